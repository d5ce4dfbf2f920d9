use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier shared by the blob, the wide-column row and the index document of one post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(Uuid);

impl PostId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PostId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Geographic point in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Whether both coordinates lie within the valid WGS84 ranges
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// A geo-tagged post as stored in the search index and returned by search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub user: String,
    pub message: String,
    pub location: Location,
    /// Public media URL of the attachment; empty until the upload succeeds
    #[serde(default)]
    pub url: String,
}

impl Post {
    pub fn new(id: PostId, user: impl Into<String>, message: impl Into<String>, location: Location) -> Self {
        Self {
            id,
            user: user.into(),
            message: message.into(),
            location,
            url: String::new(),
        }
    }
}

/// Attachment bytes received with a post
#[derive(Debug, Clone)]
pub struct Attachment {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

impl Attachment {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            content_type: None,
            file_name: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Search radius in kilometers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Radius {
    km: f64,
}

impl Radius {
    /// Returns `None` unless `km` is finite and positive
    pub fn from_km(km: f64) -> Option<Self> {
        (km.is_finite() && km > 0.0).then_some(Self { km })
    }

    pub fn km(&self) -> f64 {
        self.km
    }

    pub fn meters(&self) -> f64 {
        self.km * 1000.0
    }

    /// Distance string understood by Elasticsearch, e.g. `200km`
    pub fn to_distance_string(&self) -> String {
        format!("{}km", self.km)
    }
}
