use crate::config::SearchConfig;
use crate::model::{Location, Post, Radius};
use async_trait::async_trait;
use elasticsearch::{
    http::response::Response,
    http::transport::{BuildError, SingleNodeConnectionPool, TransportBuilder},
    indices::{IndicesCreateParts, IndicesExistsParts},
    params::Refresh,
    Elasticsearch, ExistsParts, IndexParts, SearchParts,
};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum SearchIndexError {
    #[error("invalid Elasticsearch URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to build transport: {0}")]
    TransportBuild(#[from] BuildError),
    #[error("transport error: {0}")]
    Transport(#[from] elasticsearch::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("request rejected with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("query failed: {0}")]
    Query(String),
}

/// Search index answering geo-distance queries over posts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create `index` with `location` mapped as a geo-point unless it already exists
    async fn ensure_index(&self, index: &str) -> Result<(), SearchIndexError>;

    /// Index `post` under `doc_id`, visible to searches once this returns
    async fn upsert(&self, index: &str, doc_id: &str, post: &Post) -> Result<(), SearchIndexError>;

    /// Every post within `radius` of `center`, in index order
    async fn query_by_distance(
        &self,
        index: &str,
        center: Location,
        radius: Radius,
    ) -> Result<Vec<Post>, SearchIndexError>;

    async fn document_exists(&self, index: &str, doc_id: &str) -> Result<bool, SearchIndexError>;

    async fn health_check(&self) -> Result<(), SearchIndexError>;
}

/// Elasticsearch-backed post index
#[derive(Clone)]
pub struct ElasticsearchIndex {
    client: Elasticsearch,
    max_results: usize,
}

impl ElasticsearchIndex {
    pub fn new(config: &SearchConfig) -> Result<Self, SearchIndexError> {
        let parsed = Url::parse(&config.url)?;
        let pool = SingleNodeConnectionPool::new(parsed);
        let transport = TransportBuilder::new(pool).build()?;

        info!(url = %config.url, index = %config.index, "Elasticsearch client initialized");

        Ok(Self {
            client: Elasticsearch::new(transport),
            max_results: config.max_results,
        })
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn ensure_index(&self, index: &str) -> Result<(), SearchIndexError> {
        let exists_response = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[index]))
            .send()
            .await?;

        if exists_response.status_code().is_success() {
            debug!(index = %index, "Index already exists");
            return Ok(());
        }

        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(index))
            .body(index_mapping())
            .send()
            .await?;

        if response.status_code().is_success() {
            info!(index = %index, "Created post index");
            return Ok(());
        }

        // Another instance may have created it between the two calls
        let status = response.status_code().as_u16();
        let body = response.text().await.unwrap_or_default();
        if body.contains("resource_already_exists_exception") {
            return Ok(());
        }

        Err(SearchIndexError::Status { status, body })
    }

    #[instrument(skip(self, post))]
    async fn upsert(&self, index: &str, doc_id: &str, post: &Post) -> Result<(), SearchIndexError> {
        let response = self
            .client
            .index(IndexParts::IndexId(index, doc_id))
            .refresh(Refresh::True)
            .body(post)
            .send()
            .await?;

        ensure_success(response).await?;

        debug!(doc_id = %doc_id, "Post indexed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query_by_distance(
        &self,
        index: &str,
        center: Location,
        radius: Radius,
    ) -> Result<Vec<Post>, SearchIndexError> {
        let response = self
            .client
            .search(SearchParts::Index(&[index]))
            .body(geo_distance_query(center, radius, self.max_results))
            .send()
            .await?;

        let search_response: SearchResponse = ensure_success(response).await?.json().await?;

        debug!(
            took_ms = search_response.took,
            hits = search_response.hits.hits.len(),
            "Geo-distance query completed"
        );

        Ok(decode_hits(search_response.hits.hits))
    }

    async fn document_exists(&self, index: &str, doc_id: &str) -> Result<bool, SearchIndexError> {
        let response = self
            .client
            .exists(ExistsParts::IndexId(index, doc_id))
            .send()
            .await?;

        match response.status_code().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(SearchIndexError::Status {
                status,
                body: String::new(),
            }),
        }
    }

    async fn health_check(&self) -> Result<(), SearchIndexError> {
        let response = self.client.ping().send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

async fn ensure_success(response: Response) -> Result<Response, SearchIndexError> {
    let status = response.status_code();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(SearchIndexError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Index settings: geo queries need `location` typed as a geo-point up front
pub fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "id": { "type": "keyword" },
                "user": { "type": "keyword" },
                "message": { "type": "text" },
                "location": { "type": "geo_point" },
                "url": { "type": "keyword", "index": false }
            }
        }
    })
}

/// Filter-only geo-distance query, no scoring
pub fn geo_distance_query(center: Location, radius: Radius, size: usize) -> Value {
    json!({
        "size": size,
        "query": {
            "bool": {
                "filter": {
                    "geo_distance": {
                        "distance": radius.to_distance_string(),
                        "location": {
                            "lat": center.lat,
                            "lon": center.lon
                        }
                    }
                }
            }
        }
    })
}

/// Decode each hit's source as a `Post`, skipping documents of another shape
fn decode_hits(hits: Vec<Hit>) -> Vec<Post> {
    hits.into_iter()
        .filter_map(|hit| {
            let doc_id = hit.id.clone();
            match hit.into_post() {
                Ok(post) => Some(post),
                Err(e) => {
                    warn!(doc_id = %doc_id, error = %e, "Skipping malformed post document");
                    metrics::counter!("search.documents.malformed").increment(1);
                    None
                }
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    took: u64,
    hits: InnerHits,
}

#[derive(Debug, Deserialize)]
struct InnerHits {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: Option<Value>,
}

impl Hit {
    fn into_post(self) -> Result<Post, SearchIndexError> {
        let mut source = self
            .source
            .ok_or_else(|| SearchIndexError::Query("hit has no _source".to_string()))?;

        // Documents written without an id field take it from the hit
        if let Some(object) = source.as_object_mut() {
            object.entry("id").or_insert_with(|| Value::String(self.id));
        }

        Ok(serde_json::from_value(source)?)
    }
}
