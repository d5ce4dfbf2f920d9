//! In-process implementations of the store contracts.
//!
//! Each store keeps its state behind a lock and can be told to fail, which
//! lets the ingestion pipeline be exercised end to end without S3,
//! PostgreSQL or Elasticsearch.

use crate::blob_store::{BlobObject, BlobStore, BlobStoreError};
use crate::model::{Attachment, Location, Post, Radius};
use crate::search_index::{SearchIndex, SearchIndexError};
use crate::wide_column::{Row, RowMutation, WideColumnError, WideColumnStore};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// Mean Earth radius used by Elasticsearch's arc distance, in meters
const EARTH_RADIUS_METERS: f64 = 6_371_008.7714;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    public: bool,
    last_modified: DateTime<Utc>,
}

/// Blob store holding objects in memory
#[derive(Default)]
pub struct InMemoryBlobStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, StoredObject>>>,
    fail_uploads: AtomicBool,
}

impl InMemoryBlobStore {
    pub fn with_bucket(bucket: &str) -> Self {
        let store = Self::default();
        store.buckets.write().insert(bucket.to_string(), BTreeMap::new());
        store
    }

    /// Make every subsequent upload fail
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets.read().get(bucket).map_or(0, BTreeMap::len)
    }

    pub fn contains(&self, bucket: &str, object_name: &str) -> bool {
        self.buckets
            .read()
            .get(bucket)
            .is_some_and(|objects| objects.contains_key(object_name))
    }

    pub fn is_public(&self, bucket: &str, object_name: &str) -> bool {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|objects| objects.get(object_name))
            .is_some_and(|object| object.public)
    }

    pub fn object_data(&self, bucket: &str, object_name: &str) -> Option<Bytes> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|objects| objects.get(object_name))
            .map(|object| object.data.clone())
    }

    /// Backdate an object, as if it had been written at `at`
    pub fn set_last_modified(&self, bucket: &str, object_name: &str, at: DateTime<Utc>) {
        if let Some(object) = self
            .buckets
            .write()
            .get_mut(bucket)
            .and_then(|objects| objects.get_mut(object_name))
        {
            object.last_modified = at;
        }
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(
        &self,
        attachment: &Attachment,
        bucket: &str,
        object_name: &str,
    ) -> Result<String, BlobStoreError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(BlobStoreError::upload_failed(object_name, "injected failure"));
        }

        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| BlobStoreError::upload_failed(object_name, "bucket does not exist"))?;

        objects.insert(
            object_name.to_string(),
            StoredObject {
                data: attachment.data.clone(),
                public: true,
                last_modified: Utc::now(),
            },
        );

        Ok(self.object_url(bucket, object_name))
    }

    async fn list_objects(&self, bucket: &str) -> Result<Vec<BlobObject>, BlobStoreError> {
        let buckets = self.buckets.read();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| BlobStoreError::Request(format!("bucket {} does not exist", bucket)))?;

        Ok(objects
            .iter()
            .map(|(key, object)| BlobObject {
                key: key.clone(),
                last_modified: Some(object.last_modified),
            })
            .collect())
    }

    async fn delete_object(&self, bucket: &str, object_name: &str) -> Result<(), BlobStoreError> {
        if let Some(objects) = self.buckets.write().get_mut(bucket) {
            objects.remove(object_name);
        }
        Ok(())
    }

    fn object_url(&self, bucket: &str, object_name: &str) -> String {
        format!("https://blobs.local/{}/{}", bucket, object_name)
    }

    async fn health_check(&self, bucket: &str) -> Result<(), BlobStoreError> {
        if self.buckets.read().contains_key(bucket) {
            Ok(())
        } else {
            Err(BlobStoreError::Request(format!("bucket {} does not exist", bucket)))
        }
    }
}

/// Wide-column store holding cell versions in memory
#[derive(Default)]
pub struct InMemoryWideColumnStore {
    // row key -> (family, column) -> timestamp -> value
    rows: RwLock<HashMap<String, BTreeMap<(String, String), BTreeMap<i64, Vec<u8>>>>>,
    fail_writes: AtomicBool,
}

impl InMemoryWideColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    pub fn row_keys(&self) -> HashSet<String> {
        self.rows.read().keys().cloned().collect()
    }
}

#[async_trait]
impl WideColumnStore for InMemoryWideColumnStore {
    async fn write_fields(
        &self,
        row_key: &str,
        mutation: &RowMutation,
        timestamp: i64,
    ) -> Result<(), WideColumnError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(WideColumnError::Database("injected failure".to_string()));
        }

        // Single write lock for the whole mutation keeps it atomic
        let mut rows = self.rows.write();
        let row = rows.entry(row_key.to_string()).or_default();
        for (family, column, value) in mutation.cells() {
            row.entry((family.to_string(), column.to_string()))
                .or_default()
                .insert(timestamp, value.to_vec());
        }

        Ok(())
    }

    async fn read_row(&self, row_key: &str) -> Result<Option<Row>, WideColumnError> {
        let rows = self.rows.read();
        let Some(row) = rows.get(row_key) else {
            return Ok(None);
        };

        let mut cells = RowMutation::new();
        for ((family, column), versions) in row {
            if let Some((_, value)) = versions.iter().next_back() {
                cells.set(family, column, value.clone());
            }
        }

        Ok(Some(Row {
            key: row_key.to_string(),
            cells,
        }))
    }

    async fn health_check(&self) -> Result<(), WideColumnError> {
        Ok(())
    }
}

/// Search index keeping documents in insertion order
#[derive(Default)]
pub struct InMemorySearchIndex {
    indices: RwLock<HashMap<String, Vec<(String, Post)>>>,
    fail_upserts: AtomicBool,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent upsert fail
    pub fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.indices.read().get(index).map_or(0, Vec::len)
    }

    pub fn document(&self, index: &str, doc_id: &str) -> Option<Post> {
        self.indices.read().get(index).and_then(|docs| {
            docs.iter()
                .find(|(id, _)| id == doc_id)
                .map(|(_, post)| post.clone())
        })
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn ensure_index(&self, index: &str) -> Result<(), SearchIndexError> {
        self.indices.write().entry(index.to_string()).or_default();
        Ok(())
    }

    async fn upsert(&self, index: &str, doc_id: &str, post: &Post) -> Result<(), SearchIndexError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(SearchIndexError::Query("injected failure".to_string()));
        }

        let mut indices = self.indices.write();
        let docs = indices.get_mut(index).ok_or_else(|| SearchIndexError::Status {
            status: 404,
            body: format!("no such index [{}]", index),
        })?;

        match docs.iter_mut().find(|(id, _)| id == doc_id) {
            Some((_, existing)) => *existing = post.clone(),
            None => docs.push((doc_id.to_string(), post.clone())),
        }

        Ok(())
    }

    async fn query_by_distance(
        &self,
        index: &str,
        center: Location,
        radius: Radius,
    ) -> Result<Vec<Post>, SearchIndexError> {
        let indices = self.indices.read();
        let docs = indices.get(index).ok_or_else(|| SearchIndexError::Status {
            status: 404,
            body: format!("no such index [{}]", index),
        })?;

        Ok(docs
            .iter()
            .filter(|(_, post)| distance_meters(center, post.location) <= radius.meters())
            .map(|(_, post)| post.clone())
            .collect())
    }

    async fn document_exists(&self, index: &str, doc_id: &str) -> Result<bool, SearchIndexError> {
        Ok(self.document(index, doc_id).is_some())
    }

    async fn health_check(&self) -> Result<(), SearchIndexError> {
        Ok(())
    }
}

/// Great-circle distance between two points
pub fn distance_meters(a: Location, b: Location) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PostId;

    #[test]
    fn test_distance() {
        let sf = Location::new(37.7749, -122.4194);
        let la = Location::new(34.0522, -118.2437);

        let km = distance_meters(sf, la) / 1000.0;
        assert!((km - 559.0).abs() < 2.0, "got {}", km);
        assert_eq!(distance_meters(sf, sf), 0.0);
    }

    #[tokio::test]
    async fn test_geo_query_respects_radius() {
        let index = InMemorySearchIndex::new();
        index.ensure_index("around").await.unwrap();

        let near = Post::new(PostId::generate(), "a", "near", Location::new(37.0, -120.0));
        let far = Post::new(PostId::generate(), "b", "far", Location::new(40.0, -120.0));
        index.upsert("around", &near.id.to_string(), &near).await.unwrap();
        index.upsert("around", &far.id.to_string(), &far).await.unwrap();

        let hits = index
            .query_by_distance(
                "around",
                Location::new(37.1, -120.0),
                Radius::from_km(200.0).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(hits, vec![near]);
    }

    #[tokio::test]
    async fn test_upload_requires_bucket() {
        let store = InMemoryBlobStore::with_bucket("images");
        let attachment = Attachment::new(vec![1u8, 2, 3]);

        assert!(store.upload(&attachment, "missing", "x").await.is_err());

        let url = store.upload(&attachment, "images", "x").await.unwrap();
        assert_eq!(url, "https://blobs.local/images/x");
        assert!(store.is_public("images", "x"));
    }

    #[tokio::test]
    async fn test_read_row_returns_latest_version() {
        let store = InMemoryWideColumnStore::new();

        let mut first = RowMutation::new();
        first.set("post", "message", "old");
        let mut second = RowMutation::new();
        second.set("post", "message", "new");

        store.write_fields("r1", &second, 20).await.unwrap();
        store.write_fields("r1", &first, 10).await.unwrap();

        let row = store.read_row("r1").await.unwrap().unwrap();
        assert_eq!(row.cells.get("post", "message"), Some(&b"new"[..]));
        assert!(store.read_row("r2").await.unwrap().is_none());
    }
}
