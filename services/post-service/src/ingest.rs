use crate::error::PostError;
use crate::model::{Attachment, Location, Post, PostId};
use crate::stores::Stores;
use crate::wide_column::RowMutation;
use chrono::Utc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Raw multipart fields of a create-post request
#[derive(Debug, Default)]
pub struct PostForm {
    pub message: Option<String>,
    pub lat: Option<String>,
    pub lon: Option<String>,
    pub image: Option<Attachment>,
}

/// Progress of one ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Received,
    IdentityAssigned,
    BlobUploaded,
    ColumnWritten,
    Indexed,
    Complete,
    Aborted,
}

/// A validated request, ready to be assigned an identity
#[derive(Debug)]
struct Draft {
    message: String,
    location: Location,
    attachment: Attachment,
}

/// Writes one post to the blob store, the wide-column store and the index, in that order
///
/// The blob URL feeds the other two writes, so the steps cannot overlap. A
/// failure after the upload leaves the blob behind without a row or document;
/// such orphans are logged here and cleaned up by the reconciler.
pub struct IngestionOrchestrator {
    stores: Stores,
    bucket: String,
    index: String,
}

impl IngestionOrchestrator {
    pub fn new(stores: Stores, bucket: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            stores,
            bucket: bucket.into(),
            index: index.into(),
        }
    }

    /// Ingest a post authored by `author`, the verified token's username
    #[instrument(skip(self, form), fields(author = %author))]
    pub async fn ingest(&self, author: &str, form: PostForm) -> Result<Post, PostError> {
        let started = Instant::now();
        let result = self.run(author, form).await;

        match &result {
            Ok(post) => {
                metrics::counter!("posts.ingested").increment(1);
                metrics::histogram!("posts.ingest.duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                info!(post_id = %post.id, url = %post.url, "Post saved");
            }
            Err(e) if e.is_input_error() => {
                metrics::counter!("posts.rejected").increment(1);
                debug!(error = %e, stage = ?IngestStage::Aborted, "Post rejected");
            }
            Err(_) => {}
        }

        result
    }

    async fn run(&self, author: &str, form: PostForm) -> Result<Post, PostError> {
        let draft = validate(form)?;

        let id = PostId::generate();
        let row_key = id.to_string();
        advance(id, IngestStage::IdentityAssigned);

        let mut post = Post::new(id, author, draft.message, draft.location);

        post.url = self
            .stores
            .blobs
            .upload(&draft.attachment, &self.bucket, &row_key)
            .await?;
        advance(id, IngestStage::BlobUploaded);

        let timestamp = Utc::now().timestamp_micros();
        if let Err(e) = self
            .stores
            .columns
            .write_fields(&row_key, &RowMutation::from(&post), timestamp)
            .await
        {
            report_orphan(&post, IngestStage::BlobUploaded);
            return Err(e.into());
        }
        advance(id, IngestStage::ColumnWritten);

        if let Err(e) = self.stores.index.upsert(&self.index, &row_key, &post).await {
            report_orphan(&post, IngestStage::ColumnWritten);
            return Err(e.into());
        }
        advance(id, IngestStage::Indexed);

        advance(id, IngestStage::Complete);
        Ok(post)
    }
}

fn advance(id: PostId, stage: IngestStage) {
    debug!(post_id = %id, stage = ?stage, "Ingestion advanced");
}

fn report_orphan(post: &Post, reached: IngestStage) {
    warn!(
        post_id = %post.id,
        url = %post.url,
        reached = ?reached,
        "Ingestion stopped after upload; blob left without complete records"
    );
    metrics::counter!("posts.orphaned_blobs").increment(1);
}

/// Check the request before anything is written
fn validate(form: PostForm) -> Result<Draft, PostError> {
    let location = Location::new(
        parse_coordinate("lat", form.lat.as_deref())?,
        parse_coordinate("lon", form.lon.as_deref())?,
    );

    if !location.is_valid() {
        return Err(PostError::invalid(format!(
            "coordinates out of range: lat {}, lon {}",
            location.lat, location.lon
        )));
    }

    let attachment = match form.image {
        Some(image) if !image.is_empty() => image,
        _ => return Err(PostError::MissingAttachment),
    };

    Ok(Draft {
        message: form.message.unwrap_or_default(),
        location,
        attachment,
    })
}

fn parse_coordinate(name: &str, raw: Option<&str>) -> Result<f64, PostError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PostError::invalid(format!("{} is required", name)))?;

    raw.parse::<f64>()
        .map_err(|_| PostError::invalid(format!("{} must be a number, got {:?}", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobStoreError, MockBlobStore};
    use crate::search_index::{MockSearchIndex, SearchIndexError};
    use crate::wide_column::{MockWideColumnStore, WideColumnError};
    use mockall::predicate::*;
    use mockall::Sequence;
    use std::sync::{Arc, Mutex};

    fn form() -> PostForm {
        PostForm {
            message: Some("Test".to_string()),
            lat: Some("37".to_string()),
            lon: Some("-120".to_string()),
            image: Some(Attachment::new(vec![0xFFu8, 0xD8, 0xFF]).with_content_type("image/jpeg")),
        }
    }

    fn orchestrator(
        blobs: MockBlobStore,
        columns: MockWideColumnStore,
        index: MockSearchIndex,
    ) -> IngestionOrchestrator {
        IngestionOrchestrator::new(
            Stores::new(Arc::new(blobs), Arc::new(columns), Arc::new(index)),
            "post-images",
            "around",
        )
    }

    #[tokio::test]
    async fn test_writes_in_order_with_one_id() {
        let mut seq = Sequence::new();
        let seen_ids = Arc::new(Mutex::new(Vec::<String>::new()));

        let mut blobs = MockBlobStore::new();
        let ids = seen_ids.clone();
        blobs
            .expect_upload()
            .with(always(), eq("post-images"), always())
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _, name| {
                ids.lock().unwrap().push(name.to_string());
                Ok(format!("https://media.example.com/{}", name))
            });

        let mut columns = MockWideColumnStore::new();
        let ids = seen_ids.clone();
        columns
            .expect_write_fields()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |key, mutation, _| {
                assert_eq!(mutation.get("post", "user"), Some(&b"john"[..]));
                assert_eq!(mutation.get("location", "lat"), Some(&b"37"[..]));
                ids.lock().unwrap().push(key.to_string());
                Ok(())
            });

        let mut index = MockSearchIndex::new();
        let ids = seen_ids.clone();
        index
            .expect_upsert()
            .with(eq("around"), always(), always())
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, doc_id, post| {
                assert!(!post.url.is_empty(), "index write must carry the media URL");
                assert_eq!(post.url, format!("https://media.example.com/{}", doc_id));
                ids.lock().unwrap().push(doc_id.to_string());
                Ok(())
            });

        let post = orchestrator(blobs, columns, index)
            .ingest("john", form())
            .await
            .unwrap();

        let ids = seen_ids.lock().unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| *id == post.id.to_string()));
        assert_eq!(post.user, "john");
        assert_eq!(post.location, Location::new(37.0, -120.0));
    }

    #[tokio::test]
    async fn test_missing_attachment_writes_nothing() {
        let mut blobs = MockBlobStore::new();
        blobs.expect_upload().never();
        let mut columns = MockWideColumnStore::new();
        columns.expect_write_fields().never();
        let mut index = MockSearchIndex::new();
        index.expect_upsert().never();

        let orchestrator = orchestrator(blobs, columns, index);

        let mut without_image = form();
        without_image.image = None;
        let result = orchestrator.ingest("john", without_image).await;
        assert!(matches!(result, Err(PostError::MissingAttachment)));

        let mut empty_image = form();
        empty_image.image = Some(Attachment::new(Vec::<u8>::new()));
        let result = orchestrator.ingest("john", empty_image).await;
        assert!(matches!(result, Err(PostError::MissingAttachment)));
    }

    #[tokio::test]
    async fn test_bad_coordinates_write_nothing() {
        let mut blobs = MockBlobStore::new();
        blobs.expect_upload().never();
        let orchestrator = orchestrator(blobs, MockWideColumnStore::new(), MockSearchIndex::new());

        for (lat, lon) in [
            (None, Some("1")),
            (Some("abc"), Some("1")),
            (Some("1"), Some("")),
            (Some("91"), Some("0")),
            (Some("0"), Some("-181")),
            (Some("NaN"), Some("0")),
        ] {
            let mut bad = form();
            bad.lat = lat.map(String::from);
            bad.lon = lon.map(String::from);

            let result = orchestrator.ingest("john", bad).await;
            assert!(
                matches!(result, Err(PostError::InvalidInput(_))),
                "lat {:?} lon {:?} gave {:?}",
                lat,
                lon,
                result
            );
        }
    }

    #[tokio::test]
    async fn test_upload_failure_aborts_before_other_writes() {
        let mut blobs = MockBlobStore::new();
        blobs
            .expect_upload()
            .times(1)
            .returning(|_, _, name| Err(BlobStoreError::upload_failed(name, "bucket not found")));
        let mut columns = MockWideColumnStore::new();
        columns.expect_write_fields().never();
        let mut index = MockSearchIndex::new();
        index.expect_upsert().never();

        let result = orchestrator(blobs, columns, index)
            .ingest("john", form())
            .await;

        assert!(matches!(result, Err(PostError::Upload(_))));
    }

    #[tokio::test]
    async fn test_column_failure_skips_index() {
        let mut blobs = MockBlobStore::new();
        blobs
            .expect_upload()
            .returning(|_, _, name| Ok(format!("https://media.example.com/{}", name)));
        let mut columns = MockWideColumnStore::new();
        columns
            .expect_write_fields()
            .times(1)
            .returning(|_, _, _| Err(WideColumnError::Database("connection reset".to_string())));
        let mut index = MockSearchIndex::new();
        index.expect_upsert().never();

        let result = orchestrator(blobs, columns, index)
            .ingest("john", form())
            .await;

        assert!(matches!(result, Err(PostError::WideColumn(_))));
    }

    #[tokio::test]
    async fn test_index_failure_is_fatal() {
        let mut blobs = MockBlobStore::new();
        blobs
            .expect_upload()
            .returning(|_, _, name| Ok(format!("https://media.example.com/{}", name)));
        let mut columns = MockWideColumnStore::new();
        columns.expect_write_fields().returning(|_, _, _| Ok(()));
        let mut index = MockSearchIndex::new();
        index
            .expect_upsert()
            .times(1)
            .returning(|_, _, _| Err(SearchIndexError::Query("shard unavailable".to_string())));

        let result = orchestrator(blobs, columns, index)
            .ingest("john", form())
            .await;

        assert!(matches!(result, Err(PostError::Index(_))));
    }

    #[test]
    fn test_message_defaults_to_empty() {
        let mut without_message = form();
        without_message.message = None;
        let draft = validate(without_message).unwrap();
        assert_eq!(draft.message, "");
    }

    #[test]
    fn test_parse_coordinate_trims() {
        assert_eq!(parse_coordinate("lat", Some(" 37.5 ")).unwrap(), 37.5);
    }
}
