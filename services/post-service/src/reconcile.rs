use crate::blob_store::BlobObject;
use crate::error::PostError;
use crate::model::PostId;
use crate::stores::Stores;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one sweep over the bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub deleted: usize,
    pub reindexed: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Action {
    Keep,
    Skip,
    Deleted,
    Reindexed,
}

/// Repairs posts left incomplete by a failed ingestion
///
/// A blob without a wide-column row is deleted. A row without an index
/// document is indexed again. Blobs younger than the grace period are left
/// alone since their ingestion may still be running.
pub struct Reconciler {
    stores: Stores,
    bucket: String,
    index: String,
    grace: Duration,
}

impl Reconciler {
    pub fn new(
        stores: Stores,
        bucket: impl Into<String>,
        index: impl Into<String>,
        grace: std::time::Duration,
    ) -> Self {
        Self {
            stores,
            bucket: bucket.into(),
            index: index.into(),
            grace: Duration::seconds(grace.as_secs() as i64),
        }
    }

    /// Sweep every object in the bucket once
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn run_once(&self) -> Result<ReconcileReport, PostError> {
        let objects = self.stores.blobs.list_objects(&self.bucket).await?;
        let cutoff = Utc::now() - self.grace;

        let mut report = ReconcileReport::default();
        for object in objects {
            report.scanned += 1;

            match self.reconcile_object(&object, cutoff).await {
                Ok(Action::Keep) => {}
                Ok(Action::Skip) => report.skipped += 1,
                Ok(Action::Deleted) => report.deleted += 1,
                Ok(Action::Reindexed) => report.reindexed += 1,
                Err(e) => {
                    warn!(key = %object.key, error = %e, "Failed to reconcile object");
                    report.failed += 1;
                }
            }
        }

        if report.deleted > 0 {
            metrics::counter!("reconcile.blobs_deleted").increment(report.deleted as u64);
        }
        if report.reindexed > 0 {
            metrics::counter!("reconcile.posts_reindexed").increment(report.reindexed as u64);
        }

        info!(
            scanned = report.scanned,
            deleted = report.deleted,
            reindexed = report.reindexed,
            skipped = report.skipped,
            failed = report.failed,
            "Reconciliation sweep completed"
        );

        Ok(report)
    }

    async fn reconcile_object(
        &self,
        object: &BlobObject,
        cutoff: DateTime<Utc>,
    ) -> Result<Action, PostError> {
        if object.key.parse::<PostId>().is_err() {
            return Ok(Action::Skip);
        }

        // Objects without a timestamp cannot be proven old enough
        match object.last_modified {
            Some(modified) if modified <= cutoff => {}
            _ => return Ok(Action::Skip),
        }

        let Some(row) = self.stores.columns.read_row(&object.key).await? else {
            self.stores
                .blobs
                .delete_object(&self.bucket, &object.key)
                .await?;
            info!(key = %object.key, "Deleted blob without a wide-column row");
            return Ok(Action::Deleted);
        };

        if self
            .stores
            .index
            .document_exists(&self.index, &object.key)
            .await?
        {
            return Ok(Action::Keep);
        }

        let mut post = row.to_post()?;
        post.url = self.stores.blobs.object_url(&self.bucket, &object.key);
        self.stores
            .index
            .upsert(&self.index, &object.key, &post)
            .await?;

        info!(post_id = %post.id, "Re-indexed post missing from the search index");
        Ok(Action::Reindexed)
    }

    /// Sweep every `interval` until `shutdown` is cancelled
    pub async fn run(&self, interval: std::time::Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        info!(interval_secs = interval.as_secs(), "Reconciliation job started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciliation job stopping");
                    break;
                }
                _ = ticker.tick() => {
                    debug!("Starting reconciliation sweep");
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Reconciliation sweep failed");
                    }
                }
            }
        }
    }
}
