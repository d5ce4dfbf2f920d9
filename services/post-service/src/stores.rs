use crate::blob_store::{BlobStore, S3BlobStore};
use crate::config::Config;
use crate::search_index::{ElasticsearchIndex, SearchIndex};
use crate::wide_column::{PgWideColumnStore, WideColumnStore};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Long-lived handles to the three backing stores, built once per process
#[derive(Clone)]
pub struct Stores {
    pub blobs: Arc<dyn BlobStore>,
    pub columns: Arc<dyn WideColumnStore>,
    pub index: Arc<dyn SearchIndex>,
}

impl Stores {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        columns: Arc<dyn WideColumnStore>,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        Self {
            blobs,
            columns,
            index,
        }
    }

    /// Connect to S3, PostgreSQL and Elasticsearch and prepare the schema and index
    ///
    /// Any failure here is a startup failure.
    pub async fn connect(config: &Config) -> Result<Self> {
        let blobs = S3BlobStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 blob store")?;

        let columns = PgWideColumnStore::new(&config.database)
            .await
            .context("Failed to initialize wide-column store")?;

        if config.database.run_migrations {
            columns
                .run_migrations()
                .await
                .context("Failed to run database migrations")?;
        }

        let index =
            ElasticsearchIndex::new(&config.search).context("Failed to initialize search index")?;

        index
            .ensure_index(&config.search.index)
            .await
            .with_context(|| format!("Failed to create index {}", config.search.index))?;

        info!(index = %config.search.index, "Backing stores ready");

        Ok(Self::new(Arc::new(blobs), Arc::new(columns), Arc::new(index)))
    }

    /// Probe every store
    pub async fn readiness(&self, bucket: &str) -> Readiness {
        let (blobs, columns, index) = tokio::join!(
            self.blobs.health_check(bucket),
            self.columns.health_check(),
            self.index.health_check(),
        );

        Readiness {
            blob_store: probe(blobs),
            wide_column: probe(columns),
            search_index: probe(index),
        }
    }
}

fn probe<E: std::fmt::Display>(result: Result<(), E>) -> ProbeStatus {
    match result {
        Ok(()) => ProbeStatus::Connected,
        Err(e) => ProbeStatus::Disconnected {
            error: e.to_string(),
        },
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeStatus {
    Connected,
    Disconnected { error: String },
}

/// Result of probing the backing stores
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub blob_store: ProbeStatus,
    pub wide_column: ProbeStatus,
    pub search_index: ProbeStatus,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        [&self.blob_store, &self.wide_column, &self.search_index]
            .iter()
            .all(|status| **status == ProbeStatus::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBlobStore, InMemorySearchIndex, InMemoryWideColumnStore};

    #[tokio::test]
    async fn test_readiness_reports_each_store() {
        let stores = Stores::new(
            Arc::new(InMemoryBlobStore::with_bucket("images")),
            Arc::new(InMemoryWideColumnStore::new()),
            Arc::new(InMemorySearchIndex::new()),
        );

        assert!(stores.readiness("images").await.is_ready());

        let readiness = stores.readiness("missing").await;
        assert!(!readiness.is_ready());
        assert!(matches!(
            readiness.blob_store,
            ProbeStatus::Disconnected { .. }
        ));
        assert_eq!(readiness.search_index, ProbeStatus::Connected);
    }
}
