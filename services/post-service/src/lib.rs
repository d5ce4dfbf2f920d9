//! Around Post Service
//!
//! Accepts geo-tagged posts with an image attachment and answers "posts near
//! me" searches. Each post is written to three stores: the image to an S3
//! bucket, the structured fields to a wide-column table in PostgreSQL, and a
//! searchable document to Elasticsearch. Search results pass through a
//! content denylist before they are returned.
//!
//! ## Features
//!
//! - **Ordered Ingestion**: blob, then wide-column row, then index document,
//!   all under one generated post id
//! - **Geo-distance Search**: radius queries over a `geo_point` mapping
//! - **Content Filtering**: denylisted messages never reach the caller
//! - **Reconciliation**: periodic sweep removing orphaned blobs and
//!   re-indexing rows missing from the index
//!
//! ## Architecture
//!
//! ```text
//!   POST /post                               GET /search
//!       │                                        │
//!       ▼                                        ▼
//! ┌──────────────┐                        ┌──────────────┐
//! │ Ingestion    │                        │ Query        │
//! │ Orchestrator │                        │ Orchestrator │
//! └──────────────┘                        └──────────────┘
//!    │    │    │                             │        │
//!    │    │    └──────────────┐              │        ▼
//!    ▼    ▼                   ▼              │  ┌──────────────┐
//! ┌─────┐ ┌──────────────┐ ┌──────────────┐  │  │ Content      │
//! │ S3  │ │ post_cells   │ │ Elasticsearch│◀─┘  │ Filter       │
//! └─────┘ └──────────────┘ └──────────────┘     └──────────────┘
//!    ▲           ▲                ▲
//!    └───────────┴────────────────┘
//!               Reconciler
//! ```

pub mod api;
pub mod auth;
pub mod blob_store;
pub mod config;
pub mod content_filter;
pub mod error;
pub mod ingest;
pub mod memory;
pub mod model;
pub mod query;
pub mod reconcile;
pub mod search_index;
pub mod stores;
pub mod wide_column;

pub use api::{create_router, start_api_server, AppState};
pub use auth::{AuthUser, JwtService};
pub use blob_store::{BlobStore, S3BlobStore};
pub use config::Config;
pub use content_filter::ContentFilter;
pub use error::PostError;
pub use ingest::{IngestionOrchestrator, PostForm};
pub use model::{Attachment, Location, Post, PostId, Radius};
pub use query::{QueryOrchestrator, SearchParams};
pub use reconcile::{ReconcileReport, Reconciler};
pub use search_index::{ElasticsearchIndex, SearchIndex};
pub use stores::Stores;
pub use wide_column::{PgWideColumnStore, WideColumnStore};
