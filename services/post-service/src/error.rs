use crate::blob_store::BlobStoreError;
use crate::search_index::SearchIndexError;
use crate::wide_column::WideColumnError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors surfaced by the ingestion and query paths
#[derive(Error, Debug)]
pub enum PostError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Image is not available")]
    MissingAttachment,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Upload(#[from] BlobStoreError),

    #[error(transparent)]
    WideColumn(#[from] WideColumnError),

    #[error(transparent)]
    Index(#[from] SearchIndexError),
}

impl PostError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Whether the caller sent something unusable (as opposed to a store failing)
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::MissingAttachment)
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::MissingAttachment => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Upload(_) | Self::WideColumn(_) | Self::Index(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::MissingAttachment => "MISSING_ATTACHMENT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Upload(_) | Self::WideColumn(_) | Self::Index(_) => "INTERNAL_ERROR",
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for PostError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Store failures are logged in full but reported generically
        let message = if status.is_server_error() {
            error!(error = %self, "Request failed on a backing store");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code: self.code().to_string(),
            }),
        )
            .into_response()
    }
}
