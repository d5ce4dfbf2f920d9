use crate::auth::{require_auth, AuthUser, JwtService};
use crate::config::ApiConfig;
use crate::error::PostError;
use crate::ingest::{IngestionOrchestrator, PostForm};
use crate::model::{Attachment, Post};
use crate::query::{QueryOrchestrator, SearchParams};
use crate::stores::Stores;
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::{Field, MultipartRejection},
        DefaultBodyLimit, Multipart, Query, State,
    },
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestion: Arc<IngestionOrchestrator>,
    pub query: Arc<QueryOrchestrator>,
    pub jwt: Arc<JwtService>,
    pub stores: Stores,
    pub bucket: String,
}

/// Create the API router
///
/// `/health` and `/ready` are public; everything else needs a bearer token.
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let protected = Router::new()
        .route("/post", post(create_post))
        .route("/search", get(search_posts))
        .route_layer(middleware::from_fn_with_state(
            state.jwt.clone(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .merge(protected)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "post-service"
    }))
}

/// Readiness check endpoint, probing all three stores
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let readiness = state.stores.readiness(&state.bucket).await;

    let (status, label) = if readiness.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };

    (
        status,
        Json(serde_json::json!({
            "status": label,
            "blob_store": readiness.blob_store,
            "wide_column": readiness.wide_column,
            "search_index": readiness.search_index,
        })),
    )
}

/// Create a post from a multipart form; responds with an empty body
async fn create_post(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, PostError> {
    let multipart = multipart.map_err(|e| PostError::invalid(e.body_text()))?;
    let form = read_form(multipart).await?;

    state.ingestion.ingest(&user.username, form).await?;
    Ok(StatusCode::OK)
}

/// Posts near a point
async fn search_posts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<Post>>, PostError> {
    debug!(user = %user.username, "Search requested");
    let posts = state.query.search(&params).await?;
    Ok(Json(posts))
}

/// Collect the known fields of a create-post form, ignoring the rest
async fn read_form(mut multipart: Multipart) -> Result<PostForm, PostError> {
    let mut form = PostForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PostError::invalid(e.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("message") => form.message = Some(field_text(field).await?),
            Some("lat") => form.lat = Some(field_text(field).await?),
            Some("lon") => form.lon = Some(field_text(field).await?),
            Some("image") => {
                let content_type = field.content_type().map(str::to_string);
                let file_name = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| PostError::invalid(e.body_text()))?;

                form.image = Some(Attachment {
                    data,
                    content_type,
                    file_name,
                });
            }
            other => debug!(field = ?other, "Ignoring unknown form field"),
        }
    }

    Ok(form)
}

async fn field_text(field: Field<'_>) -> Result<String, PostError> {
    field
        .text()
        .await
        .map_err(|e| PostError::invalid(e.body_text()))
}

/// Serve the API until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting post API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
