//! HTTP server
//!
//! Provides /health, PUT /files/{user}/{filename}, GET /files/{user} and
//! the long-poll GET /files/{user}/next.

use crate::context::AppContext;
use crate::error::ApiError;
use crate::snapshot::UserSnapshot;
use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use chrono::Utc;
use futures_util::TryStreamExt;
use serde::Serialize;
use spool_cache::{CacheStats, CachedFile};
use spool_relay::RelayStatus;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tower_http::cors::CorsLayer;
use tracing::info;

pub type SharedContext = Arc<AppContext>;

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: i64,
    relay: RelayStatus,
    queue_len: usize,
    cache: CacheStats,
}

/// Accepted upload
#[derive(Serialize)]
struct SubmitResponse {
    user: String,
    filename: String,
    size: u64,
}

/// Create the HTTP router
pub fn create_router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/files/{user}", get(user_files))
        .route("/files/{user}/next", get(next_change))
        .route("/files/{user}/{filename}", put(submit_file))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Serve until `shutdown` resolves
pub async fn start_server<F>(ctx: SharedContext, port: u16, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(ctx);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(ctx): State<SharedContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: (Utc::now() - ctx.started_at).num_seconds(),
        relay: ctx.uploader.status(),
        queue_len: ctx.uploader.queue_len(),
        cache: ctx.cache.stats().await,
    })
}

async fn submit_file(
    State(ctx): State<SharedContext>,
    Path((user, filename)): Path<(String, String)>,
    body: Body,
) -> Result<Response, ApiError> {
    validate_filename(&filename)?;

    let stream = body.into_data_stream().map_err(io::Error::other);
    let mut reader = StreamReader::new(stream);
    let entry = ctx.submit(&user, &filename, &mut reader).await?;

    let response = SubmitResponse {
        user: entry.user().to_string(),
        filename: entry.filename().to_string(),
        size: entry.size(),
    };
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

async fn user_files(
    State(ctx): State<SharedContext>,
    Path(user): Path<String>,
) -> Json<UserSnapshot> {
    Json(ctx.snapshot(&user).await)
}

async fn next_change(State(ctx): State<SharedContext>, Path(user): Path<String>) -> Response {
    let mut subscription = ctx.listen(&user);
    match tokio::time::timeout(ctx.poll_timeout, subscription.next()).await {
        Ok(Some(snapshot)) => Json(snapshot.as_ref().clone()).into_response(),
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Filenames become remote paths, so only plain names are accepted.
fn validate_filename(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(ApiError::BadRequest("missing filename".to_string()));
    }
    if name.contains(['/', '\\']) || name.chars().any(char::is_control) {
        return Err(ApiError::BadRequest(format!("invalid filename {:?}", name)));
    }
    Ok(())
}
