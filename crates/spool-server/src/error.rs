//! Error types for the spool server

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use spool_cache::CacheError;
use spool_relay::RelayError;
use std::fmt;

#[derive(Debug)]
pub enum ServerError {
    Config(String),
    Cache(Box<CacheError>),
    Relay(Box<RelayError>),
    Io(Box<std::io::Error>),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ServerError::Cache(err) => write!(f, "Cache error: {}", err),
            ServerError::Relay(err) => write!(f, "Relay error: {}", err),
            ServerError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Cache(err) => Some(err.as_ref()),
            ServerError::Relay(err) => Some(err.as_ref()),
            ServerError::Io(err) => Some(err.as_ref()),
            ServerError::Config(_) => None,
        }
    }
}

impl From<CacheError> for ServerError {
    fn from(err: CacheError) -> Self {
        ServerError::Cache(Box::new(err))
    }
}

impl From<RelayError> for ServerError {
    fn from(err: RelayError) -> Self {
        ServerError::Relay(Box::new(err))
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ServerError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ServerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Error type that converts to HTTP responses
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    /// The spool has no room for the upload
    BufferFull,
    Internal(String),
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Cache(e) if matches!(*e, CacheError::BufferFull) => ApiError::BufferFull,
            ServerError::Relay(e) if matches!(*e, RelayError::InvalidUser(_)) => {
                ApiError::BadRequest(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::BufferFull => (
                StatusCode::INSUFFICIENT_STORAGE,
                "Upload buffer full, try again later".to_string(),
            ),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}
