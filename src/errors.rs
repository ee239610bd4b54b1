//! Typed error hierarchy for the vigil orchestrator.
//!
//! Two top-level enums cover the two subsystems:
//! - `VigilError` — service and API failures with an HTTP mapping
//! - `EngineError` — external scan-engine invocation failures

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors from a scan-engine invocation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn engine process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Engine invocation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Engine exited with non-zero code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    #[error("Engine produced no report")]
    MissingReport,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Service-level error taxonomy. Variants map 1:1 to HTTP statuses in
/// `IntoResponse`; guard violations (e.g. stopping an already-terminal
/// run) are `Conflict` and perform no mutation.
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Engine failure: {0}")]
    Engine(#[from] EngineError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VigilError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn conflict(what: impl std::fmt::Display) -> Self {
        Self::Conflict(what.to_string())
    }
}

impl From<anyhow::Error> for VigilError {
    fn from(e: anyhow::Error) -> Self {
        Self::Database(e)
    }
}

impl IntoResponse for VigilError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Self::Engine(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            Self::Database(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}
