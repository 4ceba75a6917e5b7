//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds spelled out for this service: each variant maps
//! to exactly one HTTP status when it surfaces from a handler, and only the
//! fetcher retries — everything else bubbles straight out.

use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl AppError {
    /// `retryAfterMs` extracted from this error, if any — consulted by the
    /// sync worker to decide whether to pause rather than fail the job.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            AppError::RateLimited { retry_after } => Some(retry_after.as_millis() as u64),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::RateLimited { .. } => (StatusCode::SERVICE_UNAVAILABLE, "rate_limited"),
            AppError::Transport(_) => (StatusCode::INTERNAL_SERVER_ERROR, "transport_error"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Parse(_) => (StatusCode::INTERNAL_SERVER_ERROR, "parse_error"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Fatal(_) => (StatusCode::BAD_REQUEST, "fatal"),
        };

        let mut body = json!({
            "error": code,
            "message": self.to_string(),
        });
        if let Some(retry_after_ms) = self.retry_after_ms() {
            body["retry_after_ms"] = json!(retry_after_ms);
        }

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
