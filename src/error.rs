//! Core error taxonomy shared by every component.
//!
//! Internal plumbing (config loading, filesystem setup) keeps using `anyhow`;
//! this type is what public component operations return and what the
//! streaming server turns into a JSON body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported combination: {0}")]
    UnsupportedCombination(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("file unavailable: {0}")]
    FileUnavailable(String),

    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("launch failed: {0}")]
    LaunchFailed(String),

    #[error("transcode failed: {0}")]
    TranscodeFailed(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    /// Short machine-readable kind used in the JSON body and for log filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidRequest(_) => "InvalidRequest",
            CoreError::UnsupportedCombination(_) => "UnsupportedCombination",
            CoreError::CapacityExceeded(_) => "CapacityExceeded",
            CoreError::FileUnavailable(_) => "FileUnavailable",
            CoreError::ProbeFailed(_) => "ProbeFailed",
            CoreError::LaunchFailed(_) => "LaunchFailed",
            CoreError::TranscodeFailed(_) => "TranscodeFailed",
            CoreError::ValidationFailed(_) => "ValidationFailed",
            CoreError::NotFound(_) => "NotFound",
        }
    }

    /// Whether this is safe to retry later without caller changes.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::CapacityExceeded(_) | CoreError::ProbeFailed(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            CoreError::InvalidRequest(_) | CoreError::UnsupportedCombination(_) => {
                StatusCode::BAD_REQUEST
            }
            CoreError::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            CoreError::FileUnavailable(_) | CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::ProbeFailed(_)
            | CoreError::LaunchFailed(_)
            | CoreError::TranscodeFailed(_)
            | CoreError::ValidationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    reason: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.is_transient() {
            tracing::warn!(kind = self.kind(), "{}", self);
        } else if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{}", self);
        }
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
            session_id: None,
            reason: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
