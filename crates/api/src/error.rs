//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use engine::EngineError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Malformed query string or body.
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Engine(e) => match e {
                EngineError::InvalidFlow(_)
                | EngineError::InvalidTrigger(_)
                | EngineError::InvalidSubmission(_)
                | EngineError::InvalidQuery(_)
                | EngineError::UnknownTool { .. } => StatusCode::BAD_REQUEST,

                EngineError::FlowNotFound(_)
                | EngineError::VersionNotFound { .. }
                | EngineError::RollbackTargetNotFound { .. }
                | EngineError::TaskNotFound(_)
                | EngineError::StepNotFound { .. }
                | EngineError::NotificationNotFound(_) => StatusCode::NOT_FOUND,

                EngineError::StepNotPending { .. }
                | EngineError::TaskNotActive { .. }
                | EngineError::TaskNotRejected { .. }
                | EngineError::NotUrgeable { .. } => StatusCode::CONFLICT,

                EngineError::ToolExecution { .. }
                | EngineError::EngineUnavailable
                | EngineError::Corrupt(_)
                | EngineError::Database(_)
                | EngineError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Engine(e) => e.kind(),
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.kind(), "request failed: {self}");
        }
        let body = json!({ "error": self.to_string(), "kind": self.kind() });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
