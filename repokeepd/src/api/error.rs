use std::time::Duration;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use shared::types::{CallCode, ErrorBody};

/// Per-call failure, rendered as an [`ErrorBody`].
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("call canceled by caller")]
    Canceled,

    #[error("call exceeded the {0:?} service deadline")]
    DeadlineExceeded(Duration),

    /// Detail goes to the log, never to the caller.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    pub fn code(&self) -> CallCode {
        match self {
            ApiError::InvalidArgument(_) => CallCode::InvalidArgument,
            ApiError::NotFound(_) => CallCode::NotFound,
            ApiError::Canceled => CallCode::Canceled,
            ApiError::DeadlineExceeded(_) => CallCode::DeadlineExceeded,
            ApiError::Internal(_) => CallCode::Internal,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(e) = &self {
            tracing::error!("Call failed: {:#}", e);
        }
        error_response(self.code(), self.to_string())
    }
}

pub fn error_response(code: CallCode, message: impl Into<String>) -> Response {
    let status = StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorBody {
        code,
        message: message.into(),
    };
    (status, Json(body)).into_response()
}
