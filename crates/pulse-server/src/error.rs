use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use pulse_shared::error::ErrorCode;
use pulse_store::StoreError;

use crate::calls::CallError;

/// Errors surfaced by the HTTP routes.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Failure of a single inbound frame. Sent back to the client as a
/// `socket:error` frame; the connection stays open.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct FrameError {
    pub code: ErrorCode,
    pub message: String,
}

impl FrameError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn not_a_member() -> Self {
        Self::new(ErrorCode::NotAMember, "not a member of this conversation")
    }
}

impl From<StoreError> for FrameError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::new(ErrorCode::MessageNotFound, "record not found"),
            other => {
                tracing::error!(error = %other, "Store failure while handling frame");
                Self::new(ErrorCode::InternalError, "internal error")
            }
        }
    }
}

impl From<CallError> for FrameError {
    fn from(err: CallError) -> Self {
        if let CallError::Store(e) = &err {
            tracing::error!(error = %e, "Store failure in call manager");
            return Self::new(ErrorCode::InternalError, "internal error");
        }
        Self::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_hide_details() {
        let err: FrameError = StoreError::Unavailable("lock poisoned".into()).into();
        assert_eq!(err.code, ErrorCode::InternalError);
        assert!(!err.message.contains("poisoned"));

        let err: FrameError = StoreError::NotFound.into();
        assert_eq!(err.code, ErrorCode::MessageNotFound);
    }

    #[test]
    fn test_call_errors_keep_their_code() {
        let err: FrameError = CallError::UserBusy.into();
        assert_eq!(err.code, ErrorCode::UserBusy);
        let err: FrameError = CallError::NotFound.into();
        assert_eq!(err.code, ErrorCode::CallNotFound);
    }

    #[test]
    fn test_response_status() {
        let response = ServerError::Unauthorized("missing token".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = ServerError::Store(StoreError::Unavailable("boom".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
