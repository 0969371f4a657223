use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error codes carried by `socket:error` frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    ValidationError,
    NotAMember,
    MessageNotFound,
    UserBusy,
    UserNotFound,
    CallAccessDisabled,
    CallNotFound,
    InvalidCallState,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotAMember => "NOT_A_MEMBER",
            Self::MessageNotFound => "MESSAGE_NOT_FOUND",
            Self::UserBusy => "USER_BUSY",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::CallAccessDisabled => "CALL_ACCESS_DISABLED",
            Self::CallNotFound => "CALL_NOT_FOUND",
            Self::InvalidCallState => "INVALID_CALL_STATE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token encoding is invalid")]
    Encoding,

    #[error("Token has expired")]
    Expired,

    #[error("Token signature is invalid")]
    BadSignature,

    #[error("Issuer key is invalid")]
    BadIssuerKey,
}
