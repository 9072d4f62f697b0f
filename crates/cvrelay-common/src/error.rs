use serde::{Deserialize, Serialize};

/// Stable error codes shared by the relay surface and the client library.
///
/// The serialized form is the SCREAMING_SNAKE_CASE code; everything else
/// about an error (cause chain, context) stays in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    InvalidSignature,
    KeyRevoked,
    KeyExpired,
    ValidationFailed,
    RateLimited,
    QueueFull,
    Timeout,
    BusinessFailed,
    DecodeFailed,
    DatabaseError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            ErrorCode::KeyRevoked => "KEY_REVOKED",
            ErrorCode::KeyExpired => "KEY_EXPIRED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::BusinessFailed => "BUSINESS_FAILED",
            ErrorCode::DecodeFailed => "DECODE_FAILED",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::AuthFailed
            | ErrorCode::InvalidSignature
            | ErrorCode::KeyRevoked
            | ErrorCode::KeyExpired => 401,
            ErrorCode::ValidationFailed => 400,
            ErrorCode::RateLimited => 429,
            ErrorCode::QueueFull => 503,
            ErrorCode::Timeout => 504,
            ErrorCode::BusinessFailed | ErrorCode::DecodeFailed => 502,
            ErrorCode::DatabaseError | ErrorCode::InternalError => 500,
        }
    }

    /// Whether a caller may reasonably retry the same request.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited | ErrorCode::QueueFull | ErrorCode::Timeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire form of a relay error: `{code, message}` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
