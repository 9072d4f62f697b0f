use cvrelay_common::{ErrorBody, ErrorCode};
use cvrelay_sign::SignError;
use cvrelay_storage::StorageError;

/// A relay-surface error: stable code, caller-facing message, and the
/// wrapped cause chain. Serialization carries `{code, message}` only.
#[derive(Debug)]
pub struct RelayError {
    pub code: ErrorCode,
    pub message: String,
    source: Option<anyhow::Error>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthFailed, message)
    }

    pub fn invalid_signature(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidSignature, message)
    }

    pub fn key_revoked() -> Self {
        Self::new(ErrorCode::KeyRevoked, "api key has been revoked")
    }

    pub fn key_expired() -> Self {
        Self::new(ErrorCode::KeyExpired, "api key has expired")
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimited, message)
    }

    pub fn queue_full() -> Self {
        Self::new(ErrorCode::QueueFull, "admission queue at capacity")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BusinessFailed, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DecodeFailed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody::new(self.code, self.message.clone())
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|err| err.as_ref() as _)
    }
}

impl From<StorageError> for RelayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => {
                Self::new(ErrorCode::DatabaseError, "record not found").with_source(err)
            }
            other => Self::new(ErrorCode::DatabaseError, "persistence failure").with_source(other),
        }
    }
}

impl From<SignError> for RelayError {
    fn from(err: SignError) -> Self {
        let code = match &err {
            SignError::SkewExceeded | SignError::ScopeMismatch(_) => ErrorCode::InvalidSignature,
            SignError::MalformedHeader | SignError::BadDate(_) | SignError::SignatureMismatch => {
                ErrorCode::AuthFailed
            }
        };
        Self::new(code, err.to_string()).with_source(err)
    }
}
