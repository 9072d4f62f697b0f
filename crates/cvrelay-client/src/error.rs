use cvrelay_common::ErrorCode;

/// Client-side error taxonomy. Retry decisions hang off
/// [`ClientError::is_retryable`]; everything else is terminal for the
/// current operation.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Request rejected locally, before any network call.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The relay answered with a taxonomy error body.
    #[error("relay error {code}: {message}")]
    Api { code: ErrorCode, message: String },

    /// Non-2xx response that did not carry a parseable error body.
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    /// Connection-level failure: reset, refused, timeout, pipe.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A response that should have parsed, didn't.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The waiter exhausted its hard timeout.
    #[error("timed out waiting for task {task_id} after {elapsed_secs}s")]
    WaitTimeout { task_id: String, elapsed_secs: u64 },

    /// The task reached a terminal state other than done.
    #[error("task {task_id} ended as {status}")]
    TaskFailed { task_id: String, status: String },

    /// Download-stage failure (bad URL, refusal to overwrite, io).
    #[error("download failed: {0}")]
    Download(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Only rate limits, queue pressure, 5xx and transport failures are
    /// worth retrying; auth and validation rejections never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Api { code, .. } => code.retryable(),
            ClientError::Http { status, .. } => *status >= 500,
            ClientError::Transport(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(
            ClientError::Api {
                code: ErrorCode::RateLimited,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            ClientError::Api {
                code: ErrorCode::QueueFull,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            ClientError::Http {
                status: 502,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(ClientError::Transport("connection reset".into()).is_retryable());

        assert!(
            !ClientError::Api {
                code: ErrorCode::AuthFailed,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !ClientError::Api {
                code: ErrorCode::ValidationFailed,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!ClientError::Validation("bad preset".into()).is_retryable());
        assert!(
            !ClientError::Http {
                status: 404,
                message: String::new()
            }
            .is_retryable()
        );
    }
}
