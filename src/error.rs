//! Error types for the vector destinations.

use thiserror::Error;

use crate::utils::retry::Retryable;

/// Errors raised by a backend adapter (Qdrant, Pinecone, Weaviate, Milvus).
///
/// The sync core never inspects these beyond propagating them to the caller.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("collection error: {0}")]
    CollectionError(String),

    #[error("load error: {0}")]
    LoadError(String),

    #[error("delete error: {0}")]
    DeleteError(String),

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("backend client error: {0}")]
    ClientError(String),
}

impl BackendError {
    /// Classify a failed HTTP exchange by its status code.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let msg = format!("status {}: {}", status, body);
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            BackendError::Unavailable(msg)
        } else if status == reqwest::StatusCode::NOT_FOUND {
            BackendError::NotFound(msg)
        } else {
            BackendError::ClientError(msg)
        }
    }

    /// Re-label a failure with `wrap`; `Unavailable` passes through unchanged.
    pub fn relabel(self, wrap: fn(String) -> BackendError) -> Self {
        match self {
            BackendError::Unavailable(_) => self,
            other => wrap(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            BackendError::Unavailable(err.to_string())
        } else if err.is_decode() {
            BackendError::InvalidResponse(err.to_string())
        } else {
            BackendError::ClientError(err.to_string())
        }
    }
}

impl Retryable for BackendError {
    fn is_retryable(&self) -> bool {
        match self {
            BackendError::Unavailable(_) => true,
            BackendError::CollectionError(msg)
            | BackendError::LoadError(msg)
            | BackendError::DeleteError(msg)
            | BackendError::ClientError(msg) => {
                let msg_lower = msg.to_lowercase();
                msg_lower.contains("timeout")
                    || msg_lower.contains("connection")
                    || msg_lower.contains("unavailable")
                    || msg_lower.contains("too many")
            }
            BackendError::NotFound(_) | BackendError::InvalidResponse(_) => false,
        }
    }
}

/// Errors raised while processing a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Errors related to configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    JsonParseError(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_retryable() {
        assert!(BackendError::Unavailable("refused".into()).is_retryable());
        assert!(BackendError::LoadError("request timeout".into()).is_retryable());
        assert!(!BackendError::LoadError("dimension mismatch".into()).is_retryable());
        assert!(!BackendError::InvalidResponse("bad json".into()).is_retryable());
    }

    #[test]
    fn test_from_status() {
        let err = BackendError::from_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "down");
        assert!(matches!(err, BackendError::Unavailable(_)));

        let err = BackendError::from_status(reqwest::StatusCode::BAD_REQUEST, "nope");
        assert!(matches!(err, BackendError::ClientError(_)));
        assert!(err.to_string().contains("400"));

        let err = BackendError::from_status(reqwest::StatusCode::NOT_FOUND, "no class");
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[test]
    fn test_sync_error_is_transparent_over_backend() {
        let err: SyncError = BackendError::LoadError("boom".into()).into();
        assert_eq!(err.to_string(), "load error: boom");
    }

    #[test]
    fn test_relabel_keeps_unavailable() {
        let err = BackendError::Unavailable("503".into()).relabel(BackendError::LoadError);
        assert!(matches!(err, BackendError::Unavailable(_)));

        let err = BackendError::ClientError("bad vector".into()).relabel(BackendError::LoadError);
        assert!(matches!(err, BackendError::LoadError(msg) if msg.contains("bad vector")));
    }
}
