//! Error taxonomy for the gateway.
//!
//! Every fallible library operation returns [`GatewayError`] so that callers
//! can tell business failures (surfaced to clients as `{"error": ...}`) from
//! unexpected faults, and transient conditions from fatal ones, without
//! matching on message text.
//!
//! | Variant | Code | Retryable |
//! |---------|------|-----------|
//! | `Validation` | `validation` | no |
//! | `SpaceNotFound` | `space_not_found` | no |
//! | `DocumentNotFound` | `document_not_found` | no |
//! | `ObjectStore` | `object_store` | yes |
//! | `RemoteIndex` | `remote_index` | on 429 / 5xx |
//! | `RemoteTransport` | `remote_transport` | yes |
//! | `Persistence` | `persistence` | no |
//! | `Extract` | `unsupported_format`, `file_too_large`, `empty_content`, `extract_failed` | no |
//! | `Timeout` | `timeout` | yes |
//! | `Unknown` | `internal` | no |

use std::time::Duration;

use thiserror::Error;

use crate::extract::ExtractError;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or malformed caller input.
    #[error("{0}")]
    Validation(String),

    #[error("knowledge space not found: {0}")]
    SpaceNotFound(String),

    /// The local mapping row for a document is absent.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("object storage error: {0}")]
    ObjectStore(String),

    /// Non-2xx answer from the remote RAG platform. The body is kept verbatim.
    #[error("remote index error (HTTP {status}): {body}")]
    RemoteIndex { status: u16, body: String },

    #[error("remote index unreachable: {0}")]
    RemoteTransport(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("answer stream exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn object_store(message: impl Into<String>) -> Self {
        Self::ObjectStore(message.into())
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown(message.into())
    }

    /// Stable machine-readable code, used in client-facing error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation",
            GatewayError::SpaceNotFound(_) => "space_not_found",
            GatewayError::DocumentNotFound(_) => "document_not_found",
            GatewayError::ObjectStore(_) => "object_store",
            GatewayError::RemoteIndex { .. } => "remote_index",
            GatewayError::RemoteTransport(_) => "remote_transport",
            GatewayError::Persistence(_) => "persistence",
            GatewayError::Extract(e) => e.code(),
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Unknown(_) => "internal",
        }
    }

    /// Whether repeating the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::ObjectStore(_)
            | GatewayError::RemoteTransport(_)
            | GatewayError::Timeout(_) => true,
            GatewayError::RemoteIndex { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Unexpected faults are reported to clients without internal detail.
    pub fn is_internal(&self) -> bool {
        matches!(self, GatewayError::Unknown(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::RemoteTransport(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Extract(ExtractError::Io(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_retry_only_on_transient_status() {
        let throttled = GatewayError::RemoteIndex {
            status: 429,
            body: "slow down".to_string(),
        };
        let rejected = GatewayError::RemoteIndex {
            status: 400,
            body: "bad name".to_string(),
        };
        assert!(throttled.is_retryable());
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.code(), "remote_index");
        assert!(rejected.to_string().contains("bad name"));
    }

    #[test]
    fn extraction_errors_keep_their_codes() {
        let err: GatewayError = ExtractError::FileTooLarge {
            size: 10,
            limit: 5,
        }
        .into();
        assert_eq!(err.code(), "file_too_large");
        assert!(!err.is_retryable());
        assert!(!err.is_internal());
    }

    #[test]
    fn only_unknown_is_internal() {
        assert!(GatewayError::unknown("boom").is_internal());
        assert!(!GatewayError::validation("title must not be empty").is_internal());
    }
}
