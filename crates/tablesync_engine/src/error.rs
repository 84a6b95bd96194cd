//! Errors of a sync pass and how to react to them.

use tablesync_protocol::ResponseClass;
use tablesync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Running the pass again may succeed.
    Retryable,
    /// Running the pass again will fail the same way.
    Permanent,
    /// A new access token is required first.
    ReauthRequired,
}

/// Errors of protocol calls and of the local steps of a pass.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The access token was rejected (401).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server denied access (403).
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The server answered with another non-success status.
    #[error("request failed with status {status}: {message}")]
    RequestFailed {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Response body could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Local file system failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Another pass is still running on this processor.
    #[error("a sync pass is already running")]
    AlreadyRunning,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Maps a non-success status and its body to an error.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let message = String::from_utf8_lossy(body).trim().to_string();
        match ResponseClass::from_status(status) {
            ResponseClass::AuthRequired => SyncError::Auth(message),
            ResponseClass::AccessDenied => SyncError::AccessDenied(message),
            ResponseClass::Ok | ResponseClass::Failure => {
                SyncError::RequestFailed { status, message }
            }
        }
    }

    /// The HTTP status behind this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Auth(_) => Some(401),
            SyncError::AccessDenied(_) => Some(403),
            SyncError::RequestFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true if the server reported a row version conflict.
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Classifies the error for retry decisions.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            SyncError::Transport { retryable, .. } => {
                if *retryable {
                    RetryClass::Retryable
                } else {
                    RetryClass::Permanent
                }
            }
            SyncError::Auth(_) => RetryClass::ReauthRequired,
            SyncError::RequestFailed { status, .. } if *status >= 500 || *status == 408 => {
                RetryClass::Retryable
            }
            SyncError::Io(_) => RetryClass::Retryable,
            _ => RetryClass::Permanent,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.retry_class() == RetryClass::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::from_status(503, b"busy").is_retryable());
        assert!(!SyncError::from_status(400, b"bad").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn status_classes() {
        assert!(matches!(
            SyncError::from_status(401, b""),
            SyncError::Auth(_)
        ));
        assert!(matches!(
            SyncError::from_status(403, b"nope"),
            SyncError::AccessDenied(ref m) if m == "nope"
        ));
        assert!(SyncError::from_status(409, b"").is_conflict());
        assert_eq!(
            SyncError::from_status(401, b"").retry_class(),
            RetryClass::ReauthRequired
        );
        assert_eq!(
            SyncError::from_status(403, b"").retry_class(),
            RetryClass::Permanent
        );
    }

    #[test]
    fn error_display() {
        let err = SyncError::RequestFailed {
            status: 500,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "request failed with status 500: boom");
        assert_eq!(SyncError::Cancelled.to_string(), "sync cancelled");
    }
}
