//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A serialized sync tag could not be parsed.
    #[error("invalid sync tag: {0}")]
    InvalidSyncTag(String),

    /// Unknown row sync state name.
    #[error("unknown sync state: {0}")]
    UnknownSyncState(String),

    /// Unknown conflict type code.
    #[error("unknown conflict type code: {0}")]
    UnknownConflictType(i64),

    /// Unknown savepoint type name.
    #[error("unknown savepoint type: {0}")]
    UnknownSavepointType(String),

    /// Unknown key-value type name.
    #[error("unknown key-value type: {0}")]
    UnknownKvType(String),

    /// A key-value payload does not parse as its declared type.
    #[error("value {value:?} is not a valid {kind}")]
    InvalidKvValue {
        /// Declared type name.
        kind: &'static str,
        /// Raw stored value.
        value: String,
    },
}
