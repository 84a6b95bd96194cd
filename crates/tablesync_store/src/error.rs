//! Error types for the local store.

use tablesync_protocol::{KvType, ProtocolError, SyncState};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the local store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored code or tag could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The table is not in the catalog.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// The table is already in the catalog.
    #[error("table already exists: {0}")]
    TableExists(String),

    /// No physical row has this id.
    #[error("row {row_id} not found in table {table_id}")]
    RowNotFound {
        /// Table identifier.
        table_id: String,
        /// Row identifier.
        row_id: String,
    },

    /// A table id or column key is not a safe SQL identifier.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A typed getter found a value of another type.
    #[error("key {key} holds a {actual} value, not {expected}")]
    TypeMismatch {
        /// The key that was read.
        key: String,
        /// Requested type.
        expected: KvType,
        /// Stored type.
        actual: KvType,
    },

    /// A local edit is not allowed in the row's current state.
    #[error("cannot {operation} row {row_id} in state {state}")]
    InvalidTransition {
        /// Row identifier.
        row_id: String,
        /// Current state.
        state: SyncState,
        /// Attempted edit.
        operation: &'static str,
    },

    /// Conflict resolution was requested for a row that is not in conflict.
    #[error("row {row_id} is not in conflict")]
    NotInConflict {
        /// Row identifier.
        row_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::InvalidTransition {
            row_id: "r1".into(),
            state: SyncState::Deleted,
            operation: "update",
        };
        assert_eq!(err.to_string(), "cannot update row r1 in state deleted");

        let err = StoreError::TypeMismatch {
            key: "color".into(),
            expected: KvType::Integer,
            actual: KvType::String,
        };
        assert_eq!(err.to_string(), "key color holds a string value, not integer");
    }
}
