//! Row lifecycle codes and the transitions that do not need the server.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Synchronization state of a local row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Created locally, never pushed.
    NewRow,
    /// Matches the server copy identified by the row ETag.
    Synced,
    /// Edited locally since the last sync.
    Changed,
    /// Synced, but attachments still have to be uploaded.
    SyncedPendingFiles,
    /// Deleted locally, delete not yet pushed.
    Deleted,
    /// One half of a local/server conflict pair.
    InConflict,
}

/// What a local delete does to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAction {
    /// Remove the row outright; the server never saw it.
    Purge,
    /// Keep the row as `deleted` so the delete gets pushed.
    SoftDelete,
}

/// Outcome for one physical row when the server schema changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclassification {
    /// Leave the row as it is.
    Keep,
    /// Move the row to the given state and clear its conflict type.
    Become(SyncState),
    /// Remove the physical row.
    Remove,
}

impl SyncState {
    /// All states in declaration order.
    pub const ALL: [SyncState; 6] = [
        SyncState::NewRow,
        SyncState::Synced,
        SyncState::Changed,
        SyncState::SyncedPendingFiles,
        SyncState::Deleted,
        SyncState::InConflict,
    ];

    /// Returns the persisted name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::NewRow => "new_row",
            SyncState::Synced => "synced",
            SyncState::Changed => "changed",
            SyncState::SyncedPendingFiles => "synced_pending_files",
            SyncState::Deleted => "deleted",
            SyncState::InConflict => "in_conflict",
        }
    }

    /// Returns true if the row carries a local change waiting to be pushed.
    pub fn has_pending_push(&self) -> bool {
        matches!(
            self,
            SyncState::NewRow | SyncState::Changed | SyncState::Deleted
        )
    }

    /// State after a local value edit, or `None` if the row cannot be edited.
    pub fn after_local_update(&self) -> Option<SyncState> {
        match self {
            SyncState::NewRow => Some(SyncState::NewRow),
            SyncState::Synced | SyncState::SyncedPendingFiles | SyncState::Changed => {
                Some(SyncState::Changed)
            }
            SyncState::Deleted | SyncState::InConflict => None,
        }
    }

    /// Effect of a local delete, or `None` if the row cannot be deleted.
    pub fn on_local_delete(&self) -> Option<DeleteAction> {
        match self {
            SyncState::NewRow => Some(DeleteAction::Purge),
            SyncState::Synced | SyncState::SyncedPendingFiles | SyncState::Changed => {
                Some(DeleteAction::SoftDelete)
            }
            SyncState::Deleted | SyncState::InConflict => None,
        }
    }

    /// Reclassifies a physical row after the server schema changed.
    ///
    /// Synced rows go back to `new_row` so they get pushed again. A conflict
    /// pair collapses to its local half: the server half is removed and the
    /// local half returns to `changed` or `deleted`.
    pub fn after_schema_change(&self, conflict: Option<ConflictType>) -> Reclassification {
        match (self, conflict) {
            (SyncState::Synced | SyncState::SyncedPendingFiles, _) => {
                Reclassification::Become(SyncState::NewRow)
            }
            (SyncState::InConflict, Some(ConflictType::LocalUpdatedUpdatedValues)) => {
                Reclassification::Become(SyncState::Changed)
            }
            (SyncState::InConflict, Some(ConflictType::LocalDeletedOldValues)) => {
                Reclassification::Become(SyncState::Deleted)
            }
            (SyncState::InConflict, _) => Reclassification::Remove,
            (SyncState::NewRow | SyncState::Changed | SyncState::Deleted, _) => {
                Reclassification::Keep
            }
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownSyncState(s.to_string()))
    }
}

/// Which side of a conflict a physical row holds, and what happened to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Local copy was deleted; the row holds its old values.
    LocalDeletedOldValues,
    /// Local copy was updated; the row holds the local values.
    LocalUpdatedUpdatedValues,
    /// Server copy was deleted; the row holds its old values.
    ServerDeletedOldValues,
    /// Server copy was updated; the row holds the server values.
    ServerUpdatedUpdatedValues,
}

impl ConflictType {
    /// Returns the persisted integer code.
    pub fn to_code(&self) -> i64 {
        match self {
            ConflictType::LocalDeletedOldValues => 0,
            ConflictType::LocalUpdatedUpdatedValues => 1,
            ConflictType::ServerDeletedOldValues => 2,
            ConflictType::ServerUpdatedUpdatedValues => 3,
        }
    }

    /// Parses a persisted integer code.
    pub fn from_code(code: i64) -> ProtocolResult<Self> {
        match code {
            0 => Ok(ConflictType::LocalDeletedOldValues),
            1 => Ok(ConflictType::LocalUpdatedUpdatedValues),
            2 => Ok(ConflictType::ServerDeletedOldValues),
            3 => Ok(ConflictType::ServerUpdatedUpdatedValues),
            other => Err(ProtocolError::UnknownConflictType(other)),
        }
    }

    /// Conflict type for the local half of a pair.
    pub fn local(deleted: bool) -> Self {
        if deleted {
            ConflictType::LocalDeletedOldValues
        } else {
            ConflictType::LocalUpdatedUpdatedValues
        }
    }

    /// Conflict type for the server half of a pair.
    pub fn server(deleted: bool) -> Self {
        if deleted {
            ConflictType::ServerDeletedOldValues
        } else {
            ConflictType::ServerUpdatedUpdatedValues
        }
    }

    /// Returns true for the local half of a pair.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ConflictType::LocalDeletedOldValues | ConflictType::LocalUpdatedUpdatedValues
        )
    }

    /// Returns true for the server half of a pair.
    pub fn is_server(&self) -> bool {
        !self.is_local()
    }

    /// Returns true if this side of the pair was deleted.
    pub fn is_deleted(&self) -> bool {
        matches!(
            self,
            ConflictType::LocalDeletedOldValues | ConflictType::ServerDeletedOldValues
        )
    }
}

/// Whether a savepoint is a finished edit or an intermediate checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SavepointType {
    /// A completed, user-saved edit. Only these are pushed.
    #[default]
    Complete,
    /// An in-progress checkpoint.
    Incomplete,
}

impl SavepointType {
    /// Returns the persisted name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SavepointType::Complete => "COMPLETE",
            SavepointType::Incomplete => "INCOMPLETE",
        }
    }
}

impl fmt::Display for SavepointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SavepointType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETE" => Ok(SavepointType::Complete),
            "INCOMPLETE" => Ok(SavepointType::Incomplete),
            other => Err(ProtocolError::UnknownSavepointType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_parse_back() {
        for state in SyncState::ALL {
            assert_eq!(state.as_str().parse::<SyncState>().unwrap(), state);
        }
        assert!("rest".parse::<SyncState>().is_err());
    }

    #[test]
    fn pending_push_states() {
        let pending: Vec<_> = SyncState::ALL
            .iter()
            .filter(|s| s.has_pending_push())
            .collect();
        assert_eq!(
            pending,
            [&SyncState::NewRow, &SyncState::Changed, &SyncState::Deleted]
        );
    }

    #[test]
    fn conflict_codes() {
        for code in 0..4 {
            assert_eq!(ConflictType::from_code(code).unwrap().to_code(), code);
        }
        assert!(ConflictType::from_code(4).is_err());
        assert!(ConflictType::from_code(-1).is_err());
    }

    #[test]
    fn conflict_sides() {
        assert!(ConflictType::local(true).is_local());
        assert!(ConflictType::local(true).is_deleted());
        assert!(ConflictType::server(false).is_server());
        assert!(!ConflictType::server(false).is_deleted());
        assert_eq!(
            ConflictType::server(true),
            ConflictType::ServerDeletedOldValues
        );
    }

    #[test]
    fn local_edits_never_reach_engine_states() {
        for state in SyncState::ALL {
            if let Some(next) = state.after_local_update() {
                assert!(matches!(next, SyncState::NewRow | SyncState::Changed));
            }
        }
        assert_eq!(SyncState::Synced.after_local_update(), Some(SyncState::Changed));
        assert_eq!(SyncState::NewRow.after_local_update(), Some(SyncState::NewRow));
        assert_eq!(SyncState::Deleted.after_local_update(), None);
        assert_eq!(SyncState::InConflict.after_local_update(), None);
    }

    #[test]
    fn local_delete() {
        assert_eq!(SyncState::NewRow.on_local_delete(), Some(DeleteAction::Purge));
        assert_eq!(
            SyncState::Synced.on_local_delete(),
            Some(DeleteAction::SoftDelete)
        );
        assert_eq!(
            SyncState::Changed.on_local_delete(),
            Some(DeleteAction::SoftDelete)
        );
        assert_eq!(SyncState::InConflict.on_local_delete(), None);
    }

    #[test]
    fn schema_change_table() {
        use ConflictType::*;
        use Reclassification::*;
        use SyncState::*;

        let cases = [
            (NewRow, None, Keep),
            (Synced, None, Become(NewRow)),
            (SyncedPendingFiles, None, Become(NewRow)),
            (Changed, None, Keep),
            (Deleted, None, Keep),
            (InConflict, Some(LocalUpdatedUpdatedValues), Become(Changed)),
            (InConflict, Some(LocalDeletedOldValues), Become(Deleted)),
            (InConflict, Some(ServerUpdatedUpdatedValues), Remove),
            (InConflict, Some(ServerDeletedOldValues), Remove),
        ];

        for (state, conflict, expected) in cases {
            assert_eq!(
                state.after_schema_change(conflict),
                expected,
                "{state} / {conflict:?}"
            );
        }
    }

    #[test]
    fn savepoint_names() {
        assert_eq!(
            "INCOMPLETE".parse::<SavepointType>().unwrap(),
            SavepointType::Incomplete
        );
        assert_eq!(SavepointType::default().as_str(), "COMPLETE");
        assert!("complete".parse::<SavepointType>().is_err());
    }
}
