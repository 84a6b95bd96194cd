//! Classification of pulled rows against the local copy.
//!
//! Everything here is pure except [`apply`], which writes one decision through
//! a [`RowWriter`] inside the caller's transaction.

use tablesync_protocol::{ConflictType, FilterScope, Row, SavepointType, SyncState};
use tablesync_store::{LocalRow, LocalTable, RowEntry, RowWriter, StoreResult, Values};

/// What a pulled row does to the local table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullAction {
    /// Nothing changes.
    Ignore,
    /// A row new to this device is stored as `synced`.
    Insert(LocalRow),
    /// The local copy is replaced by the server version as `synced`.
    Replace(LocalRow),
    /// Every physical row of the id is removed.
    Purge,
    /// Local and server edits collide; both are kept as a conflict pair.
    Conflict {
        /// The local half.
        local: LocalRow,
        /// The server half.
        server: LocalRow,
    },
    /// An existing conflict gets a newer server half.
    RefreshServerHalf(LocalRow),
}

/// Converts a pulled row to a local `synced` row restricted to the declared columns.
///
/// `fallback_timestamp` is used when the server row carries no savepoint.
pub fn server_row(table: &LocalTable, row: &Row, fallback_timestamp: &str) -> LocalRow {
    let values: Values = table
        .column_keys()
        .into_iter()
        .map(|key| {
            let value = row.values.get(&key).cloned().flatten();
            (key, value)
        })
        .collect();
    LocalRow {
        row_id: row.row_id.clone(),
        row_etag: row.row_etag.clone(),
        sync_state: SyncState::Synced,
        conflict_type: None,
        filter_type: row.filter_scope.filter_type.clone(),
        filter_value: row.filter_scope.value.clone(),
        form_id: row.form_id.clone(),
        locale: row.locale.clone(),
        savepoint_type: row
            .savepoint_type
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(SavepointType::Complete),
        savepoint_timestamp: row
            .savepoint_timestamp
            .clone()
            .unwrap_or_else(|| fallback_timestamp.to_string()),
        savepoint_creator: row.savepoint_creator.clone(),
        values,
    }
}

/// Converts a local row to its wire form for a push.
pub fn wire_row(row: &LocalRow) -> Row {
    Row {
        row_id: row.row_id.clone(),
        row_etag: row.row_etag.clone(),
        deleted: row.sync_state == SyncState::Deleted,
        form_id: row.form_id.clone(),
        locale: row.locale.clone(),
        savepoint_type: Some(row.savepoint_type.as_str().to_string()),
        savepoint_timestamp: Some(row.savepoint_timestamp.clone()),
        savepoint_creator: row.savepoint_creator.clone(),
        filter_scope: FilterScope {
            filter_type: row.filter_type.clone(),
            value: row.filter_value.clone(),
        },
        values: row.values.clone(),
    }
}

/// Decides what a pulled row does, given the local entry for its id.
///
/// `incoming` must come from [`server_row`]; `deleted` is the server's
/// deletion flag for it.
pub fn plan_pull(local: Option<&RowEntry>, incoming: LocalRow, deleted: bool) -> PullAction {
    let entry = match local {
        None if deleted => return PullAction::Ignore,
        None => return PullAction::Insert(incoming),
        Some(entry) => entry,
    };

    match entry {
        RowEntry::Plain(local) => plan_plain(local, incoming, deleted),
        RowEntry::Conflicted { local, server } => {
            let server_deleted = server
                .conflict_type
                .map(|c| c.is_deleted())
                .unwrap_or(false);
            if server.row_etag == incoming.row_etag && server_deleted == deleted {
                PullAction::Ignore
            } else if deleted && local.conflict_type == Some(ConflictType::LocalDeletedOldValues) {
                PullAction::Purge
            } else {
                PullAction::RefreshServerHalf(
                    incoming.as_conflict(ConflictType::server(deleted)),
                )
            }
        }
    }
}

fn plan_plain(local: &LocalRow, incoming: LocalRow, deleted: bool) -> PullAction {
    let same_version = local.row_etag.is_some() && local.row_etag == incoming.row_etag;
    match local.sync_state {
        SyncState::Synced | SyncState::SyncedPendingFiles => {
            if deleted {
                PullAction::Purge
            } else if same_version {
                PullAction::Ignore
            } else {
                PullAction::Replace(incoming)
            }
        }
        SyncState::NewRow | SyncState::Changed => {
            if same_version && !deleted {
                PullAction::Ignore
            } else if !deleted && local.values == incoming.values {
                PullAction::Replace(incoming)
            } else {
                PullAction::Conflict {
                    local: local
                        .clone()
                        .as_conflict(ConflictType::LocalUpdatedUpdatedValues),
                    server: incoming.as_conflict(ConflictType::server(deleted)),
                }
            }
        }
        SyncState::Deleted => {
            if deleted {
                PullAction::Purge
            } else if same_version {
                PullAction::Ignore
            } else {
                PullAction::Conflict {
                    local: local
                        .clone()
                        .as_conflict(ConflictType::LocalDeletedOldValues),
                    server: incoming.as_conflict(ConflictType::ServerUpdatedUpdatedValues),
                }
            }
        }
        // A lone in_conflict row is malformed; let the server version win.
        SyncState::InConflict => PullAction::Replace(incoming),
    }
}

/// Writes one pull decision.
pub fn apply(writer: &RowWriter<'_>, row_id: &str, action: &PullAction) -> StoreResult<()> {
    match action {
        PullAction::Ignore => {}
        PullAction::Insert(row) | PullAction::Replace(row) => writer.replace(row)?,
        PullAction::Purge => {
            writer.delete_all(row_id)?;
        }
        PullAction::Conflict { local, server } => writer.store_conflict(local, server)?,
        PullAction::RefreshServerHalf(server) => writer.replace_server_half(server)?,
    }
    Ok(())
}

/// Rows waiting to be pushed: complete savepoints in `new_row`, `changed` or `deleted`.
pub fn rows_to_push(writer: &RowWriter<'_>) -> StoreResult<Vec<LocalRow>> {
    Ok(writer
        .rows_in_states(&[SyncState::NewRow, SyncState::Changed, SyncState::Deleted])?
        .into_iter()
        .filter(|row| row.savepoint_type == SavepointType::Complete)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::{Column, SyncTag};

    fn table() -> LocalTable {
        LocalTable {
            table_id: "people".into(),
            display_name: None,
            columns: vec![Column::new("age", "integer"), Column::new("name", "string")],
            sync_tag: SyncTag::empty(),
            last_sync_time: None,
            properties_dirty: false,
            sync_enabled: true,
        }
    }

    fn wire(etag: &str, age: &str) -> Row {
        let mut row = Row::new(
            "r1",
            [
                ("age".to_string(), Some(age.to_string())),
                ("undeclared".to_string(), Some("x".to_string())),
            ]
            .into(),
        );
        row.row_etag = Some(etag.into());
        row
    }

    fn local(state: SyncState, etag: Option<&str>, age: &str) -> LocalRow {
        let mut row = LocalRow::new(
            "r1",
            "2026-01-01T00:00:00.000000000".into(),
            Values::from([
                ("age".to_string(), Some(age.to_string())),
                ("name".to_string(), None),
            ]),
        )
        .in_state(state);
        row.row_etag = etag.map(String::from);
        row
    }

    fn incoming(etag: &str, age: &str) -> LocalRow {
        server_row(&table(), &wire(etag, age), "2026-01-02T00:00:00.000000000")
    }

    #[test]
    fn server_row_keeps_declared_columns_only() {
        let row = incoming("e1", "5");
        assert_eq!(row.values.len(), 2);
        assert_eq!(row.value("age"), Some("5"));
        assert_eq!(row.values.get("name"), Some(&None));
        assert!(!row.values.contains_key("undeclared"));
        assert_eq!(row.sync_state, SyncState::Synced);
        assert_eq!(row.savepoint_timestamp, "2026-01-02T00:00:00.000000000");
    }

    #[test]
    fn unknown_rows() {
        assert!(matches!(
            plan_pull(None, incoming("e1", "5"), false),
            PullAction::Insert(_)
        ));
        assert_eq!(plan_pull(None, incoming("e1", "5"), true), PullAction::Ignore);
    }

    #[test]
    fn synced_rows_follow_server() {
        let entry = RowEntry::Plain(local(SyncState::Synced, Some("e1"), "5"));
        assert!(matches!(
            plan_pull(Some(&entry), incoming("e2", "6"), false),
            PullAction::Replace(_)
        ));
        assert_eq!(
            plan_pull(Some(&entry), incoming("e1", "5"), false),
            PullAction::Ignore
        );
        assert_eq!(
            plan_pull(Some(&entry), incoming("e2", "5"), true),
            PullAction::Purge
        );
    }

    #[test]
    fn changed_row_with_moved_server_conflicts() {
        let entry = RowEntry::Plain(local(SyncState::Changed, Some("e1"), "5"));
        match plan_pull(Some(&entry), incoming("e2", "7"), false) {
            PullAction::Conflict { local, server } => {
                assert_eq!(local.sync_state, SyncState::InConflict);
                assert_eq!(
                    local.conflict_type,
                    Some(ConflictType::LocalUpdatedUpdatedValues)
                );
                assert_eq!(local.value("age"), Some("5"));
                assert_eq!(
                    server.conflict_type,
                    Some(ConflictType::ServerUpdatedUpdatedValues)
                );
                assert_eq!(server.value("age"), Some("7"));
                assert_eq!(server.row_etag.as_deref(), Some("e2"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn changed_row_against_server_delete() {
        let entry = RowEntry::Plain(local(SyncState::Changed, Some("e1"), "5"));
        match plan_pull(Some(&entry), incoming("e2", "5"), true) {
            PullAction::Conflict { server, .. } => {
                assert_eq!(
                    server.conflict_type,
                    Some(ConflictType::ServerDeletedOldValues)
                );
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn pending_push_with_same_version_waits() {
        let entry = RowEntry::Plain(local(SyncState::Changed, Some("e1"), "5"));
        assert_eq!(
            plan_pull(Some(&entry), incoming("e1", "4"), false),
            PullAction::Ignore
        );
    }

    #[test]
    fn identical_values_adopt_server_version() {
        let entry = RowEntry::Plain(local(SyncState::NewRow, None, "5"));
        match plan_pull(Some(&entry), incoming("e9", "5"), false) {
            PullAction::Replace(row) => {
                assert_eq!(row.sync_state, SyncState::Synced);
                assert_eq!(row.row_etag.as_deref(), Some("e9"));
            }
            other => panic!("expected replace, got {other:?}"),
        }
    }

    #[test]
    fn local_delete() {
        let entry = RowEntry::Plain(local(SyncState::Deleted, Some("e1"), "5"));
        assert_eq!(
            plan_pull(Some(&entry), incoming("e1", "5"), false),
            PullAction::Ignore
        );
        assert_eq!(
            plan_pull(Some(&entry), incoming("e2", "5"), true),
            PullAction::Purge
        );
        match plan_pull(Some(&entry), incoming("e2", "8"), false) {
            PullAction::Conflict { local, server } => {
                assert_eq!(local.conflict_type, Some(ConflictType::LocalDeletedOldValues));
                assert_eq!(
                    server.conflict_type,
                    Some(ConflictType::ServerUpdatedUpdatedValues)
                );
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn existing_conflicts() {
        let pair = |local_type: ConflictType| RowEntry::Conflicted {
            local: local(SyncState::Changed, Some("e1"), "5").as_conflict(local_type),
            server: incoming("e2", "7").as_conflict(ConflictType::ServerUpdatedUpdatedValues),
        };
        let updated = pair(ConflictType::LocalUpdatedUpdatedValues);
        assert_eq!(
            plan_pull(Some(&updated), incoming("e2", "7"), false),
            PullAction::Ignore
        );
        match plan_pull(Some(&updated), incoming("e3", "8"), false) {
            PullAction::RefreshServerHalf(server) => {
                assert_eq!(server.row_etag.as_deref(), Some("e3"));
                assert_eq!(
                    server.conflict_type,
                    Some(ConflictType::ServerUpdatedUpdatedValues)
                );
            }
            other => panic!("expected refresh, got {other:?}"),
        }

        let deleted = pair(ConflictType::LocalDeletedOldValues);
        assert_eq!(
            plan_pull(Some(&deleted), incoming("e3", "7"), true),
            PullAction::Purge
        );
    }

    #[test]
    fn wire_row_marks_deletes() {
        let row = wire_row(&local(SyncState::Deleted, Some("e1"), "5"));
        assert!(row.deleted);
        assert_eq!(row.savepoint_type.as_deref(), Some("COMPLETE"));
        assert_eq!(row.values.get("age"), Some(&Some("5".to_string())));
    }
}
