//! Resolution of rows left in conflict by a sync pass.

use tablesync_protocol::{ConflictType, SyncState};
use tablesync_store::{
    Database, LocalRow, LocalTable, RowEntry, RowWriter, StoreError, StoreResult, Values,
};
use tracing::info;

/// Which side of a conflict the caller keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the local values.
    TakeLocal,
    /// Keep the server values.
    TakeServer,
    /// Keep a caller-chosen blend.
    TakeMerged(Values),
}

/// What a resolution left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedAs {
    /// One `changed` row, pushed by the next pass.
    Changed,
    /// One `deleted` row, so the local delete is pushed again.
    Deleted,
    /// Nothing; the server had already deleted the row.
    Removed,
}

/// Resolves conflict pairs of one table.
pub struct ConflictResolver<'a> {
    db: &'a Database,
    table: LocalTable,
}

impl<'a> ConflictResolver<'a> {
    /// Opens the resolver for a table.
    pub fn new(db: &'a Database, table_id: &str) -> StoreResult<Self> {
        Ok(Self {
            db,
            table: db.table(table_id)?,
        })
    }

    /// The conflict pairs of the table, ordered by row id.
    pub fn conflicts(&self) -> StoreResult<Vec<(LocalRow, LocalRow)>> {
        Ok(self
            .db
            .data_table(&self.table.table_id)?
            .conflicts()?
            .into_iter()
            .filter_map(|entry| match entry {
                RowEntry::Conflicted { local, server } => Some((local, server)),
                RowEntry::Plain(_) => None,
            })
            .collect())
    }

    /// Keeps the local values.
    pub fn take_local(&self, row_id: &str) -> StoreResult<ResolvedAs> {
        self.resolve(row_id, Resolution::TakeLocal)
    }

    /// Keeps the server values.
    pub fn take_server(&self, row_id: &str) -> StoreResult<ResolvedAs> {
        self.resolve(row_id, Resolution::TakeServer)
    }

    /// Keeps the given values.
    pub fn take_merged(&self, row_id: &str, values: Values) -> StoreResult<ResolvedAs> {
        self.resolve(row_id, Resolution::TakeMerged(values))
    }

    /// Collapses a conflict pair into one row in a single transaction.
    ///
    /// The kept row always carries the server half's row ETag, so the next
    /// push is accepted. Fails with [`StoreError::NotInConflict`] if the id
    /// has no conflict pair.
    pub fn resolve(&self, row_id: &str, resolution: Resolution) -> StoreResult<ResolvedAs> {
        let outcome = self.db.transaction(|txn| {
            let writer = RowWriter::new(txn, &self.table);
            let (local, server) = writer.conflict_pair(row_id)?;

            if resolution == Resolution::TakeServer
                && server.conflict_type == Some(ConflictType::ServerDeletedOldValues)
            {
                writer.delete_all(row_id)?;
                return Ok(ResolvedAs::Removed);
            }

            let keep_delete = resolution == Resolution::TakeLocal
                && local.conflict_type == Some(ConflictType::LocalDeletedOldValues);
            let merged = match &resolution {
                Resolution::TakeLocal if keep_delete => server.values.clone(),
                Resolution::TakeLocal => local.values.clone(),
                Resolution::TakeServer => server.values.clone(),
                Resolution::TakeMerged(values) => values.clone(),
            };

            let state = if keep_delete {
                SyncState::Deleted
            } else {
                SyncState::Changed
            };
            writer.collapse_conflict(
                local,
                state,
                server.row_etag.clone(),
                merged,
                self.db.clock().next(),
            )?;
            Ok::<_, StoreError>(if keep_delete {
                ResolvedAs::Deleted
            } else {
                ResolvedAs::Changed
            })
        })?;
        info!(
            table_id = %self.table.table_id,
            row_id,
            ?outcome,
            "resolved conflict"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::Column;

    fn values(pairs: &[(&str, &str)]) -> Values {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Some(v.to_string())))
            .collect()
    }

    fn conflicted_db(local: ConflictType, server: ConflictType) -> Database {
        let db = Database::open_in_memory().unwrap();
        let table = db
            .create_table(
                "people",
                None,
                &[Column::new("name", "string"), Column::new("age", "integer")],
            )
            .unwrap();
        let local_row = LocalRow::new(
            "r1",
            db.clock().next(),
            values(&[("name", "Ann"), ("age", "5")]),
        )
        .as_conflict(local);
        let mut server_row = LocalRow::new(
            "r1",
            db.clock().next(),
            values(&[("name", "Ann"), ("age", "7")]),
        )
        .as_conflict(server);
        server_row.row_etag = Some("etag-2".into());
        db.transaction(|txn| RowWriter::new(txn, &table).store_conflict(&local_row, &server_row))
            .unwrap();
        db
    }

    fn only_row(db: &Database) -> LocalRow {
        let rows = db.data_table("people").unwrap().savepoint_history("r1").unwrap();
        assert_eq!(rows.len(), 1);
        rows.into_iter().next().unwrap()
    }

    #[test]
    fn take_local_keeps_local_values_and_server_etag() {
        let db = conflicted_db(
            ConflictType::LocalUpdatedUpdatedValues,
            ConflictType::ServerUpdatedUpdatedValues,
        );
        let resolver = ConflictResolver::new(&db, "people").unwrap();
        assert_eq!(resolver.take_local("r1").unwrap(), ResolvedAs::Changed);

        let row = only_row(&db);
        assert_eq!(row.sync_state, SyncState::Changed);
        assert_eq!(row.conflict_type, None);
        assert_eq!(row.value("age"), Some("5"));
        assert_eq!(row.row_etag.as_deref(), Some("etag-2"));
    }

    #[test]
    fn take_server_keeps_server_values() {
        let db = conflicted_db(
            ConflictType::LocalUpdatedUpdatedValues,
            ConflictType::ServerUpdatedUpdatedValues,
        );
        let resolver = ConflictResolver::new(&db, "people").unwrap();
        resolver.take_server("r1").unwrap();
        assert_eq!(only_row(&db).value("age"), Some("7"));
    }

    #[test]
    fn take_merged_blends_values() {
        let db = conflicted_db(
            ConflictType::LocalUpdatedUpdatedValues,
            ConflictType::ServerUpdatedUpdatedValues,
        );
        let resolver = ConflictResolver::new(&db, "people").unwrap();
        resolver
            .take_merged("r1", values(&[("age", "6"), ("unknown", "x")]))
            .unwrap();
        let row = only_row(&db);
        assert_eq!(row.value("age"), Some("6"));
        assert_eq!(row.value("name"), Some("Ann"));
        assert!(!row.values.contains_key("unknown"));
    }

    #[test]
    fn merged_resolution_matches_table_level_resolution() {
        let merged = values(&[("age", "6")]);
        let via_resolver = conflicted_db(
            ConflictType::LocalUpdatedUpdatedValues,
            ConflictType::ServerUpdatedUpdatedValues,
        );
        ConflictResolver::new(&via_resolver, "people")
            .unwrap()
            .take_merged("r1", merged.clone())
            .unwrap();
        let via_table = conflicted_db(
            ConflictType::LocalUpdatedUpdatedValues,
            ConflictType::ServerUpdatedUpdatedValues,
        );
        via_table
            .data_table("people")
            .unwrap()
            .resolve_conflict("r1", Some("etag-2"), &merged)
            .unwrap();

        let mut a = only_row(&via_resolver);
        let mut b = only_row(&via_table);
        a.savepoint_timestamp.clear();
        b.savepoint_timestamp.clear();
        assert_eq!(a, b);
    }

    #[test]
    fn take_local_of_a_local_delete_repushes_the_delete() {
        let db = conflicted_db(
            ConflictType::LocalDeletedOldValues,
            ConflictType::ServerUpdatedUpdatedValues,
        );
        let resolver = ConflictResolver::new(&db, "people").unwrap();
        assert_eq!(resolver.take_local("r1").unwrap(), ResolvedAs::Deleted);

        let row = only_row(&db);
        assert_eq!(row.sync_state, SyncState::Deleted);
        assert_eq!(row.row_etag.as_deref(), Some("etag-2"));
    }

    #[test]
    fn take_server_of_a_server_delete_removes_the_row() {
        let db = conflicted_db(
            ConflictType::LocalUpdatedUpdatedValues,
            ConflictType::ServerDeletedOldValues,
        );
        let resolver = ConflictResolver::new(&db, "people").unwrap();
        assert_eq!(resolver.take_server("r1").unwrap(), ResolvedAs::Removed);
        assert!(db
            .data_table("people")
            .unwrap()
            .savepoint_history("r1")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn resolving_twice_fails_cleanly() {
        let db = conflicted_db(
            ConflictType::LocalUpdatedUpdatedValues,
            ConflictType::ServerUpdatedUpdatedValues,
        );
        let resolver = ConflictResolver::new(&db, "people").unwrap();
        resolver.take_local("r1").unwrap();
        assert!(matches!(
            resolver.take_local("r1"),
            Err(StoreError::NotInConflict { .. })
        ));
        assert_eq!(only_row(&db).value("age"), Some("5"));
    }

    #[test]
    fn conflicts_lists_pairs() {
        let db = conflicted_db(
            ConflictType::LocalUpdatedUpdatedValues,
            ConflictType::ServerUpdatedUpdatedValues,
        );
        let resolver = ConflictResolver::new(&db, "people").unwrap();
        let pairs = resolver.conflicts().unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1.value("age"), Some("7"));
    }
}
