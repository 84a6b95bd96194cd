//! Local edits and conflict handling for one data table.

use crate::catalog::LocalTable;
use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::rows::{LocalRow, RowEntry, RowWriter, Values};
use std::collections::BTreeMap;
use tablesync_protocol::{DeleteAction, Reclassification, SavepointType, SyncState};
use tracing::{debug, info, warn};

/// Counts of a schema-change reclassification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclassifySummary {
    /// Rows demoted to `new_row`.
    pub demoted: usize,
    /// Conflict pairs collapsed to their local half.
    pub collapsed: usize,
    /// Server halves removed.
    pub removed: usize,
}

/// The rows of one synchronized table.
pub struct DataTable<'a> {
    db: &'a Database,
    table: LocalTable,
}

impl<'a> DataTable<'a> {
    pub(crate) fn new(db: &'a Database, table: LocalTable) -> Self {
        Self { db, table }
    }

    /// The catalog entry of this table.
    pub fn table(&self) -> &LocalTable {
        &self.table
    }

    fn not_found(&self, row_id: &str) -> StoreError {
        StoreError::RowNotFound {
            table_id: self.table.table_id.clone(),
            row_id: row_id.to_string(),
        }
    }

    fn keep_declared(&self, values: &Values) -> Values {
        values
            .iter()
            .filter(|(k, _)| self.table.has_column(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Inserts a complete `new_row` with a fresh id.
    pub fn insert_row(&self, values: Values) -> StoreResult<String> {
        let row_id = uuid::Uuid::new_v4().to_string();
        self.insert_row_as(&row_id, values, SavepointType::Complete)?;
        Ok(row_id)
    }

    /// Inserts a `new_row` with a caller-chosen id and savepoint type.
    pub fn insert_row_as(
        &self,
        row_id: &str,
        values: Values,
        savepoint_type: SavepointType,
    ) -> StoreResult<()> {
        let mut row = LocalRow::new(row_id, self.db.clock().next(), self.keep_declared(&values));
        row.savepoint_type = savepoint_type;
        self.db
            .transaction(|tx| RowWriter::new(tx, &self.table).insert(&row))?;
        debug!(table_id = %self.table.table_id, row_id, "inserted row");
        Ok(())
    }

    /// Applies a local value edit and stamps a complete savepoint.
    ///
    /// A `synced` row becomes `changed`. Deleted and conflicted rows are refused.
    pub fn update_row(&self, row_id: &str, values: &Values) -> StoreResult<()> {
        let values = self.keep_declared(values);
        self.db.transaction(|tx| {
            let writer = RowWriter::new(tx, &self.table);
            let mut row = single_plain(writer.physical_rows(row_id)?)
                .ok_or_else(|| self.not_found(row_id))?;
            let next = row
                .sync_state
                .after_local_update()
                .ok_or(StoreError::InvalidTransition {
                    row_id: row_id.to_string(),
                    state: row.sync_state,
                    operation: "update",
                })?;
            row.values.extend(values);
            row.sync_state = next;
            row.savepoint_type = SavepointType::Complete;
            row.savepoint_timestamp = self.db.clock().next();
            writer.replace(&row)
        })
    }

    /// Deletes a row locally.
    ///
    /// A `new_row` is removed outright; a row the server has seen is kept as
    /// `deleted` so the delete can be pushed.
    pub fn mark_deleted(&self, row_id: &str) -> StoreResult<()> {
        self.db.transaction(|tx| {
            let writer = RowWriter::new(tx, &self.table);
            let row = single_plain(writer.physical_rows(row_id)?)
                .ok_or_else(|| self.not_found(row_id))?;
            match row.sync_state.on_local_delete() {
                Some(DeleteAction::Purge) => {
                    writer.delete_all(row_id)?;
                }
                Some(DeleteAction::SoftDelete) => {
                    writer.set_state(
                        row_id,
                        None,
                        SyncState::Deleted,
                        row.row_etag.as_deref(),
                    )?;
                }
                None => {
                    return Err(StoreError::InvalidTransition {
                        row_id: row_id.to_string(),
                        state: row.sync_state,
                        operation: "delete",
                    })
                }
            }
            Ok(())
        })
    }

    /// Hard-deletes every physical row of the id.
    pub fn delete_row_actual(&self, row_id: &str) -> StoreResult<usize> {
        self.db
            .transaction(|tx| RowWriter::new(tx, &self.table).delete_all(row_id))
    }

    /// The sync state of a row.
    ///
    /// Returns `None` if the id is unknown, or if it matches more than one
    /// physical row.
    pub fn get_row_sync_state(&self, row_id: &str) -> StoreResult<Option<SyncState>> {
        let rows = self.savepoint_history(row_id)?;
        match rows.as_slice() {
            [row] => Ok(Some(row.sync_state)),
            [] => Ok(None),
            _ => {
                warn!(
                    table_id = %self.table.table_id,
                    row_id,
                    count = rows.len(),
                    "multiple rows match row id"
                );
                Ok(None)
            }
        }
    }

    /// All physical rows of an id, oldest savepoint first.
    pub fn savepoint_history(&self, row_id: &str) -> StoreResult<Vec<LocalRow>> {
        self.db
            .read(|conn| RowWriter::new(conn, &self.table).physical_rows(row_id))
    }

    /// The logical entry of a row id.
    pub fn entry(&self, row_id: &str) -> StoreResult<Option<RowEntry>> {
        Ok(RowEntry::from_physical(self.savepoint_history(row_id)?)
            .into_iter()
            .next())
    }

    /// All logical entries, ordered by row id.
    pub fn entries(&self) -> StoreResult<Vec<RowEntry>> {
        let rows = self
            .db
            .read(|conn| RowWriter::new(conn, &self.table).all_rows())?;
        let mut grouped: BTreeMap<String, Vec<LocalRow>> = BTreeMap::new();
        for row in rows {
            grouped.entry(row.row_id.clone()).or_default().push(row);
        }
        Ok(grouped
            .into_values()
            .flat_map(RowEntry::from_physical)
            .collect())
    }

    /// Only the conflicted entries.
    pub fn conflicts(&self) -> StoreResult<Vec<RowEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(RowEntry::is_conflicted)
            .collect())
    }

    /// Resolves a conflict pair into a single `changed` row.
    ///
    /// The server half is deleted. The local half takes `server_row_etag`,
    /// the merged values and a fresh complete savepoint. Fails with
    /// [`StoreError::NotInConflict`] if the id has no conflict pair.
    pub fn resolve_conflict(
        &self,
        row_id: &str,
        server_row_etag: Option<&str>,
        merged_values: &Values,
    ) -> StoreResult<()> {
        self.db.transaction(|tx| {
            let writer = RowWriter::new(tx, &self.table);
            let (local, _server) = writer.conflict_pair(row_id)?;
            writer.collapse_conflict(
                local,
                SyncState::Changed,
                server_row_etag.map(str::to_string),
                merged_values.clone(),
                self.db.clock().next(),
            )
        })?;
        info!(table_id = %self.table.table_id, row_id, "resolved conflict");
        Ok(())
    }

    /// Reclassifies every row after the server schema changed.
    ///
    /// Runs in one transaction; a failure leaves every row untouched.
    pub fn reset_for_schema_change(&self) -> StoreResult<ReclassifySummary> {
        let summary = self.db.transaction(|tx| {
            let writer = RowWriter::new(tx, &self.table);
            let mut summary = ReclassifySummary::default();
            for row in writer.all_rows()? {
                match row.sync_state.after_schema_change(row.conflict_type) {
                    Reclassification::Keep => {}
                    Reclassification::Become(SyncState::NewRow) => {
                        writer.set_state(&row.row_id, row.conflict_type, SyncState::NewRow, None)?;
                        summary.demoted += 1;
                    }
                    Reclassification::Become(state) => {
                        writer.set_state(
                            &row.row_id,
                            row.conflict_type,
                            state,
                            row.row_etag.as_deref(),
                        )?;
                        summary.collapsed += 1;
                    }
                    Reclassification::Remove => {
                        writer.delete_one(&row.row_id, row.conflict_type)?;
                        summary.removed += 1;
                    }
                }
            }
            Ok::<_, StoreError>(summary)
        })?;
        info!(
            table_id = %self.table.table_id,
            demoted = summary.demoted,
            collapsed = summary.collapsed,
            removed = summary.removed,
            "reclassified rows after schema change"
        );
        Ok(summary)
    }
}

fn single_plain(rows: Vec<LocalRow>) -> Option<LocalRow> {
    match RowEntry::from_physical(rows).into_iter().next() {
        Some(RowEntry::Plain(row)) => Some(row),
        Some(RowEntry::Conflicted { local, .. }) => Some(local),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::{Column, ConflictType};

    fn values(age: &str) -> Values {
        Values::from([("age".to_string(), Some(age.to_string()))])
    }

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_table("people", None, &[Column::new("age", "integer")])
            .unwrap();
        db
    }

    fn put(db: &Database, row: LocalRow) {
        let table = db.table("people").unwrap();
        db.transaction(|tx| RowWriter::new(tx, &table).insert(&row))
            .unwrap();
    }

    #[test]
    fn insert_update_delete_lifecycle() {
        let db = setup();
        let rows = db.data_table("people").unwrap();
        let id = rows.insert_row(values("5")).unwrap();
        assert_eq!(rows.get_row_sync_state(&id).unwrap(), Some(SyncState::NewRow));

        rows.update_row(&id, &values("6")).unwrap();
        assert_eq!(rows.get_row_sync_state(&id).unwrap(), Some(SyncState::NewRow));

        rows.mark_deleted(&id).unwrap();
        assert_eq!(rows.get_row_sync_state(&id).unwrap(), None);
        assert!(rows.entries().unwrap().is_empty());
    }

    #[test]
    fn synced_row_edits() {
        let db = setup();
        put(
            &db,
            LocalRow::new("r1", db.clock().next(), values("5")).in_state(SyncState::Synced),
        );
        let rows = db.data_table("people").unwrap();

        rows.update_row("r1", &values("6")).unwrap();
        assert_eq!(rows.get_row_sync_state("r1").unwrap(), Some(SyncState::Changed));

        rows.mark_deleted("r1").unwrap();
        assert_eq!(rows.get_row_sync_state("r1").unwrap(), Some(SyncState::Deleted));

        assert!(matches!(
            rows.update_row("r1", &values("7")),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn update_stamps_later_savepoint() {
        let db = setup();
        let rows = db.data_table("people").unwrap();
        let id = rows.insert_row(values("5")).unwrap();
        let before = rows.savepoint_history(&id).unwrap()[0].savepoint_timestamp.clone();
        rows.update_row(&id, &values("6")).unwrap();
        let after = &rows.savepoint_history(&id).unwrap()[0];
        assert!(after.savepoint_timestamp > before);
        assert_eq!(after.value("age"), Some("6"));
    }

    #[test]
    fn ambiguous_sync_state_is_none() {
        let db = setup();
        put(
            &db,
            LocalRow::new("r1", db.clock().next(), values("5"))
                .as_conflict(ConflictType::LocalUpdatedUpdatedValues),
        );
        put(
            &db,
            LocalRow::new("r1", db.clock().next(), values("7"))
                .as_conflict(ConflictType::ServerUpdatedUpdatedValues),
        );
        let rows = db.data_table("people").unwrap();
        assert_eq!(rows.get_row_sync_state("r1").unwrap(), None);
        assert_eq!(rows.savepoint_history("r1").unwrap().len(), 2);
    }

    #[test]
    fn conflicted_rows_refuse_edits() {
        let db = setup();
        put(
            &db,
            LocalRow::new("r1", db.clock().next(), values("5"))
                .as_conflict(ConflictType::LocalUpdatedUpdatedValues),
        );
        put(
            &db,
            LocalRow::new("r1", db.clock().next(), values("7"))
                .as_conflict(ConflictType::ServerUpdatedUpdatedValues),
        );
        let rows = db.data_table("people").unwrap();
        assert!(matches!(
            rows.update_row("r1", &values("8")),
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            rows.mark_deleted("r1"),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn resolve_twice_fails_cleanly() {
        let db = setup();
        put(
            &db,
            LocalRow::new("r1", db.clock().next(), values("5"))
                .as_conflict(ConflictType::LocalUpdatedUpdatedValues),
        );
        let mut server = LocalRow::new("r1", db.clock().next(), values("7"))
            .as_conflict(ConflictType::ServerUpdatedUpdatedValues);
        server.row_etag = Some("e2".into());
        put(&db, server);

        let rows = db.data_table("people").unwrap();
        rows.resolve_conflict("r1", Some("e2"), &values("7")).unwrap();
        let second = rows.resolve_conflict("r1", Some("e2"), &values("7"));
        assert!(matches!(second, Err(StoreError::NotInConflict { .. })));

        let history = rows.savepoint_history("r1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sync_state, SyncState::Changed);
        assert_eq!(history[0].conflict_type, None);
        assert_eq!(history[0].row_etag.as_deref(), Some("e2"));
        assert_eq!(history[0].value("age"), Some("7"));
    }

    #[test]
    fn resolve_unknown_row() {
        let db = setup();
        let rows = db.data_table("people").unwrap();
        assert!(matches!(
            rows.resolve_conflict("nope", None, &Values::new()),
            Err(StoreError::RowNotFound { .. })
        ));
    }
}
