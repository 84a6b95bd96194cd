//! Physical rows and transaction-scoped row primitives.

use crate::catalog::{quote, LocalTable, METADATA_COLUMNS};
use crate::error::{StoreError, StoreResult};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::BTreeMap;
use tablesync_protocol::{ConflictType, SavepointType, SyncState};
use tracing::warn;

/// Column values keyed by element key.
pub type Values = BTreeMap<String, Option<String>>;

/// One physical row of a data table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRow {
    /// Stable row identifier.
    pub row_id: String,
    /// Server version the local copy derives from.
    pub row_etag: Option<String>,
    /// Lifecycle state.
    pub sync_state: SyncState,
    /// Conflict side; set only when `sync_state` is `in_conflict`.
    pub conflict_type: Option<ConflictType>,
    /// Visibility filter kind.
    pub filter_type: Option<String>,
    /// Visibility filter argument.
    pub filter_value: Option<String>,
    /// Form that produced the row.
    pub form_id: Option<String>,
    /// Locale of the edit.
    pub locale: Option<String>,
    /// Complete edit or checkpoint.
    pub savepoint_type: SavepointType,
    /// When the savepoint was taken.
    pub savepoint_timestamp: String,
    /// Who took the savepoint.
    pub savepoint_creator: Option<String>,
    /// User column values.
    pub values: Values,
}

impl LocalRow {
    /// Creates a `new_row` with a complete savepoint.
    pub fn new(row_id: impl Into<String>, savepoint_timestamp: String, values: Values) -> Self {
        Self {
            row_id: row_id.into(),
            row_etag: None,
            sync_state: SyncState::NewRow,
            conflict_type: None,
            filter_type: None,
            filter_value: None,
            form_id: None,
            locale: None,
            savepoint_type: SavepointType::Complete,
            savepoint_timestamp,
            savepoint_creator: None,
            values,
        }
    }

    /// Returns the value of a column, if set.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_deref())
    }

    /// Returns a copy in the given state with no conflict type.
    pub fn in_state(mut self, state: SyncState) -> Self {
        self.sync_state = state;
        self.conflict_type = None;
        self
    }

    /// Returns a copy marked as one half of a conflict pair.
    pub fn as_conflict(mut self, conflict: ConflictType) -> Self {
        self.sync_state = SyncState::InConflict;
        self.conflict_type = Some(conflict);
        self
    }
}

/// A logical row: either a single physical row or a conflict pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowEntry {
    /// A row with no pending conflict.
    Plain(LocalRow),
    /// Local and server versions awaiting resolution.
    Conflicted {
        /// The local half.
        local: LocalRow,
        /// The server half.
        server: LocalRow,
    },
}

impl RowEntry {
    /// The shared row id.
    pub fn row_id(&self) -> &str {
        match self {
            RowEntry::Plain(row) => &row.row_id,
            RowEntry::Conflicted { local, .. } => &local.row_id,
        }
    }

    /// Returns true for a conflict pair.
    pub fn is_conflicted(&self) -> bool {
        matches!(self, RowEntry::Conflicted { .. })
    }

    /// Groups the physical rows of one row id into logical entries.
    ///
    /// A well-formed id yields one entry. Anything else is logged and every
    /// physical row is reported as plain.
    pub fn from_physical(rows: Vec<LocalRow>) -> Vec<RowEntry> {
        match rows.as_slice() {
            [] => Vec::new(),
            [single] if single.conflict_type.is_none() => vec![RowEntry::Plain(single.clone())],
            [a, b] => {
                let (local, server) = match (a.conflict_type, b.conflict_type) {
                    (Some(x), Some(y)) if x.is_local() && y.is_server() => (a, b),
                    (Some(x), Some(y)) if x.is_server() && y.is_local() => (b, a),
                    _ => return Self::malformed(rows),
                };
                vec![RowEntry::Conflicted {
                    local: local.clone(),
                    server: server.clone(),
                }]
            }
            _ => Self::malformed(rows),
        }
    }

    fn malformed(rows: Vec<LocalRow>) -> Vec<RowEntry> {
        warn!(
            row_id = %rows[0].row_id,
            physical_rows = rows.len(),
            "row id has an unexpected set of physical rows"
        );
        rows.into_iter().map(RowEntry::Plain).collect()
    }
}

/// Row primitives bound to one connection or transaction.
///
/// The sync engine composes these inside a single
/// [`Database::transaction`](crate::Database::transaction).
pub struct RowWriter<'a> {
    conn: &'a Connection,
    table: &'a LocalTable,
}

impl<'a> RowWriter<'a> {
    /// Binds the primitives to a table.
    pub fn new(conn: &'a Connection, table: &'a LocalTable) -> Self {
        Self { conn, table }
    }

    fn table_name(&self) -> String {
        quote(&self.table.table_id)
    }

    fn select_list(&self) -> String {
        METADATA_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.table.columns.iter().map(|c| quote(&c.element_key)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn query(&self, clause: &str, args: Vec<Value>) -> StoreResult<Vec<LocalRow>> {
        let sql = format!(
            "SELECT {} FROM {} {} ORDER BY id, savepoint_timestamp",
            self.select_list(),
            self.table_name(),
            clause
        );
        let keys = self.table.column_keys();
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params_from_iter(args), |row| {
                let mut values = Values::new();
                for (i, key) in keys.iter().enumerate() {
                    values.insert(key.clone(), row.get(METADATA_COLUMNS.len() + i)?);
                }
                Ok(RawRow {
                    row_id: row.get(0)?,
                    row_etag: row.get(1)?,
                    sync_state: row.get(2)?,
                    conflict_type: row.get(3)?,
                    filter_type: row.get(4)?,
                    filter_value: row.get(5)?,
                    form_id: row.get(6)?,
                    locale: row.get(7)?,
                    savepoint_type: row.get(8)?,
                    savepoint_timestamp: row.get(9)?,
                    savepoint_creator: row.get(10)?,
                    values,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRow::decode).collect()
    }

    /// All physical rows of one id, oldest savepoint first.
    pub fn physical_rows(&self, row_id: &str) -> StoreResult<Vec<LocalRow>> {
        self.query("WHERE id = ?1", vec![Value::Text(row_id.to_string())])
    }

    /// Every physical row of the table.
    pub fn all_rows(&self) -> StoreResult<Vec<LocalRow>> {
        self.query("", Vec::new())
    }

    /// Physical rows in any of the given states.
    pub fn rows_in_states(&self, states: &[SyncState]) -> StoreResult<Vec<LocalRow>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=states.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let args = states
            .iter()
            .map(|s| Value::Text(s.as_str().to_string()))
            .collect();
        self.query(&format!("WHERE sync_state IN ({placeholders})"), args)
    }

    /// Inserts a physical row. Values for undeclared columns are ignored.
    pub fn insert(&self, row: &LocalRow) -> StoreResult<()> {
        let keys = self.table.column_keys();
        let columns = METADATA_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(keys.iter().map(|k| quote(k)))
            .collect::<Vec<_>>();
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table_name(),
            columns.join(", "),
            placeholders
        );

        let mut args = vec![
            Value::Text(row.row_id.clone()),
            opt_text(&row.row_etag),
            Value::Text(row.sync_state.as_str().to_string()),
            row.conflict_type
                .map(|c| Value::Integer(c.to_code()))
                .unwrap_or(Value::Null),
            opt_text(&row.filter_type),
            opt_text(&row.filter_value),
            opt_text(&row.form_id),
            opt_text(&row.locale),
            Value::Text(row.savepoint_type.as_str().to_string()),
            Value::Text(row.savepoint_timestamp.clone()),
            opt_text(&row.savepoint_creator),
        ];
        for key in &keys {
            args.push(opt_text(row.values.get(key).unwrap_or(&None)));
        }
        self.conn.execute(&sql, params_from_iter(args))?;
        Ok(())
    }

    /// Replaces every physical row of the id with `row`.
    pub fn replace(&self, row: &LocalRow) -> StoreResult<()> {
        self.delete_all(&row.row_id)?;
        self.insert(row)
    }

    /// Replaces every physical row of the id with a conflict pair.
    pub fn store_conflict(&self, local: &LocalRow, server: &LocalRow) -> StoreResult<()> {
        self.delete_all(&local.row_id)?;
        self.insert(local)?;
        self.insert(server)
    }

    /// Reads the local and server halves of a conflict pair.
    ///
    /// Fails with [`StoreError::RowNotFound`] for an unknown id and
    /// [`StoreError::NotInConflict`] for a plain row.
    pub fn conflict_pair(&self, row_id: &str) -> StoreResult<(LocalRow, LocalRow)> {
        match RowEntry::from_physical(self.physical_rows(row_id)?).as_slice() {
            [RowEntry::Conflicted { local, server }] => Ok((local.clone(), server.clone())),
            [] => Err(StoreError::RowNotFound {
                table_id: self.table.table_id.clone(),
                row_id: row_id.to_string(),
            }),
            _ => Err(StoreError::NotInConflict {
                row_id: row_id.to_string(),
            }),
        }
    }

    /// Collapses a conflict pair into its local half.
    ///
    /// The kept row takes `state`, the given row ETag and a complete
    /// savepoint; declared `values` override the local ones. The server half
    /// is deleted.
    pub fn collapse_conflict(
        &self,
        local: LocalRow,
        state: SyncState,
        row_etag: Option<String>,
        values: Values,
        savepoint_timestamp: String,
    ) -> StoreResult<LocalRow> {
        let mut kept = local.in_state(state);
        kept.row_etag = row_etag;
        kept.values.extend(
            values
                .into_iter()
                .filter(|(key, _)| self.table.has_column(key)),
        );
        kept.savepoint_type = SavepointType::Complete;
        kept.savepoint_timestamp = savepoint_timestamp;
        self.replace(&kept)?;
        Ok(kept)
    }

    /// Replaces the server half of a conflict pair, keeping the local half.
    pub fn replace_server_half(&self, server: &LocalRow) -> StoreResult<()> {
        self.delete_server_half(&server.row_id)?;
        self.insert(server)
    }

    /// Hard-deletes every physical row of the id.
    pub fn delete_all(&self, row_id: &str) -> StoreResult<usize> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", self.table_name());
        Ok(self.conn.execute(&sql, [row_id])?)
    }

    /// Hard-deletes the server half of a conflict pair.
    pub fn delete_server_half(&self, row_id: &str) -> StoreResult<usize> {
        let sql = format!(
            "DELETE FROM {} WHERE id = ?1 AND conflict_type IN (?2, ?3)",
            self.table_name()
        );
        Ok(self.conn.execute(
            &sql,
            rusqlite::params![
                row_id,
                ConflictType::ServerDeletedOldValues.to_code(),
                ConflictType::ServerUpdatedUpdatedValues.to_code()
            ],
        )?)
    }

    /// Moves one physical row, selected by its conflict type, to a new plain state.
    pub fn set_state(
        &self,
        row_id: &str,
        current_conflict: Option<ConflictType>,
        state: SyncState,
        row_etag: Option<&str>,
    ) -> StoreResult<usize> {
        let sql = format!(
            "UPDATE {} SET sync_state = ?1, conflict_type = NULL, row_etag = ?2
             WHERE id = ?3 AND conflict_type IS ?4",
            self.table_name()
        );
        Ok(self.conn.execute(
            &sql,
            rusqlite::params![
                state.as_str(),
                row_etag,
                row_id,
                current_conflict.map(|c| c.to_code())
            ],
        )?)
    }

    /// Deletes one physical row, selected by its conflict type.
    pub fn delete_one(&self, row_id: &str, conflict: Option<ConflictType>) -> StoreResult<usize> {
        let sql = format!(
            "DELETE FROM {} WHERE id = ?1 AND conflict_type IS ?2",
            self.table_name()
        );
        Ok(self
            .conn
            .execute(&sql, rusqlite::params![row_id, conflict.map(|c| c.to_code())])?)
    }

    /// Promotes every `synced_pending_files` row to `synced`.
    pub fn promote_pending_files(&self) -> StoreResult<usize> {
        let sql = format!(
            "UPDATE {} SET sync_state = ?1 WHERE sync_state = ?2",
            self.table_name()
        );
        Ok(self.conn.execute(
            &sql,
            [
                SyncState::Synced.as_str(),
                SyncState::SyncedPendingFiles.as_str(),
            ],
        )?)
    }
}

fn opt_text(value: &Option<String>) -> Value {
    value.clone().map(Value::Text).unwrap_or(Value::Null)
}

struct RawRow {
    row_id: String,
    row_etag: Option<String>,
    sync_state: String,
    conflict_type: Option<i64>,
    filter_type: Option<String>,
    filter_value: Option<String>,
    form_id: Option<String>,
    locale: Option<String>,
    savepoint_type: String,
    savepoint_timestamp: String,
    savepoint_creator: Option<String>,
    values: Values,
}

impl RawRow {
    fn decode(self) -> StoreResult<LocalRow> {
        Ok(LocalRow {
            row_id: self.row_id,
            row_etag: self.row_etag,
            sync_state: self.sync_state.parse()?,
            conflict_type: self.conflict_type.map(ConflictType::from_code).transpose()?,
            filter_type: self.filter_type,
            filter_value: self.filter_value,
            form_id: self.form_id,
            locale: self.locale,
            savepoint_type: self.savepoint_type.parse()?,
            savepoint_timestamp: self.savepoint_timestamp,
            savepoint_creator: self.savepoint_creator,
            values: self.values,
        })
    }
}
