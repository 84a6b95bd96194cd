//! Catalog of synchronized tables.

use crate::error::{StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use tablesync_protocol::{Column, SyncTag};

/// Sync metadata columns present in every data table, in storage order.
pub const METADATA_COLUMNS: [&str; 11] = [
    "id",
    "row_etag",
    "sync_state",
    "conflict_type",
    "filter_type",
    "filter_value",
    "form_id",
    "locale",
    "savepoint_type",
    "savepoint_timestamp",
    "savepoint_creator",
];

/// A table registered for synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTable {
    /// Table identifier, also the name of its data table.
    pub table_id: String,
    /// Human readable name.
    pub display_name: Option<String>,
    /// User columns in declaration order.
    pub columns: Vec<Column>,
    /// Tag last observed from the server.
    pub sync_tag: SyncTag,
    /// When the last successful pass finished.
    pub last_sync_time: Option<String>,
    /// True if local property edits have not been pushed.
    pub properties_dirty: bool,
    /// True if sync passes include this table.
    pub sync_enabled: bool,
}

impl LocalTable {
    /// Keys of the user columns.
    pub fn column_keys(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.element_key.clone()).collect()
    }

    /// Returns true if the table declares this column.
    pub fn has_column(&self, key: &str) -> bool {
        self.columns.iter().any(|c| c.element_key == key)
    }
}

/// Quotes a validated identifier for use in SQL.
pub(crate) fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

/// Accepts `[A-Za-z][A-Za-z0-9_]*` up to 64 characters.
pub(crate) fn validate_identifier(name: &str) -> StoreResult<()> {
    let mut chars = name.chars();
    let valid = name.len() <= 64
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

fn validate_column_key(key: &str) -> StoreResult<()> {
    validate_identifier(key)?;
    if METADATA_COLUMNS
        .iter()
        .any(|m| m.eq_ignore_ascii_case(key))
    {
        return Err(StoreError::InvalidIdentifier(key.to_string()));
    }
    Ok(())
}

/// Registers a table and creates its data table.
pub fn create_table(
    conn: &Connection,
    table_id: &str,
    display_name: Option<&str>,
    columns: &[Column],
) -> StoreResult<()> {
    validate_identifier(table_id)?;
    for column in columns {
        validate_column_key(&column.element_key)?;
    }
    if load_table(conn, table_id)?.is_some() {
        return Err(StoreError::TableExists(table_id.to_string()));
    }

    conn.execute(
        "INSERT INTO _table_definitions (table_id, display_name) VALUES (?1, ?2)",
        params![table_id, display_name],
    )?;
    write_columns(conn, table_id, columns)?;

    let mut ddl = format!(
        "CREATE TABLE {} (
            id TEXT NOT NULL,
            row_etag TEXT NULL,
            sync_state TEXT NOT NULL,
            conflict_type INTEGER NULL,
            filter_type TEXT NULL,
            filter_value TEXT NULL,
            form_id TEXT NULL,
            locale TEXT NULL,
            savepoint_type TEXT NOT NULL,
            savepoint_timestamp TEXT NOT NULL,
            savepoint_creator TEXT NULL",
        quote(table_id)
    );
    for column in columns {
        ddl.push_str(&format!(",\n            {} TEXT NULL", quote(&column.element_key)));
    }
    ddl.push_str("\n        );");
    ddl.push_str(&format!(
        "\nCREATE INDEX {} ON {} (id);",
        quote(&format!("{table_id}_id_idx")),
        quote(table_id)
    ));
    conn.execute_batch(&ddl)?;
    Ok(())
}

fn write_columns(conn: &Connection, table_id: &str, columns: &[Column]) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM _column_definitions WHERE table_id = ?1",
        params![table_id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO _column_definitions
            (table_id, element_key, element_name, element_type, list_child_element_keys, ordinal)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (ordinal, column) in columns.iter().enumerate() {
        stmt.execute(params![
            table_id,
            column.element_key,
            column.element_name,
            column.element_type,
            column.list_child_element_keys,
            ordinal as i64,
        ])?;
    }
    Ok(())
}

/// Replaces a table's column definitions, adding storage for new columns.
///
/// Storage for dropped columns is kept but no longer read.
pub fn update_columns(conn: &Connection, table_id: &str, columns: &[Column]) -> StoreResult<()> {
    let table = load_table(conn, table_id)?
        .ok_or_else(|| StoreError::TableNotFound(table_id.to_string()))?;
    let existing = existing_storage_columns(conn, table_id)?;
    for column in columns {
        validate_column_key(&column.element_key)?;
        if !existing.iter().any(|c| c == &column.element_key) {
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} TEXT NULL;",
                quote(&table.table_id),
                quote(&column.element_key)
            ))?;
        }
    }
    write_columns(conn, table_id, columns)
}

fn existing_storage_columns(conn: &Connection, table_id: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table_id)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Loads one table, or `None` if it is not registered.
pub fn load_table(conn: &Connection, table_id: &str) -> StoreResult<Option<LocalTable>> {
    let header = conn
        .query_row(
            "SELECT table_id, display_name, schema_etag, properties_etag, data_etag,
                    last_sync_time, properties_dirty, sync_enabled
             FROM _table_definitions WHERE table_id = ?1",
            params![table_id],
            |row| {
                Ok(LocalTable {
                    table_id: row.get(0)?,
                    display_name: row.get(1)?,
                    sync_tag: SyncTag::new(row.get(4)?, row.get(3)?, row.get(2)?),
                    last_sync_time: row.get(5)?,
                    properties_dirty: row.get::<_, i64>(6)? != 0,
                    sync_enabled: row.get::<_, i64>(7)? != 0,
                    columns: Vec::new(),
                })
            },
        )
        .optional()?;

    let Some(mut table) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT element_key, element_name, element_type, list_child_element_keys
         FROM _column_definitions WHERE table_id = ?1 ORDER BY ordinal",
    )?;
    table.columns = stmt
        .query_map(params![table_id], |row| {
            Ok(Column {
                element_key: row.get(0)?,
                element_name: row.get(1)?,
                element_type: row.get(2)?,
                list_child_element_keys: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(table))
}

/// Lists all registered tables, ordered by id.
pub fn list_tables(conn: &Connection) -> StoreResult<Vec<LocalTable>> {
    let mut stmt = conn.prepare("SELECT table_id FROM _table_definitions ORDER BY table_id")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut tables = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(table) = load_table(conn, &id)? {
            tables.push(table);
        }
    }
    Ok(tables)
}

fn expect_one(changed: usize, table_id: &str) -> StoreResult<()> {
    if changed == 0 {
        Err(StoreError::TableNotFound(table_id.to_string()))
    } else {
        Ok(())
    }
}

/// Persists a table's sync tag.
pub fn write_sync_tag(conn: &Connection, table_id: &str, tag: &SyncTag) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE _table_definitions
         SET schema_etag = ?2, properties_etag = ?3, data_etag = ?4
         WHERE table_id = ?1",
        params![
            table_id,
            tag.schema_etag,
            tag.properties_etag,
            tag.data_etag
        ],
    )?;
    expect_one(changed, table_id)
}

/// Sets or clears the unpushed-properties flag.
pub fn set_properties_dirty(conn: &Connection, table_id: &str, dirty: bool) -> StoreResult<()> {
    conn.execute(
        "UPDATE _table_definitions SET properties_dirty = ?2 WHERE table_id = ?1",
        params![table_id, dirty as i64],
    )?;
    Ok(())
}

/// Records the end of a successful pass.
pub fn touch_last_sync(conn: &Connection, table_id: &str, when: &str) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE _table_definitions SET last_sync_time = ?2 WHERE table_id = ?1",
        params![table_id, when],
    )?;
    expect_one(changed, table_id)
}

pub(crate) fn set_sync_enabled(conn: &Connection, table_id: &str, enabled: bool) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE _table_definitions SET sync_enabled = ?2 WHERE table_id = ?1",
        params![table_id, enabled as i64],
    )?;
    expect_one(changed, table_id)
}

pub(crate) fn drop_table(conn: &Connection, table_id: &str) -> StoreResult<()> {
    validate_identifier(table_id)?;
    if load_table(conn, table_id)?.is_none() {
        return Err(StoreError::TableNotFound(table_id.to_string()));
    }
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote(table_id)))?;
    conn.execute(
        "DELETE FROM _column_definitions WHERE table_id = ?1",
        params![table_id],
    )?;
    conn.execute(
        "DELETE FROM _key_value_store WHERE table_id = ?1",
        params![table_id],
    )?;
    conn.execute(
        "DELETE FROM _table_definitions WHERE table_id = ?1",
        params![table_id],
    )?;
    Ok(())
}
