//! Connection ownership and transactions.

use crate::catalog::{self, LocalTable};
use crate::data_table::DataTable;
use crate::error::{StoreError, StoreResult};
use crate::kv::KeyValueStore;
use crate::savepoint::SavepointClock;
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use std::path::Path;
use tablesync_protocol::{Column, SyncTag};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS _table_definitions (
    table_id TEXT PRIMARY KEY NOT NULL,
    display_name TEXT NULL,
    schema_etag TEXT NULL,
    properties_etag TEXT NULL,
    data_etag TEXT NULL,
    last_sync_time TEXT NULL,
    properties_dirty INTEGER NOT NULL DEFAULT 0,
    sync_enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS _column_definitions (
    table_id TEXT NOT NULL,
    element_key TEXT NOT NULL,
    element_name TEXT NOT NULL,
    element_type TEXT NOT NULL,
    list_child_element_keys TEXT NULL,
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (table_id, element_key)
);

CREATE TABLE IF NOT EXISTS _key_value_store (
    table_id TEXT NOT NULL,
    partition TEXT NOT NULL,
    aspect TEXT NOT NULL,
    key TEXT NOT NULL,
    value_type TEXT NOT NULL,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_key_value_store_key
    ON _key_value_store (table_id, partition, aspect, key);
";

/// A local tablesync database.
///
/// All access goes through one connection guarded by a mutex. Closures passed
/// to [`Database::transaction`] and [`Database::read`] must not call back into
/// the same `Database`.
pub struct Database {
    conn: Mutex<Connection>,
    clock: SavepointClock,
}

impl Database {
    /// Opens or creates a database file.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock: SavepointClock::new(),
        })
    }

    /// Runs `f` inside a transaction, committing only if it succeeds.
    ///
    /// Any error from `f` rolls the transaction back.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| E::from(StoreError::from(e)))?;
        let value = f(&tx)?;
        tx.commit().map_err(|e| E::from(StoreError::from(e)))?;
        Ok(value)
    }

    /// Runs a read-only closure against the connection.
    pub fn read<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// The savepoint clock shared by every writer of this database.
    pub fn clock(&self) -> &SavepointClock {
        &self.clock
    }

    /// Registers a table and creates its data table.
    pub fn create_table(
        &self,
        table_id: &str,
        display_name: Option<&str>,
        columns: &[Column],
    ) -> StoreResult<LocalTable> {
        self.transaction(|tx| {
            catalog::create_table(tx, table_id, display_name, columns)?;
            catalog::load_table(tx, table_id)?
                .ok_or_else(|| StoreError::TableNotFound(table_id.to_string()))
        })
    }

    /// Loads a table from the catalog.
    pub fn table(&self, table_id: &str) -> StoreResult<LocalTable> {
        self.read(|conn| catalog::load_table(conn, table_id))?
            .ok_or_else(|| StoreError::TableNotFound(table_id.to_string()))
    }

    /// Returns true if the table is in the catalog.
    pub fn has_table(&self, table_id: &str) -> StoreResult<bool> {
        Ok(self.read(|conn| catalog::load_table(conn, table_id))?.is_some())
    }

    /// Lists all tables, ordered by id.
    pub fn tables(&self) -> StoreResult<Vec<LocalTable>> {
        self.read(catalog::list_tables)
    }

    /// Persists a table's sync tag.
    pub fn set_sync_tag(&self, table_id: &str, tag: &SyncTag) -> StoreResult<()> {
        self.transaction(|tx| catalog::write_sync_tag(tx, table_id, tag))
    }

    /// Includes or excludes a table from sync passes.
    pub fn set_sync_enabled(&self, table_id: &str, enabled: bool) -> StoreResult<()> {
        self.transaction(|tx| catalog::set_sync_enabled(tx, table_id, enabled))
    }

    /// Drops a table, its rows and its metadata entries.
    pub fn drop_table(&self, table_id: &str) -> StoreResult<()> {
        self.transaction(|tx| catalog::drop_table(tx, table_id))
    }

    /// Opens the rows of a table.
    pub fn data_table(&self, table_id: &str) -> StoreResult<DataTable<'_>> {
        Ok(DataTable::new(self, self.table(table_id)?))
    }

    /// Opens the key-value metadata store.
    pub fn key_value_store(&self) -> KeyValueStore<'_> {
        KeyValueStore::new(self)
    }
}
