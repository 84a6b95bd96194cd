//! # tablesync store
//!
//! Local persistence for tablesync, backed by SQLite.
//!
//! This crate provides:
//! - A catalog of synchronized tables with their columns and `SyncTag`
//! - One data table per synchronized table, with fixed sync metadata columns
//! - The local half of the row state machine (edits, deletes, conflict
//!   resolution, schema-change reclassification)
//! - Transaction-scoped row primitives used by the sync engine
//! - The key-value metadata store with typed values
//! - A monotonic savepoint clock
//!
//! ## Key Invariants
//!
//! - `conflict_type` is set if and only if `sync_state` is `in_conflict`
//! - A conflicted row id has exactly two physical rows, one local and one server
//! - At most one key-value entry exists per (table, partition, aspect, key)
//! - Every multi-statement change runs in a single transaction

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod data_table;
mod database;
mod error;
mod kv;
mod rows;
mod savepoint;

pub use catalog::{LocalTable, METADATA_COLUMNS};
pub use data_table::{DataTable, ReclassifySummary};
pub use database::Database;
pub use error::{StoreError, StoreResult};
pub use kv::{KeyValueEntry, KeyValueStore, KvKey};
pub use rows::{LocalRow, RowEntry, RowWriter, Values};
pub use savepoint::SavepointClock;

/// Transaction-scoped catalog access, for callers composing their own transactions.
pub mod tx {
    pub use crate::catalog::{
        create_table, load_table, set_properties_dirty, touch_last_sync, update_columns,
        write_sync_tag,
    };
    pub use crate::kv::{replace_table_entries, table_entries};
}
