//! Tables command implementation.

use super::open_database;
use serde::Serialize;
use std::path::Path;
use tablesync_store::RowEntry;

/// A local table and its sync status.
#[derive(Debug, Serialize)]
pub struct TableInfo {
    /// Table identifier.
    pub table_id: String,
    /// Human readable name.
    pub display_name: Option<String>,
    /// Local data ETag.
    pub data_etag: Option<String>,
    /// Local properties ETag.
    pub properties_etag: Option<String>,
    /// Local schema ETag.
    pub schema_etag: Option<String>,
    /// Whether sync passes include the table.
    pub sync_enabled: bool,
    /// Whether properties wait to be pushed.
    pub properties_dirty: bool,
    /// End of the last successful pass.
    pub last_sync_time: Option<String>,
    /// Number of logical rows.
    pub rows: usize,
    /// Rows waiting to be pushed.
    pub pending: usize,
    /// Rows in conflict.
    pub conflicts: usize,
}

/// Runs the tables command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_database(path)?;
    let mut infos = Vec::new();
    for table in db.tables()? {
        let entries = db.data_table(&table.table_id)?.entries()?;
        let pending = entries
            .iter()
            .filter(|e| matches!(e, RowEntry::Plain(row) if row.sync_state.has_pending_push()))
            .count();
        let conflicts = entries.iter().filter(|e| e.is_conflicted()).count();
        infos.push(TableInfo {
            rows: entries.len(),
            pending,
            conflicts,
            data_etag: table.sync_tag.data_etag,
            properties_etag: table.sync_tag.properties_etag,
            schema_etag: table.sync_tag.schema_etag,
            table_id: table.table_id,
            display_name: table.display_name,
            sync_enabled: table.sync_enabled,
            properties_dirty: table.properties_dirty,
            last_sync_time: table.last_sync_time,
        });
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        _ => {
            println!("=== Local Tables ===");
            println!();
            for info in &infos {
                println!("{}", info.table_id);
                if let Some(name) = &info.display_name {
                    println!("  Name:        {name}");
                }
                println!("  Data ETag:   {}", info.data_etag.as_deref().unwrap_or("-"));
                println!(
                    "  Props ETag:  {}",
                    info.properties_etag.as_deref().unwrap_or("-")
                );
                println!("  Schema ETag: {}", info.schema_etag.as_deref().unwrap_or("-"));
                println!(
                    "  Rows:        {} ({} pending, {} in conflict)",
                    info.rows, info.pending, info.conflicts
                );
                println!(
                    "  Sync:        {}{}",
                    if info.sync_enabled { "enabled" } else { "disabled" },
                    if info.properties_dirty {
                        ", properties pending"
                    } else {
                        ""
                    }
                );
                println!(
                    "  Last sync:   {}",
                    info.last_sync_time.as_deref().unwrap_or("never")
                );
            }
            if infos.is_empty() {
                println!("No tables.");
            }
        }
    }

    Ok(())
}
