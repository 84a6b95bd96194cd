//! Conflicts command implementation.

use super::open_database;
use serde::Serialize;
use std::path::Path;
use tablesync_engine::ConflictResolver;
use tablesync_store::{LocalRow, Values};

/// One conflict pair as shown to the user.
#[derive(Debug, Serialize)]
pub struct ConflictInfo {
    /// Row identifier.
    pub row_id: String,
    /// Whether the local side was deleted.
    pub local_deleted: bool,
    /// Whether the server side was deleted.
    pub server_deleted: bool,
    /// Local values.
    pub local: Values,
    /// Server values.
    pub server: Values,
    /// Server row ETag.
    pub server_etag: Option<String>,
}

impl ConflictInfo {
    fn from_pair(local: LocalRow, server: LocalRow) -> Self {
        let deleted = |row: &LocalRow| row.conflict_type.is_some_and(|c| c.is_deleted());
        Self {
            local_deleted: deleted(&local),
            server_deleted: deleted(&server),
            row_id: local.row_id,
            local: local.values,
            server: server.values,
            server_etag: server.row_etag,
        }
    }

    /// Keys whose values differ between the two sides.
    pub fn differing_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .local
            .keys()
            .chain(self.server.keys())
            .map(String::as_str)
            .filter(|k| self.local.get(*k) != self.server.get(*k))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}

/// Runs the conflicts command.
pub fn run(path: &Path, table_id: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_database(path)?;
    let resolver = ConflictResolver::new(&db, table_id)?;
    let conflicts: Vec<ConflictInfo> = resolver
        .conflicts()?
        .into_iter()
        .map(|(local, server)| ConflictInfo::from_pair(local, server))
        .collect();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&conflicts)?);
        }
        _ => {
            println!("=== Conflicts in {table_id} ===");
            println!();
            for conflict in &conflicts {
                println!("{}", conflict.row_id);
                if conflict.local_deleted {
                    println!("  local:  deleted");
                }
                if conflict.server_deleted {
                    println!("  server: deleted");
                }
                for key in conflict.differing_keys() {
                    println!(
                        "  {:<16} local {:<16} server {}",
                        key,
                        display(&conflict.local, key),
                        display(&conflict.server, key)
                    );
                }
            }
            println!("{} row(s) in conflict", conflicts.len());
        }
    }

    Ok(())
}

fn display<'a>(values: &'a Values, key: &str) -> &'a str {
    values.get(key).and_then(|v| v.as_deref()).unwrap_or("<null>")
}
