//! Resolve command implementation.

use super::open_database;
use std::path::Path;
use tablesync_engine::{ConflictResolver, ResolvedAs};

/// Side of a conflict to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Side {
    /// Keep the local values.
    Local,
    /// Keep the server values.
    Server,
}

/// Runs the resolve command.
pub fn run(
    path: &Path,
    table_id: &str,
    row_id: &str,
    take: Side,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_database(path)?;
    let resolver = ConflictResolver::new(&db, table_id)?;
    let outcome = match take {
        Side::Local => resolver.take_local(row_id)?,
        Side::Server => resolver.take_server(row_id)?,
    };

    match outcome {
        ResolvedAs::Changed => println!("{row_id}: kept, will be pushed on the next sync"),
        ResolvedAs::Deleted => println!("{row_id}: delete will be pushed on the next sync"),
        ResolvedAs::Removed => println!("{row_id}: removed"),
    }
    Ok(())
}
