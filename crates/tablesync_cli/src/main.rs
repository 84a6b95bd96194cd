//! tablesync CLI
//!
//! Command-line tools for syncing local tables with an Aggregate server.
//!
//! # Commands
//!
//! - `sync` - Run a full sync pass
//! - `tables` - List local tables and their sync tags
//! - `remote-tables` - List the server's tables
//! - `conflicts` - Show rows left in conflict
//! - `resolve` - Resolve a conflicted row
//! - `init-table` - Declare a local table for sync
//!
//! The access token, if any, is read from `TABLESYNC_TOKEN`.

mod commands;

use clap::{Parser, Subcommand};
use commands::{resolve::Side, ServerArgs};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tablesync command-line tools.
#[derive(Parser)]
#[command(name = "tablesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the local database file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full sync pass against the server
    Sync {
        #[command(flatten)]
        server: ServerArgs,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List local tables with their sync tags
    Tables {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List the tables on the server
    RemoteTables {
        #[command(flatten)]
        server: ServerArgs,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the rows of a table left in conflict
    Conflicts {
        /// Table identifier
        table_id: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Resolve a conflicted row
    Resolve {
        /// Table identifier
        table_id: String,

        /// Row identifier
        row_id: String,

        /// Which side to keep
        #[arg(short, long, value_enum)]
        take: Side,
    },

    /// Declare a local table for sync
    InitTable {
        /// Table identifier
        table_id: String,

        /// Column as `key` or `key:type` (repeatable)
        #[arg(short, long = "column", required = true)]
        columns: Vec<String>,

        /// Human readable table name
        #[arg(short, long)]
        display_name: Option<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Sync { server, format } => {
            let path = cli.path.ok_or("Database path required for sync")?;
            commands::sync::run(&path, &server, &format)?;
        }
        Commands::Tables { format } => {
            let path = cli.path.ok_or("Database path required for tables")?;
            commands::tables::run(&path, &format)?;
        }
        Commands::RemoteTables { server, format } => {
            commands::remote_tables::run(&server, &format)?;
        }
        Commands::Conflicts { table_id, format } => {
            let path = cli.path.ok_or("Database path required for conflicts")?;
            commands::conflicts::run(&path, &table_id, &format)?;
        }
        Commands::Resolve {
            table_id,
            row_id,
            take,
        } => {
            let path = cli.path.ok_or("Database path required for resolve")?;
            commands::resolve::run(&path, &table_id, &row_id, take)?;
        }
        Commands::InitTable {
            table_id,
            columns,
            display_name,
        } => {
            let path = cli.path.ok_or("Database path required for init-table")?;
            commands::init_table::run(&path, &table_id, &columns, display_name.as_deref())?;
        }
        Commands::Version => {
            println!("tablesync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "protocol version {}",
                tablesync_protocol::DEFAULT_PROTOCOL_VERSION
            );
        }
    }

    Ok(())
}
