//! CLI command implementations.

pub mod conflicts;
pub mod init_table;
pub mod remote_tables;
pub mod resolve;
pub mod sync;
pub mod tables;

use clap::Args;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tablesync_engine::SyncConfig;
use tablesync_store::Database;

/// Environment variable holding the bearer token.
pub const TOKEN_ENV: &str = "TABLESYNC_TOKEN";

/// Options naming the server and the app to sync.
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Server URL
    #[arg(short, long)]
    pub server: String,

    /// App name on the server
    #[arg(short, long, default_value = "default")]
    pub app: String,

    /// Local folder holding the app files
    #[arg(long, default_value = ".")]
    pub app_folder: PathBuf,

    /// Client version used in manifest and file paths
    #[arg(long, default_value = "2")]
    pub client_version: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Do not upload local app and table files
    #[arg(long)]
    pub no_push_files: bool,
}

impl ServerArgs {
    /// Builds the sync configuration, taking the token from the environment.
    pub fn config(&self) -> SyncConfig {
        let config = SyncConfig::new(&self.server, &self.app)
            .with_client_version(&self.client_version)
            .with_app_folder(&self.app_folder)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_push_local_files(!self.no_push_files);
        match std::env::var(TOKEN_ENV) {
            Ok(token) if !token.is_empty() => config.with_access_token(token),
            _ => config,
        }
    }
}

/// Opens an existing database file.
pub fn open_database(path: &Path) -> Result<Database, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No database found at {:?}", path).into());
    }
    Ok(Database::open(path)?)
}
