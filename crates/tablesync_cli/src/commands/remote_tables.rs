//! Remote tables command implementation.

use super::ServerArgs;
use serde::Serialize;
use tablesync_engine::{AggregateSynchronizer, ReqwestClient, Synchronizer};

/// A table as listed by the server.
#[derive(Debug, Serialize)]
pub struct RemoteTableInfo {
    /// Table identifier.
    pub table_id: String,
    /// Human readable name.
    pub display_name: Option<String>,
    /// Server data ETag.
    pub data_etag: Option<String>,
    /// Server properties ETag.
    pub properties_etag: Option<String>,
    /// Server schema ETag.
    pub schema_etag: Option<String>,
}

/// Runs the remote-tables command.
pub fn run(server: &ServerArgs, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = server.config();
    let client = ReqwestClient::new(config.timeout)?;
    let sync = AggregateSynchronizer::new(config, client);

    let infos: Vec<RemoteTableInfo> = sync
        .list_tables()?
        .into_iter()
        .map(|t| RemoteTableInfo {
            table_id: t.table_id,
            display_name: t.display_name,
            data_etag: t.data_etag,
            properties_etag: t.properties_etag,
            schema_etag: t.schema_etag,
        })
        .collect();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        _ => {
            println!("=== Remote Tables ({}) ===", server.server);
            println!();
            for info in &infos {
                println!(
                    "{:<24} {:<24} data {:<10} schema {}",
                    info.table_id,
                    info.display_name.as_deref().unwrap_or("-"),
                    info.data_etag.as_deref().unwrap_or("-"),
                    info.schema_etag.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}
