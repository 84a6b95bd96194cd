//! Sync command implementation.

use super::ServerArgs;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tablesync_engine::{
    AggregateSynchronizer, FileSyncReport, ReqwestClient, SyncOutcome, SyncProcessor, TableResult,
};
use tablesync_store::Database;
use tracing::info;

/// Result of a sync pass.
#[derive(Debug, Serialize)]
pub struct SyncReport {
    /// True if every table and the app files synced.
    pub success: bool,
    /// Duration of the pass in milliseconds.
    pub duration_ms: u64,
    /// Per-table results.
    pub tables: Vec<TableReport>,
    /// App-level file counts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_files: Option<FileReport>,
    /// App-level file sync error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_files_error: Option<String>,
}

/// Result of one table.
#[derive(Debug, Serialize)]
pub struct TableReport {
    /// Table identifier.
    pub table_id: String,
    /// Outcome class.
    pub status: &'static str,
    /// Error message of a failed table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Rows written locally.
    pub pulled: usize,
    /// Rows written to the server.
    pub pushed: usize,
    /// Conflict pairs created.
    pub conflicts: usize,
    /// Row writes refused by the server.
    pub deferred_conflicts: usize,
    /// Files downloaded.
    pub files_downloaded: usize,
    /// Files uploaded.
    pub files_uploaded: usize,
    /// Downloads that failed.
    pub files_failed: usize,
}

/// File counts of the app-level scope.
#[derive(Debug, Serialize)]
pub struct FileReport {
    /// Files downloaded.
    pub downloaded: usize,
    /// Files uploaded.
    pub uploaded: usize,
    /// Files already current.
    pub skipped: usize,
    /// Downloads that failed.
    pub failed: usize,
}

impl From<&TableResult> for TableReport {
    fn from(result: &TableResult) -> Self {
        let c = &result.counters;
        Self {
            table_id: result.table_id.clone(),
            status: result.status.as_str(),
            message: result.message.clone(),
            pulled: c.pulled(),
            pushed: c.pushed(),
            conflicts: c.conflicts,
            deferred_conflicts: c.deferred_conflicts,
            files_downloaded: c.files_downloaded,
            files_uploaded: c.files_uploaded,
            files_failed: c.files_failed,
        }
    }
}

impl From<&FileSyncReport> for FileReport {
    fn from(report: &FileSyncReport) -> Self {
        Self {
            downloaded: report.downloaded,
            uploaded: report.uploaded,
            skipped: report.skipped,
            failed: report.failed,
        }
    }
}

impl From<&SyncOutcome> for SyncReport {
    fn from(outcome: &SyncOutcome) -> Self {
        Self {
            success: outcome.is_success(),
            duration_ms: outcome.duration.as_millis() as u64,
            tables: outcome.tables.iter().map(TableReport::from).collect(),
            app_files: outcome.app_files.as_ref().map(FileReport::from),
            app_files_error: outcome.app_files_error.clone(),
        }
    }
}

/// Runs the sync command.
pub fn run(path: &Path, server: &ServerArgs, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = Arc::new(Database::open(path)?);
    let config = server.config();
    let client = ReqwestClient::new(config.timeout)?;
    let sync = AggregateSynchronizer::new(config.clone(), client);
    info!(server = %config.server_url, app = %config.app_name, "starting sync");
    let processor = SyncProcessor::new(config, sync, db);

    let outcome = processor.synchronize()?;
    let report = SyncReport::from(&outcome);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    if report.success {
        Ok(())
    } else {
        Err("sync finished with failures".into())
    }
}

fn print_text_output(report: &SyncReport) {
    println!("=== Sync ===");
    println!();
    for table in &report.tables {
        println!(
            "{:<24} {:<14} pulled {:>4}  pushed {:>4}  conflicts {:>3}  deferred {:>3}  files +{}/-{}",
            table.table_id,
            table.status,
            table.pulled,
            table.pushed,
            table.conflicts,
            table.deferred_conflicts,
            table.files_downloaded,
            table.files_uploaded
        );
        if let Some(message) = &table.message {
            println!("    {message}");
        }
    }
    println!();
    match (&report.app_files, &report.app_files_error) {
        (_, Some(error)) => println!("App files:  FAILED ({error})"),
        (Some(files), None) => println!(
            "App files:  {} downloaded, {} uploaded, {} current, {} failed",
            files.downloaded, files.uploaded, files.skipped, files.failed
        ),
        (None, None) => {}
    }
    println!("Duration:   {} ms", report.duration_ms);
    println!(
        "Result:     {}",
        if report.success { "OK" } else { "FAILED" }
    );
}
