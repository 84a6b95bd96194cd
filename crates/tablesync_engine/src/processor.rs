//! Sync passes over every table of an app.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::files::{FileSyncReport, FileSynchronizer};
use crate::reconcile::{self, PullAction};
use crate::synchronizer::Synchronizer;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tablesync_protocol::{FileScope, SyncState, SyncTag, TableResource};
use tablesync_store::{
    tx, Database, KeyValueEntry, LocalRow, LocalTable, RowEntry, RowWriter, StoreError,
    StoreResult,
};
use tracing::{debug, error, info, warn};

/// The current state of the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not syncing.
    Idle,
    /// Fetching the remote table list.
    Listing,
    /// Pulling properties and rows of a table.
    Pulling,
    /// Pushing rows of a table.
    Pushing,
    /// Syncing table, attachment or app files.
    SyncingFiles,
    /// The last pass finished without failures.
    Synced,
    /// The last pass had a failure.
    Error,
    /// Waiting before retrying a table.
    RetryWait,
}

impl EngineState {
    /// Returns true while a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            EngineState::Listing
                | EngineState::Pulling
                | EngineState::Pushing
                | EngineState::SyncingFiles
                | EngineState::RetryWait
        )
    }

    /// Returns true if a new pass may start.
    pub fn can_start_sync(&self) -> bool {
        !self.is_active()
    }
}

/// Cumulative statistics over every pass of a processor.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Passes that ran to the end.
    pub passes_completed: u64,
    /// Table passes that succeeded.
    pub tables_synced: u64,
    /// Table passes that failed.
    pub tables_failed: u64,
    /// Rows written locally from the server.
    pub rows_pulled: u64,
    /// Rows written to the server.
    pub rows_pushed: u64,
    /// Conflict pairs created.
    pub conflicts: u64,
    /// Row writes the server refused with 409.
    pub deferred_conflicts: u64,
    /// Files downloaded.
    pub files_downloaded: u64,
    /// Files uploaded.
    pub files_uploaded: u64,
    /// Table retries.
    pub retries: u64,
    /// End of the last pass.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Outcome class of one table pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    /// Everything went through.
    Success,
    /// The pass failed; the table stays at its last consistent checkpoint.
    Failure,
    /// The access token was rejected.
    AuthFailure,
    /// The server denied access.
    AccessDenied,
}

impl TableStatus {
    /// Status for a failed pass.
    pub fn from_error(error: &SyncError) -> Self {
        match error {
            SyncError::Auth(_) => TableStatus::AuthFailure,
            SyncError::AccessDenied(_) => TableStatus::AccessDenied,
            _ => TableStatus::Failure,
        }
    }

    /// Status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Success => "success",
            TableStatus::Failure => "failure",
            TableStatus::AuthFailure => "auth_failure",
            TableStatus::AccessDenied => "access_denied",
        }
    }
}

/// Counts of one table pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounters {
    /// Server rows new to this device.
    pub pulled_inserts: usize,
    /// Local rows replaced by server versions.
    pub pulled_updates: usize,
    /// Local rows removed after a server delete.
    pub pulled_deletes: usize,
    /// New rows written to the server.
    pub pushed_inserts: usize,
    /// Changed rows written to the server.
    pub pushed_updates: usize,
    /// Deletes sent to the server.
    pub pushed_deletes: usize,
    /// Conflict pairs created or refreshed.
    pub conflicts: usize,
    /// Row writes refused with 409, left for the next pass.
    pub deferred_conflicts: usize,
    /// Table and attachment files downloaded.
    pub files_downloaded: usize,
    /// Table and attachment files uploaded.
    pub files_uploaded: usize,
    /// Downloads skipped after failing twice.
    pub files_failed: usize,
}

impl TableCounters {
    /// Rows written locally.
    pub fn pulled(&self) -> usize {
        self.pulled_inserts + self.pulled_updates + self.pulled_deletes
    }

    /// Rows written to the server.
    pub fn pushed(&self) -> usize {
        self.pushed_inserts + self.pushed_updates + self.pushed_deletes
    }

    fn add_files(&mut self, report: &FileSyncReport) {
        self.files_downloaded += report.downloaded;
        self.files_uploaded += report.uploaded;
        self.files_failed += report.failed;
    }
}

/// Result of one table pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableResult {
    /// Table identifier.
    pub table_id: String,
    /// Outcome class.
    pub status: TableStatus,
    /// Error message of a failed pass.
    pub message: Option<String>,
    /// What the pass did before it ended.
    pub counters: TableCounters,
}

/// Result of a full pass.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// One result per table, in processing order.
    pub tables: Vec<TableResult>,
    /// App-level file sync counts, if it succeeded.
    pub app_files: Option<FileSyncReport>,
    /// App-level file sync error, if it failed.
    pub app_files_error: Option<String>,
    /// Duration of the pass.
    pub duration: Duration,
}

impl SyncOutcome {
    /// Returns true if every table and the app files synced.
    pub fn is_success(&self) -> bool {
        self.app_files_error.is_none()
            && self
                .tables
                .iter()
                .all(|t| t.status == TableStatus::Success)
    }

    /// The result of one table.
    pub fn table(&self, table_id: &str) -> Option<&TableResult> {
        self.tables.iter().find(|t| t.table_id == table_id)
    }
}

/// Runs sync passes for one app against one server.
///
/// Callers must not run two passes over the same tables at once; the
/// processor refuses to start while its own pass is active.
pub struct SyncProcessor<S: Synchronizer> {
    config: SyncConfig,
    sync: S,
    db: Arc<Database>,
    state: RwLock<EngineState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

impl<S: Synchronizer> SyncProcessor<S> {
    /// Creates a processor.
    pub fn new(config: SyncConfig, sync: S, db: Arc<Database>) -> Self {
        Self {
            config,
            sync,
            db,
            state: RwLock::new(EngineState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Gets the cumulative stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The synchronizer.
    pub fn synchronizer(&self) -> &S {
        &self.sync
    }

    /// The local database.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Cancels the running pass before its next table.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: EngineState) {
        *self.state.write() = state;
    }

    fn handle_error(&self, error: &SyncError) {
        self.set_state(EngineState::Error);
        self.stats.write().last_error = Some(error.to_string());
    }

    fn files(&self) -> FileSynchronizer<'_, S> {
        FileSynchronizer::new(&self.sync, &self.config.app_folder)
    }

    /// Runs a full pass: every table, then the app-level files.
    ///
    /// A failing table is reported in the outcome and does not stop the
    /// others. Only a failed table listing or a cancellation fails the pass.
    pub fn synchronize(&self) -> SyncResult<SyncOutcome> {
        let start = Instant::now();
        if !self.state().can_start_sync() {
            return Err(SyncError::AlreadyRunning);
        }
        self.cancelled.store(false, Ordering::SeqCst);

        self.set_state(EngineState::Listing);
        let remote = match self.sync.list_tables() {
            Ok(tables) => tables,
            Err(e) => {
                error!(error = %e, "failed to list remote tables");
                self.handle_error(&e);
                return Err(e);
            }
        };
        let local = match self.db.tables() {
            Ok(tables) => tables,
            Err(e) => {
                let e = SyncError::from(e);
                self.handle_error(&e);
                return Err(e);
            }
        };

        let mut outcome = SyncOutcome::default();
        for (table_id, on_server) in tables_to_sync(&remote, &local) {
            if let Err(e) = self.check_cancelled() {
                self.set_state(EngineState::Idle);
                return Err(e);
            }
            let result = match self.synchronize_table_with_retry(&table_id, on_server) {
                Ok(result) => result,
                Err(e) => {
                    self.set_state(EngineState::Idle);
                    return Err(e);
                }
            };
            outcome.tables.push(result);
        }

        self.set_state(EngineState::SyncingFiles);
        match self
            .files()
            .sync_scope(&FileScope::App, self.config.push_local_files)
        {
            Ok(report) => {
                let mut stats = self.stats.write();
                stats.files_downloaded += report.downloaded as u64;
                stats.files_uploaded += report.uploaded as u64;
                outcome.app_files = Some(report);
            }
            Err(e) => {
                error!(error = %e, "app-level file sync failed");
                self.stats.write().last_error = Some(e.to_string());
                outcome.app_files_error = Some(e.to_string());
            }
        }

        outcome.duration = start.elapsed();
        {
            let mut stats = self.stats.write();
            stats.passes_completed += 1;
            stats.last_sync_time = Some(Instant::now());
            if outcome.is_success() {
                stats.last_error = None;
            }
        }
        self.set_state(if outcome.is_success() {
            EngineState::Synced
        } else {
            EngineState::Error
        });
        info!(
            tables = outcome.tables.len(),
            success = outcome.is_success(),
            duration_ms = outcome.duration.as_millis() as u64,
            "sync pass finished"
        );
        Ok(outcome)
    }

    /// Runs one table pass, retrying transient failures.
    ///
    /// Fails only when cancelled; every other error becomes the result's status.
    pub fn synchronize_table_with_retry(
        &self,
        table_id: &str,
        on_server: bool,
    ) -> SyncResult<TableResult> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                self.set_state(EngineState::RetryWait);
                std::thread::sleep(retry.delay_for_attempt(attempt));
                self.stats.write().retries += 1;
            }
            self.check_cancelled()?;

            let mut counters = TableCounters::default();
            match self.synchronize_table(table_id, on_server, &mut counters) {
                Ok(()) => {
                    info!(
                        table_id,
                        pulled = counters.pulled(),
                        pushed = counters.pushed(),
                        conflicts = counters.conflicts,
                        "table synced"
                    );
                    self.record(&counters, true);
                    return Ok(TableResult {
                        table_id: table_id.to_string(),
                        status: TableStatus::Success,
                        message: None,
                        counters,
                    });
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) if e.is_retryable() && retry.allows_retry_after(attempt) => {
                    warn!(table_id, attempt, error = %e, "table sync failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    error!(table_id, error = %e, "table sync failed");
                    self.record(&counters, false);
                    self.stats.write().last_error = Some(e.to_string());
                    return Ok(TableResult {
                        table_id: table_id.to_string(),
                        status: TableStatus::from_error(&e),
                        message: Some(e.to_string()),
                        counters,
                    });
                }
            }
        }
    }

    fn record(&self, counters: &TableCounters, success: bool) {
        let mut stats = self.stats.write();
        if success {
            stats.tables_synced += 1;
        } else {
            stats.tables_failed += 1;
        }
        stats.rows_pulled += counters.pulled() as u64;
        stats.rows_pushed += counters.pushed() as u64;
        stats.conflicts += counters.conflicts as u64;
        stats.deferred_conflicts += counters.deferred_conflicts as u64;
        stats.files_downloaded += counters.files_downloaded as u64;
        stats.files_uploaded += counters.files_uploaded as u64;
    }

    /// Runs one table pass: schema, properties, pull, push, then files.
    ///
    /// Each local step commits on its own, so a failure leaves the table at
    /// the last completed step and the pass can simply be run again.
    pub fn synchronize_table(
        &self,
        table_id: &str,
        on_server: bool,
        counters: &mut TableCounters,
    ) -> SyncResult<()> {
        self.set_state(EngineState::Pulling);
        let remote = if on_server {
            self.sync.get_table_or_none(table_id)?
        } else {
            None
        };
        let (local, remote) = self.ensure_tables(table_id, remote)?;

        let local = self.verify_schema(local, &remote)?;
        let local = self.sync_properties(local, &remote)?;
        let local = self.pull_rows(local, counters)?;

        self.set_state(EngineState::Pushing);
        self.push_rows(&local, counters)?;

        self.set_state(EngineState::SyncingFiles);
        let files = self.files();
        let table_files =
            files.sync_scope(&FileScope::Table(table_id.to_string()), self.config.push_local_files)?;
        counters.add_files(&table_files);
        if table_files.properties_changed {
            info!(table_id, "properties file changed; properties will be pulled again");
            let tag = self.db.table(table_id)?.sync_tag.with_properties_etag(None);
            self.db.set_sync_tag(table_id, &tag)?;
        }

        let row_files = files.sync_scope(
            &FileScope::Instances(table_id.to_string()),
            self.config.push_local_instance_files,
        )?;
        counters.add_files(&row_files);
        if row_files.failed == 0 {
            let table = self.db.table(table_id)?;
            let promoted = self
                .db
                .transaction(|txn| RowWriter::new(txn, &table).promote_pending_files())?;
            if promoted > 0 {
                debug!(table_id, promoted, "rows no longer pending files");
            }
        }

        let now = chrono::Utc::now().to_rfc3339();
        self.db
            .transaction(|txn| tx::touch_last_sync(txn, table_id, &now))?;
        Ok(())
    }

    /// Makes sure the table exists on both sides.
    fn ensure_tables(
        &self,
        table_id: &str,
        remote: Option<TableResource>,
    ) -> SyncResult<(LocalTable, TableResource)> {
        let local = if self.db.has_table(table_id)? {
            self.db.table(table_id)?
        } else {
            let Some(resource) = &remote else {
                return Err(StoreError::TableNotFound(table_id.to_string()).into());
            };
            let definition = self.sync.get_table_definition(&resource.definition_uri)?;
            info!(table_id, "creating local table from server definition");
            self.db.create_table(
                table_id,
                resource.display_name.as_deref(),
                &definition.definition.columns,
            )?
        };

        let remote = match remote {
            Some(remote) => remote,
            None => {
                let resource =
                    self.sync
                        .create_table(table_id, &local.sync_tag, &local.columns)?;
                // Local properties win over the fresh server table's defaults.
                let tag = SyncTag::new(
                    local.sync_tag.data_etag.clone(),
                    resource.properties_etag.clone(),
                    resource.schema_etag.clone(),
                );
                self.db.transaction(|txn| {
                    tx::write_sync_tag(txn, table_id, &tag)?;
                    tx::set_properties_dirty(txn, table_id, true)
                })?;
                resource
            }
        };
        Ok((self.db.table(table_id)?, remote))
    }

    fn verify_schema(&self, local: LocalTable, remote: &TableResource) -> SyncResult<LocalTable> {
        let table_id = local.table_id.clone();
        match &local.sync_tag.schema_etag {
            Some(schema) if Some(schema) != remote.schema_etag.as_ref() => {
                warn!(
                    table_id = %table_id,
                    local = %schema,
                    remote = ?remote.schema_etag,
                    "server schema changed"
                );
                let definition = self.sync.get_table_definition(&remote.definition_uri)?;
                self.db.data_table(&table_id)?.reset_for_schema_change()?;
                let tag = SyncTag::new(
                    None,
                    local.sync_tag.properties_etag.clone(),
                    remote.schema_etag.clone(),
                );
                self.db.transaction(|txn| {
                    tx::update_columns(txn, &table_id, &definition.definition.columns)?;
                    tx::write_sync_tag(txn, &table_id, &tag)
                })?;
            }
            Some(_) => return Ok(local),
            None => {
                let tag = local
                    .sync_tag
                    .clone()
                    .with_schema_etag(remote.schema_etag.clone());
                self.db.set_sync_tag(&table_id, &tag)?;
            }
        }
        Ok(self.db.table(&table_id)?)
    }

    fn sync_properties(&self, local: LocalTable, remote: &TableResource) -> SyncResult<LocalTable> {
        let table_id = local.table_id.as_str();
        if remote.properties_etag != local.sync_tag.properties_etag {
            if local.properties_dirty {
                warn!(table_id, "server properties changed; discarding local edits");
            }
            let properties = self
                .sync
                .get_table_properties(&remote.properties_uri, &local.sync_tag)?;
            let entries = properties
                .properties
                .kvs_entries
                .iter()
                .map(KeyValueEntry::from_wire)
                .collect::<StoreResult<Vec<_>>>()?;
            let tag = local
                .sync_tag
                .clone()
                .with_properties_etag(properties.properties.properties_etag.clone());
            self.db.transaction(|txn| {
                tx::replace_table_entries(txn, table_id, &entries)?;
                tx::write_sync_tag(txn, table_id, &tag)
            })?;
            info!(table_id, entries = entries.len(), "pulled table properties");
        } else if local.properties_dirty {
            let entries: Vec<_> = self
                .db
                .read(|conn| tx::table_entries(conn, table_id))?
                .iter()
                .map(KeyValueEntry::to_wire)
                .collect();
            let pushed = self.sync.set_table_properties(
                &remote.properties_uri,
                &local.sync_tag,
                table_id,
                &entries,
            )?;
            let tag = local
                .sync_tag
                .clone()
                .with_properties_etag(pushed.properties_etag);
            self.db.transaction(|txn| {
                tx::write_sync_tag(txn, table_id, &tag)?;
                tx::set_properties_dirty(txn, table_id, false)
            })?;
        } else {
            return Ok(local);
        }
        Ok(self.db.table(table_id)?)
    }

    fn pull_rows(&self, local: LocalTable, counters: &mut TableCounters) -> SyncResult<LocalTable> {
        let table_id = local.table_id.as_str();
        let incoming = self.sync.get_updates(table_id, &local.sync_tag)?;
        if incoming.is_empty() && incoming.tag.same_data(&local.sync_tag) {
            return Ok(local);
        }

        let tag = local
            .sync_tag
            .clone()
            .with_data_etag(incoming.tag.data_etag.clone());
        let clock = self.db.clock();
        self.db.transaction(|txn| {
            let writer = RowWriter::new(txn, &local);
            for resource in &incoming.rows {
                let row = &resource.row;
                let entry = RowEntry::from_physical(writer.physical_rows(&row.row_id)?)
                    .into_iter()
                    .next();
                let server = reconcile::server_row(&local, row, &clock.next());
                let action = reconcile::plan_pull(entry.as_ref(), server, row.deleted);
                debug!(table_id, row_id = %row.row_id, ?action, "pulled row");
                count_pull(counters, &action);
                reconcile::apply(&writer, &row.row_id, &action)?;
            }
            tx::write_sync_tag(txn, table_id, &tag)
        })?;
        Ok(self.db.table(table_id)?)
    }

    fn push_rows(&self, local: &LocalTable, counters: &mut TableCounters) -> SyncResult<()> {
        let table_id = local.table_id.as_str();
        let rows = self
            .db
            .read(|conn| reconcile::rows_to_push(&RowWriter::new(conn, local)))?;
        let files = self.files();

        for row in rows {
            self.check_cancelled()?;
            let wire = reconcile::wire_row(&row);
            if row.sync_state == SyncState::Deleted {
                match self.sync.delete_row(table_id, &local.sync_tag, &wire) {
                    Ok(_) => {
                        self.db.transaction(|txn| {
                            RowWriter::new(txn, local).delete_all(&row.row_id)
                        })?;
                        counters.pushed_deletes += 1;
                    }
                    Err(e) if e.is_conflict() => defer(counters, table_id, &row),
                    Err(e) => return Err(e),
                }
            } else {
                match self.sync.insert_or_update_row(table_id, &local.sync_tag, &wire) {
                    Ok(written) => {
                        let state = if files.row_has_attachments(table_id, &row.row_id) {
                            SyncState::SyncedPendingFiles
                        } else {
                            SyncState::Synced
                        };
                        self.db.transaction(|txn| {
                            RowWriter::new(txn, local).set_state(
                                &row.row_id,
                                None,
                                state,
                                written.row_etag.as_deref(),
                            )
                        })?;
                        if row.sync_state == SyncState::NewRow {
                            counters.pushed_inserts += 1;
                        } else {
                            counters.pushed_updates += 1;
                        }
                    }
                    Err(e) if e.is_conflict() => defer(counters, table_id, &row),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

fn defer(counters: &mut TableCounters, table_id: &str, row: &LocalRow) {
    warn!(
        table_id,
        row_id = %row.row_id,
        "server row changed since last pull; push deferred"
    );
    counters.deferred_conflicts += 1;
}

fn count_pull(counters: &mut TableCounters, action: &PullAction) {
    match action {
        PullAction::Ignore => {}
        PullAction::Insert(_) => counters.pulled_inserts += 1,
        PullAction::Replace(_) => counters.pulled_updates += 1,
        PullAction::Purge => counters.pulled_deletes += 1,
        PullAction::Conflict { .. } | PullAction::RefreshServerHalf(_) => counters.conflicts += 1,
    }
}

/// Tables of a pass in processing order: remote tables in listing order, then
/// local-only tables. Tables disabled locally are left out.
fn tables_to_sync(remote: &[TableResource], local: &[LocalTable]) -> Vec<(String, bool)> {
    let enabled: HashMap<&str, bool> = local
        .iter()
        .map(|t| (t.table_id.as_str(), t.sync_enabled))
        .collect();
    let mut tables: Vec<(String, bool)> = remote
        .iter()
        .filter(|r| enabled.get(r.table_id.as_str()).copied().unwrap_or(true))
        .map(|r| (r.table_id.clone(), true))
        .collect();
    for table in local {
        if table.sync_enabled && !remote.iter().any(|r| r.table_id == table.table_id) {
            tables.push((table.table_id.clone(), false));
        }
    }
    tables
}
