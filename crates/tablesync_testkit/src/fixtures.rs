//! Test fixtures.
//!
//! A [`TestApp`] is one device: a temporary app folder and database wired to
//! a [`FakeAggregate`]. Several devices can share a server.

use crate::fake::{FakeAggregate, FAKE_APP, FAKE_CLIENT_VERSION, FAKE_SERVER_URL};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tablesync_engine::{AggregateSynchronizer, RetryConfig, SyncConfig, SyncProcessor};
use tablesync_protocol::Column;
use tablesync_store::{Database, Values};
use tempfile::TempDir;

/// The processor type driven by the fixtures.
pub type TestProcessor = SyncProcessor<AggregateSynchronizer<FakeAggregate>>;

/// One device with its own app folder and database.
pub struct TestApp {
    /// The local database.
    pub db: Arc<Database>,
    /// The server this device syncs with.
    pub server: FakeAggregate,
    dir: TempDir,
}

impl TestApp {
    /// Creates a device with a fresh server.
    pub fn new() -> Self {
        Self::with_server(FakeAggregate::new())
    }

    /// Creates a device syncing with an existing server.
    pub fn with_server(server: FakeAggregate) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        fs::create_dir_all(dir.path().join("app")).expect("Failed to create app folder");
        let db = Database::open(dir.path().join("tablesync.db"))
            .expect("Failed to open database");
        Self {
            db: Arc::new(db),
            server,
            dir,
        }
    }

    /// The app folder of this device.
    pub fn app_folder(&self) -> PathBuf {
        self.dir.path().join("app")
    }

    /// Sync configuration pointing at the fake server, with fast retries.
    pub fn config(&self) -> SyncConfig {
        SyncConfig::new(FAKE_SERVER_URL, FAKE_APP)
            .with_client_version(FAKE_CLIENT_VERSION)
            .with_app_folder(self.app_folder())
            .with_retry(
                RetryConfig::new(2)
                    .with_initial_delay(Duration::from_millis(1))
                    .without_jitter(),
            )
    }

    /// A synchronizer over the fake server.
    pub fn synchronizer(&self) -> AggregateSynchronizer<FakeAggregate> {
        AggregateSynchronizer::new(self.config(), self.server.clone())
    }

    /// A processor with the default configuration.
    pub fn processor(&self) -> TestProcessor {
        self.processor_with(self.config())
    }

    /// A processor with a custom configuration.
    pub fn processor_with(&self, config: SyncConfig) -> TestProcessor {
        let sync = AggregateSynchronizer::new(config.clone(), self.server.clone());
        SyncProcessor::new(config, sync, Arc::clone(&self.db))
    }

    /// Writes a file into the app folder.
    pub fn write_file(&self, relative_path: &str, content: &[u8]) {
        let path = self.path_of(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent folder");
        }
        fs::write(path, content).expect("Failed to write file");
    }

    /// Reads a file from the app folder.
    pub fn read_file(&self, relative_path: &str) -> Option<Vec<u8>> {
        fs::read(self.path_of(relative_path)).ok()
    }

    /// Absolute path of an app-relative path.
    pub fn path_of(&self, relative_path: &str) -> PathBuf {
        relative_path
            .split('/')
            .fold(self.app_folder(), |path, segment| path.join(segment))
    }

    /// Lists every file under the app folder, as app-relative paths.
    pub fn all_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        collect_files(&self.app_folder(), &self.app_folder(), &mut files);
        files.sort();
        files
    }
}

impl Default for TestApp {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(relative) = path.strip_prefix(root) {
            let segments: Vec<_> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(segments.join("/"));
        }
    }
}

/// Builds a value map from string pairs.
pub fn values(pairs: &[(&str, &str)]) -> Values {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Some(v.to_string())))
        .collect()
}

/// Columns of the `people` table used across tests.
pub fn people_columns() -> Vec<Column> {
    vec![Column::new("name", "string"), Column::new("age", "integer")]
}
