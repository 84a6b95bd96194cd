//! Manifest-driven file sync.

use crate::error::{SyncError, SyncResult};
use crate::synchronizer::Synchronizer;
use md5::{Digest, Md5};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tablesync_protocol::{
    files_to_upload, is_safe_relative_path, FileManifestEntry, FileScope, INSTANCES_FOLDER,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const TMP_SUFFIX: &str = ".tmp";

/// Counts of one scope's file sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSyncReport {
    /// Files written from the server.
    pub downloaded: usize,
    /// Files sent to the server.
    pub uploaded: usize,
    /// Manifest entries already current locally.
    pub skipped: usize,
    /// Downloads that failed twice and were left for the next pass, plus
    /// manifest entries whose path would leave the app folder.
    pub failed: usize,
    /// True if the table properties file was replaced.
    pub properties_changed: bool,
}

/// Syncs the files of one scope between the app folder and the server.
pub struct FileSynchronizer<'a, S: Synchronizer + ?Sized> {
    sync: &'a S,
    app_folder: &'a Path,
}

impl<'a, S: Synchronizer + ?Sized> FileSynchronizer<'a, S> {
    /// Binds a synchronizer to a local app folder.
    pub fn new(sync: &'a S, app_folder: &'a Path) -> Self {
        Self { sync, app_folder }
    }

    /// Downloads stale files of a scope, then uploads local files the manifest lacks.
    ///
    /// A download that fails twice is logged and counted, and the pass goes on.
    /// An upload failure aborts the scope.
    pub fn sync_scope(&self, scope: &FileScope, push_local: bool) -> SyncResult<FileSyncReport> {
        let manifest = self.sync.manifest(scope)?;
        let mut report = FileSyncReport::default();
        let properties_file = match scope {
            FileScope::Table(table_id) => Some(FileScope::properties_file(table_id)),
            _ => None,
        };

        for entry in &manifest {
            if !is_safe_relative_path(&entry.filename) {
                warn!(filename = %entry.filename, ?scope, "refusing manifest entry outside the app folder");
                report.failed += 1;
                continue;
            }
            if !scope.accepts(&entry.filename) {
                debug!(filename = %entry.filename, ?scope, "manifest entry outside scope");
                continue;
            }
            match self.compare_and_download(entry) {
                Ok(true) => {
                    report.downloaded += 1;
                    if properties_file.as_deref() == Some(entry.filename.as_str()) {
                        report.properties_changed = true;
                    }
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(filename = %entry.filename, error = %e, "skipping file after failed download");
                    report.failed += 1;
                }
            }
        }

        if push_local {
            let local = self.local_files(scope)?;
            for path in files_to_upload(local.iter().map(String::as_str), &manifest) {
                let content = fs::read(self.local_path(&path)?)?;
                self.sync.upload_file(scope, &path, content)?;
                report.uploaded += 1;
            }
        }

        info!(
            ?scope,
            downloaded = report.downloaded,
            uploaded = report.uploaded,
            skipped = report.skipped,
            failed = report.failed,
            "file sync finished"
        );
        Ok(report)
    }

    /// Downloads a manifest entry unless the local copy has the same hash.
    ///
    /// Returns true if the file was downloaded. Fails with
    /// [`SyncError::Protocol`] if the filename would leave the app folder.
    pub fn compare_and_download(&self, entry: &FileManifestEntry) -> SyncResult<bool> {
        let dest = self.local_path(&entry.filename)?;
        if dest.is_file() && file_md5(&dest)?.eq_ignore_ascii_case(&entry.md5hash) {
            return Ok(false);
        }

        if let Err(first) = self.download_to(&entry.download_url, &dest) {
            warn!(filename = %entry.filename, error = %first, "download failed, retrying once");
            self.download_to(&entry.download_url, &dest)?;
        }
        debug!(filename = %entry.filename, "downloaded file");
        Ok(true)
    }

    fn download_to(&self, url: &str, dest: &Path) -> SyncResult<()> {
        write_atomically(dest, |sink| self.sync.download_file(url, sink))
    }

    /// App-relative paths of the local files belonging to a scope.
    pub fn local_files(&self, scope: &FileScope) -> SyncResult<Vec<String>> {
        if !self.app_folder.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in WalkDir::new(self.app_folder).sort_by_file_name() {
            let entry = entry.map_err(|e| SyncError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = relative_path(self.app_folder, entry.path()) else {
                continue;
            };
            if relative.ends_with(TMP_SUFFIX) || !scope.accepts(&relative) {
                continue;
            }
            paths.push(relative);
        }
        Ok(paths)
    }

    /// Returns true if a row's attachment folder holds any file.
    pub fn row_has_attachments(&self, table_id: &str, row_id: &str) -> bool {
        let folder = self
            .app_folder
            .join("tables")
            .join(table_id)
            .join(INSTANCES_FOLDER)
            .join(row_id);
        WalkDir::new(folder)
            .into_iter()
            .filter_map(Result::ok)
            .any(|e| e.file_type().is_file())
    }

    fn local_path(&self, relative: &str) -> SyncResult<PathBuf> {
        if !is_safe_relative_path(relative) {
            return Err(SyncError::Protocol(format!(
                "file path escapes the app folder: {relative:?}"
            )));
        }
        Ok(relative
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.app_folder.to_path_buf(), |path, segment| path.join(segment)))
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments = relative
        .components()
        .map(|c| c.as_os_str().to_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()?;
    Some(segments.join("/"))
}

/// Content hash of a file, formatted like manifest hashes.
pub fn file_md5(path: &Path) -> SyncResult<String> {
    let bytes = fs::read(path)?;
    Ok(format!("md5:{:x}", Md5::digest(&bytes)))
}

/// Writes `dest` through a sibling temp file renamed over it on success.
///
/// The temp file is always removed, so `dest` only ever holds a complete file.
pub fn write_atomically<F>(dest: &Path, write: F) -> SyncResult<()>
where
    F: FnOnce(&mut dyn Write) -> SyncResult<()>,
{
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = dest.as_os_str().to_owned();
    tmp_name.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp_name);

    let result = (|| -> SyncResult<()> {
        let mut file = BufWriter::new(fs::File::create(&tmp)?);
        write(&mut file)?;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, dest)?;
        Ok(())
    })();

    if tmp.exists() {
        if let Err(e) = fs::remove_file(&tmp) {
            warn!(path = %tmp.display(), error = %e, "failed to remove temp file");
        }
    }
    result
}
