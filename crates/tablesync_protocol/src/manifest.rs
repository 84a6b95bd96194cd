//! File manifests and the upload differ.
//!
//! Paths are always relative to the app folder and use `/` separators.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Name of the per-table folder holding row attachments.
pub const INSTANCES_FOLDER: &str = "instances";

/// Top-level folders that never take part in app-level file sync.
pub const APP_LEVEL_EXCLUDED_DIRS: [&str; 4] = ["tables", "logging", "metadata", "output"];

const ASSETS_CSV_PREFIX: &str = "assets/csv/";

/// One file the server holds for a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManifestEntry {
    /// Path relative to the scope root.
    pub filename: String,
    /// Size of the file in bytes.
    #[serde(default)]
    pub content_length: Option<u64>,
    /// MIME type.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Content hash, formatted `md5:<hex>`.
    pub md5hash: String,
    /// Where to fetch the file.
    pub download_url: String,
}

/// Server response listing the files of a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    /// The entries.
    #[serde(default)]
    pub files: Vec<FileManifestEntry>,
}

/// The granularity a manifest describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileScope {
    /// Files shared by the whole app.
    App,
    /// Non-attachment files of one table, plus its `assets/csv` files.
    Table(String),
    /// Row attachments of one table.
    Instances(String),
}

impl FileScope {
    /// Folder, relative to the app folder, that holds the scope's files.
    pub fn local_root(&self) -> String {
        match self {
            FileScope::App => String::new(),
            FileScope::Table(table_id) => format!("tables/{table_id}"),
            FileScope::Instances(table_id) => format!("tables/{table_id}/{INSTANCES_FOLDER}"),
        }
    }

    /// Prefix to prepend to manifest filenames to make them app-relative.
    pub fn manifest_prefix(&self) -> Option<String> {
        match self {
            FileScope::Instances(_) => Some(format!("{}/", self.local_root())),
            _ => None,
        }
    }

    /// Returns true if the app-relative path belongs to this scope.
    ///
    /// Paths that could leave the app folder belong to no scope.
    pub fn accepts(&self, relative_path: &str) -> bool {
        if !is_safe_relative_path(relative_path) {
            return false;
        }
        match self {
            FileScope::App => {
                let top = relative_path.split('/').next().unwrap_or_default();
                !APP_LEVEL_EXCLUDED_DIRS.contains(&top)
                    && !relative_path.starts_with(ASSETS_CSV_PREFIX)
            }
            FileScope::Table(table_id) => {
                let root = format!("tables/{table_id}/");
                let instances = format!("{root}{INSTANCES_FOLDER}/");
                (relative_path.starts_with(&root) && !relative_path.starts_with(&instances))
                    || is_table_asset_file(relative_path, table_id)
            }
            FileScope::Instances(table_id) => relative_path
                .starts_with(&format!("tables/{table_id}/{INSTANCES_FOLDER}/")),
        }
    }

    /// Location of the table properties file for a table.
    pub fn properties_file(table_id: &str) -> String {
        format!("tables/{table_id}/properties.csv")
    }
}

/// Files to upload: local paths that the manifest does not list.
///
/// The manifest is the only proof that the server already holds a file, so
/// hashes play no part here.
pub fn files_to_upload<'a, I>(local_paths: I, manifest: &[FileManifestEntry]) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let on_server: HashSet<&str> = manifest.iter().map(|e| e.filename.as_str()).collect();
    local_paths
        .into_iter()
        .filter(|path| !on_server.contains(path))
        .map(str::to_string)
        .collect()
}

/// Returns true if the path stays inside whatever folder it is joined onto.
///
/// Rejects empty and absolute paths, backslashes and any `.` or `..` segment.
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && !path.contains('\0')
        && path
            .split('/')
            .all(|segment| segment != "." && segment != "..")
}

// assets/csv/<tableId>.<anything>
fn is_table_asset_file(path: &str, table_id: &str) -> bool {
    if !path.starts_with(ASSETS_CSV_PREFIX) {
        return false;
    }
    let parts: Vec<&str> = path.split('/').collect();
    parts.len() >= 3 && parts[2].split('.').next() == Some(table_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(name: &str) -> FileManifestEntry {
        FileManifestEntry {
            filename: name.to_string(),
            content_length: None,
            content_type: None,
            md5hash: "md5:00".into(),
            download_url: format!("http://host/{name}"),
        }
    }

    #[test]
    fn upload_set_is_local_minus_manifest() {
        let local = ["a.html", "b.js", "c.css"];
        let manifest = vec![entry("b.js"), entry("zzz.txt")];
        let upload = files_to_upload(local, &manifest);
        assert_eq!(
            upload.into_iter().collect::<Vec<_>>(),
            vec!["a.html".to_string(), "c.css".to_string()]
        );
    }

    #[test]
    fn app_scope_filters() {
        let scope = FileScope::App;
        assert!(scope.accepts("framework/index.html"));
        assert!(scope.accepts("assets/app.js"));
        assert!(!scope.accepts("assets/csv/people.csv"));
        assert!(!scope.accepts("tables/people/definition.csv"));
        assert!(!scope.accepts("logging/today.log"));
    }

    #[test]
    fn table_scope_filters() {
        let scope = FileScope::Table("people".into());
        assert!(scope.accepts("tables/people/properties.csv"));
        assert!(scope.accepts("assets/csv/people.csv"));
        assert!(scope.accepts("assets/csv/people.updated.csv"));
        assert!(!scope.accepts("assets/csv/places.csv"));
        assert!(!scope.accepts("tables/people/instances/r1/photo.jpg"));
        assert!(!scope.accepts("tables/peoplex/properties.csv"));
    }

    #[test]
    fn instance_scope_prefix() {
        let scope = FileScope::Instances("people".into());
        assert_eq!(
            scope.manifest_prefix().as_deref(),
            Some("tables/people/instances/")
        );
        assert!(scope.accepts("tables/people/instances/r1/photo.jpg"));
        assert!(!scope.accepts("tables/people/properties.csv"));
        assert_eq!(FileScope::App.manifest_prefix(), None);
    }

    #[test]
    fn escaping_paths_belong_to_no_scope() {
        let scopes = [
            FileScope::App,
            FileScope::Table("people".into()),
            FileScope::Instances("people".into()),
        ];
        let escaping = [
            "../escaped.txt",
            "/etc/passwd",
            "tables/people/../../escaped.txt",
            "tables/people/instances/../../../x",
            "tables/people/./properties.csv",
            "assets\\..\\..\\x",
            "",
        ];
        for scope in &scopes {
            for path in escaping {
                assert!(!scope.accepts(path), "{scope:?} accepted {path:?}");
            }
        }
    }

    #[test]
    fn safe_paths() {
        assert!(is_safe_relative_path("framework/index.html"));
        assert!(is_safe_relative_path("tables/people/instances/r1/photo..jpg"));
        assert!(is_safe_relative_path("a//b"));
        assert!(!is_safe_relative_path(".."));
        assert!(!is_safe_relative_path("a/.."));
        assert!(!is_safe_relative_path("a\\b"));
    }

    proptest! {
        #[test]
        fn differ_is_a_pure_set_difference(
            local in proptest::collection::vec("[a-d]{1,2}", 0..12),
            listed in proptest::collection::vec("[a-d]{1,2}", 0..12),
        ) {
            let manifest: Vec<_> = listed.iter().map(|n| entry(n)).collect();
            let upload = files_to_upload(local.iter().map(String::as_str), &manifest);

            let expected: BTreeSet<String> = local
                .iter()
                .filter(|p| !listed.contains(p))
                .cloned()
                .collect();
            prop_assert_eq!(&upload, &expected);

            let mut reversed_local = local.clone();
            reversed_local.reverse();
            let mut reversed_manifest = manifest.clone();
            reversed_manifest.reverse();
            let again = files_to_upload(
                reversed_local.iter().map(String::as_str),
                &reversed_manifest,
            );
            prop_assert_eq!(upload, again);
        }
    }
}
