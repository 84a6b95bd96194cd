//! The table synchronizer contract.

use crate::error::SyncResult;
use std::io::Write;
use tablesync_protocol::{
    Column, FileManifestEntry, FileScope, KeyValueStoreEntry, PropertiesResource, Row,
    RowResource, SyncTag, TableDefinitionResource, TableResource,
};

/// Rows the server changed since a tag, with the tag observed alongside them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRows {
    /// Tag of the table at the time of the fetch.
    pub tag: SyncTag,
    /// Changed rows, deleted ones included.
    pub rows: Vec<RowResource>,
}

impl IncomingRows {
    /// Returns true if no row changed.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The server's answer to a row write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowModification {
    /// New version of the row.
    pub row_etag: Option<String>,
    /// Table data ETag right after the write.
    pub data_etag: Option<String>,
    /// The caller's tag with the data ETag advanced.
    pub tag: SyncTag,
}

/// Remote operations on the tables, rows, properties and files of one app.
pub trait Synchronizer: Send + Sync {
    /// Lists the remote tables, sorted by display name, and refreshes the cache.
    fn list_tables(&self) -> SyncResult<Vec<TableResource>>;

    /// Returns a table resource, from the cache when possible.
    fn get_table(&self, table_id: &str) -> SyncResult<TableResource>;

    /// Like [`Synchronizer::get_table`], but a table the server does not know is `None`.
    fn get_table_or_none(&self, table_id: &str) -> SyncResult<Option<TableResource>>;

    /// Creates a table on the server.
    fn create_table(
        &self,
        table_id: &str,
        tag: &SyncTag,
        columns: &[Column],
    ) -> SyncResult<TableResource>;

    /// Deletes a table on the server.
    fn delete_table(&self, table_id: &str) -> SyncResult<()>;

    /// Fetches a table definition.
    fn get_table_definition(&self, definition_uri: &str) -> SyncResult<TableDefinitionResource>;

    /// Fetches the rows changed since `current`.
    ///
    /// Returns no rows, without fetching any, when the data ETag has not moved.
    fn get_updates(&self, table_id: &str, current: &SyncTag) -> SyncResult<IncomingRows>;

    /// Writes a row.
    fn insert_or_update_row(
        &self,
        table_id: &str,
        current: &SyncTag,
        row: &Row,
    ) -> SyncResult<RowModification>;

    /// Deletes a row and returns the tag with the new data ETag.
    fn delete_row(&self, table_id: &str, current: &SyncTag, row: &Row) -> SyncResult<SyncTag>;

    /// Fetches a table's properties.
    fn get_table_properties(
        &self,
        properties_uri: &str,
        current: &SyncTag,
    ) -> SyncResult<PropertiesResource>;

    /// Replaces a table's properties and returns the new tag.
    fn set_table_properties(
        &self,
        properties_uri: &str,
        current: &SyncTag,
        table_id: &str,
        entries: &[KeyValueStoreEntry],
    ) -> SyncResult<SyncTag>;

    /// Fetches the manifest of a scope, with app-relative filenames.
    fn manifest(&self, scope: &FileScope) -> SyncResult<Vec<FileManifestEntry>>;

    /// Uploads one app-relative file within a scope.
    fn upload_file(
        &self,
        scope: &FileScope,
        relative_path: &str,
        content: Vec<u8>,
    ) -> SyncResult<()>;

    /// Streams a file into `sink`.
    fn download_file(&self, url: &str, sink: &mut dyn Write) -> SyncResult<()>;
}
