//! Synchronizer for an Aggregate table server.

use crate::cache::ResourceCache;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method, RequestHeaders};
use crate::synchronizer::{IncomingRows, RowModification, Synchronizer};
use std::io::Write;
use tablesync_protocol::{
    escape_path, normalize_uri, with_query, Column, FileManifest, FileManifestEntry, FileScope,
    KeyValueStoreEntry, PropertiesResource, Row, RowResource, RowResourceList, SyncTag,
    TableDefinition, TableDefinitionResource, TableProperties, TableResource, TableResourceList,
};
use tracing::{debug, info};

/// Talks to the `/odktables/{app}/` service of one server.
///
/// Owns the resource cache for its app session.
pub struct AggregateSynchronizer<C: HttpClient> {
    config: SyncConfig,
    root: String,
    headers: RequestHeaders,
    client: C,
    cache: ResourceCache,
}

impl<C: HttpClient> AggregateSynchronizer<C> {
    /// Creates a synchronizer with an empty cache.
    pub fn new(config: SyncConfig, client: C) -> Self {
        Self::with_cache(config, client, ResourceCache::new())
    }

    /// Creates a synchronizer around an existing cache.
    pub fn with_cache(config: SyncConfig, client: C, cache: ResourceCache) -> Self {
        Self {
            root: config.odktables_root(),
            headers: RequestHeaders::from_config(&config),
            config,
            client,
            cache,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The resource cache.
    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// The underlying HTTP client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn tables_uri(&self) -> String {
        normalize_uri(&self.root, "tables/")
    }

    fn table_uri(&self, table_id: &str) -> String {
        normalize_uri(&self.tables_uri(), &escape_path(table_id))
    }

    fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let request = self.headers.apply(request);
        debug!(method = request.method.as_str(), url = %request.url, "request");
        let response = self
            .client
            .execute(request)
            .map_err(SyncError::transport_retryable)?;
        response.error_for_status()
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> SyncResult<T> {
        self.send(HttpRequest::get(url))?.json()
    }

    fn refresh_table(&self, table_id: &str) -> SyncResult<TableResource> {
        let resource: TableResource = self.get_json(&self.table_uri(table_id))?;
        self.cache.insert(resource.clone());
        Ok(resource)
    }

    fn manifest_uri(&self, scope: &FileScope) -> String {
        match scope {
            FileScope::App => {
                normalize_uri(&self.root, &format!("manifest/{}/", self.config.client_version))
            }
            FileScope::Table(table_id) => normalize_uri(
                &self.root,
                &format!(
                    "manifest/{}/{}",
                    self.config.client_version,
                    escape_path(table_id)
                ),
            ),
            FileScope::Instances(table_id) => normalize_uri(
                &self.table_uri(table_id),
                "attachments/manifest/",
            ),
        }
    }

    fn upload_uri(&self, scope: &FileScope, relative_path: &str) -> SyncResult<String> {
        match scope {
            FileScope::App | FileScope::Table(_) => Ok(normalize_uri(
                &self.root,
                &format!(
                    "files/{}/{}",
                    self.config.client_version,
                    escape_path(relative_path)
                ),
            )),
            FileScope::Instances(table_id) => {
                let prefix = scope.manifest_prefix().unwrap_or_default();
                let partial = relative_path.strip_prefix(&prefix).ok_or_else(|| {
                    SyncError::Protocol(format!(
                        "{relative_path} is not an attachment of table {table_id}"
                    ))
                })?;
                Ok(normalize_uri(
                    &self.table_uri(table_id),
                    &format!("attachments/file/{}", escape_path(partial)),
                ))
            }
        }
    }
}

impl<C: HttpClient> Synchronizer for AggregateSynchronizer<C> {
    fn list_tables(&self) -> SyncResult<Vec<TableResource>> {
        let list: TableResourceList = self.get_json(&self.tables_uri())?;
        let mut tables = list.tables;
        self.cache.replace_all(tables.iter().cloned());
        tables.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        info!(count = tables.len(), "listed remote tables");
        Ok(tables)
    }

    fn get_table(&self, table_id: &str) -> SyncResult<TableResource> {
        match self.cache.get(table_id) {
            Some(resource) => Ok(resource),
            None => self.refresh_table(table_id),
        }
    }

    fn get_table_or_none(&self, table_id: &str) -> SyncResult<Option<TableResource>> {
        match self.get_table(table_id) {
            Ok(resource) => Ok(Some(resource)),
            Err(e) if e.status() == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_table(
        &self,
        table_id: &str,
        tag: &SyncTag,
        columns: &[Column],
    ) -> SyncResult<TableResource> {
        let definition = TableDefinition {
            table_id: table_id.to_string(),
            schema_etag: tag.schema_etag.clone(),
            columns: columns.to_vec(),
        };
        let request =
            HttpRequest::new(Method::Put, self.table_uri(table_id)).with_json(&definition)?;
        let resource: TableResource = self.send(request)?.json()?;
        self.cache.insert(resource.clone());
        info!(table_id, schema_etag = ?resource.schema_etag, "created remote table");
        Ok(resource)
    }

    fn delete_table(&self, table_id: &str) -> SyncResult<()> {
        self.send(HttpRequest::delete(self.table_uri(table_id)))?;
        self.cache.evict(table_id);
        info!(table_id, "deleted remote table");
        Ok(())
    }

    fn get_table_definition(&self, definition_uri: &str) -> SyncResult<TableDefinitionResource> {
        self.get_json(definition_uri)
    }

    fn get_updates(&self, table_id: &str, current: &SyncTag) -> SyncResult<IncomingRows> {
        let resource = self.refresh_table(table_id)?;
        let tag = resource.sync_tag();
        if tag.same_data(current) {
            debug!(table_id, "no data changes");
            return Ok(IncomingRows {
                tag,
                rows: Vec::new(),
            });
        }

        let url = match &current.data_etag {
            None => resource.data_uri.clone(),
            Some(etag) => with_query(&resource.diff_uri, "data_etag", etag),
        };
        let list: RowResourceList = self.get_json(&url)?;
        debug!(table_id, rows = list.rows.len(), "fetched row changes");
        Ok(IncomingRows {
            tag,
            rows: list.rows,
        })
    }

    fn insert_or_update_row(
        &self,
        table_id: &str,
        current: &SyncTag,
        row: &Row,
    ) -> SyncResult<RowModification> {
        let resource = self.get_table(table_id)?;
        let url = normalize_uri(&resource.data_uri, &escape_path(&row.row_id));
        let request = HttpRequest::new(Method::Put, url).with_json(row)?;
        let written: RowResource = self.send(request)?.json()?;

        let tag = current
            .clone()
            .with_data_etag(written.data_etag_at_modification.clone());
        self.cache.observe(table_id, &tag);
        Ok(RowModification {
            row_etag: written.row.row_etag,
            data_etag: written.data_etag_at_modification,
            tag,
        })
    }

    fn delete_row(&self, table_id: &str, current: &SyncTag, row: &Row) -> SyncResult<SyncTag> {
        let resource = self.get_table(table_id)?;
        let mut url = normalize_uri(&resource.data_uri, &escape_path(&row.row_id));
        if let Some(row_etag) = &row.row_etag {
            url = with_query(&url, "row_etag", row_etag);
        }
        let data_etag = self.send(HttpRequest::delete(url))?.text();
        let data_etag = (!data_etag.is_empty()).then_some(data_etag);

        let tag = current.clone().with_data_etag(data_etag);
        self.cache.observe(table_id, &tag);
        Ok(tag)
    }

    fn get_table_properties(
        &self,
        properties_uri: &str,
        current: &SyncTag,
    ) -> SyncResult<PropertiesResource> {
        let properties: PropertiesResource = self.get_json(properties_uri)?;
        let observed = current
            .clone()
            .with_properties_etag(properties.properties.properties_etag.clone())
            .with_schema_etag(properties.properties.schema_etag.clone());
        self.cache
            .observe(&properties.properties.table_id, &observed);
        Ok(properties)
    }

    fn set_table_properties(
        &self,
        properties_uri: &str,
        current: &SyncTag,
        table_id: &str,
        entries: &[KeyValueStoreEntry],
    ) -> SyncResult<SyncTag> {
        let body = TableProperties {
            table_id: table_id.to_string(),
            schema_etag: current.schema_etag.clone(),
            properties_etag: current.properties_etag.clone(),
            kvs_entries: entries.to_vec(),
        };
        let request = HttpRequest::new(Method::Put, properties_uri).with_json(&body)?;
        let updated: PropertiesResource = self.send(request)?.json()?;

        let tag = SyncTag::new(
            current.data_etag.clone(),
            updated.properties.properties_etag,
            updated.properties.schema_etag,
        );
        self.cache.observe(table_id, &tag);
        info!(table_id, entries = entries.len(), "pushed table properties");
        Ok(tag)
    }

    fn manifest(&self, scope: &FileScope) -> SyncResult<Vec<FileManifestEntry>> {
        let manifest: FileManifest = self.get_json(&self.manifest_uri(scope))?;
        let prefix = scope.manifest_prefix();
        Ok(manifest
            .files
            .into_iter()
            .map(|mut entry| {
                if let Some(prefix) = &prefix {
                    entry.filename = format!("{prefix}{}", entry.filename);
                }
                entry
            })
            .collect())
    }

    fn upload_file(
        &self,
        scope: &FileScope,
        relative_path: &str,
        content: Vec<u8>,
    ) -> SyncResult<()> {
        let url = self.upload_uri(scope, relative_path)?;
        let request = HttpRequest::new(Method::Post, url)
            .with_body(content_type_for(relative_path), content);
        self.send(request)?;
        debug!(path = relative_path, "uploaded file");
        Ok(())
    }

    fn download_file(&self, url: &str, sink: &mut dyn Write) -> SyncResult<()> {
        let request = self.headers.apply(HttpRequest::get(url));
        let status = self
            .client
            .download(request, sink)
            .map_err(SyncError::transport_retryable)?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(SyncError::from_status(status, b""))
        }
    }
}

fn content_type_for(path: &str) -> &'static str {
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "js" => "application/javascript",
        "json" => "application/json",
        "css" => "text/css",
        "xml" => "text/xml",
        "txt" => "text/plain",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays canned responses and records the requests it saw.
    struct ScriptedClient {
        responses: Mutex<VecDeque<HttpResponse>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<HttpResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn urls(&self) -> Vec<String> {
            self.requests.lock().iter().map(|r| r.url.clone()).collect()
        }
    }

    impl HttpClient for ScriptedClient {
        fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String> {
            self.requests.lock().push(request);
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| "connection refused".to_string())
        }

        fn download(&self, request: HttpRequest, sink: &mut dyn Write) -> Result<u16, String> {
            let response = self.execute(request)?;
            if response.is_success() {
                sink.write_all(&response.body).map_err(|e| e.to_string())?;
            }
            Ok(response.status)
        }
    }

    fn table_json(id: &str, display: Option<&str>, data_etag: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "tableId": id,
            "displayName": display,
            "schemaETag": "s1",
            "propertiesETag": "p1",
            "dataETag": data_etag,
            "selfUri": format!("http://agg/odktables/default/tables/{id}"),
            "definitionUri": format!("http://agg/odktables/default/tables/{id}/ref/s1"),
            "dataUri": format!("http://agg/odktables/default/tables/{id}/ref/s1/rows"),
            "diffUri": format!("http://agg/odktables/default/tables/{id}/ref/s1/diff"),
            "propertiesUri": format!("http://agg/odktables/default/tables/{id}/ref/s1/properties"),
        })
    }

    fn ok(json: serde_json::Value) -> HttpResponse {
        HttpResponse::new(200, serde_json::to_vec(&json).unwrap())
    }

    fn synchronizer(responses: Vec<HttpResponse>) -> AggregateSynchronizer<ScriptedClient> {
        AggregateSynchronizer::new(
            SyncConfig::new("http://agg", "default"),
            ScriptedClient::new(responses),
        )
    }

    fn tag(data: Option<&str>) -> SyncTag {
        SyncTag::new(data.map(String::from), Some("p1".into()), Some("s1".into()))
    }

    #[test]
    fn list_sorts_nameless_tables_first() {
        let sync = synchronizer(vec![ok(serde_json::json!({
            "tables": [
                table_json("b", Some("Beta"), None),
                table_json("n", None, None),
                table_json("a", Some("Alpha"), None),
            ]
        }))]);
        let ids: Vec<String> = sync
            .list_tables()
            .unwrap()
            .into_iter()
            .map(|t| t.table_id)
            .collect();
        assert_eq!(ids, ["n", "a", "b"]);
        assert_eq!(sync.cache().len(), 3);
        assert_eq!(sync.client().urls(), ["http://agg/odktables/default/tables/"]);
    }

    #[test]
    fn unchanged_data_etag_skips_row_fetch() {
        let sync = synchronizer(vec![ok(table_json("t", None, Some("d1")))]);
        let incoming = sync.get_updates("t", &tag(Some("d1"))).unwrap();
        assert!(incoming.is_empty());
        assert_eq!(incoming.tag.data_etag.as_deref(), Some("d1"));
        assert_eq!(sync.client().urls().len(), 1);
    }

    #[test]
    fn both_null_data_etags_skip_row_fetch() {
        let sync = synchronizer(vec![ok(table_json("t", None, None))]);
        assert!(sync.get_updates("t", &tag(None)).unwrap().is_empty());
        assert_eq!(sync.client().urls().len(), 1);
    }

    #[test]
    fn first_sync_fetches_all_rows_then_diffs() {
        let rows = serde_json::json!({"rows": [{"rowId": "r1", "rowETag": "e1", "values": {"age": "5"}}]});
        let sync = synchronizer(vec![
            ok(table_json("t", None, Some("d2"))),
            ok(rows.clone()),
            ok(table_json("t", None, Some("d3"))),
            ok(rows),
        ]);

        let incoming = sync.get_updates("t", &tag(None)).unwrap();
        assert_eq!(incoming.rows.len(), 1);
        assert_eq!(incoming.tag.data_etag.as_deref(), Some("d2"));

        sync.get_updates("t", &tag(Some("d2"))).unwrap();
        let urls = sync.client().urls();
        assert_eq!(urls[1], "http://agg/odktables/default/tables/t/ref/s1/rows");
        assert_eq!(
            urls[3],
            "http://agg/odktables/default/tables/t/ref/s1/diff?data_etag=d2"
        );
    }

    #[test]
    fn row_write_advances_data_etag() {
        let sync = synchronizer(vec![
            ok(table_json("t", None, Some("d1"))),
            ok(serde_json::json!({
                "rowId": "r1",
                "rowETag": "e2",
                "dataETagAtModification": "d2",
                "values": {"age": "6"}
            })),
        ]);
        let row = Row::new("r1", [("age".to_string(), Some("6".to_string()))].into());
        let modification = sync
            .insert_or_update_row("t", &tag(Some("d1")), &row)
            .unwrap();
        assert_eq!(modification.row_etag.as_deref(), Some("e2"));
        assert_eq!(modification.tag.data_etag.as_deref(), Some("d2"));
        assert_eq!(
            sync.cache().get("t").unwrap().data_etag.as_deref(),
            Some("d2")
        );

        let put = &sync.client().requests.lock()[1];
        assert_eq!(put.method, Method::Put);
        assert_eq!(put.url, "http://agg/odktables/default/tables/t/ref/s1/rows/r1");
    }

    #[test]
    fn delete_reads_plain_text_etag() {
        let sync = synchronizer(vec![
            ok(table_json("t", None, Some("d1"))),
            HttpResponse::new(200, "d9\n"),
        ]);
        let mut row = Row::new("r1", Default::default());
        row.row_etag = Some("e1".into());
        let tag = sync.delete_row("t", &tag(Some("d1")), &row).unwrap();
        assert_eq!(tag.data_etag.as_deref(), Some("d9"));
        assert!(sync.client().urls()[1].ends_with("/rows/r1?row_etag=e1"));
    }

    #[test]
    fn properties_push_combines_tags() {
        let sync = synchronizer(vec![ok(serde_json::json!({
            "tableId": "t",
            "schemaETag": "s1",
            "propertiesETag": "p2",
            "kvsEntries": []
        }))]);
        let tag = sync
            .set_table_properties("http://agg/props", &tag(Some("d1")), "t", &[])
            .unwrap();
        assert_eq!(
            tag,
            SyncTag::new(Some("d1".into()), Some("p2".into()), Some("s1".into()))
        );
    }

    #[test]
    fn missing_table_is_none() {
        let sync = synchronizer(vec![HttpResponse::new(404, "no such table")]);
        assert!(sync.get_table_or_none("gone").unwrap().is_none());
    }

    #[test]
    fn transport_failure_is_retryable() {
        let sync = synchronizer(Vec::new());
        let err = sync.list_tables().unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn access_denied_is_typed() {
        let sync = synchronizer(vec![HttpResponse::new(403, "forbidden")]);
        assert!(matches!(
            sync.list_tables(),
            Err(SyncError::AccessDenied(_))
        ));
    }

    #[test]
    fn scope_urls() {
        let sync = synchronizer(Vec::new());
        assert_eq!(
            sync.manifest_uri(&FileScope::App),
            "http://agg/odktables/default/manifest/2/"
        );
        assert_eq!(
            sync.manifest_uri(&FileScope::Table("t".into())),
            "http://agg/odktables/default/manifest/2/t"
        );
        assert_eq!(
            sync.manifest_uri(&FileScope::Instances("t".into())),
            "http://agg/odktables/default/tables/t/attachments/manifest/"
        );
        assert_eq!(
            sync.upload_uri(&FileScope::App, "assets/my file.html").unwrap(),
            "http://agg/odktables/default/files/2/assets/my%20file.html"
        );
        assert_eq!(
            sync.upload_uri(
                &FileScope::Instances("t".into()),
                "tables/t/instances/r1/a.jpg"
            )
            .unwrap(),
            "http://agg/odktables/default/tables/t/attachments/file/r1/a.jpg"
        );
        assert!(sync
            .upload_uri(&FileScope::Instances("t".into()), "assets/a.jpg")
            .is_err());
    }

    #[test]
    fn instance_manifest_names_are_prefixed() {
        let sync = synchronizer(vec![ok(serde_json::json!({
            "files": [{
                "filename": "r1/a.jpg",
                "md5hash": "md5:00",
                "downloadUrl": "http://agg/x"
            }]
        }))]);
        let entries = sync.manifest(&FileScope::Instances("t".into())).unwrap();
        assert_eq!(entries[0].filename, "tables/t/instances/r1/a.jpg");
    }

    #[test]
    fn delete_table_evicts_cached_tags() {
        let sync = synchronizer(vec![
            ok(serde_json::json!({
                "tables": [table_json("t", None, Some("d1")), table_json("u", None, None)]
            })),
            HttpResponse::new(200, ""),
        ]);
        sync.list_tables().unwrap();
        assert!(sync.cache().get("t").is_some());

        sync.delete_table("t").unwrap();
        let requests = sync.client().requests.lock().clone();
        assert_eq!(requests[1].method, Method::Delete);
        assert_eq!(requests[1].url, "http://agg/odktables/default/tables/t");
        assert!(sync.cache().get("t").is_none());
        assert!(sync.cache().get("u").is_some());
    }

    #[test]
    fn failed_delete_keeps_cached_tags() {
        let sync = synchronizer(vec![
            ok(table_json("t", None, Some("d1"))),
            HttpResponse::new(500, "boom"),
        ]);
        sync.get_table("t").unwrap();
        assert!(sync.delete_table("t").is_err());
        assert!(sync.cache().get("t").is_some());
    }
}
