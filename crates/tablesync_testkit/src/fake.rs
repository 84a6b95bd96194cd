//! An in-memory Aggregate server.
//!
//! [`FakeAggregate`] implements [`HttpClient`] by routing requests to shared
//! in-memory state, so a real [`tablesync_engine::AggregateSynchronizer`] can
//! be driven end to end. Clones share the same server, which lets a test keep
//! a handle while the synchronizer owns another, or point two devices at one
//! server.
//!
//! Data ETags are `d{n}` where `n` counts row writes on the table, so the
//! diff endpoint can answer from per-row sequence numbers.

use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use tablesync_engine::{HttpClient, HttpRequest, HttpResponse, Method};
use tablesync_protocol::{
    escape_path, Column, FileManifest, FileManifestEntry, FileScope, KeyValueStoreEntry,
    PropertiesResource, Row, RowResource, RowResourceList, TableDefinition,
    TableDefinitionResource, TableProperties, TableResource, TableResourceList,
};

/// Base URL the fake answers on.
pub const FAKE_SERVER_URL: &str = "http://aggregate.test";

/// App name the fake serves.
pub const FAKE_APP: &str = "default";

/// Client version used in manifest and file paths.
pub const FAKE_CLIENT_VERSION: &str = "2";

struct RemoteRow {
    row: Row,
    seq: u64,
}

struct RemoteTable {
    display_name: Option<String>,
    schema_etag: String,
    columns: Vec<Column>,
    properties_etag: String,
    kvs: Vec<KeyValueStoreEntry>,
    seq: u64,
    rows: BTreeMap<String, RemoteRow>,
    attachments: BTreeMap<String, Vec<u8>>,
}

impl RemoteTable {
    fn data_etag(&self) -> String {
        format!("d{}", self.seq)
    }
}

struct Failure {
    fragment: String,
    remaining: usize,
    status: u16,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, RemoteTable>,
    files: BTreeMap<String, Vec<u8>>,
    counter: u64,
    failures: Vec<Failure>,
    interrupt_downloads: usize,
    required_token: Option<String>,
    requests: Vec<HttpRequest>,
    downloads: usize,
}

impl State {
    fn next_etag(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}{}", self.counter)
    }
}

/// Shared handle to an in-memory Aggregate server.
#[derive(Clone, Default)]
pub struct FakeAggregate {
    state: Arc<Mutex<State>>,
}

fn root() -> String {
    format!("{FAKE_SERVER_URL}/odktables/{FAKE_APP}/")
}

fn table_uri(table_id: &str) -> String {
    format!("{}tables/{}", root(), escape_path(table_id))
}

fn definition_uri(table_id: &str, schema_etag: &str) -> String {
    format!("{}/ref/{}", table_uri(table_id), escape_path(schema_etag))
}

fn md5_of(content: &[u8]) -> String {
    format!("md5:{:x}", Md5::digest(content))
}

fn json<T: Serialize>(status: u16, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = HttpResponse::new(status, body);
            response
                .headers
                .push(("Content-Type".into(), "application/json".into()));
            response
        }
        Err(e) => HttpResponse::new(500, e.to_string()),
    }
}

fn not_found(what: &str) -> HttpResponse {
    HttpResponse::new(404, format!("{what} not found"))
}

fn resource(table_id: &str, table: &RemoteTable) -> TableResource {
    let definition = definition_uri(table_id, &table.schema_etag);
    TableResource {
        table_id: table_id.to_string(),
        display_name: table.display_name.clone(),
        schema_etag: Some(table.schema_etag.clone()),
        properties_etag: Some(table.properties_etag.clone()),
        data_etag: Some(table.data_etag()),
        self_uri: table_uri(table_id),
        data_uri: format!("{definition}/rows"),
        diff_uri: format!("{definition}/diff"),
        properties_uri: format!("{definition}/properties"),
        definition_uri: definition,
    }
}

fn properties(table_id: &str, table: &RemoteTable) -> PropertiesResource {
    PropertiesResource {
        properties: TableProperties {
            table_id: table_id.to_string(),
            schema_etag: Some(table.schema_etag.clone()),
            properties_etag: Some(table.properties_etag.clone()),
            kvs_entries: table.kvs.clone(),
        },
        self_uri: Some(format!(
            "{}/properties",
            definition_uri(table_id, &table.schema_etag)
        )),
        table_uri: Some(table_uri(table_id)),
    }
}

fn row_resource(table_id: &str, table: &RemoteTable, row: &Row) -> RowResource {
    RowResource {
        row: row.clone(),
        self_uri: Some(format!(
            "{}/rows/{}",
            definition_uri(table_id, &table.schema_etag),
            escape_path(&row.row_id)
        )),
        data_etag_at_modification: Some(table.data_etag()),
    }
}

fn manifest_entry(filename: &str, content: &[u8], download_url: String) -> FileManifestEntry {
    FileManifestEntry {
        filename: filename.to_string(),
        content_length: Some(content.len() as u64),
        content_type: None,
        md5hash: md5_of(content),
        download_url,
    }
}

fn split_url(url: &str) -> Option<(Vec<String>, BTreeMap<String, String>)> {
    let rest = url.strip_prefix(&root())?;
    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
    let segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).ok())
        .collect::<Option<Vec<_>>>()?;
    let query = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter_map(|(k, v)| Some((k.to_string(), urlencoding::decode(v).ok()?.into_owned())))
        .collect();
    Some((segments, query))
}

impl FakeAggregate {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table and returns its resource.
    pub fn create_table(
        &self,
        table_id: &str,
        display_name: Option<&str>,
        columns: &[Column],
    ) -> TableResource {
        let mut state = self.state.lock();
        let schema_etag = state.next_etag("s");
        let properties_etag = state.next_etag("p");
        let table = RemoteTable {
            display_name: display_name.map(str::to_string),
            schema_etag,
            columns: columns.to_vec(),
            properties_etag,
            kvs: Vec::new(),
            seq: 1,
            rows: BTreeMap::new(),
            attachments: BTreeMap::new(),
        };
        let created = resource(table_id, &table);
        state.tables.insert(table_id.to_string(), table);
        created
    }

    /// The current resource of a table.
    pub fn table(&self, table_id: &str) -> Option<TableResource> {
        let state = self.state.lock();
        state.tables.get(table_id).map(|t| resource(table_id, t))
    }

    /// Columns of a table.
    pub fn columns(&self, table_id: &str) -> Vec<Column> {
        let state = self.state.lock();
        state
            .tables
            .get(table_id)
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }

    /// Writes a row as another client would, returning its new row ETag.
    pub fn upsert_row(
        &self,
        table_id: &str,
        row_id: &str,
        values: BTreeMap<String, Option<String>>,
    ) -> String {
        let mut state = self.state.lock();
        let etag = state.next_etag("r");
        if let Some(table) = state.tables.get_mut(table_id) {
            table.seq += 1;
            let mut row = Row::new(row_id, values);
            row.row_etag = Some(etag.clone());
            row.savepoint_type = Some("COMPLETE".to_string());
            let seq = table.seq;
            table.rows.insert(row_id.to_string(), RemoteRow { row, seq });
        }
        etag
    }

    /// Deletes a row as another client would.
    pub fn delete_row(&self, table_id: &str, row_id: &str) {
        let mut state = self.state.lock();
        let etag = state.next_etag("r");
        if let Some(table) = state.tables.get_mut(table_id) {
            table.seq += 1;
            let seq = table.seq;
            if let Some(remote) = table.rows.get_mut(row_id) {
                remote.row.deleted = true;
                remote.row.row_etag = Some(etag);
                remote.seq = seq;
            }
        }
    }

    /// The server copy of a row, deleted ones included.
    pub fn row(&self, table_id: &str, row_id: &str) -> Option<Row> {
        let state = self.state.lock();
        Some(state.tables.get(table_id)?.rows.get(row_id)?.row.clone())
    }

    /// Live rows of a table.
    pub fn live_rows(&self, table_id: &str) -> Vec<Row> {
        let state = self.state.lock();
        state
            .tables
            .get(table_id)
            .map(|t| {
                t.rows
                    .values()
                    .filter(|r| !r.row.deleted)
                    .map(|r| r.row.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replaces a table's schema, dropping its rows, and returns the new schema ETag.
    pub fn change_schema(&self, table_id: &str, columns: &[Column]) -> Option<String> {
        let mut state = self.state.lock();
        let schema_etag = state.next_etag("s");
        let table = state.tables.get_mut(table_id)?;
        table.schema_etag = schema_etag.clone();
        table.columns = columns.to_vec();
        table.rows.clear();
        table.seq += 1;
        Some(schema_etag)
    }

    /// Replaces a table's properties and returns the new properties ETag.
    pub fn set_properties(&self, table_id: &str, entries: Vec<KeyValueStoreEntry>) -> Option<String> {
        let mut state = self.state.lock();
        let etag = state.next_etag("p");
        let table = state.tables.get_mut(table_id)?;
        table.kvs = entries;
        table.properties_etag = etag.clone();
        Some(etag)
    }

    /// A table's properties.
    pub fn properties(&self, table_id: &str) -> Vec<KeyValueStoreEntry> {
        let state = self.state.lock();
        state
            .tables
            .get(table_id)
            .map(|t| t.kvs.clone())
            .unwrap_or_default()
    }

    /// Stores an app-level or table-level file under its app-relative path.
    pub fn put_file(&self, relative_path: &str, content: &[u8]) {
        let mut state = self.state.lock();
        state
            .files
            .insert(relative_path.to_string(), content.to_vec());
    }

    /// An app-level or table-level file.
    pub fn file(&self, relative_path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(relative_path).cloned()
    }

    /// Stores a row attachment under its path inside the table's instances folder.
    pub fn put_attachment(&self, table_id: &str, partial_path: &str, content: &[u8]) {
        let mut state = self.state.lock();
        if let Some(table) = state.tables.get_mut(table_id) {
            table
                .attachments
                .insert(partial_path.to_string(), content.to_vec());
        }
    }

    /// A row attachment.
    pub fn attachment(&self, table_id: &str, partial_path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state.tables.get(table_id)?.attachments.get(partial_path).cloned()
    }

    /// Answers the next `count` requests with `status` instead of routing them.
    pub fn fail_next_requests(&self, count: usize, status: u16) {
        self.fail_requests_to("", count, status);
    }

    /// Answers the next `count` requests whose URL contains `fragment` with `status`.
    pub fn fail_requests_to(&self, fragment: &str, count: usize, status: u16) {
        self.state.lock().failures.push(Failure {
            fragment: fragment.to_string(),
            remaining: count,
            status,
        });
    }

    /// Breaks the next `count` downloads halfway through the body.
    pub fn interrupt_next_downloads(&self, count: usize) {
        self.state.lock().interrupt_downloads = count;
    }

    /// Rejects requests without this bearer token.
    pub fn require_token(&self, token: &str) {
        self.state.lock().required_token = Some(token.to_string());
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().requests.clone()
    }

    /// Forgets the recorded requests.
    pub fn clear_requests(&self) {
        let mut state = self.state.lock();
        state.requests.clear();
        state.downloads = 0;
    }

    /// Number of download calls received.
    pub fn download_count(&self) -> usize {
        self.state.lock().downloads
    }

    fn admit(state: &mut State, request: &HttpRequest) -> Option<HttpResponse> {
        state.requests.push(request.clone());
        if let Some(failure) = state
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && request.url.contains(&f.fragment))
        {
            failure.remaining -= 1;
            return Some(HttpResponse::new(failure.status, "injected failure"));
        }
        if let Some(token) = &state.required_token {
            let expected = format!("Bearer {token}");
            if request.header("Authorization") != Some(expected.as_str()) {
                return Some(HttpResponse::new(401, "authentication required"));
            }
        }
        None
    }
}

fn route(state: &mut State, request: &HttpRequest) -> HttpResponse {
    let Some((segments, query)) = split_url(&request.url) else {
        return not_found(&request.url);
    };
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    let body = request.body.as_deref().unwrap_or_default();

    match (request.method, segments.as_slice()) {
        (Method::Get, ["tables"]) => {
            let tables = state
                .tables
                .iter()
                .map(|(id, t)| resource(id, t))
                .collect();
            json(200, &TableResourceList { tables })
        }
        (Method::Get, ["tables", id]) => match state.tables.get(*id) {
            Some(table) => json(200, &resource(id, table)),
            None => not_found(id),
        },
        (Method::Put, ["tables", id]) => create_table(state, id, body),
        (Method::Delete, ["tables", id]) => match state.tables.remove(*id) {
            Some(_) => HttpResponse::new(200, ""),
            None => not_found(id),
        },
        (Method::Get, ["tables", id, "ref", _schema]) => match state.tables.get(*id) {
            Some(table) => json(
                200,
                &TableDefinitionResource {
                    definition: TableDefinition {
                        table_id: id.to_string(),
                        schema_etag: Some(table.schema_etag.clone()),
                        columns: table.columns.clone(),
                    },
                    self_uri: Some(definition_uri(id, &table.schema_etag)),
                    table_uri: Some(table_uri(id)),
                },
            ),
            None => not_found(id),
        },
        (Method::Get, ["tables", id, "ref", _schema, "rows"]) => match state.tables.get(*id) {
            Some(table) => {
                let rows = table
                    .rows
                    .values()
                    .filter(|r| !r.row.deleted)
                    .map(|r| row_resource(id, table, &r.row))
                    .collect();
                json(200, &RowResourceList { rows })
            }
            None => not_found(id),
        },
        (Method::Get, ["tables", id, "ref", _schema, "diff"]) => match state.tables.get(*id) {
            Some(table) => {
                let since = query
                    .get("data_etag")
                    .and_then(|e| e.strip_prefix('d'))
                    .and_then(|n| n.parse::<u64>().ok())
                    .unwrap_or(0);
                let mut changed: Vec<&RemoteRow> =
                    table.rows.values().filter(|r| r.seq > since).collect();
                changed.sort_by_key(|r| r.seq);
                let rows = changed
                    .into_iter()
                    .map(|r| row_resource(id, table, &r.row))
                    .collect();
                json(200, &RowResourceList { rows })
            }
            None => not_found(id),
        },
        (Method::Put, ["tables", id, "ref", _schema, "rows", row_id]) => {
            put_row(state, id, row_id, body)
        }
        (Method::Delete, ["tables", id, "ref", _schema, "rows", row_id]) => {
            delete_row(state, id, row_id, query.get("row_etag").map(String::as_str))
        }
        (Method::Get, ["tables", id, "ref", _schema, "properties"]) => {
            match state.tables.get(*id) {
                Some(table) => json(200, &properties(id, table)),
                None => not_found(id),
            }
        }
        (Method::Put, ["tables", id, "ref", _schema, "properties"]) => {
            put_properties(state, id, body)
        }
        (Method::Get, ["manifest", _version]) => file_manifest(state, &FileScope::App),
        (Method::Get, ["manifest", _version, id]) => {
            file_manifest(state, &FileScope::Table(id.to_string()))
        }
        (Method::Get, ["tables", id, "attachments", "manifest"]) => match state.tables.get(*id) {
            Some(table) => {
                let files = table
                    .attachments
                    .iter()
                    .map(|(partial, content)| {
                        manifest_entry(
                            partial,
                            content,
                            format!("{}/attachments/file/{}", table_uri(id), escape_path(partial)),
                        )
                    })
                    .collect();
                json(200, &FileManifest { files })
            }
            None => not_found(id),
        },
        (Method::Post, ["files", _version, path @ ..]) => {
            state.files.insert(path.join("/"), body.to_vec());
            HttpResponse::new(201, "")
        }
        (Method::Get, ["files", _version, path @ ..]) => match state.files.get(&path.join("/")) {
            Some(content) => HttpResponse::new(200, content.clone()),
            None => not_found(&path.join("/")),
        },
        (Method::Post, ["tables", id, "attachments", "file", path @ ..]) => {
            match state.tables.get_mut(*id) {
                Some(table) => {
                    table.attachments.insert(path.join("/"), body.to_vec());
                    HttpResponse::new(201, "")
                }
                None => not_found(id),
            }
        }
        (Method::Get, ["tables", id, "attachments", "file", path @ ..]) => {
            match state
                .tables
                .get(*id)
                .and_then(|t| t.attachments.get(&path.join("/")))
            {
                Some(content) => HttpResponse::new(200, content.clone()),
                None => not_found(&path.join("/")),
            }
        }
        _ => HttpResponse::new(405, "unsupported request"),
    }
}

fn create_table(state: &mut State, table_id: &str, body: &[u8]) -> HttpResponse {
    if let Some(table) = state.tables.get(table_id) {
        return json(200, &resource(table_id, table));
    }
    let definition: TableDefinition = match serde_json::from_slice(body) {
        Ok(definition) => definition,
        Err(e) => return HttpResponse::new(400, e.to_string()),
    };
    let schema_etag = state.next_etag("s");
    let properties_etag = state.next_etag("p");
    let table = RemoteTable {
        display_name: None,
        schema_etag,
        columns: definition.columns,
        properties_etag,
        kvs: Vec::new(),
        seq: 1,
        rows: BTreeMap::new(),
        attachments: BTreeMap::new(),
    };
    let created = resource(table_id, &table);
    state.tables.insert(table_id.to_string(), table);
    json(201, &created)
}

fn put_row(state: &mut State, table_id: &str, row_id: &str, body: &[u8]) -> HttpResponse {
    let incoming: Row = match serde_json::from_slice(body) {
        Ok(row) => row,
        Err(e) => return HttpResponse::new(400, e.to_string()),
    };
    let etag = state.next_etag("r");
    let Some(table) = state.tables.get_mut(table_id) else {
        return not_found(table_id);
    };
    if let Some(existing) = table.rows.get(row_id) {
        if existing.row.row_etag != incoming.row_etag {
            return HttpResponse::new(409, "row ETag does not match");
        }
    }

    table.seq += 1;
    let mut row = incoming;
    row.row_id = row_id.to_string();
    row.row_etag = Some(etag);
    row.deleted = false;
    let seq = table.seq;
    table.rows.insert(
        row_id.to_string(),
        RemoteRow {
            row: row.clone(),
            seq,
        },
    );
    json(200, &row_resource(table_id, table, &row))
}

fn delete_row(
    state: &mut State,
    table_id: &str,
    row_id: &str,
    row_etag: Option<&str>,
) -> HttpResponse {
    let etag = state.next_etag("r");
    let Some(table) = state.tables.get_mut(table_id) else {
        return not_found(table_id);
    };
    if let Some(remote) = table.rows.get(row_id) {
        if remote.row.row_etag.as_deref() != row_etag {
            return HttpResponse::new(409, "row ETag does not match");
        }
    }
    table.seq += 1;
    let seq = table.seq;
    if let Some(remote) = table.rows.get_mut(row_id) {
        remote.row.deleted = true;
        remote.row.row_etag = Some(etag);
        remote.seq = seq;
    }
    HttpResponse::new(200, table.data_etag())
}

fn put_properties(state: &mut State, table_id: &str, body: &[u8]) -> HttpResponse {
    let incoming: TableProperties = match serde_json::from_slice(body) {
        Ok(properties) => properties,
        Err(e) => return HttpResponse::new(400, e.to_string()),
    };
    let etag = state.next_etag("p");
    let Some(table) = state.tables.get_mut(table_id) else {
        return not_found(table_id);
    };
    if incoming.properties_etag.as_deref() != Some(table.properties_etag.as_str()) {
        return HttpResponse::new(409, "properties ETag does not match");
    }
    table.kvs = incoming.kvs_entries;
    table.properties_etag = etag;
    json(200, &properties(table_id, table))
}

fn file_manifest(state: &State, scope: &FileScope) -> HttpResponse {
    let files = state
        .files
        .iter()
        .filter(|(path, _)| scope.accepts(path))
        .map(|(path, content)| {
            manifest_entry(
                path,
                content,
                format!("{}files/{FAKE_CLIENT_VERSION}/{}", root(), escape_path(path)),
            )
        })
        .collect();
    json(200, &FileManifest { files })
}

impl HttpClient for FakeAggregate {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let mut state = self.state.lock();
        if let Some(response) = Self::admit(&mut state, &request) {
            return Ok(response);
        }
        Ok(route(&mut state, &request))
    }

    fn download(&self, request: HttpRequest, sink: &mut dyn Write) -> Result<u16, String> {
        let mut state = self.state.lock();
        state.downloads += 1;
        if let Some(response) = Self::admit(&mut state, &request) {
            return Ok(response.status);
        }
        let response = route(&mut state, &request);
        if !response.is_success() {
            return Ok(response.status);
        }
        if state.interrupt_downloads > 0 {
            state.interrupt_downloads -= 1;
            let half = response.body.len() / 2;
            sink.write_all(&response.body[..half])
                .map_err(|e| e.to_string())?;
            return Err("connection reset by peer".to_string());
        }
        sink.write_all(&response.body).map_err(|e| e.to_string())?;
        Ok(response.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> HttpRequest {
        HttpRequest::get(url)
    }

    #[test]
    fn diff_returns_rows_after_etag() {
        let server = FakeAggregate::new();
        let table = server.create_table("people", None, &[Column::new("name", "string")]);
        server.upsert_row("people", "a", BTreeMap::new());
        let after_a = server.table("people").unwrap().data_etag.unwrap();
        server.upsert_row("people", "b", BTreeMap::new());

        let url = format!("{}?data_etag={after_a}", table.diff_uri);
        let response = server.execute(get(&url)).unwrap();
        let list: RowResourceList = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(list.rows.len(), 1);
        assert_eq!(list.rows[0].row.row_id, "b");
    }

    #[test]
    fn stale_row_etag_is_refused() {
        let server = FakeAggregate::new();
        let table = server.create_table("people", None, &[]);
        server.upsert_row("people", "a", BTreeMap::new());

        let mut row = Row::new("a", BTreeMap::new());
        row.row_etag = Some("stale".into());
        let request = HttpRequest::new(Method::Put, format!("{}/a", table.data_uri))
            .with_json(&row)
            .unwrap();
        assert_eq!(server.execute(request).unwrap().status, 409);
    }

    #[test]
    fn injected_failures_come_first() {
        let server = FakeAggregate::new();
        server.fail_next_requests(1, 503);
        let url = format!("{}tables/", root());
        assert_eq!(server.execute(get(&url)).unwrap().status, 503);
        assert_eq!(server.execute(get(&url)).unwrap().status, 200);
        assert_eq!(server.requests().len(), 2);
    }

    #[test]
    fn interrupted_download_writes_partial_body() {
        let server = FakeAggregate::new();
        server.put_file("config/app.json", b"0123456789");
        server.interrupt_next_downloads(1);
        let url = format!("{}files/{FAKE_CLIENT_VERSION}/config/app.json", root());

        let mut sink = Vec::new();
        assert!(server.download(get(&url), &mut sink).is_err());
        assert_eq!(sink, b"01234");

        let mut sink = Vec::new();
        assert_eq!(server.download(get(&url), &mut sink).unwrap(), 200);
        assert_eq!(sink, b"0123456789");
    }

    #[test]
    fn missing_token_is_rejected() {
        let server = FakeAggregate::new();
        server.require_token("secret");
        let url = format!("{}tables/", root());
        assert_eq!(server.execute(get(&url)).unwrap().status, 401);
        let authed = get(&url).with_header("Authorization", "Bearer secret");
        assert_eq!(server.execute(authed).unwrap().status, 200);
    }
}
