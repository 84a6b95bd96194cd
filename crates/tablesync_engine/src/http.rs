//! HTTP transport for the synchronizer.
//!
//! The actual HTTP client is abstracted via a trait so the synchronizer can be
//! driven by reqwest in production and by an in-memory server in tests.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use std::io::Write;
use std::time::Duration;
use tablesync_protocol::VERSION_HEADER;

/// Quality-weighted media types accepted from the server.
pub const ACCEPT_MEDIA_TYPES: &str =
    "application/json;q=1.0, text/xml;q=0.8, application/*+xml;q=0.6, text/plain;q=0.4";

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET.
    Get,
    /// PUT.
    Put,
    /// POST.
    Post,
    /// DELETE.
    Delete,
}

impl Method {
    /// The method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Creates a request with no headers and no body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Creates a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Creates a DELETE request.
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets a raw body with its content type.
    pub fn with_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self.with_header("Content-Type", content_type)
    }

    /// Sets a JSON body.
    pub fn with_json<T: serde::Serialize>(self, value: &T) -> SyncResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| SyncError::Protocol(format!("failed to encode request: {e}")))?;
        Ok(self.with_body("application/json; charset=utf-8", body))
    }

    /// Returns the first header with this name, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A fully read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Response body, already decompressed.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with no headers.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Returns true for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns the first header with this name, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Fails with the status-specific error unless the status is 2xx.
    pub fn error_for_status(self) -> SyncResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SyncError::from_status(self.status, &self.body))
        }
    }

    /// Decodes a JSON body.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> SyncResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| SyncError::Protocol(format!("failed to decode response: {e}")))
    }

    /// The body as trimmed text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. Errors are
/// transport failures only; every status code, success or not, comes back as
/// a response.
pub trait HttpClient: Send + Sync {
    /// Sends a request and reads the whole response.
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String>;

    /// Sends a request and streams a 2xx body into `sink`.
    ///
    /// A non-2xx body is drained and discarded. Returns the status code.
    fn download(&self, request: HttpRequest, sink: &mut dyn Write) -> Result<u16, String>;
}

/// Builds the headers every request to the server carries.
#[derive(Debug, Clone)]
pub struct RequestHeaders {
    protocol_version: String,
    access_token: Option<String>,
    server: Option<(String, Option<u16>)>,
}

impl RequestHeaders {
    /// Captures the header inputs of a configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            protocol_version: config.protocol_version.clone(),
            access_token: config.access_token.clone(),
            server: host_and_port(&config.server_url),
        }
    }

    /// Adds the standard headers to a request.
    ///
    /// The bearer token is only attached when the request targets the
    /// configured server's host and port.
    pub fn apply(&self, mut request: HttpRequest) -> HttpRequest {
        request.headers.extend([
            ("Accept".to_string(), ACCEPT_MEDIA_TYPES.to_string()),
            ("Accept-Charset".to_string(), "UTF-8".to_string()),
            ("Accept-Encoding".to_string(), "gzip".to_string()),
            (VERSION_HEADER.to_string(), self.protocol_version.clone()),
            ("Date".to_string(), rfc1123_now()),
        ]);
        if let Some(token) = &self.access_token {
            if self.server.is_some() && host_and_port(&request.url) == self.server {
                request
                    .headers
                    .push(("Authorization".to_string(), format!("Bearer {token}")));
            }
        }
        request
    }
}

fn host_and_port(url: &str) -> Option<(String, Option<u16>)> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some((host, parsed.port_or_known_default()))
}

fn rfc1123_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Production client backed by a blocking reqwest client.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    /// Creates a client with the given connect and read timeout.
    ///
    /// Gzip responses are decompressed transparently.
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        Ok(Self { client })
    }

    fn send(&self, request: HttpRequest) -> Result<reqwest::blocking::Response, String> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            // reqwest negotiates and decodes gzip itself
            if name.eq_ignore_ascii_case("Accept-Encoding") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        builder.send().map_err(|e| e.to_string())
    }
}

impl HttpClient for ReqwestClient {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let response = self.send(request)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = response.bytes().map_err(|e| e.to_string())?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn download(&self, request: HttpRequest, sink: &mut dyn Write) -> Result<u16, String> {
        let mut response = self.send(request)?;
        let status = response.status().as_u16();
        if response.status().is_success() {
            std::io::copy(&mut response, sink).map_err(|e| e.to_string())?;
        } else {
            std::io::copy(&mut response, &mut std::io::sink()).map_err(|e| e.to_string())?;
        }
        Ok(status)
    }
}
