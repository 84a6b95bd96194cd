//! # tablesync protocol
//!
//! Wire types and pure state rules shared by the tablesync store and engine.
//!
//! This crate provides:
//! - `SyncTag`, the (schema, properties, data) ETag triple of a table
//! - `SyncState`, `ConflictType` and `SavepointType` row metadata codes
//! - Row lifecycle transitions for local edits and schema changes
//! - JSON wire entities for tables, rows, properties and file manifests
//! - The manifest differ and file scope filters
//! - URI joining and path escaping helpers
//! - Response status classification
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod kv;
mod manifest;
mod state;
mod status;
mod tag;
mod uri;

pub use entity::{
    Column, FilterScope, KeyValueStoreEntry, PropertiesResource, Row, RowResource,
    RowResourceList, TableDefinition, TableDefinitionResource, TableProperties, TableResource,
    TableResourceList,
};
pub use error::{ProtocolError, ProtocolResult};
pub use kv::{KvType, KvValue};
pub use manifest::{
    files_to_upload, is_safe_relative_path, FileManifest, FileManifestEntry, FileScope,
    APP_LEVEL_EXCLUDED_DIRS, INSTANCES_FOLDER,
};
pub use state::{
    ConflictType, DeleteAction, Reclassification, SavepointType, SyncState,
};
pub use status::ResponseClass;
pub use tag::SyncTag;
pub use uri::{escape_path, normalize_uri, with_query};

/// Header carrying the client protocol version on every request.
pub const VERSION_HEADER: &str = "X-OpenDataKit-Version";

/// Protocol version sent when the configuration does not override it.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2.0";
