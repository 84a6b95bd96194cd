//! # tablesync engine
//!
//! Client side of tablesync: talks to an Aggregate-style server and keeps the
//! local store in step with it.
//!
//! This crate provides:
//! - The `Synchronizer` contract and its HTTP implementation
//! - A resource cache with ETag-driven invalidation
//! - Row reconciliation (pull classification and push selection)
//! - Manifest-driven file sync with atomic downloads
//! - The sync processor (schema, properties, pull, push, files)
//! - Conflict resolution
//! - Retry with exponential backoff
//!
//! ## Architecture
//!
//! Each table pass runs in a fixed order:
//! 1. Make sure the table exists on both sides and the schemas agree
//! 2. Pull or push table properties
//! 3. Pull rows changed since the stored data ETag
//! 4. Push local inserts, updates and deletes
//! 5. Sync table files, then row attachments
//!
//! ## Key Invariants
//!
//! - Pull always happens before push
//! - Every local step commits in its own transaction
//! - A table's data ETag only advances after its rows were applied
//! - A partially downloaded file never replaces a complete one
//! - A failing table never stops the others

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod aggregate;
mod cache;
mod config;
mod error;
mod files;
mod http;
mod processor;
mod reconcile;
mod resolver;
mod synchronizer;

pub use aggregate::AggregateSynchronizer;
pub use cache::{CacheDecision, EvictOnMismatch, InvalidationPolicy, ResourceCache};
pub use config::{RetryConfig, SyncConfig};
pub use error::{RetryClass, SyncError, SyncResult};
pub use files::{file_md5, write_atomically, FileSyncReport, FileSynchronizer};
pub use http::{
    HttpClient, HttpRequest, HttpResponse, Method, RequestHeaders, ReqwestClient,
    ACCEPT_MEDIA_TYPES,
};
pub use processor::{
    EngineState, SyncOutcome, SyncProcessor, SyncStats, TableCounters, TableResult, TableStatus,
};
pub use reconcile::{plan_pull, rows_to_push, server_row, wire_row, PullAction};
pub use resolver::{ConflictResolver, Resolution, ResolvedAs};
pub use synchronizer::{IncomingRows, RowModification, Synchronizer};
