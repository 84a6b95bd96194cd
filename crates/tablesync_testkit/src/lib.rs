//! # tablesync testkit
//!
//! Test utilities for tablesync.
//!
//! This crate provides:
//! - An in-memory Aggregate server that plugs in as the HTTP client
//! - Fixtures pairing a temporary app folder and database with that server
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tablesync_testkit::prelude::*;
//!
//! #[test]
//! fn pulls_server_rows() {
//!     let app = TestApp::new();
//!     app.server.create_table("people", None, &people_columns());
//!     app.processor().synchronize().unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fake;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fake::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fake::*;
pub use fixtures::*;
pub use generators::*;
