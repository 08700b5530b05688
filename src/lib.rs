//! postdrop - Drop-folder template ingestion
//!
//! Watches a directory for HTML-like template files, turns each one into a
//! post record with categories and tags, stores it in SQLite, and archives
//! the file by outcome.
//!
//! # Architecture
//!
//! Every file is handled independently:
//! - The watcher polls the directory and dispatches each match to a pool
//! - The processor parses, persists in one transaction, then archives
//! - Failures end that file's run only and are reported through tracing
//!
//! # Modules
//!
//! - `ingest`: Watcher, dispatch pool, parser, processor, archiver
//! - `store`: Transactional post store (SQLite)
//! - `domain`: Data structures (ContentRecord, Association)
//! - `config`: YAML config with environment overrides
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Watch ~/.postdrop/templates
//! postdrop watch
//!
//! # Ingest one file
//! postdrop ingest post.tpl
//!
//! # List posts tagged "rust"
//! postdrop list --tag rust
//! ```

pub mod cli;
pub mod config;
pub mod domain;
pub mod ingest;
pub mod store;

// Re-export main types at crate root for convenience
pub use config::AppConfig;
pub use domain::{Association, AssociationKind, ContentRecord};
pub use ingest::{
    parse_template, Archiver, DirectoryWatcher, DispatchPool, ParseError, ProcessOutcome,
    Processor, WatchTarget,
};
pub use store::{ContentStore, RecordQuery, SqliteStore, StoreError};
