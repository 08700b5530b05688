//! Template ingestion pipeline.
//!
//! Files dropped into the watched directory flow through:
//!
//! 1. **Watcher**: polls the directory for files with the template extension
//! 2. **Pool**: runs one bounded task per discovered file
//! 3. **Processor**: parses the template and stores it as a post
//! 4. **Archiver**: moves the file to the ok or error directory
//!
//! # Architecture
//!
//! ```text
//! templates/ → Watcher → Pool → Processor → Store
//!                                   ↓
//!                         templates/ok | templates/error
//! ```

pub mod archive;
pub mod parser;
pub mod pool;
pub mod processor;
pub mod watcher;

// Re-export key types
pub use archive::{ArchiveError, ArchiveOutcome, Archiver};
pub use parser::{parse_template, ParseError};
pub use pool::{DispatchConfig, DispatchPool, FileHandler, ShutdownReport};
pub use processor::{persist_record, ProcessError, ProcessOutcome, Processor};
pub use watcher::{
    CycleReport, DirectoryWatcher, WatchHandle, WatchTarget, WatcherError, DEFAULT_EXTENSION,
};
