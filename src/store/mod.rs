//! Persistence boundary for ingested posts.
//!
//! The ingestion pipeline only needs a transactional write path:
//! begin, insert the record, insert its associations, commit. Dropping an
//! uncommitted transaction rolls it back. A read path for listing stored
//! posts with filters is provided for the CLI.

pub mod migrations;
pub mod sqlite;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Association, ContentRecord};

pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database schema version {db_version} is newer than supported {latest_supported}")]
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Store connection lock poisoned")]
    Poisoned,
}

/// A transactional store for posts.
///
/// Implementations must serialize conflicting writes; the pipeline calls
/// `begin` concurrently from several blocking threads.
pub trait ContentStore: Send + Sync {
    /// Open a write transaction.
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>>;

    /// List stored posts matching the query, ordered by id.
    fn list_records(&self, query: &RecordQuery) -> StoreResult<Vec<ContentRecord>>;

    /// All associations of one record, in insertion order.
    fn associations(&self, record_id: i64) -> StoreResult<Vec<Association>>;
}

/// One open write transaction. Rolled back on drop unless committed.
pub trait StoreTransaction {
    /// Insert a post row and return its new identity.
    fn insert_record(&mut self, record: &ContentRecord) -> StoreResult<i64>;

    /// Insert one category or tag row.
    fn insert_association(&mut self, association: &Association) -> StoreResult<()>;

    /// Make every write of this transaction visible.
    fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discard every write of this transaction. Dropping does the same but
    /// cannot report failure.
    fn rollback(self: Box<Self>) -> StoreResult<()>;
}

const PAGE_SIZE_DEFAULT: u32 = 20;
const PAGE_SIZE_MAX: u32 = 100;

/// Filters for listing stored posts. All set filters must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    pub id: Option<i64>,
    pub author: Option<String>,
    /// Inclusive lower bound on the creation timestamp
    pub date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the creation timestamp
    pub date_to: Option<DateTime<Utc>>,
    /// Match posts having any of these categories
    pub categories: Vec<String>,
    /// Match posts having any of these tags
    pub tags: Vec<String>,
    /// 1-based page number
    pub page: u32,
    /// Defaults to 20, clamped to 100
    pub page_size: Option<u32>,
}

impl RecordQuery {
    pub fn limit(&self) -> u32 {
        self.page_size
            .unwrap_or(PAGE_SIZE_DEFAULT)
            .clamp(1, PAGE_SIZE_MAX)
    }

    pub fn offset(&self) -> u32 {
        if self.page > 1 {
            (self.page - 1) * self.limit()
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults() {
        let query = RecordQuery::default();
        assert_eq!(query.limit(), 20);
        assert_eq!(query.offset(), 0);
    }

    #[test]
    fn test_pagination_offset_and_clamp() {
        let query = RecordQuery {
            page: 3,
            page_size: Some(10),
            ..Default::default()
        };
        assert_eq!(query.offset(), 20);

        let huge = RecordQuery {
            page_size: Some(10_000),
            ..Default::default()
        };
        assert_eq!(huge.limit(), 100);

        let zero = RecordQuery {
            page_size: Some(0),
            ..Default::default()
        };
        assert_eq!(zero.limit(), 1);
    }
}
