//! Template processor.
//!
//! Drives one file through read → parse → persist → archive. Every failure
//! is terminal for that file only and is reported through logging; nothing
//! is propagated to the watcher or to other files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::archive::{ArchiveOutcome, Archiver};
use super::parser::{parse_template, ParseError};
use super::pool::FileHandler;
use crate::domain::{Association, AssociationKind, ContentRecord};
use crate::store::{ContentStore, StoreError, StoreResult};

/// Why a file was routed to the failure archive
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("error saving template to the database: {0}")]
    Persist(#[from] StoreError),

    #[error("persistence task failed: {0}")]
    PersistTask(#[from] tokio::task::JoinError),
}

/// Terminal state of one processed file
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Stored. `archived_to` is `None` if the success archive step failed.
    Stored {
        id: i64,
        archived_to: Option<PathBuf>,
    },

    /// Not stored. `archived_to` is `None` if the failure archive step failed.
    Rejected {
        error: ProcessError,
        archived_to: Option<PathBuf>,
    },

    /// Could not be read; left in place for the next cycle
    ReadFailed { error: std::io::Error },
}

impl ProcessOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, ProcessOutcome::Stored { .. })
    }
}

/// Processes template files into the store
#[derive(Clone)]
pub struct Processor {
    store: Arc<dyn ContentStore>,
    archiver: Archiver,
}

impl Processor {
    pub fn new(store: Arc<dyn ContentStore>, archiver: Archiver) -> Self {
        Self { store, archiver }
    }

    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    /// Process one template file
    #[instrument(skip(self, path), fields(file = %path.display()))]
    pub async fn process(&self, path: &Path) -> ProcessOutcome {
        info!("processing file");

        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "error reading template content");
                return ProcessOutcome::ReadFailed { error: e };
            }
        };

        let mut record = match decode(data).and_then(|markup| parse_template(&markup)) {
            Ok(record) => record,
            Err(e) => {
                error!(error = %e, "error parsing template");
                return self.reject(path, e.into()).await;
            }
        };

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        record.finalize(file_name, Utc::now());

        let store = Arc::clone(&self.store);
        let saved = tokio::task::spawn_blocking(move || persist_record(store.as_ref(), &record)).await;
        let id = match saved {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                error!(error = %e, "error saving template to the database");
                return self.reject(path, e.into()).await;
            }
            Err(e) => {
                error!(error = %e, "persistence task failed");
                return self.reject(path, e.into()).await;
            }
        };

        match self.archiver.archive(path, ArchiveOutcome::Success).await {
            Ok(dest) => {
                info!(id, dest = %dest.display(), "file processed OK");
                ProcessOutcome::Stored {
                    id,
                    archived_to: Some(dest),
                }
            }
            Err(e) => {
                // Already stored; the file is not reprocessed for this
                error!(id, error = %e, "error moving template");
                ProcessOutcome::Stored {
                    id,
                    archived_to: None,
                }
            }
        }
    }

    async fn reject(&self, path: &Path, error: ProcessError) -> ProcessOutcome {
        let archived_to = match self.archiver.archive(path, ArchiveOutcome::Failure).await {
            Ok(dest) => {
                warn!(dest = %dest.display(), "template moved to error folder");
                Some(dest)
            }
            Err(e) => {
                error!(error = %e, "error moving template");
                None
            }
        };

        ProcessOutcome::Rejected { error, archived_to }
    }
}

#[async_trait]
impl FileHandler for Processor {
    async fn handle(&self, path: PathBuf) {
        let _ = self.process(&path).await;
    }
}

fn decode(data: Vec<u8>) -> Result<String, ParseError> {
    String::from_utf8(data)
        .map_err(|e| ParseError::MalformedDocument(format!("content is not valid UTF-8: {}", e)))
}

/// Write a record and all of its associations in one transaction.
///
/// Returns the new record identity. On error the transaction is dropped,
/// which rolls back every row written so far.
pub fn persist_record(store: &dyn ContentStore, record: &ContentRecord) -> StoreResult<i64> {
    let mut tx = store.begin()?;
    let id = tx.insert_record(record)?;

    let associations = record
        .category_names()
        .into_iter()
        .map(|name| (AssociationKind::Category, name))
        .chain(
            record
                .tag_names()
                .into_iter()
                .map(|name| (AssociationKind::Tag, name)),
        );

    for (kind, name) in associations {
        tx.insert_association(&Association {
            record_id: id,
            kind,
            name,
        })?;
    }

    tx.commit()?;
    Ok(id)
}
