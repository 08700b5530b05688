//! Archival of processed template files.
//!
//! Every processed file leaves the watched directory: into the success
//! directory once its post is stored, or into the failure directory when it
//! could not be parsed or stored. Archived names carry a Unix timestamp
//! prefix so the same base name can recur. An archived file is never
//! overwritten: a name already taken within the same second gets a counter.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Errors that can occur while archiving
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("non-regular source file {0}")]
    NotRegularFile(PathBuf),

    #[error("non-regular destination file {0}")]
    DestinationNotRegular(PathBuf),

    #[error("destination already exists: {0}")]
    DestinationExists(PathBuf),

    #[error("Failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Names tried per archive call before giving up
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Which archive directory a file goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Success,
    Failure,
}

/// How a file reached its archive location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    /// Source and destination were already the same file
    AlreadyInPlace,
    /// Hard-linked (same volume)
    Linked,
    /// Copied byte for byte and synced
    Copied,
}

/// Moves files into outcome-specific directories
#[derive(Debug, Clone)]
pub struct Archiver {
    success_dir: PathBuf,
    failure_dir: PathBuf,
}

impl Archiver {
    pub fn new(success_dir: impl Into<PathBuf>, failure_dir: impl Into<PathBuf>) -> Self {
        Self {
            success_dir: success_dir.into(),
            failure_dir: failure_dir.into(),
        }
    }

    /// Create both archive directories if missing
    pub async fn ensure_dirs(&self) -> Result<(), ArchiveError> {
        for dir in [&self.success_dir, &self.failure_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| ArchiveError::io("create directory", dir, e))?;
        }
        Ok(())
    }

    pub fn destination_dir(&self, outcome: ArchiveOutcome) -> &Path {
        match outcome {
            ArchiveOutcome::Success => &self.success_dir,
            ArchiveOutcome::Failure => &self.failure_dir,
        }
    }

    /// Move `src` into the archive for `outcome` and return its new path.
    ///
    /// The source is removed only once the archived copy exists. On any
    /// error the source is left where it was.
    pub async fn archive(&self, src: &Path, outcome: ArchiveOutcome) -> Result<PathBuf, ArchiveError> {
        let base_name = src
            .file_name()
            .ok_or_else(|| ArchiveError::NotRegularFile(src.to_path_buf()))?
            .to_string_lossy();
        let dir = self.destination_dir(outcome);
        let unix_seconds = Utc::now().timestamp();

        let mut attempt = 0;
        let dst = loop {
            let dst = dir.join(archive_file_name(&base_name, unix_seconds, attempt));
            match relocate(src, &dst).await {
                Ok(_) => break dst,
                Err(ArchiveError::DestinationExists(_)) if attempt + 1 < MAX_NAME_ATTEMPTS => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        if !same_path(src, &dst).await {
            fs::remove_file(src)
                .await
                .map_err(|e| ArchiveError::io("remove", src, e))?;
        }

        tracing::debug!(
            src = %src.display(),
            dest = %dst.display(),
            ?outcome,
            "Archived file"
        );
        Ok(dst)
    }
}

/// `<unix seconds>_<base name>`, or `<unix seconds>_<attempt>_<base name>`
/// when an earlier name was taken.
pub fn archive_file_name(base_name: &str, unix_seconds: i64, attempt: u32) -> String {
    if attempt == 0 {
        format!("{}_{}", unix_seconds, base_name)
    } else {
        format!("{}_{}_{}", unix_seconds, attempt, base_name)
    }
}

/// Make `dst` hold the contents of `src` without touching `src`.
///
/// Tries a hard link first and falls back to copy + fsync. An existing
/// destination that is a different file is never replaced and yields
/// [`ArchiveError::DestinationExists`]. A failed copy removes its partial
/// destination.
pub async fn relocate(src: &Path, dst: &Path) -> Result<Relocation, ArchiveError> {
    let src_meta = fs::metadata(src)
        .await
        .map_err(|e| ArchiveError::io("stat", src, e))?;
    if !src_meta.is_file() {
        return Err(ArchiveError::NotRegularFile(src.to_path_buf()));
    }

    match fs::metadata(dst).await {
        Ok(dst_meta) => {
            if !dst_meta.is_file() {
                return Err(ArchiveError::DestinationNotRegular(dst.to_path_buf()));
            }
            if same_file(src, &src_meta, dst, &dst_meta).await {
                return Ok(Relocation::AlreadyInPlace);
            }
            return Err(ArchiveError::DestinationExists(dst.to_path_buf()));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(ArchiveError::io("stat", dst, e)),
    }

    match fs::hard_link(src, dst).await {
        Ok(()) => return Ok(Relocation::Linked),
        // Taken between the stat above and the link
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(ArchiveError::DestinationExists(dst.to_path_buf()));
        }
        Err(_) => {}
    }

    copy_contents(src, dst).await?;
    Ok(Relocation::Copied)
}

/// Copy `src` into a new file at `dst` and sync it to disk. Fails with
/// [`ArchiveError::DestinationExists`] rather than truncating an existing
/// file.
async fn copy_contents(src: &Path, dst: &Path) -> Result<(), ArchiveError> {
    let mut input = File::open(src)
        .await
        .map_err(|e| ArchiveError::io("open", src, e))?;
    let mut output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => ArchiveError::DestinationExists(dst.to_path_buf()),
            _ => ArchiveError::io("create", dst, e),
        })?;

    let copied = async {
        tokio::io::copy(&mut input, &mut output)
            .await
            .map_err(|e| ArchiveError::io("copy to", dst, e))?;
        output
            .flush()
            .await
            .map_err(|e| ArchiveError::io("flush", dst, e))?;
        output
            .sync_all()
            .await
            .map_err(|e| ArchiveError::io("sync", dst, e))
    }
    .await;

    if copied.is_err() {
        drop(output);
        if let Err(cleanup) = fs::remove_file(dst).await {
            if cleanup.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    dest = %dst.display(),
                    error = %cleanup,
                    "Failed to remove partial archive copy"
                );
            }
        }
    }
    copied
}

#[cfg(unix)]
async fn same_file(_: &Path, a: &std::fs::Metadata, _: &Path, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
async fn same_file(a: &Path, _: &std::fs::Metadata, b: &Path, _: &std::fs::Metadata) -> bool {
    same_path(a, b).await
}

async fn same_path(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a).await, fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn archiver(temp: &TempDir) -> Archiver {
        Archiver::new(temp.path().join("ok"), temp.path().join("error"))
    }

    #[test]
    fn test_archive_file_name() {
        assert_eq!(archive_file_name("post.tpl", 1586952597, 0), "1586952597_post.tpl");
        assert_eq!(archive_file_name("post.tpl", 1586952597, 2), "1586952597_2_post.tpl");
    }

    #[tokio::test]
    async fn test_archive_success_moves_file() {
        let temp = TempDir::new().unwrap();
        let archiver = archiver(&temp);
        archiver.ensure_dirs().await.unwrap();

        let src = temp.path().join("post.tpl");
        fs::write(&src, b"<head></head>").await.unwrap();

        let dst = archiver.archive(&src, ArchiveOutcome::Success).await.unwrap();

        assert!(!src.exists());
        assert_eq!(dst.parent().unwrap(), temp.path().join("ok"));
        let name = dst.file_name().unwrap().to_string_lossy().to_string();
        let (prefix, rest) = name.split_once('_').unwrap();
        assert!(prefix.parse::<i64>().is_ok());
        assert_eq!(rest, "post.tpl");
        assert_eq!(fs::read(&dst).await.unwrap(), b"<head></head>");
    }

    #[tokio::test]
    async fn test_archive_failure_uses_failure_dir() {
        let temp = TempDir::new().unwrap();
        let archiver = archiver(&temp);
        archiver.ensure_dirs().await.unwrap();

        let src = temp.path().join("bad.tpl");
        fs::write(&src, b"nope").await.unwrap();

        let dst = archiver.archive(&src, ArchiveOutcome::Failure).await.unwrap();
        assert_eq!(dst.parent().unwrap(), temp.path().join("error"));
        assert!(!src.exists());
    }

    #[tokio::test]
    async fn test_failed_relocation_keeps_source() {
        let temp = TempDir::new().unwrap();
        // Archive directories are never created
        let archiver = archiver(&temp);

        let src = temp.path().join("post.tpl");
        fs::write(&src, b"data").await.unwrap();

        let err = archiver.archive(&src, ArchiveOutcome::Success).await;
        assert!(err.is_err());
        assert!(src.exists());
        assert_eq!(fs::read(&src).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_relocate_rejects_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("sub.tpl");
        fs::create_dir(&dir).await.unwrap();

        let err = relocate(&dir, &temp.path().join("dst")).await.unwrap_err();
        assert!(matches!(err, ArchiveError::NotRegularFile(_)));
    }

    #[tokio::test]
    async fn test_relocate_same_file_is_noop() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.tpl");
        let linked = temp.path().join("b.tpl");
        fs::write(&src, b"data").await.unwrap();
        fs::hard_link(&src, &linked).await.unwrap();

        assert_eq!(
            relocate(&src, &linked).await.unwrap(),
            Relocation::AlreadyInPlace
        );
        assert_eq!(relocate(&src, &src).await.unwrap(), Relocation::AlreadyInPlace);
    }

    #[tokio::test]
    async fn test_relocate_links_on_same_volume() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.tpl");
        fs::write(&src, b"data").await.unwrap();

        let dst = temp.path().join("linked.tpl");
        assert_eq!(relocate(&src, &dst).await.unwrap(), Relocation::Linked);
        assert!(src.exists());
        assert_eq!(fs::read(&dst).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_copy_contents_never_truncates_existing_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.tpl");
        let dst = temp.path().join("b.tpl");
        fs::write(&src, b"new").await.unwrap();
        fs::write(&dst, b"old and longer").await.unwrap();

        let err = copy_contents(&src, &dst).await.unwrap_err();
        assert!(matches!(err, ArchiveError::DestinationExists(_)));
        assert_eq!(fs::read(&dst).await.unwrap(), b"old and longer");
        assert!(src.exists());
    }

    #[tokio::test]
    async fn test_copy_contents_creates_new_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.tpl");
        let dst = temp.path().join("b.tpl");
        fs::write(&src, b"data").await.unwrap();

        copy_contents(&src, &dst).await.unwrap();
        assert_eq!(fs::read(&dst).await.unwrap(), b"data");
        assert!(src.exists());
    }

    #[tokio::test]
    async fn test_relocate_refuses_other_existing_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.tpl");
        let dst = temp.path().join("taken.tpl");
        fs::write(&src, b"new").await.unwrap();
        fs::write(&dst, b"archived earlier").await.unwrap();

        let err = relocate(&src, &dst).await.unwrap_err();
        assert!(matches!(err, ArchiveError::DestinationExists(_)));
        assert_eq!(fs::read(&dst).await.unwrap(), b"archived earlier");
    }

    #[tokio::test]
    async fn test_same_base_name_twice_keeps_both_archives() {
        let temp = TempDir::new().unwrap();
        let archiver = archiver(&temp);
        archiver.ensure_dirs().await.unwrap();
        let src = temp.path().join("post.tpl");

        // Occupy every name the first call could pick within this second
        // and the next, so the collision is certain regardless of timing.
        let now = Utc::now().timestamp();
        for unix in [now, now + 1] {
            fs::write(
                temp.path().join("ok").join(archive_file_name("post.tpl", unix, 0)),
                b"FIRST",
            )
            .await
            .unwrap();
        }

        fs::write(&src, b"SECOND").await.unwrap();
        let second = archiver.archive(&src, ArchiveOutcome::Success).await.unwrap();

        fs::write(&src, b"THIRD").await.unwrap();
        let third = archiver.archive(&src, ArchiveOutcome::Success).await.unwrap();

        assert_ne!(second, third);
        assert_eq!(fs::read(&second).await.unwrap(), b"SECOND");
        assert_eq!(fs::read(&third).await.unwrap(), b"THIRD");
        for unix in [now, now + 1] {
            let first = temp.path().join("ok").join(archive_file_name("post.tpl", unix, 0));
            assert_eq!(fs::read(&first).await.unwrap(), b"FIRST");
        }
        assert!(!src.exists());
    }
}
