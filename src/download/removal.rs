// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Safe Removal Service.
//!
//! The queue's remove primitive always deletes the backing file. Keeping the
//! file therefore has to be synthesized: move the file out of the way, let
//! the queue remove the entry, and put the file back. When the file can't be
//! moved we copy it aside instead and only proceed once the copy is verified.
//! Anything short of that fails closed and leaves the entry untouched.
//!
//! The service never touches the engine's record set. Callers apply
//! [`RemovalOutcome::follow_up`] themselves.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::queue::{DownloadQueue, QueryFilter, QueueError};
use super::types::{DownloadId, DownloadRecord, DownloadStatus};
use crate::error::ErrorBuilder;
use crate::utils::now_millis;

/// Prefix of the temporary siblings created while keeping a file.
pub const TEMP_PREFIX: &str = "tmp_";

/// Filesystem primitives used by the removal strategies.
///
/// Every probe is a snapshot; the file may change before the next call.
pub trait FileOps: Send + Sync {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn can_read(&self, path: &Path) -> bool {
        fs::File::open(path).is_ok()
    }

    fn can_write(&self, path: &Path) -> bool {
        fs::OpenOptions::new().append(true).open(path).is_ok()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        fs::copy(from, to)
    }

    fn len(&self, path: &Path) -> io::Result<u64> {
        fs::metadata(path).map(|m| m.len())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// Plain `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFileOps;

impl FileOps for StdFileOps {}

#[derive(Debug, Error)]
pub enum RemovalError {
    #[error("download {id}: {reason}")]
    PreconditionFailed { id: DownloadId, reason: String },

    #[error("permission denied on {}", path.display())]
    PermissionDenied { id: DownloadId, path: PathBuf },

    #[error("file for download {id} not found at {}", path.display())]
    NotFound { id: DownloadId, path: PathBuf },

    #[error("copy of {} is {actual} bytes, expected {expected}", path.display())]
    Integrity {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("{op} failed on {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The entry is gone but the file could not be put back in place.
    #[error("download {id} was removed but its file is left at {}: {source}", saved.display())]
    FileStranded {
        id: DownloadId,
        original: PathBuf,
        saved: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("removal task failed: {0}")]
    Task(String),
}

impl RemovalError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        RemovalError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Record-set follow-up still owed when the queue entry was removed
    /// before the operation failed.
    pub fn follow_up(&self) -> Option<FollowUp> {
        match self {
            RemovalError::FileStranded { .. } => Some(FollowUp::RemoveRecord),
            _ => None,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            RemovalError::PermissionDenied { .. } => true,
            RemovalError::Io { source, .. } => source.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// Actionable message for the user.
    pub fn user_message(&self) -> String {
        match self {
            RemovalError::PermissionDenied { id, path } => {
                ErrorBuilder::new(format!("Permission denied on {}", path.display()))
                    .cause("The file was created by another user or application")
                    .cause("The file or its folder is read-only")
                    .fix(format!("Remove the entry and its file instead: dlsync remove {}", id))
                    .fix(format!("Check permissions: ls -l \"{}\"", path.display()))
                    .build()
            }
            RemovalError::NotFound { id, path } => {
                ErrorBuilder::new(format!("File for download {} is missing", id))
                    .cause(format!("{} was moved or deleted", path.display()))
                    .fix("Remove orphaned entries: dlsync clean")
                    .build()
            }
            RemovalError::Integrity { path, .. } => {
                ErrorBuilder::new("Could not safely keep the file")
                    .cause(format!("The copy of {} did not match the original", path.display()))
                    .cause("The disk may be full")
                    .fix("Free some space and try again")
                    .build()
            }
            RemovalError::FileStranded {
                id,
                original,
                saved,
                source,
            } => {
                ErrorBuilder::new(format!("Download {} was removed but its file was not put back", id))
                    .detail(format!("saved at {}", saved.display()))
                    .cause(source.to_string())
                    .fix("Restore interrupted removals: dlsync recover")
                    .fix(format!(
                        "Or move it back by hand: mv \"{}\" \"{}\"",
                        saved.display(),
                        original.display()
                    ))
                    .build()
            }
            RemovalError::Queue(e) => ErrorBuilder::new("The download queue refused the request")
                .cause(e.to_string())
                .fix("List downloads to refresh: dlsync list")
                .build(),
            other => ErrorBuilder::new(other.to_string()).build(),
        }
    }
}

/// How a file was kept while its entry was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreserveStrategy {
    Rename,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// Entry removed along with its file
    Removed,
    /// Entry removed, file left at its original path
    RemovedKeptFile { strategy: PreserveStrategy },
    /// File deleted, entry left behind (it will show up as orphaned)
    FileDeleted,
    /// The queue no longer had the entry
    AlreadyGone,
}

/// What the caller must do to the record set afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    RemoveRecord,
    UpdateOne,
}

impl RemovalOutcome {
    pub fn follow_up(&self) -> FollowUp {
        match self {
            RemovalOutcome::FileDeleted => FollowUp::UpdateOne,
            _ => FollowUp::RemoveRecord,
        }
    }
}

/// Counts reported once a bulk operation finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Entries that were already gone when their turn came
    pub skipped: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub summary: BatchSummary,
    pub removed: Vec<DownloadId>,
    pub failures: Vec<(DownloadId, RemovalError)>,
}

impl BatchReport {
    /// Failure report for the entries left behind, if any.
    pub fn failure_message(&self, label: &str) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let mut report = ErrorBuilder::new(format!(
            "{}: {} of {} entries failed",
            label,
            self.summary.failed,
            self.summary.total()
        ));
        for (id, error) in &self.failures {
            report = report.detail(format!("{}: {}", id, error));
        }
        if self.failures.iter().any(|(_, e)| e.is_permission_denied()) {
            report = report
                .cause("Some files were created by another user or application")
                .fix("Remove those entries and their files instead: dlsync remove <id>");
        }
        if self
            .failures
            .iter()
            .any(|(_, e)| matches!(e, RemovalError::NotFound { .. }))
        {
            report = report.fix("Remove orphaned entries: dlsync clean");
        }
        Some(report.fix("Refresh the list and retry: dlsync list").build())
    }

    fn record(&mut self, id: DownloadId, result: Result<RemovalOutcome, RemovalError>) {
        match result {
            Ok(RemovalOutcome::AlreadyGone) => {
                self.summary.skipped += 1;
                self.removed.push(id);
            }
            Ok(_) => {
                self.summary.succeeded += 1;
                self.removed.push(id);
            }
            Err(e) => {
                warn!(%id, error = %e, "batch removal failed for entry");
                self.summary.failed += 1;
                self.failures.push((id, e));
            }
        }
    }
}

/// A file left under its temporary name by an interrupted keep-file removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrandedTemp {
    pub temp_path: PathBuf,
    pub original_path: PathBuf,
}

/// Temporary sibling name: `tmp_<millis>_<hex>_<name>`.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tag: u32 = rand::thread_rng().gen();
    let temp_name = format!("{}{}_{:08x}_{}", TEMP_PREFIX, now_millis(), tag, name);
    path.with_file_name(temp_name)
}

/// Original file name encoded in a temporary sibling name.
pub fn original_name(temp_name: &str) -> Option<&str> {
    let rest = temp_name.strip_prefix(TEMP_PREFIX)?;
    let (millis, rest) = rest.split_once('_')?;
    let (tag, name) = rest.split_once('_')?;
    let valid = !millis.is_empty()
        && millis.bytes().all(|b| b.is_ascii_digit())
        && tag.len() == 8
        && tag.bytes().all(|b| b.is_ascii_hexdigit())
        && !name.is_empty();
    valid.then_some(name)
}

/// Scan a directory for stranded temporary siblings.
pub fn find_stranded_temps(dir: &Path) -> io::Result<Vec<StrandedTemp>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(original) = original_name(&name) {
            found.push(StrandedTemp {
                temp_path: entry.path(),
                original_path: dir.join(original),
            });
        }
    }
    found.sort_by(|a, b| a.temp_path.cmp(&b.temp_path));
    Ok(found)
}

/// Move a stranded file back to its original name.
///
/// Returns `Ok(false)` without touching anything when the original path is
/// already taken.
pub fn restore_stranded(ops: &dyn FileOps, stranded: &StrandedTemp) -> io::Result<bool> {
    if ops.exists(&stranded.original_path) {
        return Ok(false);
    }
    ops.rename(&stranded.temp_path, &stranded.original_path)?;
    info!(
        from = %stranded.temp_path.display(),
        to = %stranded.original_path.display(),
        "restored stranded file"
    );
    Ok(true)
}

pub struct SafeRemovalService {
    queue: Arc<dyn DownloadQueue>,
    scratch_dir: Option<PathBuf>,
    ops: Arc<dyn FileOps>,
}

impl SafeRemovalService {
    pub fn new(queue: Arc<dyn DownloadQueue>) -> Self {
        Self {
            queue,
            scratch_dir: None,
            ops: Arc::new(StdFileOps),
        }
    }

    /// Directory for copy-fallback scratch files. Defaults to the file's own
    /// directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn with_file_ops(mut self, ops: Arc<dyn FileOps>) -> Self {
        self.ops = ops;
        self
    }

    pub fn file_ops(&self) -> &Arc<dyn FileOps> {
        &self.ops
    }

    pub fn queue(&self) -> &Arc<dyn DownloadQueue> {
        &self.queue
    }

    fn lookup(&self, id: DownloadId) -> Result<Option<DownloadRecord>, RemovalError> {
        Ok(self
            .queue
            .query(&QueryFilter::by_id(id))?
            .iter()
            .find(|row| row.id == id)
            .map(DownloadRecord::from_row))
    }

    fn all_records(&self) -> Result<Vec<DownloadRecord>, RemovalError> {
        Ok(self
            .queue
            .query(&QueryFilter::all())?
            .iter()
            .map(DownloadRecord::from_row)
            .collect())
    }

    /// Path of a completed download whose file is present right now.
    fn existing_file(&self, record: &DownloadRecord) -> Result<PathBuf, RemovalError> {
        if record.status != DownloadStatus::Successful {
            return Err(RemovalError::PreconditionFailed {
                id: record.id,
                reason: format!("status is {}, not complete", record.status.label()),
            });
        }
        let path = record
            .local_path()
            .ok_or_else(|| RemovalError::PreconditionFailed {
                id: record.id,
                reason: "no local file recorded".into(),
            })?;
        if !self.ops.exists(&path) {
            return Err(RemovalError::NotFound { id: record.id, path });
        }
        Ok(path)
    }

    /// Remove the entry; the queue deletes the file as a side effect.
    pub fn remove_and_delete(&self, id: DownloadId) -> Result<RemovalOutcome, RemovalError> {
        let removed = self.queue.remove(id)?;
        if removed == 0 {
            debug!(%id, "entry already gone");
            return Ok(RemovalOutcome::AlreadyGone);
        }
        info!(%id, "removed download and its file");
        Ok(RemovalOutcome::Removed)
    }

    /// Remove the entry and leave the file at its original path.
    pub fn remove_and_keep(&self, id: DownloadId) -> Result<RemovalOutcome, RemovalError> {
        let Some(record) = self.lookup(id)? else {
            return Ok(RemovalOutcome::AlreadyGone);
        };
        let path = self.existing_file(&record)?;
        if !self.ops.can_read(&path) {
            warn!(%id, path = %path.display(), "file not readable; refusing to remove entry");
            return Err(RemovalError::PermissionDenied { id, path });
        }

        let temp = temp_sibling(&path);
        match self.ops.rename(&path, &temp) {
            Ok(()) => self.keep_by_rename(id, &path, &temp),
            Err(e) => {
                debug!(%id, error = %e, "rename failed; falling back to copy");
                self.keep_by_copy(id, &path)
            }
        }
    }

    fn keep_by_rename(
        &self,
        id: DownloadId,
        path: &Path,
        temp: &Path,
    ) -> Result<RemovalOutcome, RemovalError> {
        let removed = self.queue.remove(id);

        if let Err(e) = self.ops.rename(temp, path) {
            error!(
                %id,
                temp = %temp.display(),
                error = %e,
                "failed to rename file back; run `dlsync recover`"
            );
            return Err(match removed {
                Ok(_) => RemovalError::FileStranded {
                    id,
                    original: path.to_path_buf(),
                    saved: temp.to_path_buf(),
                    source: e,
                },
                Err(_) => RemovalError::io("rename back", temp, e),
            });
        }

        match removed? {
            0 => Ok(RemovalOutcome::AlreadyGone),
            _ => {
                info!(%id, path = %path.display(), "removed entry, kept file");
                Ok(RemovalOutcome::RemovedKeptFile {
                    strategy: PreserveStrategy::Rename,
                })
            }
        }
    }

    fn keep_by_copy(&self, id: DownloadId, path: &Path) -> Result<RemovalOutcome, RemovalError> {
        let copy = match &self.scratch_dir {
            Some(dir) => {
                let sibling = temp_sibling(path);
                dir.join(sibling.file_name().unwrap_or_default())
            }
            None => temp_sibling(path),
        };

        let expected = self
            .ops
            .len(path)
            .map_err(|e| RemovalError::io("stat", path, e))?;

        if let Err(e) = self.ops.copy(path, &copy) {
            self.discard(&copy);
            return Err(if e.kind() == io::ErrorKind::PermissionDenied {
                RemovalError::PermissionDenied {
                    id,
                    path: path.to_path_buf(),
                }
            } else {
                RemovalError::io("copy", path, e)
            });
        }

        // Verified before the entry goes, so a bad copy leaves everything as it was
        let actual = match self.ops.len(&copy) {
            Ok(len) => len,
            Err(e) => {
                self.discard(&copy);
                return Err(RemovalError::io("stat", &copy, e));
            }
        };
        if actual != expected {
            self.discard(&copy);
            error!(%id, expected, actual, "copy size mismatch; entry left in place");
            return Err(RemovalError::Integrity {
                path: path.to_path_buf(),
                expected,
                actual,
            });
        }

        let removed = match self.queue.remove(id) {
            Ok(n) => n,
            Err(e) => {
                self.discard(&copy);
                return Err(e.into());
            }
        };

        if !self.ops.exists(path) {
            // The queue managed to delete it after all
            if let Err(e) = self.ops.rename(&copy, path).or_else(|_| {
                self.ops.copy(&copy, path).map(|_| ())
            }) {
                error!(
                    %id,
                    copy = %copy.display(),
                    error = %e,
                    "could not restore file from copy"
                );
                return Err(RemovalError::FileStranded {
                    id,
                    original: path.to_path_buf(),
                    saved: copy,
                    source: e,
                });
            }
            debug!(%id, "restored file from copy");
        }
        self.discard(&copy);

        if removed == 0 {
            return Ok(RemovalOutcome::AlreadyGone);
        }
        info!(%id, path = %path.display(), "removed entry, kept file (copy)");
        Ok(RemovalOutcome::RemovedKeptFile {
            strategy: PreserveStrategy::Copy,
        })
    }

    fn discard(&self, path: &Path) {
        if !self.ops.exists(path) {
            return;
        }
        if let Err(e) = self.ops.remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to clean up scratch file");
        }
    }

    /// Delete the file and keep the entry, which becomes orphaned.
    pub fn delete_file_only(&self, id: DownloadId) -> Result<RemovalOutcome, RemovalError> {
        let Some(record) = self.lookup(id)? else {
            return Ok(RemovalOutcome::AlreadyGone);
        };
        let path = self.existing_file(&record)?;
        if !self.ops.can_write(&path) {
            warn!(%id, path = %path.display(), "file not writable");
            return Err(RemovalError::PermissionDenied { id, path });
        }
        match self.ops.remove_file(&path) {
            Ok(()) => {
                info!(%id, path = %path.display(), "deleted file, kept entry");
                Ok(RemovalOutcome::FileDeleted)
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Err(RemovalError::PermissionDenied { id, path })
            }
            Err(e) => Err(RemovalError::io("delete", &path, e)),
        }
    }

    /// Remove every entry. With `keep_files`, files present on disk are kept.
    pub fn remove_all(&self, keep_files: bool) -> Result<BatchReport, RemovalError> {
        let mut report = BatchReport::default();
        for record in self.all_records()? {
            let result = if keep_files && record.has_file() {
                self.remove_and_keep(record.id)
            } else {
                self.remove_and_delete(record.id)
            };
            report.record(record.id, result);
        }
        info!(summary = ?report.summary, keep_files, "remove-all finished");
        Ok(report)
    }

    /// Remove failed and orphaned entries.
    pub fn clean(&self) -> Result<BatchReport, RemovalError> {
        let mut report = BatchReport::default();
        for record in self.all_records()? {
            if record.status == DownloadStatus::Failed || record.is_orphaned() {
                report.record(record.id, self.remove_and_delete(record.id));
            }
        }
        info!(summary = ?report.summary, "clean finished");
        Ok(report)
    }

    /// Remove finished entries from the list, keeping completed files.
    pub fn clear_finished(&self) -> Result<BatchReport, RemovalError> {
        let mut report = BatchReport::default();
        for record in self.all_records()? {
            if !record.status.is_terminal() {
                continue;
            }
            let result = if record.has_file() {
                self.remove_and_keep(record.id)
            } else {
                self.remove_and_delete(record.id)
            };
            report.record(record.id, result);
        }
        info!(summary = ?report.summary, "clear finished");
        Ok(report)
    }

    /// Remove orphaned entries whose file name is `file_name`.
    pub fn remove_orphans_named(&self, file_name: &str) -> Result<BatchReport, RemovalError> {
        let mut report = BatchReport::default();
        for record in self.all_records()? {
            if record.is_orphaned() && record.file_name().as_deref() == Some(file_name) {
                report.record(record.id, self.remove_and_delete(record.id));
            }
        }
        if report.summary.total() > 0 {
            debug!(file_name, summary = ?report.summary, "removed orphans with the same name");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::queue::{MemoryQueue, QueueRow};
    use crate::download::types::path_to_local_uri;
    use tempfile::TempDir;

    fn completed(queue: &MemoryQueue, dir: &Path, id: u64, name: &str, body: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        queue.insert(QueueRow::successful(
            DownloadId(id),
            path_to_local_uri(&path),
            body.len() as u64,
        ));
        path
    }

    fn service(queue: &Arc<MemoryQueue>) -> SafeRemovalService {
        SafeRemovalService::new(queue.clone())
    }

    #[test]
    fn test_temp_sibling_round_trips_name() {
        let temp = temp_sibling(Path::new("/data/report final.pdf"));
        assert_eq!(temp.parent(), Some(Path::new("/data")));
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(TEMP_PREFIX));
        assert_eq!(original_name(&name), Some("report final.pdf"));
        assert_eq!(original_name("tmp_notes.txt"), None);
        assert_eq!(original_name("tmp_123_zzzzzzzz_a"), None);
    }

    #[test]
    fn test_remove_and_delete() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let path = completed(&queue, dir.path(), 1, "a.bin", b"abc");

        let svc = service(&queue);
        assert_eq!(svc.remove_and_delete(DownloadId(1)).unwrap(), RemovalOutcome::Removed);
        assert!(!path.exists());
        assert_eq!(
            svc.remove_and_delete(DownloadId(1)).unwrap(),
            RemovalOutcome::AlreadyGone
        );
    }

    #[test]
    fn test_remove_and_keep_by_rename() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let path = completed(&queue, dir.path(), 1, "keep.bin", b"keep me");

        let outcome = service(&queue).remove_and_keep(DownloadId(1)).unwrap();
        assert_eq!(
            outcome,
            RemovalOutcome::RemovedKeptFile {
                strategy: PreserveStrategy::Rename
            }
        );
        assert_eq!(outcome.follow_up(), FollowUp::RemoveRecord);
        assert!(!queue.contains(DownloadId(1)));
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
        assert!(find_stranded_temps(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_remove_and_keep_requires_completed_file() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        queue.insert(QueueRow::pending(DownloadId(1), "https://h/a"));
        let path = completed(&queue, dir.path(), 2, "gone.bin", b"x");
        fs::remove_file(&path).unwrap();

        let svc = service(&queue);
        assert!(matches!(
            svc.remove_and_keep(DownloadId(1)),
            Err(RemovalError::PreconditionFailed { .. })
        ));
        assert!(matches!(
            svc.remove_and_keep(DownloadId(2)),
            Err(RemovalError::NotFound { .. })
        ));
        assert_eq!(queue.len(), 2);
        assert_eq!(svc.remove_and_keep(DownloadId(9)).unwrap(), RemovalOutcome::AlreadyGone);
    }

    #[test]
    fn test_delete_file_only_leaves_orphan() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let path = completed(&queue, dir.path(), 1, "del.bin", b"bye");

        let outcome = service(&queue).delete_file_only(DownloadId(1)).unwrap();
        assert_eq!(outcome, RemovalOutcome::FileDeleted);
        assert_eq!(outcome.follow_up(), FollowUp::UpdateOne);
        assert!(!path.exists());
        assert!(queue.contains(DownloadId(1)));
    }

    #[test]
    fn test_batch_clean_and_clear() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let kept = completed(&queue, dir.path(), 1, "ok.bin", b"ok");
        let orphan = completed(&queue, dir.path(), 2, "orphan.bin", b"o");
        fs::remove_file(&orphan).unwrap();
        queue.insert(QueueRow::pending(DownloadId(3), "https://h/fail"));
        queue.update(DownloadId(3), |r| r.status = DownloadStatus::Failed);
        queue.insert(QueueRow::pending(DownloadId(4), "https://h/run"));

        let svc = service(&queue);
        let report = svc.clean().unwrap();
        assert_eq!(
            report.summary,
            BatchSummary {
                succeeded: 2,
                failed: 0,
                skipped: 0
            }
        );
        assert!(queue.contains(DownloadId(1)) && queue.contains(DownloadId(4)));

        let report = svc.clear_finished().unwrap();
        assert_eq!(report.summary.succeeded, 1);
        assert_eq!(report.removed, vec![DownloadId(1)]);
        assert!(kept.exists());
        assert!(queue.contains(DownloadId(4)));
    }

    #[test]
    fn test_remove_all_keeping_files() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let a = completed(&queue, dir.path(), 1, "a.bin", b"a");
        let b = completed(&queue, dir.path(), 2, "b.bin", b"b");
        queue.insert(QueueRow::pending(DownloadId(3), "https://h/c"));

        let report = service(&queue).remove_all(true).unwrap();
        assert_eq!(report.summary.succeeded, 3);
        assert!(queue.is_empty());
        assert!(a.exists() && b.exists());
    }

    #[test]
    fn test_remove_orphans_named() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let first = completed(&queue, dir.path(), 1, "dup.bin", b"1");
        fs::remove_file(&first).unwrap();
        completed(&queue, dir.path(), 2, "other.bin", b"2");

        let report = service(&queue).remove_orphans_named("dup.bin").unwrap();
        assert_eq!(report.removed, vec![DownloadId(1)]);
        assert!(queue.contains(DownloadId(2)));
    }

    #[test]
    fn test_find_and_restore_stranded() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("movie.mkv");
        let temp = temp_sibling(&original);
        fs::write(&temp, b"frames").unwrap();
        fs::write(dir.path().join("tmp_unrelated.txt"), b"").unwrap();

        let stranded = find_stranded_temps(dir.path()).unwrap();
        assert_eq!(stranded.len(), 1);
        assert_eq!(stranded[0].original_path, original);

        assert!(restore_stranded(&StdFileOps, &stranded[0]).unwrap());
        assert_eq!(fs::read(&original).unwrap(), b"frames");
        assert!(!temp.exists());
    }

    #[test]
    fn test_restore_stranded_skips_occupied_original() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("a.txt");
        fs::write(&original, b"new").unwrap();
        let temp = temp_sibling(&original);
        fs::write(&temp, b"old").unwrap();

        let stranded = StrandedTemp {
            temp_path: temp.clone(),
            original_path: original.clone(),
        };
        assert!(!restore_stranded(&StdFileOps, &stranded).unwrap());
        assert_eq!(fs::read(&original).unwrap(), b"new");
        assert!(temp.exists());
    }

    #[test]
    fn test_batch_failure_message_lists_entries() {
        let mut report = BatchReport::default();
        report.record(DownloadId(1), Ok(RemovalOutcome::Removed));
        report.record(
            DownloadId(2),
            Err(RemovalError::PermissionDenied {
                id: DownloadId(2),
                path: PathBuf::from("/data/b.bin"),
            }),
        );
        report.record(DownloadId(3), Ok(RemovalOutcome::AlreadyGone));

        let msg = report.failure_message("Clear").unwrap();
        assert!(msg.contains("Clear: 1 of 3 entries failed"));
        assert!(msg.contains("  - 2: permission denied on /data/b.bin"));
        assert!(msg.contains("dlsync remove <id>"));
        assert!(!msg.contains("dlsync clean"));

        assert!(BatchReport::default().failure_message("Clean").is_none());
    }

    #[test]
    fn test_user_message_is_actionable() {
        let err = RemovalError::PermissionDenied {
            id: DownloadId(4),
            path: PathBuf::from("/data/x.bin"),
        };
        assert!(err.is_permission_denied());
        let msg = err.user_message();
        assert!(msg.contains("Permission denied"));
        assert!(msg.contains("dlsync remove 4"));
    }
}
