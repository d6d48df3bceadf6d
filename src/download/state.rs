// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File-backed download queue.
//!
//! Stands in for the system download service when running the command-line
//! tool: entries live in a JSON file that any number of processes may read
//! and write. Every operation re-reads the file, so changes made by another
//! process are always visible.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::events::{ChangeSignal, SignalHub};
use super::queue::{delete_backing_file, DownloadQueue, EnqueueRequest, QueryFilter, QueueError, QueueRow};
use super::types::{file_name_from_url, path_to_local_uri, DownloadId, DownloadStatus};

/// Default timeout for acquiring file locks
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// On-disk layout of the queue file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStore {
    pub rows: IndexMap<DownloadId, QueueRow>,
    pub next_id: u64,
    pub last_saved: Option<DateTime<Utc>>,
    /// Version for future migrations
    pub version: u32,
}

impl Default for QueueStore {
    fn default() -> Self {
        Self {
            rows: IndexMap::new(),
            next_id: 1,
            last_saved: None,
            version: 1,
        }
    }
}

/// Download queue persisted as JSON, guarded by an advisory lock file.
#[derive(Debug)]
pub struct JsonQueue {
    path: PathBuf,
    downloads_dir: PathBuf,
    lock_timeout: Duration,
    changes: SignalHub,
}

impl JsonQueue {
    /// Open (or lazily create) a queue file. New downloads land in
    /// `downloads_dir`.
    pub fn open(path: impl Into<PathBuf>, downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            downloads_dir: downloads_dir.into(),
            lock_timeout: LOCK_TIMEOUT,
            changes: SignalHub::new("json-queue-changes"),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Changes made through this handle.
    pub fn changes(&self) -> &SignalHub {
        &self.changes
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn io_error(path: &Path, source: std::io::Error) -> QueueError {
        QueueError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn open_lock_file(&self) -> Result<File, QueueError> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_error(parent, e))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| Self::io_error(&lock_path, e))
    }

    /// Take the lock file, retrying until the timeout expires.
    fn acquire_lock(&self, exclusive: bool) -> Result<File, QueueError> {
        let lock_file = self.open_lock_file()?;
        let start = Instant::now();

        loop {
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(&lock_file)
            } else {
                FileExt::try_lock_shared(&lock_file)
            };
            match attempt {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
                {
                    if start.elapsed() >= self.lock_timeout {
                        return Err(QueueError::LockTimeout {
                            path: self.lock_path(),
                        });
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(Self::io_error(&self.lock_path(), e)),
            }
        }
    }

    fn read_store(&self) -> Result<QueueStore, QueueError> {
        if !self.path.exists() {
            return Ok(QueueStore::default());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| Self::io_error(&self.path, e))?;
        if content.trim().is_empty() {
            return Ok(QueueStore::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Temp file + rename so a crash never leaves a half-written queue.
    fn write_store(&self, store: &mut QueueStore) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_error(parent, e))?;
        }
        store.last_saved = Some(Utc::now());
        let content = serde_json::to_string_pretty(store)?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| Self::io_error(&temp_path, e))?;
            temp_file
                .write_all(content.as_bytes())
                .map_err(|e| Self::io_error(&temp_path, e))?;
            temp_file.sync_all().map_err(|e| Self::io_error(&temp_path, e))?;
        }
        fs::rename(&temp_path, &self.path).map_err(|e| Self::io_error(&self.path, e))
    }

    /// Snapshot of the store under a shared lock.
    pub fn load(&self) -> Result<QueueStore, QueueError> {
        let _guard = self.acquire_lock(false)?;
        self.read_store()
    }

    /// Read-modify-write under the exclusive lock.
    fn modify<T>(&self, f: impl FnOnce(&mut QueueStore) -> T) -> Result<T, QueueError> {
        let _guard = self.acquire_lock(true)?;
        let mut store = self.read_store()?;
        let out = f(&mut store);
        self.write_store(&mut store)?;
        Ok(out)
    }

    /// Record progress for a running download.
    pub fn update_progress(&self, id: DownloadId, bytes: u64, total: u64) -> Result<bool, QueueError> {
        let found = self.modify(|store| match store.rows.get_mut(&id) {
            Some(row) => {
                row.status = DownloadStatus::Running;
                row.bytes_downloaded = bytes;
                row.total_bytes = total;
                row.last_modified = Utc::now();
                true
            }
            None => false,
        })?;
        if found {
            self.changes.emit(ChangeSignal::changed(id));
        }
        Ok(found)
    }

    /// Mark an entry successful with its file at `file`.
    pub fn mark_complete(&self, id: DownloadId, file: &Path) -> Result<bool, QueueError> {
        let size = fs::metadata(file).map(|m| m.len()).unwrap_or(0);
        let found = self.modify(|store| match store.rows.get_mut(&id) {
            Some(row) => {
                row.status = DownloadStatus::Successful;
                row.local_uri = Some(path_to_local_uri(file));
                row.bytes_downloaded = size;
                row.total_bytes = size;
                row.reason = None;
                row.last_modified = Utc::now();
                true
            }
            None => false,
        })?;
        if found {
            self.changes.emit(ChangeSignal::Completed { id });
        }
        Ok(found)
    }

    /// Mark an entry failed with a reason code.
    pub fn mark_failed(&self, id: DownloadId, reason: i32) -> Result<bool, QueueError> {
        let found = self.modify(|store| match store.rows.get_mut(&id) {
            Some(row) => {
                row.status = DownloadStatus::Failed;
                row.reason = Some(reason);
                row.last_modified = Utc::now();
                true
            }
            None => false,
        })?;
        if found {
            self.changes.emit(ChangeSignal::Completed { id });
        }
        Ok(found)
    }
}

impl DownloadQueue for JsonQueue {
    fn query(&self, filter: &QueryFilter) -> Result<Vec<QueueRow>, QueueError> {
        let store = self.load()?;
        Ok(store
            .rows
            .into_values()
            .filter(|r| filter.matches(r.id))
            .collect())
    }

    fn enqueue(&self, request: EnqueueRequest) -> Result<DownloadId, QueueError> {
        if request.uri.trim().is_empty() {
            return Err(QueueError::InvalidRequest("empty download URI".into()));
        }
        let name = request
            .destination_hint
            .clone()
            .or_else(|| request.title.clone())
            .or_else(|| file_name_from_url(&request.uri))
            .unwrap_or_else(|| "download.bin".to_string());
        let destination = self.downloads_dir.join(name);

        let id = self.modify(|store| {
            let id = DownloadId(store.next_id);
            store.next_id += 1;
            let mut row = QueueRow::pending(id, request.uri);
            row.title = request.title;
            row.destination = Some(destination.display().to_string());
            store.rows.insert(id, row);
            id
        })?;
        self.changes.emit(ChangeSignal::changed(id));
        Ok(id)
    }

    fn remove(&self, id: DownloadId) -> Result<usize, QueueError> {
        let removed = self.modify(|store| store.rows.shift_remove(&id))?;
        match removed {
            Some(row) => {
                delete_backing_file(&row);
                self.changes.emit(ChangeSignal::changed(id));
                Ok(1)
            }
            None => Ok(0),
        }
    }
}
