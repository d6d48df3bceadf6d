// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Interface to the external download queue.
//!
//! The queue is the source of truth: it owns the entries, runs the transfers
//! and deletes backing files when an entry is removed. Everything here is
//! blocking, like a database cursor; callers on the async side dispatch
//! through `spawn_blocking`.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::events::{ChangeSignal, SignalHub};
use super::types::{local_uri_to_path, DownloadId, DownloadStatus};
use crate::locks::resilient_lock;

/// One entry as reported by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRow {
    pub id: DownloadId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub status: DownloadStatus,
    #[serde(default)]
    pub reason: Option<i32>,
    #[serde(default)]
    pub local_uri: Option<String>,
    #[serde(default)]
    pub original_uri: Option<String>,
    /// Where the queue intends to place the file once complete
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub bytes_downloaded: u64,
    #[serde(default)]
    pub total_bytes: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl QueueRow {
    /// A freshly queued entry.
    pub fn pending(id: DownloadId, original_uri: impl Into<String>) -> Self {
        Self {
            id,
            title: None,
            description: None,
            status: DownloadStatus::Pending,
            reason: None,
            local_uri: None,
            original_uri: Some(original_uri.into()),
            destination: None,
            bytes_downloaded: 0,
            total_bytes: 0,
            last_modified: Utc::now(),
            mime_type: None,
        }
    }

    /// A completed entry whose file lives at `local_uri`.
    pub fn successful(id: DownloadId, local_uri: impl Into<String>, size: u64) -> Self {
        Self {
            status: DownloadStatus::Successful,
            local_uri: Some(local_uri.into()),
            bytes_downloaded: size,
            total_bytes: size,
            original_uri: None,
            ..Self::pending(id, "")
        }
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        self.local_uri.as_deref().and_then(local_uri_to_path)
    }
}

/// Which entries a query returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    ids: Option<Vec<DownloadId>>,
}

impl QueryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: DownloadId) -> Self {
        Self { ids: Some(vec![id]) }
    }

    pub fn by_ids(ids: impl IntoIterator<Item = DownloadId>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
        }
    }

    pub fn matches(&self, id: DownloadId) -> bool {
        self.ids.as_ref().map_or(true, |ids| ids.contains(&id))
    }
}

/// Parameters for a new download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub uri: String,
    pub title: Option<String>,
    /// File name or path the queue should write to
    pub destination_hint: Option<String>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("download queue unavailable: {0}")]
    Unavailable(String),
    #[error("queue store I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("queue store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("timed out waiting for the queue lock on {}", path.display())]
    LockTimeout { path: PathBuf },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Primitives offered by the external download queue.
pub trait DownloadQueue: Send + Sync {
    /// Return all entries matching the filter, in the queue's order.
    fn query(&self, filter: &QueryFilter) -> Result<Vec<QueueRow>, QueueError>;

    /// Queue a new download and return its id.
    fn enqueue(&self, request: EnqueueRequest) -> Result<DownloadId, QueueError>;

    /// Remove an entry, deleting its backing file if one exists at the
    /// recorded path. Returns the number of entries removed.
    fn remove(&self, id: DownloadId) -> Result<usize, QueueError>;

    /// Number of entries currently in the queue.
    fn count(&self) -> Result<usize, QueueError> {
        self.query(&QueryFilter::all()).map(|rows| rows.len())
    }

    /// URI of the file produced by a completed download.
    fn resolve_file_uri(&self, id: DownloadId) -> Result<Option<String>, QueueError> {
        Ok(self
            .query(&QueryFilter::by_id(id))?
            .into_iter()
            .find(|r| r.id == id && r.status == DownloadStatus::Successful)
            .and_then(|r| r.local_uri))
    }

    /// MIME type of the file produced by a completed download.
    fn resolve_mime_type(&self, id: DownloadId) -> Result<Option<String>, QueueError> {
        Ok(self
            .query(&QueryFilter::by_id(id))?
            .into_iter()
            .find(|r| r.id == id && r.status == DownloadStatus::Successful)
            .and_then(|r| r.mime_type))
    }
}

/// Delete the file behind a row the way the queue's remove primitive does:
/// quietly, and only if it is still at the recorded path.
pub(crate) fn delete_backing_file(row: &QueueRow) {
    let Some(path) = row.local_path() else {
        return;
    };
    match std::fs::remove_file(&path) {
        Ok(()) => tracing::debug!(id = %row.id, path = %path.display(), "deleted backing file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::debug!(id = %row.id, path = %path.display(), error = %e, "backing file left in place")
        }
    }
}

struct MemoryInner {
    rows: IndexMap<DownloadId, QueueRow>,
    next_id: u64,
    unavailable: bool,
}

/// In-process queue, used for embedding and tests.
///
/// Every mutation publishes a generic change naming the entry; entries that
/// reach a terminal state also publish a completion.
pub struct MemoryQueue {
    inner: Mutex<MemoryInner>,
    changes: SignalHub,
    completions: SignalHub,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                rows: IndexMap::new(),
                next_id: 1,
                unavailable: false,
            }),
            changes: SignalHub::new("memory-queue-changes"),
            completions: SignalHub::new("memory-queue-completions"),
        }
    }

    /// Generic change channel.
    pub fn changes(&self) -> &SignalHub {
        &self.changes
    }

    /// Completion channel.
    pub fn completions(&self) -> &SignalHub {
        &self.completions
    }

    /// Insert or replace a row as-is.
    pub fn insert(&self, row: QueueRow) -> DownloadId {
        let id = row.id;
        let terminal = row.status.is_terminal();
        {
            let mut inner = resilient_lock(&self.inner);
            inner.next_id = inner.next_id.max(id.0 + 1);
            inner.rows.insert(id, row);
        }
        self.changes.emit(ChangeSignal::changed(id));
        if terminal {
            self.completions.emit(ChangeSignal::Completed { id });
        }
        id
    }

    /// Mutate a row in place. Returns false if the id is unknown.
    pub fn update(&self, id: DownloadId, f: impl FnOnce(&mut QueueRow)) -> bool {
        let became_terminal = {
            let mut inner = resilient_lock(&self.inner);
            let Some(row) = inner.rows.get_mut(&id) else {
                return false;
            };
            let was_terminal = row.status.is_terminal();
            f(row);
            row.last_modified = Utc::now();
            !was_terminal && row.status.is_terminal()
        };
        self.changes.emit(ChangeSignal::changed(id));
        if became_terminal {
            self.completions.emit(ChangeSignal::Completed { id });
        }
        true
    }

    /// Simulate the queue being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        resilient_lock(&self.inner).unavailable = unavailable;
    }

    pub fn contains(&self, id: DownloadId) -> bool {
        resilient_lock(&self.inner).rows.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        resilient_lock(&self.inner).rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DownloadQueue for MemoryQueue {
    fn query(&self, filter: &QueryFilter) -> Result<Vec<QueueRow>, QueueError> {
        let inner = resilient_lock(&self.inner);
        if inner.unavailable {
            return Err(QueueError::Unavailable("memory queue offline".into()));
        }
        Ok(inner
            .rows
            .values()
            .filter(|r| filter.matches(r.id))
            .cloned()
            .collect())
    }

    fn enqueue(&self, request: EnqueueRequest) -> Result<DownloadId, QueueError> {
        if request.uri.trim().is_empty() {
            return Err(QueueError::InvalidRequest("empty download URI".into()));
        }
        let id = {
            let mut inner = resilient_lock(&self.inner);
            if inner.unavailable {
                return Err(QueueError::Unavailable("memory queue offline".into()));
            }
            let id = DownloadId(inner.next_id);
            inner.next_id += 1;
            let mut row = QueueRow::pending(id, request.uri);
            row.title = request.title;
            row.destination = request.destination_hint;
            inner.rows.insert(id, row);
            id
        };
        self.changes.emit(ChangeSignal::changed(id));
        Ok(id)
    }

    fn remove(&self, id: DownloadId) -> Result<usize, QueueError> {
        let removed = {
            let mut inner = resilient_lock(&self.inner);
            if inner.unavailable {
                return Err(QueueError::Unavailable("memory queue offline".into()));
            }
            inner.rows.shift_remove(&id)
        };
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
