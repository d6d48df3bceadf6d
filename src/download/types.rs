// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download record types observed from the external queue.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::queue::QueueRow;
use crate::utils::format_size;

/// Identifier assigned by the external queue. Stable and unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub u64);

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DownloadId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(DownloadId)
    }
}

/// Lifecycle state reported by the external queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Waiting to start
    Pending,
    /// Currently transferring
    Running,
    /// Paused by the queue (network, user, ...)
    Paused,
    /// Finished; a file exists or existed
    Successful,
    /// Finished with an error
    Failed,
}

impl DownloadStatus {
    /// Returns true while the queue may still change this entry on its own.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Pending | DownloadStatus::Running | DownloadStatus::Paused
        )
    }

    /// Returns true once the transfer has ended, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Successful | DownloadStatus::Failed)
    }

    /// Short human readable label.
    pub fn label(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "Pending",
            DownloadStatus::Running => "Downloading",
            DownloadStatus::Paused => "Paused",
            DownloadStatus::Successful => "Complete",
            DownloadStatus::Failed => "Failed",
        }
    }
}

/// Snapshot of one external queue entry at the instant it was read.
///
/// Orphan state is deliberately not a field: the filesystem can change
/// underneath us at any time, so [`DownloadRecord::is_orphaned`] re-checks it
/// on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: DownloadId,
    /// Display name, re-derived from the local or original URI when possible
    pub title: String,
    pub status: DownloadStatus,
    /// Failure or pause reason code from the queue, if any
    pub reason: Option<i32>,
    pub local_uri: Option<String>,
    pub original_uri: Option<String>,
    pub bytes_downloaded: u64,
    /// Zero when the queue does not know the size yet
    pub total_bytes: u64,
    pub last_modified_at: DateTime<Utc>,
    pub mime_type: Option<String>,
}

impl DownloadRecord {
    /// Build a record from a queue row, deriving the display title.
    pub fn from_row(row: &QueueRow) -> Self {
        Self {
            id: row.id,
            title: derive_title(
                row.title.as_deref(),
                row.description.as_deref(),
                row.local_uri.as_deref(),
                row.original_uri.as_deref(),
            ),
            status: row.status,
            reason: row.reason,
            local_uri: row.local_uri.clone(),
            original_uri: row.original_uri.clone(),
            bytes_downloaded: row.bytes_downloaded,
            total_bytes: row.total_bytes,
            last_modified_at: row.last_modified,
            mime_type: row.mime_type.clone(),
        }
    }

    /// Filesystem path behind `local_uri`, if it names a local file.
    pub fn local_path(&self) -> Option<PathBuf> {
        self.local_uri.as_deref().and_then(local_uri_to_path)
    }

    /// File name component of the local path.
    pub fn file_name(&self) -> Option<String> {
        self.local_path()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
    }

    /// Successful, has a local URI, and the file is gone.
    pub fn is_orphaned(&self) -> bool {
        self.status == DownloadStatus::Successful
            && self.local_path().is_some_and(|p| !p.exists())
    }

    /// Successful with a file currently present on disk.
    pub fn has_file(&self) -> bool {
        self.status == DownloadStatus::Successful
            && self.local_path().is_some_and(|p| p.exists())
    }

    /// Whether a non-empty source URL is known.
    pub fn has_original_uri(&self) -> bool {
        self.original_uri.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Progress percentage when the total size is known.
    pub fn progress_percent(&self) -> Option<u8> {
        if self.total_bytes == 0 {
            return None;
        }
        let pct = self.bytes_downloaded.saturating_mul(100) / self.total_bytes;
        Some(pct.min(100) as u8)
    }

    /// Two-line summary for list display.
    ///
    /// `speed` is the label produced by the speed tracker, empty when no rate
    /// is available yet.
    pub fn status_line(&self, speed: &str) -> String {
        let when = self
            .last_modified_at
            .with_timezone(&chrono::Local)
            .format("%b %e, %Y %H:%M");

        if self.is_orphaned() {
            return format!("Orphaned (file missing)\n{}", when);
        }

        match self.status {
            DownloadStatus::Running => match self.progress_percent() {
                Some(pct) => {
                    let speed = if speed.is_empty() {
                        String::new()
                    } else {
                        format!(" • {}", speed)
                    };
                    format!(
                        "{}%{}\n{} / {}",
                        pct,
                        speed,
                        format_size(self.bytes_downloaded),
                        format_size(self.total_bytes)
                    )
                }
                None => DownloadStatus::Running.label().to_string(),
            },
            DownloadStatus::Successful => format!("{}\n{}", format_size(self.total_bytes), when),
            DownloadStatus::Failed => format!("Failed ({})\n{}", self.reason.unwrap_or(0), when),
            DownloadStatus::Paused | DownloadStatus::Pending => {
                format!("{}\n{}", self.status.label(), when)
            }
        }
    }
}

/// Convert a `file://` URI (or a bare path) to a filesystem path.
///
/// Returns `None` for other schemes, for `file://` URIs naming a remote host,
/// and for empty input.
pub fn local_uri_to_path(uri: &str) -> Option<PathBuf> {
    let uri = uri.trim();
    if uri.is_empty() {
        return None;
    }
    if !uri.contains("://") {
        return Some(PathBuf::from(uri));
    }
    let url = Url::parse(uri).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

/// Build a `file://` URI for a local path.
///
/// Relative paths cannot be expressed as file URLs and are kept as bare
/// paths, which [`local_uri_to_path`] reads back unchanged.
pub fn path_to_local_uri(path: &Path) -> String {
    Url::from_file_path(path)
        .map(String::from)
        .unwrap_or_else(|_| path.display().to_string())
}

/// Pick the best display name for a queue entry.
///
/// Order: file name of the local URI, then the last path segment of the
/// source URL with query and fragment stripped, then the supplied title, then
/// the description.
pub fn derive_title(
    title: Option<&str>,
    description: Option<&str>,
    local_uri: Option<&str>,
    original_uri: Option<&str>,
) -> String {
    if let Some(local) = local_uri {
        let name = local_uri_to_path(local)
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            return name;
        }
    } else if let Some(name) = original_uri.and_then(file_name_from_url) {
        return name;
    }

    title
        .filter(|t| !t.trim().is_empty())
        .or(description.filter(|d| !d.trim().is_empty()))
        .unwrap_or("Unknown")
        .to_string()
}

/// Last path segment of a URL, without query string or fragment.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let segment = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())?;
    let name = urlencoding::decode(segment)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    if name.trim().is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Derived availability of bulk actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateFlags {
    pub has_any: bool,
    pub has_failed_or_orphaned: bool,
    pub has_removable_preserving_file: bool,
}

impl AggregateFlags {
    /// Compute from scratch over a set of records.
    pub fn compute<'a>(records: impl IntoIterator<Item = &'a DownloadRecord>) -> Self {
        let mut acc = FlagAccumulator::default();
        for record in records {
            acc.add(FlagContribution::of(record));
        }
        acc.finish()
    }
}

/// What a single record adds to [`AggregateFlags`].
///
/// Computed outside of any lock since it touches the filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagContribution {
    pub failed_or_orphaned: bool,
    pub removable_preserving_file: bool,
}

impl FlagContribution {
    pub fn of(record: &DownloadRecord) -> Self {
        let has_file = record.has_file();
        Self {
            failed_or_orphaned: record.status == DownloadStatus::Failed || record.is_orphaned(),
            removable_preserving_file: has_file,
        }
    }
}

/// Running totals used while a reload is paced through the rows.
#[derive(Debug, Clone, Default)]
pub struct FlagAccumulator {
    total: usize,
    failed_or_orphaned: usize,
    removable: usize,
}

impl FlagAccumulator {
    pub fn add(&mut self, contribution: FlagContribution) {
        self.total += 1;
        if contribution.failed_or_orphaned {
            self.failed_or_orphaned += 1;
        }
        if contribution.removable_preserving_file {
            self.removable += 1;
        }
    }

    pub fn finish(&self) -> AggregateFlags {
        AggregateFlags {
            has_any: self.total > 0,
            has_failed_or_orphaned: self.failed_or_orphaned > 0,
            has_removable_preserving_file: self.removable > 0,
        }
    }
}

/// Per-record actions the presentation layer may offer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordActions {
    pub open: bool,
    pub remove_and_delete: bool,
    pub remove_and_keep: bool,
    pub delete_file: bool,
    pub cancel: bool,
    pub remove_from_list: bool,
    pub redownload: bool,
    pub share_link: bool,
}

impl RecordActions {
    /// Work out the available actions.
    ///
    /// `can_read` and `can_write` are permission probes on the local file,
    /// supplied by the caller so the probe can be swapped out in tests.
    pub fn for_record(record: &DownloadRecord, can_read: bool, can_write: bool) -> Self {
        let has_file = record.has_file();
        let orphaned = record.is_orphaned();
        let failed = record.status == DownloadStatus::Failed;
        let has_url = record.has_original_uri();

        Self {
            open: has_file,
            remove_and_delete: has_file,
            remove_and_keep: has_file && can_read,
            delete_file: has_file && can_write,
            cancel: record.status.is_active(),
            remove_from_list: orphaned || failed,
            redownload: (orphaned || failed) && has_url,
            share_link: has_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(status: DownloadStatus, local_uri: Option<String>) -> DownloadRecord {
        DownloadRecord {
            id: DownloadId(1),
            title: "file.bin".into(),
            status,
            reason: None,
            local_uri,
            original_uri: Some("https://example.com/file.bin".into()),
            bytes_downloaded: 50,
            total_bytes: 200,
            last_modified_at: Utc::now(),
            mime_type: None,
        }
    }

    #[test]
    fn test_local_uri_to_path() {
        assert_eq!(
            local_uri_to_path("file:///sdcard/Download/a%20b.pdf"),
            Some(PathBuf::from("/sdcard/Download/a b.pdf"))
        );
        assert_eq!(local_uri_to_path("/tmp/x"), Some(PathBuf::from("/tmp/x")));
        assert_eq!(local_uri_to_path("content://downloads/1"), None);
        assert_eq!(local_uri_to_path(""), None);
    }

    #[test]
    fn test_local_uri_keeps_percent_signs_in_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report%41v2 100%.pdf");
        std::fs::write(&path, b"pdf").unwrap();

        let uri = path_to_local_uri(&path);
        assert!(uri.starts_with("file://"));
        assert_eq!(local_uri_to_path(&uri), Some(path.clone()));

        let rec = record(DownloadStatus::Successful, Some(uri));
        assert!(!rec.is_orphaned());
    }

    #[test]
    fn test_relative_path_stays_bare() {
        let uri = path_to_local_uri(Path::new("downloads/a%41.bin"));
        assert_eq!(uri, "downloads/a%41.bin");
        assert_eq!(local_uri_to_path(&uri), Some(PathBuf::from("downloads/a%41.bin")));
    }

    #[test]
    fn test_file_name_from_url_decodes_segment() {
        assert_eq!(
            file_name_from_url("https://host/dir/annual%20report.pdf"),
            Some("annual report.pdf".into())
        );
        assert_eq!(file_name_from_url("not a url"), None);
    }

    #[test]
    fn test_file_name_from_url_strips_query_and_fragment() {
        assert_eq!(
            file_name_from_url("https://host/dir/file.pdf?token=123"),
            Some("file.pdf".into())
        );
        assert_eq!(
            file_name_from_url("https://host/dir/file.pdf#page=1"),
            Some("file.pdf".into())
        );
        assert_eq!(file_name_from_url("https://host/"), None);
        assert_eq!(file_name_from_url("https://host"), None);
    }

    #[test]
    fn test_derive_title_prefers_local_name() {
        let title = derive_title(
            Some("Download"),
            None,
            Some("file:///data/report.pdf"),
            Some("https://host/other.pdf"),
        );
        assert_eq!(title, "report.pdf");

        let title = derive_title(Some("Download"), None, None, Some("https://host/a/b.zip?x=1"));
        assert_eq!(title, "b.zip");

        let title = derive_title(None, Some("desc"), None, Some("https://host/"));
        assert_eq!(title, "desc");

        assert_eq!(derive_title(None, None, None, None), "Unknown");
    }

    #[test]
    fn test_orphan_detection_tracks_filesystem() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"data").unwrap();

        let rec = record(DownloadStatus::Successful, Some(path_to_local_uri(&path)));
        assert!(!rec.is_orphaned());
        assert!(rec.has_file());

        std::fs::remove_file(&path).unwrap();
        assert!(rec.is_orphaned());
        assert!(!rec.has_file());

        // Only successful downloads can be orphaned
        let failed = record(DownloadStatus::Failed, Some(path_to_local_uri(&path)));
        assert!(!failed.is_orphaned());
    }

    #[test]
    fn test_flags_from_records() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("present.bin");
        std::fs::write(&present, b"x").unwrap();

        let ok = record(DownloadStatus::Successful, Some(path_to_local_uri(&present)));
        let running = record(DownloadStatus::Running, None);
        let flags = AggregateFlags::compute([&ok, &running]);
        assert!(flags.has_any);
        assert!(flags.has_removable_preserving_file);
        assert!(!flags.has_failed_or_orphaned);

        let failed = record(DownloadStatus::Failed, None);
        let flags = AggregateFlags::compute([&running, &failed]);
        assert!(flags.has_failed_or_orphaned);
        assert!(!flags.has_removable_preserving_file);

        assert_eq!(AggregateFlags::compute([]), AggregateFlags::default());
    }

    #[test]
    fn test_progress_and_status_line() {
        let mut rec = record(DownloadStatus::Running, None);
        assert_eq!(rec.progress_percent(), Some(25));
        let line = rec.status_line("1.0 KB/s");
        assert!(line.starts_with("25% • 1.0 KB/s\n"));

        rec.total_bytes = 0;
        assert_eq!(rec.progress_percent(), None);
        assert_eq!(rec.status_line(""), "Downloading");
    }

    #[test]
    fn test_actions_for_failed_record() {
        let rec = record(DownloadStatus::Failed, None);
        let actions = RecordActions::for_record(&rec, false, false);
        assert!(actions.remove_from_list);
        assert!(actions.redownload);
        assert!(actions.share_link);
        assert!(!actions.open);
        assert!(!actions.cancel);
    }

    #[test]
    fn test_actions_for_completed_file_depend_on_permissions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("done.bin");
        std::fs::write(&path, b"x").unwrap();
        let rec = record(DownloadStatus::Successful, Some(path_to_local_uri(&path)));

        let read_only = RecordActions::for_record(&rec, true, false);
        assert!(read_only.open && read_only.remove_and_delete && read_only.remove_and_keep);
        assert!(!read_only.delete_file);

        let full = RecordActions::for_record(&rec, true, true);
        assert!(full.delete_file);
    }
}
