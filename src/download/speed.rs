// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sliding-window transfer rate estimation.
//!
//! Progress callbacks arrive in bursts, so an instantaneous rate jumps around.
//! We keep a trailing window of `(timestamp, cumulative bytes)` samples per
//! download and report the average over whatever the window holds.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use super::types::DownloadId;
use crate::utils::format_rate;

/// Default trailing window.
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(10);

/// One observation of cumulative progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedSample {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    pub bytes: u64,
}

/// Per-download sample windows.
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    window_ms: i64,
    samples: HashMap<DownloadId, VecDeque<SpeedSample>>,
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW)
    }
}

impl SpeedTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis().min(i64::MAX as u128) as i64,
            samples: HashMap::new(),
        }
    }

    /// Add a sample and return the averaged rate in bytes per second.
    ///
    /// Samples older than `now - window` are evicted first. Returns `None`
    /// with fewer than two samples left, or when time or bytes did not move
    /// forward between the oldest and newest sample.
    pub fn record_rate(&mut self, id: DownloadId, bytes_downloaded: u64, now_ms: i64) -> Option<u64> {
        let window = self.window_ms;
        let samples = self.samples.entry(id).or_default();
        samples.push_back(SpeedSample {
            timestamp_ms: now_ms,
            bytes: bytes_downloaded,
        });
        samples.retain(|s| now_ms - s.timestamp_ms <= window);

        if samples.len() < 2 {
            return None;
        }
        let oldest = samples.front()?;
        let newest = samples.back()?;

        let elapsed = newest.timestamp_ms - oldest.timestamp_ms;
        if elapsed <= 0 || newest.bytes <= oldest.bytes {
            return None;
        }
        let delta = newest.bytes - oldest.bytes;
        Some(delta.saturating_mul(1000) / elapsed as u64)
    }

    /// Add a sample and return a formatted rate, or an empty string.
    pub fn record(&mut self, id: DownloadId, bytes_downloaded: u64, now_ms: i64) -> String {
        self.record_rate(id, bytes_downloaded, now_ms)
            .map(format_rate)
            .unwrap_or_default()
    }

    /// Drop all samples for a download, e.g. once it stops running.
    pub fn forget(&mut self, id: DownloadId) {
        self.samples.remove(&id);
    }

    /// Number of samples currently held for a download.
    pub fn sample_count(&self, id: DownloadId) -> usize {
        self.samples.get(&id).map_or(0, VecDeque::len)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
