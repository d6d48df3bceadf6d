// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Polling change source.
//!
//! A queue shared with other processes can change without telling us. The
//! poller re-reads the queue on a fixed cadence, diffs it against the last
//! read and publishes the same signals a push-based channel would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::events::{ChangeChannel, ChangeSignal, ChannelError, SignalSink};
use super::queue::{DownloadQueue, QueryFilter, QueueRow};
use super::types::DownloadId;
use crate::locks::resilient_lock;

/// Signals describing how `current` differs from `previous`.
///
/// A change in the number of entries yields one anonymous change. Rows that
/// changed in place are named individually, and rows that just reached a
/// terminal state also yield a completion. When the count is unchanged but
/// the set of ids is not, every arrival and every departure is named, since
/// an anonymous change with a stable count is not acted on.
pub fn diff_rows(
    previous: &HashMap<DownloadId, QueueRow>,
    current: &[QueueRow],
) -> Vec<ChangeSignal> {
    let mut signals = Vec::new();
    let same_size = previous.len() == current.len();
    if !same_size {
        signals.push(ChangeSignal::changed_any());
    }
    for row in current {
        match previous.get(&row.id) {
            Some(old) if old == row => {}
            Some(old) => {
                signals.push(ChangeSignal::changed(row.id));
                if !old.status.is_terminal() && row.status.is_terminal() {
                    signals.push(ChangeSignal::Completed { id: row.id });
                }
            }
            None if same_size => signals.push(ChangeSignal::changed(row.id)),
            None => {}
        }
    }
    if same_size {
        let present: HashSet<DownloadId> = current.iter().map(|r| r.id).collect();
        let mut gone: Vec<DownloadId> = previous
            .keys()
            .filter(|id| !present.contains(id))
            .copied()
            .collect();
        gone.sort();
        signals.extend(gone.into_iter().map(ChangeSignal::changed));
    }
    signals
}

/// Change channel that discovers changes by polling.
pub struct QueuePoller {
    name: String,
    queue: Arc<dyn DownloadQueue>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QueuePoller {
    pub fn new(queue: Arc<dyn DownloadQueue>, interval: Duration) -> Self {
        Self {
            name: "queue-poller".to_string(),
            queue,
            interval: interval.max(Duration::from_millis(10)),
            task: Mutex::new(None),
        }
    }

    async fn snapshot(queue: &Arc<dyn DownloadQueue>) -> Option<Vec<QueueRow>> {
        let queue = Arc::clone(queue);
        match tokio::task::spawn_blocking(move || queue.query(&QueryFilter::all())).await {
            Ok(Ok(rows)) => Some(rows),
            Ok(Err(e)) => {
                debug!(error = %e, "poll query failed");
                None
            }
            Err(_) => None,
        }
    }

    async fn poll_loop(queue: Arc<dyn DownloadQueue>, interval: Duration, sink: SignalSink) {
        let mut known: HashMap<DownloadId, QueueRow> = Self::snapshot(&queue)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|row| (row.id, row))
            .collect();

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(rows) = Self::snapshot(&queue).await else {
                continue;
            };
            let signals = diff_rows(&known, &rows);
            trace!(rows = rows.len(), signals = signals.len(), "polled queue");
            for signal in signals {
                if sink.send(signal).is_err() {
                    debug!("poll receiver closed");
                    return;
                }
            }
            known = rows.into_iter().map(|row| (row.id, row)).collect();
        }
    }
}

impl ChangeChannel for QueuePoller {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&self, sink: SignalSink) -> Result<(), ChannelError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| ChannelError::Failed {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        let task = handle.spawn(Self::poll_loop(Arc::clone(&self.queue), self.interval, sink));
        if let Some(previous) = resilient_lock(&self.task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn unsubscribe(&self) -> Result<(), ChannelError> {
        match resilient_lock(&self.task).take() {
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Err(ChannelError::NotSubscribed(self.name.clone())),
        }
    }
}
