// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reconciliation Engine.
//!
//! Keeps the local record set in step with the external queue. A full reload
//! walks the queue's rows one at a time with a short pause between them so
//! readers see partial progress; every step re-checks the generation it was
//! started with and quietly stops once a newer reload has begun. The
//! generation counter is the only cancellation mechanism.
//!
//! Single-record updates are not generation-gated. They may interleave with
//! a reload freely; the reload still purges anything it did not see.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::queue::{DownloadQueue, QueryFilter, QueueError, QueueRow};
use super::speed::SpeedTracker;
use super::types::{
    AggregateFlags, DownloadId, DownloadRecord, DownloadStatus, FlagAccumulator, FlagContribution,
};
use crate::locks::{resilient_read, resilient_write};
use crate::utils::now_millis;

/// Upper bound on snapshots published while rows are being applied.
const SNAPSHOTS_PER_RELOAD: usize = 32;

/// Delay schedule between rows of a full reload.
///
/// Row `i` waits `min(step * i, max)` before it is applied, so the first row
/// lands immediately and the pause grows until it hits the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub step: Duration,
    pub max: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(10),
            max: Duration::from_millis(100),
        }
    }
}

impl PacingConfig {
    /// No pauses at all.
    pub fn immediate() -> Self {
        Self {
            step: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, index: usize) -> Duration {
        let factor = u32::try_from(index).unwrap_or(u32::MAX);
        self.step.saturating_mul(factor).min(self.max)
    }
}

/// How a full reload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// All rows applied and stale records purged
    Completed { records: usize, purged: usize },
    /// The queue reported no entries
    Empty,
    /// The queue could not be read; treated as empty
    QueryFailed,
    /// A newer reload started; this one stopped without further changes
    Superseded,
}

/// How a single-record update ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Inserted,
    Updated,
    /// The queue no longer has the id; the record was dropped
    Removed,
    /// Neither the queue nor the record set knows the id
    Absent,
    QueryFailed,
}

/// What readers see after each change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSnapshot {
    pub records: Vec<DownloadRecord>,
    pub flags: AggregateFlags,
    /// `(processed, total)` while a reload is running
    pub progress: Option<(usize, usize)>,
    pub generation: u64,
}

/// Bookkeeping for one full reload.
#[derive(Debug)]
struct ReconciliationSession {
    generation: u64,
    expected_total: usize,
    processed_count: usize,
    seen_ids: HashSet<DownloadId>,
    /// Latest flag contribution of every seen id
    contributions: HashMap<DownloadId, FlagContribution>,
}

impl ReconciliationSession {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            expected_total: 0,
            processed_count: 0,
            seen_ids: HashSet::new(),
            contributions: HashMap::new(),
        }
    }

    /// Replace the contribution of an id this pass already applied.
    fn revise(&mut self, id: DownloadId, contribution: Option<FlagContribution>) {
        if !self.seen_ids.contains(&id) {
            return;
        }
        match contribution {
            Some(c) => {
                self.contributions.insert(id, c);
            }
            None => {
                self.contributions.remove(&id);
            }
        }
    }

    fn flags(&self) -> AggregateFlags {
        let mut acc = FlagAccumulator::default();
        for c in self.contributions.values() {
            acc.add(*c);
        }
        acc.finish()
    }

    /// Snapshot cadence while applying rows.
    fn should_publish(&self) -> bool {
        let stride = self.expected_total.div_ceil(SNAPSHOTS_PER_RELOAD).max(1);
        self.processed_count % stride == 0 || self.processed_count >= self.expected_total
    }
}

#[derive(Debug, Default)]
struct EngineState {
    records: IndexMap<DownloadId, DownloadRecord>,
    flags: AggregateFlags,
    session: Option<ReconciliationSession>,
    speed: SpeedTracker,
    speed_labels: HashMap<DownloadId, String>,
}

impl EngineState {
    /// Insert or overwrite a record, keeping its list position.
    fn upsert(&mut self, record: DownloadRecord) -> bool {
        let id = record.id;
        if record.status == DownloadStatus::Running {
            let label = self.speed.record(id, record.bytes_downloaded, now_millis());
            self.speed_labels.insert(id, label);
        } else {
            self.speed.forget(id);
            self.speed_labels.remove(&id);
        }
        self.records.insert(id, record).is_none()
    }

    fn drop_record(&mut self, id: DownloadId) -> bool {
        self.speed.forget(id);
        self.speed_labels.remove(&id);
        self.records.shift_remove(&id).is_some()
    }

    fn clear(&mut self) {
        self.records.clear();
        self.flags = AggregateFlags::default();
        self.speed.clear();
        self.speed_labels.clear();
    }

    fn recompute_flags(&mut self) {
        self.flags = AggregateFlags::compute(self.records.values());
    }

    fn snapshot(&self, generation: u64) -> EngineSnapshot {
        EngineSnapshot {
            records: self.records.values().cloned().collect(),
            flags: self.flags,
            progress: self
                .session
                .as_ref()
                .map(|s| (s.processed_count, s.expected_total)),
            generation,
        }
    }
}

/// Owns the record set and aggregate flags.
pub struct ReconciliationEngine {
    queue: Arc<dyn DownloadQueue>,
    pacing: PacingConfig,
    generation: AtomicU64,
    state: RwLock<EngineState>,
    snapshots: watch::Sender<EngineSnapshot>,
}

impl ReconciliationEngine {
    pub fn new(queue: Arc<dyn DownloadQueue>, pacing: PacingConfig) -> Self {
        let (snapshots, _rx) = watch::channel(EngineSnapshot::default());
        Self {
            queue,
            pacing,
            generation: AtomicU64::new(0),
            state: RwLock::new(EngineState::default()),
            snapshots,
        }
    }

    /// Averaging window for transfer rates.
    pub fn with_speed_window(self, window: Duration) -> Self {
        resilient_write(&self.state).speed = SpeedTracker::new(window);
        self
    }

    pub fn queue(&self) -> &Arc<dyn DownloadQueue> {
        &self.queue
    }

    /// Receive a snapshot after every change.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshots.subscribe()
    }

    /// Records in insertion order.
    pub fn current_records(&self) -> Vec<DownloadRecord> {
        resilient_read(&self.state).records.values().cloned().collect()
    }

    pub fn record(&self, id: DownloadId) -> Option<DownloadRecord> {
        resilient_read(&self.state).records.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<DownloadId> {
        resilient_read(&self.state).records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_flags(&self) -> AggregateFlags {
        resilient_read(&self.state).flags
    }

    pub fn is_reconciling(&self) -> bool {
        resilient_read(&self.state).session.is_some()
    }

    /// `(processed, total)` of the reload in flight.
    pub fn progress(&self) -> Option<(usize, usize)> {
        resilient_read(&self.state)
            .session
            .as_ref()
            .map(|s| (s.processed_count, s.expected_total))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Latest averaged transfer rate for a running download.
    pub fn speed_label(&self, id: DownloadId) -> Option<String> {
        resilient_read(&self.state)
            .speed_labels
            .get(&id)
            .filter(|s| !s.is_empty())
            .cloned()
    }

    /// Ids of records the queue may still change on its own.
    pub fn active_ids(&self) -> Vec<DownloadId> {
        resilient_read(&self.state)
            .records
            .values()
            .filter(|r| r.status.is_active())
            .map(|r| r.id)
            .collect()
    }

    fn publish(&self, state: &EngineState) {
        self.snapshots.send_replace(state.snapshot(self.generation()));
    }

    async fn query(&self, filter: QueryFilter) -> Result<Vec<QueueRow>, QueueError> {
        let queue = Arc::clone(&self.queue);
        tokio::task::spawn_blocking(move || queue.query(&filter))
            .await
            .map_err(|e| QueueError::Unavailable(format!("query task failed: {}", e)))?
    }

    /// Run `f` on the state only if `generation` is still the newest.
    fn with_current<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut EngineState) -> T,
    ) -> Option<T> {
        self.with_current_publishing(generation, |state| (f(state), true))
    }

    /// Like `with_current`, but `f` decides whether readers get a snapshot.
    fn with_current_publishing<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut EngineState) -> (T, bool),
    ) -> Option<T> {
        let mut state = resilient_write(&self.state);
        // Checked under the write lock so a step can't race past a newer reload
        if self.generation.load(Ordering::SeqCst) != generation {
            return None;
        }
        let (out, publish) = f(&mut state);
        if publish {
            self.publish(&state);
        }
        Some(out)
    }

    /// Rebuild the record set from a full query.
    ///
    /// Starting a reload invalidates any reload still in flight.
    pub async fn full_reload(&self) -> ReloadOutcome {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "full reload requested");

        if self
            .with_current(generation, |state| {
                state.session = Some(ReconciliationSession::new(generation));
            })
            .is_none()
        {
            return ReloadOutcome::Superseded;
        }

        let rows = match self.query(QueryFilter::all()).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(generation, error = %e, "download query failed; showing empty list");
                return self
                    .with_current(generation, |state| {
                        state.clear();
                        state.session = None;
                        ReloadOutcome::QueryFailed
                    })
                    .unwrap_or(ReloadOutcome::Superseded);
            }
        };

        if rows.is_empty() {
            return self
                .with_current(generation, |state| {
                    state.clear();
                    state.session = None;
                    ReloadOutcome::Empty
                })
                .unwrap_or(ReloadOutcome::Superseded);
        }

        let total = rows.len();
        if self
            .with_current(generation, |state| {
                if let Some(session) = state.session.as_mut() {
                    session.expected_total = total;
                }
            })
            .is_none()
        {
            debug!(generation, "superseded before processing rows");
            return ReloadOutcome::Superseded;
        }

        for (index, row) in rows.iter().enumerate() {
            let delay = self.pacing.delay_for(index);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let record = DownloadRecord::from_row(row);
            // Touches the filesystem, so keep it out of the lock
            let contribution = FlagContribution::of(&record);

            let applied = self.with_current_publishing(generation, |state| {
                let id = record.id;
                state.upsert(record);
                let Some(session) = state.session.as_mut() else {
                    return ((), true);
                };
                if session.seen_ids.insert(id) {
                    session.contributions.insert(id, contribution);
                }
                session.processed_count += 1;
                ((), session.should_publish())
            });
            if applied.is_none() {
                debug!(generation, processed = index, "superseded mid-reload");
                return ReloadOutcome::Superseded;
            }
        }

        let outcome = self.with_current(generation, |state| {
            let Some(session) = state.session.take() else {
                return ReloadOutcome::Completed {
                    records: state.records.len(),
                    purged: 0,
                };
            };
            let stale: Vec<DownloadId> = state
                .records
                .keys()
                .filter(|id| !session.seen_ids.contains(id))
                .copied()
                .collect();
            for id in &stale {
                state.drop_record(*id);
            }
            state.flags = session.flags();
            ReloadOutcome::Completed {
                records: state.records.len(),
                purged: stale.len(),
            }
        });

        match outcome {
            Some(outcome) => {
                info!(generation, ?outcome, "full reload finished");
                outcome
            }
            None => ReloadOutcome::Superseded,
        }
    }

    /// Refresh one record from the queue.
    pub async fn update_one(&self, id: DownloadId) -> UpdateOutcome {
        let rows = match self.query(QueryFilter::by_id(id)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(%id, error = %e, "single download query failed");
                return UpdateOutcome::QueryFailed;
            }
        };

        let record = rows
            .into_iter()
            .find(|r| r.id == id)
            .map(|row| DownloadRecord::from_row(&row));
        let contribution = record.as_ref().map(FlagContribution::of);

        let mut state = resilient_write(&self.state);
        // A reload in flight finalizes flags from its own tally
        if let Some(session) = state.session.as_mut() {
            session.revise(id, contribution);
        }
        let outcome = match record {
            Some(record) => {
                if state.upsert(record) {
                    UpdateOutcome::Inserted
                } else {
                    UpdateOutcome::Updated
                }
            }
            None => {
                if state.drop_record(id) {
                    UpdateOutcome::Removed
                } else {
                    UpdateOutcome::Absent
                }
            }
        };
        state.recompute_flags();
        self.publish(&state);
        debug!(%id, ?outcome, "single download refreshed");
        outcome
    }

    /// Drop a record after it was removed from the queue by us.
    pub fn remove_record(&self, id: DownloadId) -> bool {
        let mut state = resilient_write(&self.state);
        let removed = state.drop_record(id);
        state.recompute_flags();
        self.publish(&state);
        removed
    }

    /// Recompute flags from scratch, re-reading file existence.
    pub fn refresh_flags(&self) -> AggregateFlags {
        let mut state = resilient_write(&self.state);
        state.recompute_flags();
        self.publish(&state);
        state.flags
    }
}
