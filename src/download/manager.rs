// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session controller: wires notification channels, the router and the
//! engine together for as long as a monitoring session is active.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::engine::{EngineSnapshot, PacingConfig, ReconciliationEngine, ReloadOutcome};
use super::events::{ChangeChannel, ChangeSignal};
use super::queue::{DownloadQueue, EnqueueRequest, QueueError};
use super::removal::{
    find_stranded_temps, BatchReport, FileOps, FollowUp, RemovalError, RemovalOutcome,
    SafeRemovalService, StrandedTemp,
};
use super::router::{ChangeEventRouter, RouteDecision};
use super::speed::DEFAULT_SPEED_WINDOW;
use super::types::{AggregateFlags, DownloadId, DownloadRecord, RecordActions};
use crate::locks::resilient_lock;

/// Commands that can be sent to the session worker.
#[derive(Debug)]
pub enum SessionCommand {
    /// Run a full reload now
    Refresh,
    /// Stop the worker
    Shutdown,
}

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub pacing: PacingConfig,
    pub speed_window: Duration,
    /// How often active downloads are re-read
    pub progress_interval: Duration,
    /// Where copy-fallback scratch files go
    pub scratch_dir: Option<PathBuf>,
    /// Directories scanned for stranded temporary files at start
    pub scan_dirs: Vec<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pacing: PacingConfig::default(),
            speed_window: DEFAULT_SPEED_WINDOW,
            progress_interval: Duration::from_secs(1),
            scratch_dir: None,
            scan_dirs: Vec::new(),
        }
    }
}

/// Controller for one monitoring session.
///
/// Owns the engine and removal service, and runs a background worker
/// between [`start`](Self::start) and [`stop`](Self::stop).
pub struct SessionController {
    engine: Arc<ReconciliationEngine>,
    removal: Arc<SafeRemovalService>,
    channels: Vec<Arc<dyn ChangeChannel>>,
    config: SessionConfig,
    command_tx: Mutex<Option<mpsc::Sender<SessionCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(queue: Arc<dyn DownloadQueue>, config: SessionConfig) -> Self {
        let engine = ReconciliationEngine::new(Arc::clone(&queue), config.pacing)
            .with_speed_window(config.speed_window);
        let mut removal = SafeRemovalService::new(queue);
        if let Some(dir) = &config.scratch_dir {
            removal = removal.with_scratch_dir(dir);
        }
        Self {
            engine: Arc::new(engine),
            removal: Arc::new(removal),
            channels: Vec::new(),
            config,
            command_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Attach a notification channel. Subscribed on start.
    pub fn with_channel(mut self, channel: Arc<dyn ChangeChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn with_file_ops(mut self, ops: Arc<dyn FileOps>) -> Self {
        let removal = SafeRemovalService::new(Arc::clone(self.engine.queue())).with_file_ops(ops);
        self.removal = Arc::new(match &self.config.scratch_dir {
            Some(dir) => removal.with_scratch_dir(dir),
            None => removal,
        });
        self
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        resilient_lock(&self.worker)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Begin monitoring and trigger the initial full reload.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut worker = resilient_lock(&self.worker);
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("session already running");
            return;
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        for channel in &self.channels {
            match channel.subscribe(signal_tx.clone()) {
                Ok(()) => debug!(channel = channel.name(), "subscribed"),
                Err(e) => warn!(channel = channel.name(), error = %e, "subscribe failed"),
            }
        }

        let (command_tx, command_rx) = mpsc::channel(16);
        *resilient_lock(&self.command_tx) = Some(command_tx);

        let engine = Arc::clone(&self.engine);
        let interval = self.config.progress_interval;
        let scan_dirs = self.config.scan_dirs.clone();
        *worker = Some(tokio::spawn(async move {
            report_stranded(scan_dirs).await;
            Self::worker_loop(engine, signal_tx, signal_rx, command_rx, interval).await;
        }));
        info!(channels = self.channels.len(), "download session started");
    }

    /// End monitoring. Reloads still in flight are aborted.
    pub async fn stop(&self) {
        let command_tx = resilient_lock(&self.command_tx).take();
        if let Some(tx) = command_tx {
            let _ = tx.send(SessionCommand::Shutdown).await;
        }

        let handle = resilient_lock(&self.worker).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "session worker ended abnormally");
                }
            }
        }

        for channel in &self.channels {
            if let Err(e) = channel.unsubscribe() {
                warn!(channel = channel.name(), error = %e, "unsubscribe failed");
            }
        }
        info!("download session stopped");
    }

    /// Ask the worker for a full reload.
    pub async fn refresh(&self) -> bool {
        let command_tx = resilient_lock(&self.command_tx).clone();
        match command_tx {
            Some(tx) => tx.send(SessionCommand::Refresh).await.is_ok(),
            None => false,
        }
    }

    pub fn current_records(&self) -> Vec<DownloadRecord> {
        self.engine.current_records()
    }

    pub fn current_flags(&self) -> AggregateFlags {
        self.engine.current_flags()
    }

    pub fn is_reconciling(&self) -> bool {
        self.engine.is_reconciling()
    }

    pub fn progress(&self) -> Option<(usize, usize)> {
        self.engine.progress()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.engine.subscribe()
    }

    /// Status line for one record, including its transfer rate.
    pub fn status_line(&self, record: &DownloadRecord) -> String {
        let speed = self.engine.speed_label(record.id).unwrap_or_default();
        record.status_line(&speed)
    }

    /// Actions the presentation layer may offer for a record.
    pub fn actions(&self, id: DownloadId) -> Option<RecordActions> {
        let record = self.engine.record(id)?;
        let ops = self.removal.file_ops();
        let (can_read, can_write) = match record.local_path() {
            Some(path) => (ops.can_read(&path), ops.can_write(&path)),
            None => (false, false),
        };
        Some(RecordActions::for_record(&record, can_read, can_write))
    }

    async fn run_removal<T, F>(&self, f: F) -> Result<T, RemovalError>
    where
        T: Send + 'static,
        F: FnOnce(&SafeRemovalService) -> Result<T, RemovalError> + Send + 'static,
    {
        let removal = Arc::clone(&self.removal);
        tokio::task::spawn_blocking(move || f(&removal))
            .await
            .map_err(|e| RemovalError::Task(e.to_string()))?
    }

    async fn follow_up(&self, id: DownloadId, follow_up: FollowUp) {
        match follow_up {
            FollowUp::RemoveRecord => {
                self.engine.remove_record(id);
            }
            FollowUp::UpdateOne => {
                self.engine.update_one(id).await;
            }
        }
    }

    /// Bring the record set in line with what a removal did to the queue.
    async fn settle(
        &self,
        id: DownloadId,
        result: Result<RemovalOutcome, RemovalError>,
    ) -> Result<RemovalOutcome, RemovalError> {
        match result {
            Ok(outcome) => {
                self.follow_up(id, outcome.follow_up()).await;
                Ok(outcome)
            }
            Err(e) => {
                if let Some(follow_up) = e.follow_up() {
                    self.follow_up(id, follow_up).await;
                }
                Err(e)
            }
        }
    }

    pub async fn request_remove_and_delete(
        &self,
        id: DownloadId,
    ) -> Result<RemovalOutcome, RemovalError> {
        let result = self.run_removal(move |s| s.remove_and_delete(id)).await;
        self.settle(id, result).await
    }

    pub async fn request_remove_and_keep(
        &self,
        id: DownloadId,
    ) -> Result<RemovalOutcome, RemovalError> {
        let result = self.run_removal(move |s| s.remove_and_keep(id)).await;
        self.settle(id, result).await
    }

    pub async fn request_delete_file_only(
        &self,
        id: DownloadId,
    ) -> Result<RemovalOutcome, RemovalError> {
        let result = self.run_removal(move |s| s.delete_file_only(id)).await;
        self.settle(id, result).await
    }

    async fn after_batch(&self, report: BatchReport) -> BatchReport {
        self.engine.full_reload().await;
        report
    }

    /// Remove every entry, optionally keeping files on disk.
    pub async fn request_remove_all(&self, keep_files: bool) -> Result<BatchReport, RemovalError> {
        let report = self.run_removal(move |s| s.remove_all(keep_files)).await?;
        Ok(self.after_batch(report).await)
    }

    /// Remove failed and orphaned entries.
    pub async fn request_clean(&self) -> Result<BatchReport, RemovalError> {
        let report = self.run_removal(|s| s.clean()).await?;
        Ok(self.after_batch(report).await)
    }

    /// Remove finished entries, keeping completed files.
    pub async fn request_clear(&self) -> Result<BatchReport, RemovalError> {
        let report = self.run_removal(|s| s.clear_finished()).await?;
        Ok(self.after_batch(report).await)
    }

    /// Queue a failed or orphaned download again from its source URL.
    ///
    /// Orphaned entries that would produce the same file name are removed
    /// first so the list doesn't fill up with dead duplicates.
    pub async fn redownload(&self, id: DownloadId) -> Result<DownloadId, RemovalError> {
        let record = match self.engine.record(id) {
            Some(record) => record,
            None => {
                self.engine.update_one(id).await;
                self.engine
                    .record(id)
                    .ok_or_else(|| RemovalError::PreconditionFailed {
                        id,
                        reason: "no such download".into(),
                    })?
            }
        };
        let uri = record
            .original_uri
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| RemovalError::PreconditionFailed {
                id,
                reason: "no source URL to download from".into(),
            })?;

        let file_name = record.file_name();
        let title = record.title.clone();
        let new_id = self
            .run_removal(move |s| {
                if let Some(name) = &file_name {
                    s.remove_orphans_named(name)?;
                }
                let request = EnqueueRequest {
                    uri,
                    title: Some(title),
                    destination_hint: file_name,
                };
                Ok(s.queue().enqueue(request)?)
            })
            .await?;

        info!(%id, %new_id, "download queued again");
        self.engine.full_reload().await;
        Ok(new_id)
    }

    pub async fn resolve_file_uri(&self, id: DownloadId) -> Result<Option<String>, QueueError> {
        let queue = Arc::clone(self.engine.queue());
        tokio::task::spawn_blocking(move || queue.resolve_file_uri(id))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
    }

    pub async fn resolve_mime_type(&self, id: DownloadId) -> Result<Option<String>, QueueError> {
        let queue = Arc::clone(self.engine.queue());
        tokio::task::spawn_blocking(move || queue.resolve_mime_type(id))
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
    }

    /// Background loop routing signals to engine operations.
    async fn worker_loop(
        engine: Arc<ReconciliationEngine>,
        // Held so the signal channel stays open even with no channels attached
        _signal_tx: mpsc::UnboundedSender<ChangeSignal>,
        mut signals: mpsc::UnboundedReceiver<ChangeSignal>,
        mut commands: mpsc::Receiver<SessionCommand>,
        progress_interval: Duration,
    ) {
        let mut router = ChangeEventRouter::new();
        let mut tasks: JoinSet<()> = JoinSet::new();

        let count = current_count(&engine).await;
        let initial = router.activate(count);
        dispatch(&engine, &mut tasks, initial);

        let mut ticker = tokio::time::interval(progress_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                Some(signal) = signals.recv() => {
                    let count = current_count(&engine).await;
                    let decision = router.route(&signal, count);
                    debug!(?signal, ?decision, "routed change signal");
                    dispatch(&engine, &mut tasks, decision);
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(SessionCommand::Refresh) => {
                            dispatch(&engine, &mut tasks, RouteDecision::FullReload);
                        }
                        Some(SessionCommand::Shutdown) | None => break,
                    }
                }
                _ = ticker.tick() => {
                    if !engine.is_reconciling() {
                        for id in engine.active_ids() {
                            dispatch(&engine, &mut tasks, RouteDecision::UpdateOne(id));
                        }
                    }
                }
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            warn!(error = %e, "reconciliation task failed");
                        }
                    }
                }
            }
        }

        router.deactivate();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

fn dispatch(engine: &Arc<ReconciliationEngine>, tasks: &mut JoinSet<()>, decision: RouteDecision) {
    let engine = Arc::clone(engine);
    match decision {
        RouteDecision::FullReload => {
            tasks.spawn(async move {
                if let ReloadOutcome::Superseded = engine.full_reload().await {
                    debug!("reload superseded by a newer one");
                }
            });
        }
        RouteDecision::UpdateOne(id) => {
            tasks.spawn(async move {
                engine.update_one(id).await;
            });
        }
        RouteDecision::Ignore | RouteDecision::Dropped => {}
    }
}

async fn current_count(engine: &ReconciliationEngine) -> Option<usize> {
    let queue = Arc::clone(engine.queue());
    match tokio::task::spawn_blocking(move || queue.count()).await {
        Ok(Ok(count)) => Some(count),
        Ok(Err(e)) => {
            debug!(error = %e, "count query failed");
            None
        }
        Err(_) => None,
    }
}

async fn report_stranded(dirs: Vec<PathBuf>) {
    let found = tokio::task::spawn_blocking(move || {
        let mut found: Vec<StrandedTemp> = Vec::new();
        for dir in &dirs {
            match find_stranded_temps(dir) {
                Ok(mut entries) => found.append(&mut entries),
                Err(e) => debug!(dir = %dir.display(), error = %e, "temp scan skipped"),
            }
        }
        found
    })
    .await
    .unwrap_or_default();

    for stranded in &found {
        warn!(
            temp = %stranded.temp_path.display(),
            original = %stranded.original_path.display(),
            "found file stranded under a temporary name; `dlsync recover` restores it"
        );
    }
}
