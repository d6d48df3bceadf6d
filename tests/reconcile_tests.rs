// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reconciliation tests for dlsync
//!
//! Exercise the engine and session controller against in-memory and
//! file-backed queues, including overlapping reloads.
//!
//! # Test Categories
//!
//! - Full reload convergence and stale purge
//! - Generation supersession with slow queries and paced rows
//! - Orphan detection without explicit marking
//! - Session routing end to end

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use dlsync::download::types::path_to_local_uri;
use dlsync::download::{
    DownloadId, DownloadQueue, DownloadStatus, EnqueueRequest, JsonQueue, MemoryQueue,
    PacingConfig, QueryFilter, QueueError, QueuePoller, QueueRow, ReconciliationEngine,
    ReloadOutcome, SessionConfig, SessionController, SpeedTracker,
};

const TEST_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// MOCK QUEUE
// =============================================================================

/// Queue whose queries take a configurable time, one delay per call.
struct DelayedQueue {
    inner: MemoryQueue,
    delays: Mutex<VecDeque<Duration>>,
}

impl DelayedQueue {
    fn new(inner: MemoryQueue) -> Self {
        Self {
            inner,
            delays: Mutex::new(VecDeque::new()),
        }
    }

    fn push_delay(&self, delay: Duration) {
        self.delays.lock().unwrap().push_back(delay);
    }
}

impl DownloadQueue for DelayedQueue {
    fn query(&self, filter: &QueryFilter) -> Result<Vec<QueueRow>, QueueError> {
        let delay = self.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.inner.query(filter)
    }

    fn enqueue(&self, request: EnqueueRequest) -> Result<DownloadId, QueueError> {
        self.inner.enqueue(request)
    }

    fn remove(&self, id: DownloadId) -> Result<usize, QueueError> {
        self.inner.remove(id)
    }
}

fn pending(queue: &MemoryQueue, ids: &[u64]) {
    for id in ids {
        queue.insert(QueueRow::pending(DownloadId(*id), format!("https://host/{}.bin", id)));
    }
}

fn ids(engine: &ReconciliationEngine) -> Vec<u64> {
    engine.ids().into_iter().map(|id| id.0).collect()
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// =============================================================================
// FULL RELOAD
// =============================================================================

#[tokio::test]
async fn test_reload_twice_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("done.bin");
    std::fs::write(&file, b"done").unwrap();

    let queue = Arc::new(MemoryQueue::new());
    pending(&queue, &[1, 2]);
    queue.insert(QueueRow::successful(DownloadId(3), path_to_local_uri(&file), 4));
    queue.update(DownloadId(2), |r| r.status = DownloadStatus::Failed);

    let engine = ReconciliationEngine::new(queue.clone(), PacingConfig::immediate());
    engine.full_reload().await;
    let first_records = engine.current_records();
    let first_flags = engine.current_flags();

    let outcome = engine.full_reload().await;
    assert_eq!(outcome, ReloadOutcome::Completed { records: 3, purged: 0 });
    assert_eq!(engine.current_records(), first_records);
    assert_eq!(engine.current_flags(), first_flags);
    assert!(first_flags.has_any);
    assert!(first_flags.has_failed_or_orphaned);
    assert!(first_flags.has_removable_preserving_file);
}

#[tokio::test]
async fn test_reload_purges_entries_missing_from_queue() {
    let queue = Arc::new(MemoryQueue::new());
    pending(&queue, &[1, 2, 3]);
    let engine = ReconciliationEngine::new(queue.clone(), PacingConfig::immediate());
    engine.full_reload().await;
    assert_eq!(ids(&engine), vec![1, 2, 3]);

    queue.remove(DownloadId(2)).unwrap();
    let outcome = engine.full_reload().await;
    assert_eq!(outcome, ReloadOutcome::Completed { records: 2, purged: 1 });
    assert_eq!(ids(&engine), vec![1, 3]);
}

#[tokio::test]
async fn test_paced_reload_reports_progress() {
    let queue = Arc::new(MemoryQueue::new());
    pending(&queue, &[1, 2, 3, 4]);
    let pacing = PacingConfig {
        step: Duration::from_millis(20),
        max: Duration::from_millis(20),
    };
    let engine = Arc::new(ReconciliationEngine::new(queue.clone(), pacing));

    let mut snapshots = engine.subscribe();
    let reload = tokio::spawn({
        let engine = engine.clone();
        async move { engine.full_reload().await }
    });

    let mut saw_partial = false;
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if let Some((done, total)) = snapshot.progress {
            assert_eq!(total.max(4), 4);
            assert!(done <= 4);
            if done > 0 && done < 4 {
                saw_partial = true;
            }
        } else if snapshot.records.len() == 4 {
            break;
        }
    }

    assert_eq!(
        timeout(Duration::from_secs(TEST_TIMEOUT_SECS), reload).await.unwrap().unwrap(),
        ReloadOutcome::Completed { records: 4, purged: 0 }
    );
    assert!(saw_partial);
    assert!(!engine.is_reconciling());
}

// =============================================================================
// GENERATION SUPERSESSION
// =============================================================================

#[tokio::test]
async fn test_slow_first_reload_is_superseded() {
    let memory = MemoryQueue::new();
    pending(&memory, &[1, 2, 3]);
    let queue = Arc::new(DelayedQueue::new(memory));
    queue.push_delay(Duration::from_millis(300));

    let engine = Arc::new(ReconciliationEngine::new(queue.clone(), PacingConfig::immediate()));
    let g1 = tokio::spawn({
        let engine = engine.clone();
        async move { engine.full_reload().await }
    });

    // Let G1 get stuck in its query, then change the queue and start G2
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.inner.remove(DownloadId(1)).unwrap();
    queue.inner.remove(DownloadId(2)).unwrap();
    pending(&queue.inner, &[7]);

    let g2 = engine.full_reload().await;
    assert_eq!(g2, ReloadOutcome::Completed { records: 2, purged: 0 });
    let after_g2 = engine.current_records();
    let generation = engine.generation();

    let g1 = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), g1).await.unwrap().unwrap();
    assert_eq!(g1, ReloadOutcome::Superseded);
    assert_eq!(ids(&engine), vec![3, 7]);
    assert_eq!(engine.current_records(), after_g2);
    assert_eq!(engine.generation(), generation);
}

#[tokio::test]
async fn test_mid_pace_reload_is_superseded() {
    let queue = Arc::new(MemoryQueue::new());
    pending(&queue, &[1, 2, 3, 4, 5, 6]);
    let pacing = PacingConfig {
        step: Duration::from_millis(40),
        max: Duration::from_millis(40),
    };
    let engine = Arc::new(ReconciliationEngine::new(queue.clone(), pacing));

    let g1 = tokio::spawn({
        let engine = engine.clone();
        async move { engine.full_reload().await }
    });
    assert!(wait_for(|| engine.progress().is_some_and(|(done, _)| done >= 1)).await);

    for id in 1..=6 {
        queue.remove(DownloadId(id)).unwrap();
    }
    pending(&queue, &[10, 11]);

    let g2 = engine.full_reload().await;
    assert!(matches!(g2, ReloadOutcome::Completed { records: 2, .. }));

    let g1 = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), g1).await.unwrap().unwrap();
    assert_eq!(g1, ReloadOutcome::Superseded);

    // Give any stray G1 step a chance to run
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ids(&engine), vec![10, 11]);
    assert!(!engine.is_reconciling());
}

#[tokio::test]
async fn test_concurrent_reloads_converge() {
    let queue = Arc::new(MemoryQueue::new());
    pending(&queue, &[1, 2, 3, 4, 5]);
    let pacing = PacingConfig {
        step: Duration::from_millis(2),
        max: Duration::from_millis(5),
    };
    let engine = Arc::new(ReconciliationEngine::new(queue.clone(), pacing));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.full_reload().await }));
    }
    let mut completed = 0;
    for handle in handles {
        if let ReloadOutcome::Completed { .. } = handle.await.unwrap() {
            completed += 1;
        }
    }

    // Whichever reload finished last saw the whole queue
    assert!(completed >= 1);
    engine.full_reload().await;
    assert_eq!(ids(&engine), vec![1, 2, 3, 4, 5]);
}

// =============================================================================
// SPEED WINDOW
// =============================================================================

#[test]
fn test_speed_window_evicts_old_samples() {
    let mut tracker = SpeedTracker::default();
    let id = DownloadId(1);
    assert_eq!(tracker.record_rate(id, 0, 0), None);
    assert_eq!(tracker.record_rate(id, 1_000_000, 1_000), Some(1_000_000));
    assert_eq!(tracker.record_rate(id, 2_000_000, 11_000), Some(100_000));
    assert_eq!(tracker.sample_count(id), 2);
}

// =============================================================================
// ORPHAN DETECTION
// =============================================================================

#[tokio::test]
async fn test_deleted_file_shows_as_orphan_on_next_flags() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("movie.mkv");
    std::fs::write(&file, b"frames").unwrap();

    let queue = Arc::new(MemoryQueue::new());
    queue.insert(QueueRow::successful(DownloadId(1), path_to_local_uri(&file), 6));
    let engine = ReconciliationEngine::new(queue.clone(), PacingConfig::immediate());
    engine.full_reload().await;

    let flags = engine.current_flags();
    assert!(flags.has_removable_preserving_file);
    assert!(!flags.has_failed_or_orphaned);

    std::fs::remove_file(&file).unwrap();
    assert!(engine.record(DownloadId(1)).unwrap().is_orphaned());
    let flags = engine.refresh_flags();
    assert!(flags.has_failed_or_orphaned);
    assert!(!flags.has_removable_preserving_file);
}

// =============================================================================
// SESSION END TO END
// =============================================================================

fn fast_session(queue: Arc<MemoryQueue>) -> SessionController {
    let config = SessionConfig {
        pacing: PacingConfig::immediate(),
        progress_interval: Duration::from_millis(50),
        ..SessionConfig::default()
    };
    SessionController::new(queue.clone(), config)
        .with_channel(Arc::new(queue.changes().clone()))
        .with_channel(Arc::new(queue.completions().clone()))
}

#[tokio::test]
async fn test_session_tracks_queue_changes() {
    let queue = Arc::new(MemoryQueue::new());
    pending(&queue, &[1, 2]);
    let session = fast_session(queue.clone());
    session.start();
    assert!(wait_for(|| session.current_records().len() == 2).await);

    pending(&queue, &[3]);
    assert!(wait_for(|| session.current_records().len() == 3).await);

    queue.remove(DownloadId(1)).unwrap();
    assert!(wait_for(|| session.current_records().len() == 2).await);

    queue.update(DownloadId(2), |r| {
        r.status = DownloadStatus::Running;
        r.bytes_downloaded = 512;
        r.total_bytes = 1024;
    });
    assert!(
        wait_for(|| session
            .engine()
            .record(DownloadId(2))
            .is_some_and(|r| r.progress_percent() == Some(50)))
        .await
    );

    session.stop().await;
    assert!(!queue.changes().is_subscribed());
}

#[tokio::test]
async fn test_session_ignores_changes_after_stop() {
    let queue = Arc::new(MemoryQueue::new());
    pending(&queue, &[1]);
    let session = fast_session(queue.clone());
    session.start();
    assert!(wait_for(|| session.current_records().len() == 1).await);
    session.stop().await;

    pending(&queue, &[2]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.current_records().len(), 1);
}

#[tokio::test]
async fn test_polled_session_sees_entry_swapped_between_polls() {
    let queue = Arc::new(MemoryQueue::new());
    pending(&queue, &[1]);
    let config = SessionConfig {
        pacing: PacingConfig::immediate(),
        progress_interval: Duration::from_secs(60),
        ..SessionConfig::default()
    };
    let poller = QueuePoller::new(queue.clone(), Duration::from_millis(20));
    let session = SessionController::new(queue.clone(), config).with_channel(Arc::new(poller));
    session.start();
    assert!(wait_for(|| ids(session.engine()) == vec![1]).await);
    // Let the poller take its first snapshot
    tokio::time::sleep(Duration::from_millis(60)).await;

    queue.remove(DownloadId(1)).unwrap();
    pending(&queue, &[2]);

    assert!(wait_for(|| ids(session.engine()) == vec![2]).await);
    session.stop().await;
}

#[tokio::test]
async fn test_json_queue_session_sees_completion() {
    let dir = TempDir::new().unwrap();
    let downloads = dir.path().join("downloads");
    std::fs::create_dir_all(&downloads).unwrap();
    let queue = Arc::new(JsonQueue::open(dir.path().join("queue.json"), &downloads));

    let id = queue
        .enqueue(EnqueueRequest {
            uri: "https://host/paper.pdf".into(),
            title: None,
            destination_hint: None,
        })
        .unwrap();

    let session = SessionController::new(
        queue.clone(),
        SessionConfig {
            pacing: PacingConfig::immediate(),
            ..SessionConfig::default()
        },
    )
    .with_channel(Arc::new(queue.changes().clone()));
    session.start();
    assert!(wait_for(|| session.current_records().len() == 1).await);

    let file = downloads.join("paper.pdf");
    std::fs::write(&file, b"%PDF").unwrap();
    queue.mark_complete(id, &file).unwrap();

    assert!(
        wait_for(|| session
            .engine()
            .record(id)
            .is_some_and(|r| r.status == DownloadStatus::Successful && r.has_file()))
        .await
    );
    assert_eq!(session.engine().record(id).unwrap().title, "paper.pdf");
    session.stop().await;
}
