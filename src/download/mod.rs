// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download reconciliation for dlsync
//!
//! Mirrors an external download queue into a local record set and offers
//! removal operations the queue itself can't express safely:
//! - Paced full reloads, superseded by any newer reload
//! - Targeted single-record refreshes driven by change notifications
//! - Remove-entry-keep-file, synthesized around a remove that always deletes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ ChangeChannel(s)│────▶│ SessionController│
//! │ hub / poller    │     │ worker (tokio)  │
//! └─────────────────┘     └────────┬────────┘
//!                                  │ ChangeEventRouter
//!                                  ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ SafeRemoval     │────▶│ Reconciliation  │
//! │ Service         │     │ Engine          │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌───────────────────────────────────────────┐
//! │ DownloadQueue (JsonQueue / MemoryQueue)   │
//! └───────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dlsync::download::{JsonQueue, SessionConfig, SessionController, QueuePoller};
//!
//! # async fn example() {
//! let queue = Arc::new(JsonQueue::open("/tmp/queue.json", "/tmp/downloads"));
//! let poller = Arc::new(QueuePoller::new(queue.clone(), std::time::Duration::from_millis(500)));
//! let session = SessionController::new(queue, SessionConfig::default()).with_channel(poller);
//!
//! session.start();
//! for record in session.current_records() {
//!     println!("{}: {}", record.id, session.status_line(&record));
//! }
//! session.stop().await;
//! # }
//! ```

pub mod engine;
pub mod events;
pub mod manager;
pub mod queue;
pub mod removal;
pub mod router;
pub mod speed;
pub mod state;
pub mod types;
pub mod watch;

// Re-export commonly used items
pub use engine::{EngineSnapshot, PacingConfig, ReconciliationEngine, ReloadOutcome, UpdateOutcome};
pub use events::{ChangeChannel, ChangeSignal, ChannelError, SignalHub};
pub use manager::{SessionCommand, SessionConfig, SessionController};
pub use queue::{DownloadQueue, EnqueueRequest, MemoryQueue, QueryFilter, QueueError, QueueRow};
pub use removal::{
    BatchReport, BatchSummary, FileOps, FollowUp, PreserveStrategy, RemovalError, RemovalOutcome,
    SafeRemovalService, StdFileOps, StrandedTemp,
};
pub use router::{ChangeEventRouter, RouteDecision};
pub use speed::SpeedTracker;
pub use state::JsonQueue;
pub use types::{AggregateFlags, DownloadId, DownloadRecord, DownloadStatus, RecordActions};
pub use watch::QueuePoller;
