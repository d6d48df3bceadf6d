// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! dlsync - download list reconciliation library
//!
//! Keeps a local view of an external download queue up to date and removes
//! entries without losing files the user wants to keep.
//!
//! # Core Modules
//!
//! - [`download`] - Reconciliation engine, change routing, safe removal
//! - [`config`] - Settings loaded from `~/.dlsync/config.json`
//! - [`error`] - User-facing failure reports
//! - [`locks`] - Poison-tolerant lock helpers

pub mod config;
pub mod download;
pub mod error;
pub mod locks;
pub mod utils;

pub use config::Config;

pub use download::{
    AggregateFlags, BatchSummary, ChangeSignal, DownloadId, DownloadQueue, DownloadRecord,
    DownloadStatus, JsonQueue, MemoryQueue, ReconciliationEngine, RemovalError, RemovalOutcome,
    SafeRemovalService, SessionConfig, SessionController,
};

pub use error::ErrorBuilder;
pub use utils::{format_rate, format_size};
