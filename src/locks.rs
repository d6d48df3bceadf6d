// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! The record set lives behind a `std::sync::RwLock` whose critical sections
//! are short and never span an `.await`. If a task panics while holding the
//! guard, the record set may be half-updated, but the next full reload
//! replaces it wholesale, so we log and keep going instead of propagating the
//! panic into every later reader.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read guard, recovering the data if the lock was poisoned.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "dlsync::locks",
            "record lock poisoned during read; continuing with last written state"
        );
        poisoned.into_inner()
    })
}

/// Acquire a write guard, recovering the data if the lock was poisoned.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "dlsync::locks",
            "record lock poisoned during write; continuing with last written state"
        );
        poisoned.into_inner()
    })
}

/// Mutex flavour of [`resilient_write`], used for small bookkeeping state.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        tracing::error!(target: "dlsync::locks", "mutex poisoned; recovering");
        poisoned.into_inner()
    })
}
