// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Change Event Router: decides what a notification should trigger.
//!
//! A generic change is compared against the last known queue size: any
//! difference means entries appeared or disappeared, which only a full
//! reload can reconcile. An unchanged size with a known id is a progress
//! update for that one entry. Completions always refresh their entry.

use super::events::ChangeSignal;
use super::types::DownloadId;

/// What the session should do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    FullReload,
    UpdateOne(DownloadId),
    /// Nothing actionable
    Ignore,
    /// Session inactive; the signal is discarded
    Dropped,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeEventRouter {
    active: bool,
    last_known_count: Option<usize>,
}

impl ChangeEventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn last_known_count(&self) -> Option<usize> {
        self.last_known_count
    }

    /// Enter the active state. Always asks for a full reload so nothing that
    /// happened while inactive stays invisible.
    pub fn activate(&mut self, current_count: Option<usize>) -> RouteDecision {
        self.active = true;
        self.last_known_count = current_count;
        RouteDecision::FullReload
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Route one signal.
    ///
    /// `current_count` is the queue size read just now; `None` when the count
    /// query failed.
    pub fn route(&mut self, signal: &ChangeSignal, current_count: Option<usize>) -> RouteDecision {
        if !self.active {
            return RouteDecision::Dropped;
        }

        match signal {
            ChangeSignal::Completed { id } => RouteDecision::UpdateOne(*id),
            ChangeSignal::Changed { .. } => {
                let target = signal.target_id();
                let Some(current) = current_count else {
                    // Can't tell whether entries came or went; refresh only what we can name
                    return target.map_or(RouteDecision::Ignore, RouteDecision::UpdateOne);
                };
                let previous = self.last_known_count.replace(current);

                match previous {
                    Some(previous) if previous == current => {
                        target.map_or(RouteDecision::Ignore, RouteDecision::UpdateOne)
                    }
                    _ => RouteDecision::FullReload,
                }
            }
        }
    }
}
