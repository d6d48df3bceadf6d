// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Change notifications coming out of the external queue's environment.
//!
//! Two independent channels exist: a generic "something changed" signal
//! that may name the affected entry, and a completion signal that always
//! carries an id. Both publish onto one unbounded channel that the session
//! worker drains.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use super::types::DownloadId;
use crate::locks::resilient_lock;

/// Base content URI used when a change names a specific entry.
pub const DOWNLOADS_CONTENT_URI: &str = "content://downloads/my_downloads";

/// A notification from one of the two channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSignal {
    /// Generic change; `affected_uri` may or may not identify an entry.
    Changed {
        self_change: bool,
        affected_uri: Option<String>,
        flags: u32,
    },
    /// A download finished (successfully or not).
    Completed { id: DownloadId },
}

impl ChangeSignal {
    /// Generic change naming a specific entry.
    pub fn changed(id: DownloadId) -> Self {
        ChangeSignal::Changed {
            self_change: false,
            affected_uri: Some(content_uri_for(id)),
            flags: 0,
        }
    }

    /// Generic change with no usable id.
    pub fn changed_any() -> Self {
        ChangeSignal::Changed {
            self_change: false,
            affected_uri: None,
            flags: 0,
        }
    }

    /// The entry this signal is about, if it can be determined.
    pub fn target_id(&self) -> Option<DownloadId> {
        match self {
            ChangeSignal::Changed { affected_uri, .. } => {
                affected_uri.as_deref().and_then(id_from_uri)
            }
            ChangeSignal::Completed { id } => Some(*id),
        }
    }
}

/// Content URI for one entry.
pub fn content_uri_for(id: DownloadId) -> String {
    format!("{}/{}", DOWNLOADS_CONTENT_URI, id)
}

/// Extract a trailing numeric id from an affected URI.
///
/// `content://downloads/my_downloads/42` yields 42; a URI naming the whole
/// table yields `None`.
pub fn id_from_uri(uri: &str) -> Option<DownloadId> {
    let url = Url::parse(uri).ok()?;
    let last = url.path_segments()?.rev().find(|s| !s.is_empty())?;
    if !last.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    last.parse().ok()
}

pub type SignalSink = mpsc::UnboundedSender<ChangeSignal>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel '{0}' has no active subscription")]
    NotSubscribed(String),
    #[error("channel '{name}' failed: {reason}")]
    Failed { name: String, reason: String },
}

/// A notification source the session can attach to and detach from.
pub trait ChangeChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Start delivering signals to `sink`.
    fn subscribe(&self, sink: SignalSink) -> Result<(), ChannelError>;

    /// Stop delivering signals.
    fn unsubscribe(&self) -> Result<(), ChannelError>;
}

/// Broadcast-style channel that forwards emitted signals to its current
/// subscriber, dropping them when nobody is listening.
#[derive(Clone)]
pub struct SignalHub {
    name: String,
    sink: Arc<Mutex<Option<SignalSink>>>,
}

impl SignalHub {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sink: Arc::new(Mutex::new(None)),
        }
    }

    /// Deliver a signal. Returns false when it was dropped.
    pub fn emit(&self, signal: ChangeSignal) -> bool {
        let mut guard = resilient_lock(&self.sink);
        match guard.as_ref() {
            Some(sink) => {
                if sink.send(signal).is_ok() {
                    true
                } else {
                    // Receiver went away without unsubscribing
                    *guard = None;
                    false
                }
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        resilient_lock(&self.sink).is_some()
    }
}

impl std::fmt::Debug for SignalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHub")
            .field("name", &self.name)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl ChangeChannel for SignalHub {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&self, sink: SignalSink) -> Result<(), ChannelError> {
        *resilient_lock(&self.sink) = Some(sink);
        Ok(())
    }

    fn unsubscribe(&self) -> Result<(), ChannelError> {
        resilient_lock(&self.sink)
            .take()
            .map(|_| ())
            .ok_or_else(|| ChannelError::NotSubscribed(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_from_uri() {
        assert_eq!(id_from_uri("content://downloads/my_downloads/42"), Some(DownloadId(42)));
        assert_eq!(id_from_uri("content://downloads/my_downloads/42/"), Some(DownloadId(42)));
        assert_eq!(id_from_uri("content://downloads/my_downloads"), None);
        assert_eq!(id_from_uri("content://downloads/my_downloads/4x"), None);
        assert_eq!(id_from_uri("content://downloads/my_downloads/7?notify=1"), Some(DownloadId(7)));
        assert_eq!(id_from_uri("content://downloads"), None);
        assert_eq!(id_from_uri(""), None);
    }

    #[test]
    fn test_target_id() {
        assert_eq!(ChangeSignal::changed(DownloadId(3)).target_id(), Some(DownloadId(3)));
        assert_eq!(ChangeSignal::changed_any().target_id(), None);
        assert_eq!(
            ChangeSignal::Completed { id: DownloadId(9) }.target_id(),
            Some(DownloadId(9))
        );
    }

    #[test]
    fn test_hub_drops_without_subscriber() {
        let hub = SignalHub::new("changes");
        assert!(!hub.emit(ChangeSignal::changed_any()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(tx).unwrap();
        assert!(hub.emit(ChangeSignal::Completed { id: DownloadId(1) }));
        assert_eq!(rx.try_recv().ok(), Some(ChangeSignal::Completed { id: DownloadId(1) }));

        hub.unsubscribe().unwrap();
        assert!(!hub.emit(ChangeSignal::changed_any()));
        assert!(matches!(hub.unsubscribe(), Err(ChannelError::NotSubscribed(_))));
    }

    #[test]
    fn test_hub_forgets_closed_receiver() {
        let hub = SignalHub::new("completions");
        let (tx, rx) = mpsc::unbounded_channel();
        hub.subscribe(tx).unwrap();
        drop(rx);
        assert!(!hub.emit(ChangeSignal::changed_any()));
        assert!(!hub.is_subscribed());
    }
}
