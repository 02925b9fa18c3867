//! Change feed for cluster objects.
//!
//! Every committed cluster write is appended to a bounded in-memory history
//! and broadcast to live subscribers. A subscriber opened from a cursor first
//! replays the retained history after that cursor and then follows the live
//! broadcast. When the cursor predates the retained history, or a subscriber
//! falls too far behind, the feed yields a single `Error` event with code 410
//! and ends; the caller must re-list.

use std::collections::VecDeque;

use tokio::sync::broadcast;
use tracing::debug;

use crate::types::Db;

/// HTTP-style status carried by a feed error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchStatus {
    pub code: u16,
    pub message: String,
}

impl WatchStatus {
    /// The cursor has expired and a re-list is required.
    pub const GONE: u16 = 410;

    pub fn gone(message: impl Into<String>) -> Self {
        Self {
            code: Self::GONE,
            message: message.into(),
        }
    }

    pub fn is_gone(&self) -> bool {
        self.code == Self::GONE
    }
}

/// One change-feed event. The object carries the revision of the change in
/// `metadata.resource_version`.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Db),
    Modified(Db),
    Deleted(Db),
    Error(WatchStatus),
}

impl WatchEvent {
    pub fn revision(&self) -> Option<u64> {
        match self {
            WatchEvent::Added(db) | WatchEvent::Modified(db) | WatchEvent::Deleted(db) => {
                Some(db.metadata.resource_version)
            }
            WatchEvent::Error(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FeedEntry {
    revision: u64,
    event: WatchEvent,
}

/// History and broadcast state. Always accessed under the store's write lock
/// so publication order equals commit order.
pub(crate) struct Feed {
    tx: broadcast::Sender<FeedEntry>,
    history: VecDeque<FeedEntry>,
    capacity: usize,
    /// Highest revision no longer covered by `history`.
    compacted: u64,
    /// Last committed revision.
    pub(crate) revision: u64,
}

impl Feed {
    pub(crate) fn new(capacity: usize, revision: u64) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            history: VecDeque::with_capacity(capacity),
            capacity,
            // Nothing before the opening revision is replayable.
            compacted: revision,
            revision,
        }
    }

    pub(crate) fn publish(&mut self, revision: u64, event: WatchEvent) {
        let entry = FeedEntry { revision, event };
        if self.history.len() == self.capacity {
            if let Some(evicted) = self.history.pop_front() {
                self.compacted = evicted.revision;
            }
        }
        self.history.push_back(entry.clone());
        // No receivers is fine.
        let _ = self.tx.send(entry);
    }

    /// Drop all retained history and close every open subscription.
    pub(crate) fn compact(&mut self) {
        self.history.clear();
        self.compacted = self.revision;
        let (tx, _) = broadcast::channel(self.capacity);
        self.tx = tx;
        debug!(revision = self.revision, "change feed compacted");
    }

    pub(crate) fn subscribe(&self, from: u64) -> DbWatch {
        if from < self.compacted {
            debug!(from, compacted = self.compacted, "watch cursor expired");
            return DbWatch {
                backlog: VecDeque::from([WatchEvent::Error(WatchStatus::gone(format!(
                    "resource version {from} is older than {}",
                    self.compacted
                )))]),
                rx: None,
                last: from,
            };
        }
        let backlog: VecDeque<WatchEvent> = self
            .history
            .iter()
            .filter(|e| e.revision > from)
            .map(|e| e.event.clone())
            .collect();
        let last = self
            .history
            .back()
            .map(|e| e.revision)
            .unwrap_or(from)
            .max(from);
        DbWatch {
            backlog,
            rx: Some(self.tx.subscribe()),
            last,
        }
    }
}

/// A subscription to the cluster change feed.
pub struct DbWatch {
    backlog: VecDeque<WatchEvent>,
    rx: Option<broadcast::Receiver<FeedEntry>>,
    last: u64,
}

impl DbWatch {
    /// Next event, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(entry) => {
                    if entry.revision <= self.last {
                        continue;
                    }
                    self.last = entry.revision;
                    return Some(entry.event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.rx = None;
                    return Some(WatchEvent::Error(WatchStatus::gone(format!(
                        "watcher fell behind by {skipped} events"
                    ))));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}
