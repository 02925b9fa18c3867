//! Watch controller.
//!
//! Follows the cluster change feed and keeps a `name -> resource version`
//! table of everything it has seen.
//!
//! ```text
//!   Disconnected ──► Initializing ──► Watching ──┬──► Watching   (event / feed reopened)
//!                    (full list)                 └──► Resyncing  (410: re-list)
//!                                                      │ match ──► Watching
//!                                                      └ differ ─► Disconnected + Diverged
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use tidbop_state::{ClusterStore, WatchEvent};

use crate::error::WatchError;
use crate::locks::LockManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Disconnected,
    Initializing,
    Watching,
    Resyncing,
}

/// Receives every change the watch controller sees.
#[async_trait]
pub trait ClusterEventHandler: Send + Sync {
    async fn handle(&self, event: &WatchEvent);
}

/// Keeps the lock registry in step with the set of clusters.
pub struct LockBookkeeper {
    locks: LockManager,
}

impl LockBookkeeper {
    pub fn new(locks: LockManager) -> Self {
        Self { locks }
    }
}

#[async_trait]
impl ClusterEventHandler for LockBookkeeper {
    async fn handle(&self, event: &WatchEvent) {
        match event {
            WatchEvent::Added(db) => self.locks.register(&db.metadata.name),
            WatchEvent::Modified(db) => {
                debug!(cluster = %db.metadata.name, phase = ?db.phase(), "cluster modified");
            }
            WatchEvent::Deleted(db) => self.locks.recycle(&db.metadata.name),
            WatchEvent::Error(_) => {}
        }
    }
}

pub struct WatchController {
    store: ClusterStore,
    handler: Arc<dyn ClusterEventHandler>,
    ceiling: Duration,
    state: WatchState,
    known: BTreeMap<String, u64>,
    cursor: u64,
}

impl WatchController {
    pub fn new(store: ClusterStore, handler: Arc<dyn ClusterEventHandler>, ceiling: Duration) -> Self {
        Self {
            store,
            handler,
            ceiling,
            state: WatchState::Disconnected,
            known: BTreeMap::new(),
            cursor: 0,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn known(&self) -> &BTreeMap<String, u64> {
        &self.known
    }

    /// List every cluster, seed the cursor table and announce each cluster
    /// to the handler as added.
    pub async fn initialize(&mut self) -> Result<(), WatchError> {
        self.state = WatchState::Initializing;
        let list = self.store.list_dbs()?;
        self.known = list
            .items
            .iter()
            .map(|db| (db.metadata.name.clone(), db.metadata.resource_version))
            .collect();
        self.cursor = list.resource_version;
        for db in list.items {
            self.call_handler(&WatchEvent::Added(db)).await;
        }
        info!(clusters = self.known.len(), cursor = self.cursor, "watch initialized");
        Ok(())
    }

    /// Initialize, then follow the feed until shutdown.
    pub async fn run(&mut self, shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), WatchError> {
        self.initialize().await?;
        self.watch(shutdown).await
    }

    /// Follow the feed from the current cursor until shutdown or an
    /// unrecoverable divergence.
    pub async fn watch(
        &mut self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), WatchError> {
        loop {
            self.state = WatchState::Watching;
            let mut feed = self.store.watch(self.cursor);
            loop {
                let event = tokio::select! {
                    event = feed.next() => event,
                    _ = shutdown.changed() => {
                        info!(cursor = self.cursor, "watch shutting down");
                        self.state = WatchState::Disconnected;
                        return Ok(());
                    }
                };
                match event {
                    None => {
                        debug!(cursor = self.cursor, "change feed closed, reopening");
                        break;
                    }
                    Some(WatchEvent::Error(status)) if status.is_gone() => {
                        warn!(cursor = self.cursor, message = %status.message, "watch cursor expired");
                        self.resync()?;
                        break;
                    }
                    Some(WatchEvent::Error(status)) => {
                        error!(code = status.code, message = %status.message, "unexpected watch error");
                    }
                    Some(event) => self.dispatch(event).await,
                }
            }
        }
    }

    /// Re-list after a 410. Matching state resumes from the list cursor
    /// without dispatching anything; anything else ends the session.
    fn resync(&mut self) -> Result<(), WatchError> {
        self.state = WatchState::Resyncing;
        let list = self.store.list_dbs()?;
        let listed: BTreeMap<String, u64> = list
            .items
            .iter()
            .map(|db| (db.metadata.name.clone(), db.metadata.resource_version))
            .collect();
        if listed == self.known {
            info!(from = self.cursor, to = list.resource_version, "watch resynced");
            self.cursor = list.resource_version;
            return Ok(());
        }
        self.state = WatchState::Disconnected;
        let added: Vec<&String> = listed.keys().filter(|n| !self.known.contains_key(*n)).collect();
        let gone: Vec<&String> = self.known.keys().filter(|n| !listed.contains_key(*n)).collect();
        let changed: Vec<&String> = listed
            .iter()
            .filter(|(n, rv)| self.known.get(*n).is_some_and(|known| known != *rv))
            .map(|(n, _)| n)
            .collect();
        Err(WatchError::Diverged(format!(
            "added {added:?}, deleted {gone:?}, changed {changed:?}"
        )))
    }

    async fn dispatch(&mut self, event: WatchEvent) {
        let Some(revision) = event.revision() else {
            return;
        };
        match &event {
            WatchEvent::Added(db) => {
                self.known.insert(db.metadata.name.clone(), revision);
            }
            WatchEvent::Modified(db) => {
                let name = &db.metadata.name;
                if self.known.insert(name.clone(), revision).is_none() {
                    warn!(cluster = %name, "modified event for an unknown cluster, unsafe state");
                }
            }
            WatchEvent::Deleted(db) => {
                let name = &db.metadata.name;
                if self.known.remove(name).is_none() {
                    warn!(cluster = %name, "deleted event for an unknown cluster, unsafe state");
                }
            }
            WatchEvent::Error(_) => {}
        }
        self.cursor = revision;
        self.call_handler(&event).await;
    }

    /// Run the handler under the watchdog ceiling.
    async fn call_handler(&self, event: &WatchEvent) {
        if tokio::time::timeout(self.ceiling, self.handler.handle(event))
            .await
            .is_err()
        {
            error!(ceiling = ?self.ceiling, revision = ?event.revision(), "watch handler blocked");
            panic!("watch handler blocked for more than {:?}", self.ceiling);
        }
    }
}
