//! ClusterStore — redb-backed persistence for cluster objects and events.
//!
//! Provides create/get/update/delete/list over `Db` objects with a global
//! revision counter, optimistic-concurrency updates, a change feed, and a
//! de-duplicating audit event log. Values are JSON-serialized into redb's
//! `&[u8]` value columns. Supports on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::feed::{DbWatch, Feed, WatchEvent};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Default number of cluster changes retained for watch replay.
pub const DEFAULT_HISTORY: usize = 1024;

/// Events kept per cluster; older ones are dropped first.
const MAX_EVENTS_PER_CELL: usize = 128;

/// A consistent snapshot of all clusters.
#[derive(Debug, Clone)]
pub struct DbList {
    /// Cursor to open a watch from after processing `items`.
    pub resource_version: u64,
    pub items: Vec<Db>,
}

/// Thread-safe cluster object store backed by redb.
#[derive(Clone)]
pub struct ClusterStore {
    db: Arc<Database>,
    /// Serializes writes and orders feed publication.
    feed: Arc<Mutex<Feed>>,
}

impl ClusterStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::init(db, DEFAULT_HISTORY)?;
        debug!(?path, "cluster store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        Self::open_in_memory_with_history(DEFAULT_HISTORY)
    }

    /// In-memory store retaining at most `history` changes for watch replay.
    pub fn open_in_memory_with_history(history: usize) -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::init(db, history)?;
        debug!(history, "in-memory cluster store opened");
        Ok(store)
    }

    fn init(db: Database, history: usize) -> StateResult<Self> {
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        let revision = {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            txn.open_table(EVENTS).map_err(map_err!(Table))?;
            let meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.get(REVISION_KEY)
                .map_err(map_err!(Read))?
                .map(|v| v.value())
                .unwrap_or(0)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Self {
            db: Arc::new(db),
            feed: Arc::new(Mutex::new(Feed::new(history, revision))),
        })
    }

    fn lock_feed(&self) -> MutexGuard<'_, Feed> {
        self.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current global revision.
    pub fn revision(&self) -> u64 {
        self.lock_feed().revision
    }

    fn bump_revision(txn: &WriteTransaction, revision: u64) -> StateResult<()> {
        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        meta.insert(REVISION_KEY, revision)
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn read_db(txn: &WriteTransaction, name: &str) -> StateResult<Option<Db>> {
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        let found = match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => Some(
                serde_json::from_slice::<Db>(guard.value()).map_err(map_err!(Deserialize))?,
            ),
            None => None,
        };
        Ok(found)
    }

    fn write_db(txn: &WriteTransaction, db: &Db) -> StateResult<()> {
        let value = serde_json::to_vec(db).map_err(map_err!(Serialize))?;
        let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        table
            .insert(db.metadata.name.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Create a new cluster object. Fails if the name is taken.
    pub fn create_db(&self, db: &Db) -> StateResult<Db> {
        let mut feed = self.lock_feed();
        let revision = feed.revision + 1;
        let name = db.metadata.name.clone();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if Self::read_db(&txn, &name)?.is_some() {
            return Err(StateError::AlreadyExists(name));
        }
        let mut stored = db.clone();
        stored.metadata.resource_version = revision;
        if stored.metadata.created_at == 0 {
            stored.metadata.created_at = epoch_secs();
        }
        Self::write_db(&txn, &stored)?;
        Self::bump_revision(&txn, revision)?;
        txn.commit().map_err(map_err!(Transaction))?;

        feed.revision = revision;
        feed.publish(revision, WatchEvent::Added(stored.clone()));
        debug!(%name, revision, "cluster created");
        Ok(stored)
    }

    /// Get a cluster by name.
    pub fn get_db(&self, name: &str) -> StateResult<Option<Db>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let db: Db =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(db))
            }
            None => Ok(None),
        }
    }

    /// Update a cluster. The caller's `resource_version` must match the
    /// stored one; on success the returned copy carries the new version.
    pub fn update_db(&self, db: &Db) -> StateResult<Db> {
        let mut feed = self.lock_feed();
        let revision = feed.revision + 1;
        let name = db.metadata.name.clone();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current =
            Self::read_db(&txn, &name)?.ok_or_else(|| StateError::NotFound(name.clone()))?;
        if current.metadata.resource_version != db.metadata.resource_version {
            return Err(StateError::Conflict {
                name,
                expected: db.metadata.resource_version,
                actual: current.metadata.resource_version,
            });
        }
        let mut stored = db.clone();
        stored.metadata.resource_version = revision;
        stored.metadata.created_at = current.metadata.created_at;
        Self::write_db(&txn, &stored)?;
        Self::bump_revision(&txn, revision)?;
        txn.commit().map_err(map_err!(Transaction))?;

        feed.revision = revision;
        feed.publish(revision, WatchEvent::Modified(stored.clone()));
        debug!(%name, revision, phase = ?stored.status.phase, "cluster updated");
        Ok(stored)
    }

    /// Delete a cluster by name. Returns true if it existed.
    pub fn delete_db(&self, name: &str) -> StateResult<bool> {
        let mut feed = self.lock_feed();
        let revision = feed.revision + 1;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let removed = table.remove(name).map_err(map_err!(Write))?;
            match removed {
                Some(guard) => Some(
                    serde_json::from_slice::<Db>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            }
        };
        let Some(mut removed) = removed else {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(false);
        };
        Self::bump_revision(&txn, revision)?;
        txn.commit().map_err(map_err!(Transaction))?;

        removed.metadata.resource_version = revision;
        feed.revision = revision;
        feed.publish(revision, WatchEvent::Deleted(removed));
        debug!(%name, revision, "cluster deleted");
        Ok(true)
    }

    /// List all clusters together with the revision they were read at.
    pub fn list_dbs(&self) -> StateResult<DbList> {
        // Holding the feed lock keeps the cursor consistent with the items.
        let feed = self.lock_feed();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        let mut items = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let db: Db = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            items.push(db);
        }
        Ok(DbList {
            resource_version: feed.revision,
            items,
        })
    }

    /// Open a change feed that yields every change after `from`.
    pub fn watch(&self, from: u64) -> DbWatch {
        self.lock_feed().subscribe(from)
    }

    /// Drop the retained change history and close all open feeds. Feeds
    /// reopened from an older cursor get a 410 error.
    pub fn compact(&self) {
        self.lock_feed().compact();
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Record an event, folding it into an existing one for the same
    /// component and message. Returns the stored event.
    pub fn record_event(&self, event: Event) -> StateResult<Event> {
        let mut feed = self.lock_feed();
        let revision = feed.revision + 1;
        let cell = event.cell.clone();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            let mut events: Vec<Event> = match table.get(cell.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => Vec::new(),
            };
            let stored = match events.iter_mut().find(|e| e.same_occurrence(&event)) {
                Some(existing) => {
                    existing.count += 1;
                    existing.last_seen = event.last_seen;
                    existing.kind = event.kind;
                    existing.key = event.key.clone();
                    existing.clone()
                }
                None => {
                    events.push(event.clone());
                    if events.len() > MAX_EVENTS_PER_CELL {
                        let excess = events.len() - MAX_EVENTS_PER_CELL;
                        events.drain(..excess);
                    }
                    event
                }
            };
            let value = serde_json::to_vec(&events).map_err(map_err!(Serialize))?;
            table
                .insert(cell.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            stored
        };
        Self::bump_revision(&txn, revision)?;
        txn.commit().map_err(map_err!(Transaction))?;
        feed.revision = revision;
        Ok(stored)
    }

    /// All recorded events for a cluster, oldest first.
    pub fn list_events(&self, cell: &str) -> StateResult<Vec<Event>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        match table.get(cell).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Ok(Vec::new()),
        }
    }

    /// Delete all events of a cluster. Returns how many were removed.
    pub fn delete_events(&self, cell: &str) -> StateResult<usize> {
        let mut feed = self.lock_feed();
        let revision = feed.revision + 1;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            let removed = table.remove(cell).map_err(map_err!(Write))?;
            match removed {
                Some(guard) => serde_json::from_slice::<Vec<Event>>(guard.value())
                    .map_err(map_err!(Deserialize))?
                    .len(),
                None => 0,
            }
        };
        Self::bump_revision(&txn, revision)?;
        txn.commit().map_err(map_err!(Transaction))?;
        feed.revision = revision;
        debug!(%cell, removed, "events deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> ClusterStore {
        ClusterStore::open_in_memory().unwrap()
    }

    fn test_db(name: &str) -> Db {
        let mut db = Db::default();
        db.metadata.name = name.to_string();
        db.schema = Schema {
            name: "app".to_string(),
            user: "app".to_string(),
            password: "secret".to_string(),
        };
        db.tikv.spec.replicas = 3;
        db
    }

    #[test]
    fn create_assigns_resource_version() {
        let store = test_store();
        let created = store.create_db(&test_db("001-app")).unwrap();
        assert_eq!(created.metadata.resource_version, 1);
        assert!(created.metadata.created_at > 0);
        assert_eq!(store.revision(), 1);

        let loaded = store.get_db("001-app").unwrap().unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn create_twice_is_rejected() {
        let store = test_store();
        store.create_db(&test_db("001-app")).unwrap();
        let err = store.create_db(&test_db("001-app")).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn stale_update_is_a_conflict_not_a_missing_object() {
        let store = test_store();
        let created = store.create_db(&test_db("001-app")).unwrap();

        let mut first = created.clone();
        first.operator = "start".to_string();
        let updated = store.update_db(&first).unwrap();
        assert_eq!(updated.metadata.resource_version, 2);

        let mut stale = created;
        stale.operator = "stop".to_string();
        let err = store.update_db(&stale).unwrap_err();
        assert!(err.is_conflict());
        assert!(!err.is_not_found());

        let mut missing = test_db("002-app");
        missing.metadata.resource_version = 2;
        let err = store.update_db(&missing).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_reports_existence() {
        let store = test_store();
        store.create_db(&test_db("001-app")).unwrap();
        assert!(store.delete_db("001-app").unwrap());
        assert!(!store.delete_db("001-app").unwrap());
        assert!(store.get_db("001-app").unwrap().is_none());
    }

    #[test]
    fn list_returns_cursor_and_items() {
        let store = test_store();
        store.create_db(&test_db("001-a")).unwrap();
        store.create_db(&test_db("001-b")).unwrap();
        let list = store.list_dbs().unwrap();
        assert_eq!(list.resource_version, 2);
        let names: Vec<_> = list.items.iter().map(|d| d.cell().to_string()).collect();
        assert_eq!(names, vec!["001-a", "001-b"]);
    }

    #[test]
    fn events_are_deduplicated_by_component_and_message() {
        let store = test_store();
        let first = Event::new("c", "tidb", "install", EventKind::Error, "boom".into());
        store.record_event(first.clone()).unwrap();
        store.record_event(first).unwrap();
        store
            .record_event(Event::new("c", "tidb/tikv", "scale", EventKind::Ok, "ok".into()))
            .unwrap();

        let events = store.list_events("c").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].count, 2);
        assert_eq!(events[1].component, "tidb/tikv");

        assert_eq!(store.delete_events("c").unwrap(), 2);
        assert!(store.list_events("c").unwrap().is_empty());
    }

    #[test]
    fn persistent_store_keeps_revision_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tidbop.redb");
        {
            let store = ClusterStore::open(&path).unwrap();
            store.create_db(&test_db("001-app")).unwrap();
            store.create_db(&test_db("001-other")).unwrap();
        }
        let store = ClusterStore::open(&path).unwrap();
        assert_eq!(store.revision(), 2);
        assert_eq!(store.list_dbs().unwrap().items.len(), 2);
    }

    #[tokio::test]
    async fn watch_replays_history_then_follows_live_changes() {
        let store = test_store();
        let created = store.create_db(&test_db("001-app")).unwrap();

        let mut watch = store.watch(0);
        match watch.next().await {
            Some(WatchEvent::Added(db)) => assert_eq!(db.cell(), "001-app"),
            other => panic!("expected Added, got {other:?}"),
        }

        let mut modified = created;
        modified.operator = "start".to_string();
        store.update_db(&modified).unwrap();
        store.delete_db("001-app").unwrap();

        match watch.next().await {
            Some(WatchEvent::Modified(db)) => assert_eq!(db.operator, "start"),
            other => panic!("expected Modified, got {other:?}"),
        }
        match watch.next().await {
            Some(WatchEvent::Deleted(db)) => assert_eq!(db.metadata.resource_version, 3),
            other => panic!("expected Deleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_cursor_yields_gone() {
        let store = ClusterStore::open_in_memory_with_history(2).unwrap();
        for name in ["001-a", "001-b", "001-c"] {
            store.create_db(&test_db(name)).unwrap();
        }

        // Revision 1 was evicted from the two-entry history.
        let mut watch = store.watch(0);
        match watch.next().await {
            Some(WatchEvent::Error(status)) => assert!(status.is_gone()),
            other => panic!("expected 410, got {other:?}"),
        }
        assert!(watch.next().await.is_none());

        // Still replayable from revision 1.
        let mut watch = store.watch(1);
        assert!(matches!(watch.next().await, Some(WatchEvent::Added(_))));
    }

    #[tokio::test]
    async fn compact_closes_open_feeds() {
        let store = test_store();
        store.create_db(&test_db("001-a")).unwrap();
        let mut watch = store.watch(1);

        store
            .record_event(Event::new("001-a", "tidb", "k", EventKind::Ok, "m".into()))
            .unwrap();
        store.compact();

        assert!(watch.next().await.is_none());
        let mut reopened = store.watch(1);
        match reopened.next().await {
            Some(WatchEvent::Error(status)) => assert_eq!(status.code, 410),
            other => panic!("expected 410, got {other:?}"),
        }
        // The current revision is still a valid cursor.
        let mut current = store.watch(store.revision());
        store.create_db(&test_db("001-b")).unwrap();
        assert!(matches!(current.next().await, Some(WatchEvent::Added(_))));
    }
}
