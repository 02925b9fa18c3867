//! Per-cluster operation locks.
//!
//! One async mutex per cluster name. Acquisition never waits: a busy
//! cluster fails fast with [`ControllerError::RepeatOperation`]. A separate
//! "doing" set answers whether an operation is running without touching
//! the mutexes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use tidbop_state::{ClusterStore, Db};

use crate::error::{ControllerError, ControllerResult};

#[derive(Default)]
struct LockTable {
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    doing: HashSet<String>,
}

/// Registry of per-cluster locks. Cheap to clone.
#[derive(Clone, Default)]
pub struct LockManager {
    table: Arc<Mutex<LockTable>>,
}

/// Exclusive hold on one cluster; released on drop.
pub struct ClusterGuard {
    name: String,
    table: Arc<Mutex<LockTable>>,
    _held: OwnedMutexGuard<()>,
}

impl ClusterGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ClusterGuard {
    fn drop(&mut self) {
        lock_table(&self.table).doing.remove(&self.name);
    }
}

fn lock_table(table: &Mutex<LockTable>) -> MutexGuard<'_, LockTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the lock for `name` if it does not exist yet.
    pub fn register(&self, name: &str) {
        let mut table = lock_table(&self.table);
        if !table.locks.contains_key(name) {
            table
                .locks
                .insert(name.to_string(), Arc::new(tokio::sync::Mutex::new(())));
            debug!(cluster = %name, "lock registered");
        }
    }

    /// Drop the lock of a deleted cluster.
    pub fn recycle(&self, name: &str) {
        let mut table = lock_table(&self.table);
        table.locks.remove(name);
        table.doing.remove(name);
        debug!(cluster = %name, "lock recycled");
    }

    pub fn is_registered(&self, name: &str) -> bool {
        lock_table(&self.table).locks.contains_key(name)
    }

    /// Whether an operation currently holds `name`.
    pub fn is_doing(&self, name: &str) -> bool {
        lock_table(&self.table).doing.contains(name)
    }

    /// Acquire `name` without waiting, then re-read the cluster so the
    /// caller works on the latest stored copy.
    ///
    /// A cluster that exists in the store but has no lock yet (for example
    /// before the watch controller has caught up after a restart) gets one.
    pub fn try_lock(
        &self,
        store: &ClusterStore,
        name: &str,
    ) -> ControllerResult<(ClusterGuard, Db)> {
        let mutex = {
            let table = lock_table(&self.table);
            table.locks.get(name).cloned()
        };
        let mutex = match mutex {
            Some(mutex) => mutex,
            None => {
                if store.get_db(name)?.is_none() {
                    return Err(ControllerError::NotFound(name.to_string()));
                }
                self.register(name);
                lock_table(&self.table)
                    .locks
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ControllerError::NotFound(name.to_string()))?
            }
        };

        let held = mutex
            .try_lock_owned()
            .map_err(|_| ControllerError::RepeatOperation(name.to_string()))?;
        lock_table(&self.table).doing.insert(name.to_string());
        let guard = ClusterGuard {
            name: name.to_string(),
            table: Arc::clone(&self.table),
            _held: held,
        };

        // Dropping `guard` on any failure below releases the lock.
        match store.get_db(name)? {
            Some(db) => Ok((guard, db)),
            None => Err(ControllerError::NotFound(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(name: &str) -> ClusterStore {
        let store = ClusterStore::open_in_memory().unwrap();
        let mut db = Db::default();
        db.metadata.name = name.to_string();
        store.create_db(&db).unwrap();
        store
    }

    #[test]
    fn second_acquire_fails_until_release() {
        let store = store_with("001-a");
        let locks = LockManager::new();
        locks.register("001-a");

        let (guard, db) = locks.try_lock(&store, "001-a").unwrap();
        assert_eq!(db.metadata.name, "001-a");
        assert!(locks.is_doing("001-a"));
        let err = locks.try_lock(&store, "001-a").err().unwrap();
        assert!(matches!(err, ControllerError::RepeatOperation(_)));

        drop(guard);
        assert!(!locks.is_doing("001-a"));
        assert!(locks.try_lock(&store, "001-a").is_ok());
    }

    #[test]
    fn missing_cluster_is_not_found_and_not_registered() {
        let store = ClusterStore::open_in_memory().unwrap();
        let locks = LockManager::new();
        let err = locks.try_lock(&store, "nope").err().unwrap();
        assert!(matches!(err, ControllerError::NotFound(_)));
        assert!(!locks.is_registered("nope"));
    }

    #[test]
    fn failed_reread_releases_the_lock() {
        let store = store_with("001-a");
        let locks = LockManager::new();
        locks.register("001-a");
        store.delete_db("001-a").unwrap();

        assert!(locks.try_lock(&store, "001-a").is_err());
        assert!(!locks.is_doing("001-a"));
    }

    #[test]
    fn unregistered_existing_cluster_gets_a_lock() {
        let store = store_with("001-a");
        let locks = LockManager::new();
        assert!(locks.try_lock(&store, "001-a").is_ok());
        assert!(locks.is_registered("001-a"));
    }

    #[test]
    fn recycle_forgets_lock_and_doing() {
        let store = store_with("001-a");
        let locks = LockManager::new();
        let (guard, _) = locks.try_lock(&store, "001-a").unwrap();
        locks.recycle("001-a");
        assert!(!locks.is_registered("001-a"));
        assert!(!locks.is_doing("001-a"));
        drop(guard);
    }

    #[tokio::test]
    async fn concurrent_acquires_admit_exactly_one() {
        let store = store_with("001-a");
        let locks = LockManager::new();
        locks.register("001-a");
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (store, locks, barrier) = (store.clone(), locks.clone(), Arc::clone(&barrier));
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                let held = locks.try_lock(&store, "001-a").ok();
                // Keep the winner's guard alive until everyone has tried.
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                held.is_some()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
