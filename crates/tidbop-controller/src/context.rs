//! The explicit controller context shared by every operation.

use std::sync::Arc;

use tracing::{debug, warn};

use tidbop_k8s::Orchestrator;
use tidbop_pd::{PdError, PlacementApi, StatusProbe};
use tidbop_state::{ClusterStore, Db, StateError};

use crate::config::OperatorConfig;
use crate::error::{ControllerError, ControllerResult};
use crate::events::EventRecorder;
use crate::locks::LockManager;
use crate::schema::SchemaInitializer;

/// Shared handle to the controller context.
pub type Context = Arc<ControllerContext>;

/// Configuration, external seams and registries for one controller
/// process.
pub struct ControllerContext {
    pub config: OperatorConfig,
    pub store: ClusterStore,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub placement: Arc<dyn PlacementApi>,
    pub probe: Arc<dyn StatusProbe>,
    pub schema: Arc<dyn SchemaInitializer>,
    pub locks: LockManager,
    pub events: EventRecorder,
}

impl ControllerContext {
    pub fn new(
        config: OperatorConfig,
        store: ClusterStore,
        orchestrator: Arc<dyn Orchestrator>,
        placement: Arc<dyn PlacementApi>,
        probe: Arc<dyn StatusProbe>,
        schema: Arc<dyn SchemaInitializer>,
    ) -> Context {
        Arc::new(Self {
            events: EventRecorder::new(store.clone()),
            locks: LockManager::new(),
            config,
            store,
            orchestrator,
            placement,
            probe,
            schema,
        })
    }

    pub fn load(&self, name: &str) -> ControllerResult<Db> {
        self.store
            .get_db(name)?
            .ok_or_else(|| ControllerError::NotFound(name.to_string()))
    }

    /// Write `db` back, refreshing it with the stored copy.
    ///
    /// On a version conflict the latest copy is re-read, the fields this
    /// controller owns (status and the runtime parts of each tier) are
    /// carried over, and the write is retried.
    pub fn persist(&self, db: &mut Db) -> ControllerResult<()> {
        let retries = self.config.timings.persist_retries.max(1);
        for attempt in 1..=retries {
            match self.store.update_db(db) {
                Ok(stored) => {
                    *db = stored;
                    return Ok(());
                }
                Err(StateError::Conflict { expected, actual, .. }) => {
                    warn!(
                        cluster = %db.metadata.name,
                        attempt, expected, actual,
                        "conflict persisting cluster, reapplying"
                    );
                    let mut fresh = self.load(&db.metadata.name)?;
                    carry_runtime(&mut fresh, db);
                    *db = fresh;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControllerError::Conflict(db.metadata.name.clone()))
    }

    /// Apply `f` to the latest stored copy and persist it.
    pub fn mutate<F>(&self, name: &str, mut f: F) -> ControllerResult<Db>
    where
        F: FnMut(&mut Db) -> ControllerResult<()>,
    {
        let retries = self.config.timings.persist_retries.max(1);
        for attempt in 1..=retries {
            let mut db = self.load(name)?;
            f(&mut db)?;
            match self.store.update_db(&db) {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_conflict() => {
                    debug!(cluster = %name, attempt, "conflict mutating cluster, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControllerError::Conflict(name.to_string()))
    }

    /// Placement API endpoint of a cluster.
    pub fn pd_endpoint(db: &Db) -> ControllerResult<String> {
        db.pd
            .api_endpoint()
            .map(str::to_string)
            .ok_or_else(|| PdError::NoEndpoint(db.metadata.name.clone()).into())
    }
}

/// Copy controller-owned fields of `ours` onto `fresh`, keeping whatever
/// the user changed in `fresh` (owner, schema, desired specs, operator).
fn carry_runtime(fresh: &mut Db, ours: &Db) {
    fresh.status = ours.status.clone();

    fresh.pd.members = ours.pd.members.clone();
    fresh.pd.member_seq = ours.pd.member_seq;
    fresh.pd.inner_addresses = ours.pd.inner_addresses.clone();
    fresh.pd.outer_addresses = ours.pd.outer_addresses.clone();

    fresh.tikv.member_seq = ours.tikv.member_seq;
    fresh.tikv.ready_replicas = ours.tikv.ready_replicas;
    fresh.tikv.available_replicas = ours.tikv.available_replicas;
    fresh.tikv.stores = ours.tikv.stores.clone();

    fresh.tidb.members = ours.tidb.members.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCluster, sample_db, test_context};
    use tidbop_state::Phase;

    #[test]
    fn persist_survives_a_concurrent_user_edit() {
        let ctx = test_context(FakeCluster::new());
        let mut ours = ctx.store.create_db(&sample_db("1", "app")).unwrap();

        // Someone else edits the description meanwhile.
        let mut theirs = ours.clone();
        theirs.owner.desc = "edited".to_string();
        ctx.store.update_db(&theirs).unwrap();

        ours.status.phase = Phase::PlacementPending;
        ours.pd.member_seq = 2;
        ctx.persist(&mut ours).unwrap();

        let stored = ctx.load("001-app").unwrap();
        assert_eq!(stored.owner.desc, "edited");
        assert_eq!(stored.status.phase, Phase::PlacementPending);
        assert_eq!(stored.pd.member_seq, 2);
        assert_eq!(ours.metadata.resource_version, stored.metadata.resource_version);
    }

    #[test]
    fn persist_of_deleted_cluster_is_not_found() {
        let ctx = test_context(FakeCluster::new());
        let mut ours = ctx.store.create_db(&sample_db("1", "app")).unwrap();
        let mut theirs = ours.clone();
        theirs.owner.desc = "x".to_string();
        ctx.store.update_db(&theirs).unwrap();
        ctx.store.delete_db("001-app").unwrap();

        let err = ctx.persist(&mut ours).unwrap_err();
        assert!(matches!(err, ControllerError::NotFound(_)), "got {err}");
    }

    #[test]
    fn mutate_applies_to_latest() {
        let ctx = test_context(FakeCluster::new());
        ctx.store.create_db(&sample_db("1", "app")).unwrap();
        let db = ctx
            .mutate("001-app", |db| {
                db.owner.desc = "hello".to_string();
                Ok(())
            })
            .unwrap();
        assert_eq!(db.owner.desc, "hello");
        assert!(ctx.mutate("missing", |_| Ok(())).is_err());
    }
}
