//! Periodic reconciliation of installed clusters.

use std::time::Duration;

use tracing::{debug, info, warn};

use tidbop_state::{Db, Phase};

use crate::context::{Context, ControllerContext};
use crate::error::{ControllerError, ControllerResult};
use crate::tasks::{Prepared, TaskHandle, submit};
use crate::{lifecycle, placement, sql, stores};

/// Why a cluster was left out of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    NotInstalled,
    Unavailable,
    Busy,
    Scaling,
}

/// Whether the periodic pass should touch `db` right now.
pub fn skip_reason(ctx: &ControllerContext, db: &Db) -> Option<Skip> {
    if db.phase() != Phase::SqlInited {
        Some(Skip::NotInstalled)
    } else if !db.status.available {
        Some(Skip::Unavailable)
    } else if db.status.scale.scaling {
        Some(Skip::Scaling)
    } else if ctx.locks.is_doing(&db.metadata.name) {
        Some(Skip::Busy)
    } else {
        None
    }
}

pub struct Reconciler {
    ctx: Context,
}

impl Reconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Submit one reconcile task per eligible cluster.
    pub fn reconcile_all(&self) -> ControllerResult<Vec<TaskHandle>> {
        let mut handles = Vec::new();
        for db in self.ctx.store.list_dbs()?.items {
            let name = db.metadata.name.clone();
            if let Some(reason) = skip_reason(&self.ctx, &db) {
                debug!(cluster = %name, ?reason, "reconcile skipped");
                continue;
            }
            let submitted = submit(
                &self.ctx,
                &name,
                "reconcile",
                |ctx, db| {
                    Ok(match skip_reason(ctx, db) {
                        // The lock holder itself counts as busy here.
                        None | Some(Skip::Busy) => Prepared::Run,
                        Some(_) => Prepared::Done,
                    })
                },
                |ctx, mut db| async move { reconcile_cluster(&ctx, &mut db).await },
            );
            match submitted {
                Ok(handle) => handles.push(handle),
                Err(ControllerError::RepeatOperation(_)) => {
                    debug!(cluster = %name, "cluster became busy, skipping");
                }
                Err(e) => warn!(cluster = %name, error = %e, "reconcile not submitted"),
            }
        }
        Ok(handles)
    }

    /// Run passes every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "reconciler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.reconcile_all() {
                        Ok(handles) => debug!(clusters = handles.len(), "reconcile pass submitted"),
                        Err(e) => tracing::error!(error = %e, "reconcile pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}

/// One pass over an installed cluster; the caller holds its lock.
pub async fn reconcile_cluster(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    if placement::reconcile_members(ctx, db).await? {
        info!(cell = %db.cell(), "placement members repaired");
    }
    let report = stores::reconcile(ctx, db).await?;
    if report != stores::StoreReport::default() {
        info!(cell = %db.cell(), ?report, "stores reconciled");
    }
    let healed = sql::heal(ctx, db).await?;
    if healed > 0 {
        info!(cell = %db.cell(), healed, "sql pods replaced");
    }
    if lifecycle::needs_upgrade(ctx, db).await? {
        lifecycle::upgrade(ctx, db).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tidbop_k8s::PodPhase;
    use tidbop_state::UpgradeState;

    use super::*;
    use crate::api::ClusterController;
    use crate::testing::{Call, FakeCluster, sample_db, test_context};

    async fn installed(fake: &Arc<FakeCluster>) -> Reconciler {
        let ctx = test_context(fake.clone());
        let api = ClusterController::new(ctx.clone());
        api.save(sample_db("1", "app")).await.unwrap();
        api.install("001-app").unwrap().wait().await.unwrap();
        Reconciler::new(ctx)
    }

    async fn pass(reconciler: &Reconciler) {
        for handle in reconciler.reconcile_all().unwrap() {
            handle.wait().await.unwrap();
        }
    }

    #[tokio::test]
    async fn only_installed_idle_clusters_are_reconciled() {
        let fake = FakeCluster::new();
        let ctx = test_context(fake.clone());
        let api = ClusterController::new(ctx.clone());
        let saved = api.save(sample_db("1", "app")).await.unwrap();
        assert_eq!(skip_reason(&ctx, &saved), Some(Skip::NotInstalled));
        assert!(Reconciler::new(ctx.clone()).reconcile_all().unwrap().is_empty());

        let mut db = saved;
        db.status.phase = Phase::SqlInited;
        assert_eq!(skip_reason(&ctx, &db), Some(Skip::Unavailable));
        db.status.available = true;
        db.status.scale.scaling = true;
        assert_eq!(skip_reason(&ctx, &db), Some(Skip::Scaling));
        db.status.scale.scaling = false;
        assert_eq!(skip_reason(&ctx, &db), None);
        let _held = ctx.locks.try_lock(&ctx.store, "001-app").unwrap();
        assert_eq!(skip_reason(&ctx, &db), Some(Skip::Busy));
    }

    #[tokio::test]
    async fn dead_placement_member_is_replaced() {
        let fake = FakeCluster::new();
        let reconciler = installed(&fake).await;
        fake.set_pod_phase("pd-001-app-001", PodPhase::Failed);
        fake.add_stray_member("pd-someone-else");

        pass(&reconciler).await;
        let db = reconciler.ctx.load("001-app").unwrap();
        let names: Vec<&str> = db.pd.members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["pd-001-app-004", "pd-001-app-002", "pd-001-app-003"]);
        assert_eq!(db.pd.member_seq, 4);
        let calls = fake.calls();
        assert!(calls.contains(&Call::DeleteMember("pd-001-app-001".to_string())));
        assert!(calls.contains(&Call::DeletePod("pd-001-app-001".to_string())));
        assert!(!fake.has_member("pd-someone-else"));
        assert!(fake.pod("pd-001-app-004").is_some());
    }

    #[tokio::test]
    async fn stopped_sql_pods_are_replaced() {
        let fake = FakeCluster::new();
        let reconciler = installed(&fake).await;
        fake.set_pod_phase("tidb-001-app-0001", PodPhase::Failed);

        pass(&reconciler).await;
        assert!(fake.pod("tidb-001-app-0001").is_none());
        let db = reconciler.ctx.load("001-app").unwrap();
        let names: Vec<&str> = db.tidb.members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["tidb-001-app-0002", "tidb-001-app-0003"]);
    }

    #[tokio::test]
    async fn version_drift_triggers_an_upgrade() {
        let fake = FakeCluster::new();
        let reconciler = installed(&fake).await;
        reconciler
            .ctx
            .mutate("001-app", |db| {
                db.pd.spec.version = "latest".to_string();
                Ok(())
            })
            .unwrap();

        pass(&reconciler).await;
        let db = reconciler.ctx.load("001-app").unwrap();
        assert_eq!(db.status.upgrade_state, UpgradeState::Upgraded);
        for name in fake.pod_names("pd") {
            assert_eq!(fake.pod(&name).unwrap().version(), Some("latest"));
        }
        assert!(!lifecycle::needs_upgrade(&reconciler.ctx, &db).await.unwrap());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let fake = FakeCluster::new();
        let reconciler = installed(&fake).await;
        let (tx, rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move { reconciler.run(Duration::from_millis(5), rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
