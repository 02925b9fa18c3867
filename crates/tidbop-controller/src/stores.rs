//! Store reconciliation engine.
//!
//! One pass compares the storage tier's store map with what placement and
//! the orchestrator report, then moves it one step towards the desired
//! replica count:
//!
//! ```text
//!   check stores ──► plan ──┬─ ScaleUp(n)   add n stores (join protocol)
//!                           ├─ ScaleDown(n) demote n Online stores
//!                           └─ Steady       purge unjoined, buried, long-down
//!                  ──► resync counters ──► persist
//! ```
//!
//! Demotion never deletes pods: placement migrates the data away and marks
//! the store Tombstone, and a later Steady pass purges it.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use tidbop_state::{Db, StoreState};

use crate::context::ControllerContext;
use crate::error::{ControllerError, ControllerResult};
use crate::naming::{Component, component_labels};
use crate::storage;

/// What to do about the replica count this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaPlan {
    ScaleUp(u32),
    ScaleDown(u32),
    Steady,
}

/// Compare desired replicas with the ready and available counters.
pub fn plan(desired: u32, ready: u32, available: u32) -> ReplicaPlan {
    let have = ready.max(available);
    if desired > have {
        ReplicaPlan::ScaleUp(desired - have)
    } else if desired < available {
        ReplicaPlan::ScaleDown(available - desired)
    } else {
        ReplicaPlan::Steady
    }
}

/// Everything a pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreReport {
    pub uncontrolled_stores: Vec<u64>,
    pub uncontrolled_pods: Vec<String>,
    pub went_offline: Vec<String>,
    pub came_online: Vec<String>,
    pub created: Vec<String>,
    pub demoted: Vec<String>,
    pub purged: Vec<String>,
    pub counters_resynced: bool,
}

/// Run one pass and persist the result, even when a step fails.
pub async fn reconcile(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<StoreReport> {
    let mut report = StoreReport::default();
    let result = run_pass(ctx, db, &mut report).await;
    report.counters_resynced = resync_counters(db);
    ctx.persist(db)?;
    result.map(|()| report)
}

async fn run_pass(
    ctx: &ControllerContext,
    db: &mut Db,
    report: &mut StoreReport,
) -> ControllerResult<()> {
    check_stores(ctx, db, report).await?;
    let tier = &db.tikv;
    let step = plan(
        tier.spec.replicas,
        tier.ready_replicas,
        tier.available_replicas,
    );
    debug!(cell = %db.cell(), ?step, "store plan");
    match step {
        ReplicaPlan::ScaleUp(n) => {
            for _ in 0..n {
                let name = storage::add_store(ctx, db).await?;
                report.created.push(name);
            }
            Ok(())
        }
        ReplicaPlan::ScaleDown(n) => demote(ctx, db, n, report).await,
        ReplicaPlan::Steady => purge(ctx, db, report).await,
    }
}

/// Refresh store states from placement and drop what nobody owns.
async fn check_stores(
    ctx: &ControllerContext,
    db: &mut Db,
    report: &mut StoreReport,
) -> ControllerResult<()> {
    let cell = db.cell().to_string();
    let endpoint = ControllerContext::pd_endpoint(db)?;
    let remote = ctx.placement.list_stores(&endpoint).await?;

    let local_ids: HashSet<u64> = db
        .tikv
        .stores
        .values()
        .filter(|s| s.joined())
        .map(|s| s.id)
        .collect();
    // Offline stores are already draining towards Tombstone.
    for store in remote
        .iter()
        .filter(|s| !s.is_tombstone() && !s.is_offline() && !local_ids.contains(&s.id))
    {
        warn!(%cell, store_id = store.id, address = %store.address, "deleting uncontrolled store");
        ctx.placement.delete_store(&endpoint, store.id).await?;
        report.uncontrolled_stores.push(store.id);
    }

    let pods = ctx
        .orchestrator
        .list_pods(&component_labels(&cell, Component::Tikv))
        .await?;
    for pod in pods
        .iter()
        .filter(|p| !p.terminating && !db.tikv.stores.contains_key(&p.name))
    {
        warn!(%cell, pod = %pod.name, "deleting uncontrolled storage pod");
        ctx.orchestrator.delete_pod(&pod.name).await?;
        report.uncontrolled_pods.push(pod.name.clone());
    }

    let up: HashSet<u64> = remote.iter().filter(|s| s.is_up()).map(|s| s.id).collect();
    let tombstones: HashSet<u64> = remote
        .iter()
        .filter(|s| s.is_tombstone())
        .map(|s| s.id)
        .collect();
    let offline_after = ctx.config.stores.offline_after_checks;
    let storage = &mut db.tikv;
    for store in storage.stores.values_mut().filter(|s| s.joined()) {
        if tombstones.contains(&store.id) {
            if store.state == StoreState::Online {
                storage.available_replicas = storage.available_replicas.saturating_sub(1);
            }
            store.state = StoreState::Tombstone;
        } else if up.contains(&store.id) {
            store.down_checks = 0;
            if store.state == StoreState::Offline {
                info!(%cell, store = %store.name, "store back online");
                store.state = StoreState::Online;
                storage.available_replicas += 1;
                report.came_online.push(store.name.clone());
            }
        } else {
            store.down_checks += 1;
            if store.state == StoreState::Online && store.down_checks > offline_after {
                warn!(%cell, store = %store.name, checks = store.down_checks, "store offline");
                store.state = StoreState::Offline;
                storage.available_replicas = storage.available_replicas.saturating_sub(1);
                report.went_offline.push(store.name.clone());
            }
        }
    }
    Ok(())
}

/// Ask placement to drain the `n` lexicographically first Online stores.
async fn demote(
    ctx: &ControllerContext,
    db: &mut Db,
    n: u32,
    report: &mut StoreReport,
) -> ControllerResult<()> {
    let endpoint = ControllerContext::pd_endpoint(db)?;
    let victims: Vec<(String, u64)> = db
        .tikv
        .stores
        .values()
        .filter(|s| s.state == StoreState::Online)
        .take(n as usize)
        .map(|s| (s.name.clone(), s.id))
        .collect();
    for (name, id) in victims {
        ctx.placement.delete_store(&endpoint, id).await?;
        if let Some(store) = db.tikv.stores.get_mut(&name) {
            store.state = StoreState::Offline;
        }
        db.tikv.available_replicas = db.tikv.available_replicas.saturating_sub(1);
        ctx.persist(db)?;
        info!(cell = %db.cell(), store = %name, store_id = id, "store demoted");
        report.demoted.push(name);
    }
    Ok(())
}

/// Forget a store and delete its pod.
async fn remove_store(ctx: &ControllerContext, db: &mut Db, name: &str) -> ControllerResult<()> {
    ctx.orchestrator.delete_pod(name).await?;
    if let Some(store) = db.tikv.stores.remove(name) {
        if store.state == StoreState::Online {
            db.tikv.available_replicas = db.tikv.available_replicas.saturating_sub(1);
        }
    }
    db.tikv.ready_replicas = db.tikv.store_count();
    ctx.persist(db)
}

/// Consistency reconcile: purge never-joined stores, then stores placement
/// has tombstoned or forgotten, then stores down too long with no pod.
async fn purge(
    ctx: &ControllerContext,
    db: &mut Db,
    report: &mut StoreReport,
) -> ControllerResult<()> {
    let cell = db.cell().to_string();
    let endpoint = ControllerContext::pd_endpoint(db)?;

    let unjoined: Vec<String> = db
        .tikv
        .stores
        .values()
        .filter(|s| !s.joined())
        .map(|s| s.name.clone())
        .collect();
    for name in unjoined {
        warn!(%cell, store = %name, "purging store that never joined");
        remove_store(ctx, db, &name).await?;
        report.purged.push(name);
    }

    let joined: Vec<(String, u64)> = db
        .tikv
        .stores
        .values()
        .map(|s| (s.name.clone(), s.id))
        .collect();
    for (name, id) in joined {
        let buried = match ctx.placement.get_store(&endpoint, id).await {
            Ok(info) => info.is_tombstone(),
            Err(e) if e.is_not_found() => true,
            Err(e) => return Err(ControllerError::from(e)),
        };
        if buried {
            info!(%cell, store = %name, store_id = id, "purging buried store");
            remove_store(ctx, db, &name).await?;
            report.purged.push(name);
        }
    }

    let max_down = ctx.config.stores.max_down_checks;
    let long_down: Vec<(String, u64)> = db
        .tikv
        .stores
        .values()
        .filter(|s| s.down_checks > max_down)
        .map(|s| (s.name.clone(), s.id))
        .collect();
    if long_down.is_empty() {
        return Ok(());
    }
    let live: HashSet<String> = ctx
        .orchestrator
        .list_pods(&component_labels(&cell, Component::Tikv))
        .await?
        .into_iter()
        .filter(|p| p.is_healthy())
        .map(|p| p.name)
        .collect();
    for (name, id) in long_down {
        if live.contains(&name) {
            continue;
        }
        warn!(%cell, store = %name, store_id = id, "purging store down past the limit");
        ctx.placement.delete_store(&endpoint, id).await?;
        remove_store(ctx, db, &name).await?;
        report.purged.push(name);
    }
    Ok(())
}

/// Reset the counters from the store map; returns whether they drifted.
fn resync_counters(db: &mut Db) -> bool {
    let storage = &mut db.tikv;
    if storage.counters_consistent() {
        return false;
    }
    warn!(
        cell = %db.metadata.name,
        ready = storage.ready_replicas,
        available = storage.available_replicas,
        stores = storage.store_count(),
        online = storage.online_count(),
        "store counters drifted, resyncing"
    );
    storage.ready_replicas = storage.store_count();
    storage.available_replicas = storage.online_count();
    true
}
