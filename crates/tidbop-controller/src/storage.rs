//! Storage (TiKV) tier controller and the store join protocol.

use tracing::{debug, info, warn};

use tidbop_state::{Db, Phase, Store, StoreState};

use crate::context::ControllerContext;
use crate::error::{ControllerError, ControllerResult};
use crate::lifecycle::{finish_phase, set_phase};
use crate::manifest;
use crate::naming::{Component, TIKV_PORT, component_labels, pod_name};
use crate::wait::{retry_until, wait_pod_running};

pub async fn install(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    db.tikv.stores.clear();
    db.tikv.ready_replicas = 0;
    db.tikv.available_replicas = 0;
    set_phase(ctx, db, Phase::StoragePending)?;
    let result = start_stores(ctx, db).await;
    finish_phase(ctx, db, &result, Phase::StorageStarted, Phase::StorageFailed)?;
    result
}

async fn start_stores(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    for _ in 0..db.tikv.spec.replicas {
        add_store(ctx, db).await?;
    }
    info!(cell = %db.cell(), stores = db.tikv.store_count(), "storage started");
    Ok(())
}

/// Create one store pod and wait until it has joined placement.
///
/// The store is recorded before its pod exists, so a crash or failure at
/// any later step leaves an unjoined entry the store engine purges.
pub async fn add_store(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<String> {
    let seq = db.tikv.member_seq + 1;
    let name = pod_name(Component::Tikv, db.cell(), seq);
    db.tikv.member_seq = seq;
    db.tikv.stores.insert(
        name.clone(),
        Store {
            name: name.clone(),
            ..Store::default()
        },
    );
    db.tikv.ready_replicas = db.tikv.store_count();
    ctx.persist(db)?;

    let pod = manifest::tikv_pod(&ctx.config, db, seq);
    ctx.orchestrator.create_pod(&pod).await?;
    let running = wait_pod_running(ctx, &name, ctx.config.timings.pod_timeout).await?;
    let ip = running
        .ip
        .ok_or_else(|| ControllerError::Internal(format!("running pod {name} has no IP")))?;
    let address = format!("{ip}:{TIKV_PORT}");
    if let Some(store) = db.tikv.stores.get_mut(&name) {
        store.address = address.clone();
        store.node = running.node.unwrap_or_default();
    }
    ctx.persist(db)?;

    let id = join(ctx, db, &address).await?;
    if let Some(store) = db.tikv.stores.get_mut(&name) {
        store.id = id;
        store.state = StoreState::Online;
        store.down_checks = 0;
    }
    db.tikv.available_replicas += 1;
    ctx.persist(db)?;
    info!(cell = %db.cell(), store = %name, store_id = id, %address, "store joined");
    Ok(name)
}

/// Wait until placement lists a live store at `address` and return its id.
async fn join(ctx: &ControllerContext, db: &Db, address: &str) -> ControllerResult<u64> {
    let endpoint = ControllerContext::pd_endpoint(db)?;
    let timings = &ctx.config.timings;
    let what = format!("store {address} to join");
    retry_until(&what, timings.poll_interval, timings.component_timeout, || async {
        let stores = match ctx.placement.list_stores(&endpoint).await {
            Ok(stores) => stores,
            Err(e) => {
                debug!(%endpoint, error = %e, "store list unavailable");
                return Ok(None);
            }
        };
        let matching: Vec<_> = stores
            .iter()
            .filter(|s| s.address == address && !s.is_tombstone())
            .collect();
        match matching.as_slice() {
            [] => Ok(None),
            [store] if store.id > 0 => Ok(Some(store.id)),
            [_] => Ok(None),
            many => Err(ControllerError::Internal(format!(
                "{} stores registered at {address}",
                many.len()
            ))),
        }
    })
    .await
}

pub async fn uninstall(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    let cell = db.cell().to_string();
    let deleted = ctx
        .orchestrator
        .delete_pods(&component_labels(&cell, Component::Tikv))
        .await?;
    db.tikv.stores.clear();
    db.tikv.ready_replicas = 0;
    db.tikv.available_replicas = 0;
    ctx.persist(db)?;
    info!(%cell, pods = deleted, "storage removed");
    Ok(())
}

/// Roll stores onto the desired version, one at a time.
pub async fn upgrade(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<u32> {
    let phase = db.phase();
    if phase < Phase::StorageStarted || phase == Phase::Uninstalling {
        return Err(ControllerError::Unavailable(format!(
            "storage of {} is not started",
            db.metadata.name
        )));
    }
    let endpoint = ControllerContext::pd_endpoint(db)?;
    let version = db.tikv.spec.version.clone();
    let image = ctx.config.image(Component::Tikv.as_str(), &version);
    let timings = &ctx.config.timings;
    let mut upgraded = 0;
    let stores: Vec<Store> = db.tikv.stores.values().cloned().collect();
    for store in stores {
        if store.state == StoreState::Tombstone {
            continue;
        }
        let Some(pod) = ctx.orchestrator.get_pod(&store.name).await? else {
            warn!(store = %store.name, "storage pod missing, skipping upgrade");
            continue;
        };
        if pod.version() == Some(version.as_str()) {
            continue;
        }
        info!(store = %store.name, from = ?pod.version(), to = %version, "upgrading store");
        ctx.orchestrator
            .set_pod_image(&store.name, Component::Tikv.as_str(), &image, &version)
            .await?;
        tokio::time::sleep(timings.tikv_upgrade_settle).await;
        wait_pod_running(ctx, &store.name, timings.pod_timeout).await?;
        // A demoted store is draining and never reports Up again.
        if store.joined() && store.state == StoreState::Online {
            let what = format!("store {} up", store.id);
            retry_until(&what, timings.poll_interval, timings.component_timeout, || async {
                match ctx.placement.get_store(&endpoint, store.id).await {
                    Ok(info) if info.is_up() => Ok(Some(())),
                    Ok(_) => Ok(None),
                    Err(e) => {
                        debug!(store_id = store.id, error = %e, "store state unavailable");
                        Ok(None)
                    }
                }
            })
            .await?;
        }
        upgraded += 1;
    }
    Ok(upgraded)
}
