//! SQL (TiDB) tier controller.

use tracing::{debug, info, warn};

use tidbop_k8s::{PodInfo, PodPhase};
use tidbop_state::{Db, Member, Phase};

use crate::context::ControllerContext;
use crate::error::{ControllerError, ControllerResult};
use crate::lifecycle::{finish_phase, set_phase};
use crate::manifest;
use crate::naming::{Component, TIDB_PORT, TIDB_STATUS_PORT, component_labels, tidb_name};
use crate::placement::outer_addresses;
use crate::wait::retry_until;

pub async fn install(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    set_phase(ctx, db, Phase::SqlPending)?;
    let result = start_group(ctx, db).await;
    finish_phase(ctx, db, &result, Phase::SqlStarted, Phase::SqlFailed)?;
    result
}

async fn start_group(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    let service = ctx
        .orchestrator
        .create_service(&manifest::tidb_service(db))
        .await?;
    let (mut mysql, mut status) = (
        outer_addresses(ctx, &service, "mysql"),
        outer_addresses(ctx, &service, "status"),
    );
    if mysql.is_empty() {
        if let Some(ip) = &service.cluster_ip {
            mysql.push(format!("{ip}:{TIDB_PORT}"));
            status.push(format!("{ip}:{TIDB_STATUS_PORT}"));
        }
    }
    db.status.outer_addresses = mysql;
    db.status.outer_status_addresses = status;
    ctx.persist(db)?;

    ctx.orchestrator
        .create_replica_group(&manifest::tidb_group(&ctx.config, db))
        .await?;
    wait_healthy(ctx, db).await?;
    info!(cell = %db.cell(), replicas = db.tidb.spec.replicas, "sql started");
    Ok(())
}

/// Poll until exactly the desired number of live SQL pods are healthy and
/// answer on their status endpoint; records them as members.
pub async fn wait_healthy(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    let selector = component_labels(db.cell(), Component::Tidb);
    let desired = db.tidb.spec.replicas as usize;
    let timings = &ctx.config.timings;
    let members = retry_until(
        "sql replicas healthy",
        timings.poll_interval,
        timings.component_timeout,
        || async {
            let pods = match ctx.orchestrator.list_pods(&selector).await {
                Ok(pods) => pods,
                Err(e) => {
                    debug!(error = %e, "sql pod listing failed");
                    return Ok(None);
                }
            };
            let live: Vec<&PodInfo> = pods.iter().filter(|p| !p.terminating).collect();
            if let Some(msg) = live.iter().find_map(|p| p.unschedulable.clone()) {
                return Err(ControllerError::Unschedulable(msg));
            }
            if live.len() != desired || !live.iter().all(|p| p.is_healthy()) {
                debug!(live = live.len(), desired, "sql replicas not ready");
                return Ok(None);
            }
            for pod in &live {
                let Some(ip) = &pod.ip else {
                    return Ok(None);
                };
                let address = format!("{ip}:{TIDB_STATUS_PORT}");
                if !ctx.probe.probe(&address).await.is_healthy() {
                    debug!(pod = %pod.name, "sql status endpoint not ready");
                    return Ok(None);
                }
            }
            let mut names: Vec<String> = live.iter().map(|p| p.name.clone()).collect();
            names.sort();
            Ok(Some(names))
        },
    )
    .await?;
    db.tidb.members = members.into_iter().map(|name| Member { name }).collect();
    ctx.persist(db)
}

pub async fn uninstall(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    let cell = db.cell().to_string();
    let name = tidb_name(&cell);
    ctx.orchestrator.delete_replica_group(&name).await?;
    let deleted = ctx
        .orchestrator
        .delete_pods(&component_labels(&cell, Component::Tidb))
        .await?;
    ctx.orchestrator.delete_service(&name).await?;
    db.tidb.members.clear();
    db.status.outer_addresses.clear();
    db.status.outer_status_addresses.clear();
    ctx.persist(db)?;
    info!(%cell, pods = deleted, "sql removed");
    Ok(())
}

/// Resize the replica group to `db.tidb.spec.replicas` and wait for it.
pub async fn scale(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    let replicas = db.tidb.spec.replicas;
    ctx.orchestrator
        .scale_replica_group(&tidb_name(db.cell()), replicas)
        .await?;
    info!(cell = %db.cell(), replicas, "sql replica group resized");
    wait_healthy(ctx, db).await
}

/// Move the replica group template to the desired version and replace
/// outdated pods one by one.
pub async fn upgrade(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<u32> {
    let phase = db.phase();
    if phase < Phase::SqlStarted || phase == Phase::Uninstalling {
        return Err(ControllerError::Unavailable(format!(
            "sql of {} is not started",
            db.metadata.name
        )));
    }
    let cell = db.cell().to_string();
    let version = db.tidb.spec.version.clone();
    let pods = ctx
        .orchestrator
        .list_pods(&component_labels(&cell, Component::Tidb))
        .await?;
    let mut outdated: Vec<String> = pods
        .iter()
        .filter(|p| !p.terminating && p.version() != Some(version.as_str()))
        .map(|p| p.name.clone())
        .collect();
    if outdated.is_empty() {
        return Ok(0);
    }
    outdated.sort();

    let image = ctx.config.image(Component::Tidb.as_str(), &version);
    ctx.orchestrator
        .set_replica_group_image(&tidb_name(&cell), Component::Tidb.as_str(), &image, &version)
        .await?;
    for name in &outdated {
        info!(%cell, pod = %name, to = %version, "replacing sql pod");
        ctx.orchestrator.delete_pod(name).await?;
        tokio::time::sleep(ctx.config.timings.tidb_upgrade_settle).await;
        wait_healthy(ctx, db).await?;
    }
    Ok(outdated.len() as u32)
}

/// Delete SQL pods that stopped running so the replica group replaces
/// them. Returns how many were deleted.
pub async fn heal(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<usize> {
    let cell = db.cell().to_string();
    let pods = ctx
        .orchestrator
        .list_pods(&component_labels(&cell, Component::Tidb))
        .await?;
    let mut deleted = 0;
    for pod in pods.iter().filter(|p| {
        !p.terminating && matches!(p.phase, PodPhase::Failed | PodPhase::Succeeded | PodPhase::Unknown)
    }) {
        warn!(%cell, pod = %pod.name, phase = ?pod.phase, "deleting stopped sql pod");
        ctx.orchestrator.delete_pod(&pod.name).await?;
        deleted += 1;
    }
    let mut members: Vec<String> = ctx
        .orchestrator
        .list_pods(&component_labels(&cell, Component::Tidb))
        .await?
        .into_iter()
        .filter(PodInfo::is_healthy)
        .map(|p| p.name)
        .collect();
    members.sort();
    let members: Vec<Member> = members.into_iter().map(|name| Member { name }).collect();
    if members != db.tidb.members {
        db.tidb.members = members;
        ctx.persist(db)?;
    }
    Ok(deleted)
}
