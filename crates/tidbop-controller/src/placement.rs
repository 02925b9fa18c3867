//! Placement (PD) tier controller.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use tidbop_k8s::{PodInfo, PodPhase, ServiceInfo};
use tidbop_state::{Db, Member, Phase};

use crate::context::ControllerContext;
use crate::error::{ControllerError, ControllerResult};
use crate::lifecycle::{finish_phase, set_phase};
use crate::manifest::{self, PdBootstrap};
use crate::naming::{Component, PD_CLIENT_PORT, component_labels, pod_name};
use crate::wait::{retry_until, wait_pod_running};

/// Node-port addresses reachable through the configured proxies.
pub(crate) fn outer_addresses(ctx: &ControllerContext, service: &ServiceInfo, port: &str) -> Vec<String> {
    match service.node_ports.get(port) {
        Some(node_port) => ctx
            .config
            .proxies
            .iter()
            .map(|proxy| format!("{proxy}:{node_port}"))
            .collect(),
        None => Vec::new(),
    }
}

pub async fn install(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    set_phase(ctx, db, Phase::PlacementPending)?;
    let result = start_members(ctx, db).await;
    finish_phase(ctx, db, &result, Phase::PlacementStarted, Phase::PlacementFailed)?;
    result
}

async fn start_members(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    let [peer, client] = manifest::pd_services(db);
    ctx.orchestrator.create_service(&peer).await?;
    let client = ctx.orchestrator.create_service(&client).await?;
    db.pd.inner_addresses = client
        .cluster_ip
        .iter()
        .map(|ip| format!("{ip}:{PD_CLIENT_PORT}"))
        .collect();
    db.pd.outer_addresses = outer_addresses(ctx, &client, "client");
    ctx.persist(db)?;

    let cell = db.cell().to_string();
    let first = db.pd.member_seq + 1;
    let seqs: Vec<u32> = (first..first + db.pd.spec.replicas).collect();
    let initial: Vec<String> = seqs
        .iter()
        .map(|seq| pod_name(Component::Pd, &cell, *seq))
        .collect();
    let bootstrap = PdBootstrap::Initial(initial.clone());

    for seq in &seqs {
        let pod = manifest::pd_pod(&ctx.config, db, *seq, &bootstrap);
        ctx.orchestrator.create_pod(&pod).await?;
        db.pd.member_seq = *seq;
        db.pd.members.push(Member { name: pod.name });
        ctx.persist(db)?;
    }
    for name in &initial {
        wait_pod_running(ctx, name, ctx.config.timings.pod_timeout).await?;
    }
    wait_for_quorum(ctx, db).await?;
    info!(%cell, members = initial.len(), "placement started");
    Ok(())
}

/// Poll until placement reports a leader and every recorded member.
async fn wait_for_quorum(ctx: &ControllerContext, db: &Db) -> ControllerResult<()> {
    let endpoint = ControllerContext::pd_endpoint(db)?;
    let expected = db.pd.members.len();
    let timings = &ctx.config.timings;
    retry_until(
        "placement leader",
        timings.poll_interval,
        timings.component_timeout,
        || async {
            let leader = match ctx.placement.leader(&endpoint).await {
                Ok(leader) => leader,
                Err(e) => {
                    debug!(%endpoint, error = %e, "no placement leader yet");
                    return Ok(None);
                }
            };
            match ctx.placement.members(&endpoint).await {
                Ok(members) if members.len() >= expected => {
                    debug!(leader = %leader.name, "placement quorum formed");
                    Ok(Some(()))
                }
                Ok(members) => {
                    debug!(have = members.len(), expected, "placement members still joining");
                    Ok(None)
                }
                Err(e) => {
                    debug!(%endpoint, error = %e, "placement members unavailable");
                    Ok(None)
                }
            }
        },
    )
    .await
}

pub async fn uninstall(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    let cell = db.cell().to_string();
    let deleted = ctx
        .orchestrator
        .delete_pods(&component_labels(&cell, Component::Pd))
        .await?;
    for service in manifest::pd_services(db) {
        ctx.orchestrator.delete_service(&service.name).await?;
    }
    db.pd.members.clear();
    db.pd.inner_addresses.clear();
    db.pd.outer_addresses.clear();
    ctx.persist(db)?;
    info!(%cell, pods = deleted, "placement removed");
    Ok(())
}

/// Roll placement members onto the desired version, one at a time.
pub async fn upgrade(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<u32> {
    let phase = db.phase();
    if phase < Phase::PlacementStarted || phase == Phase::Uninstalling {
        return Err(ControllerError::Unavailable(format!(
            "placement of {} is not started",
            db.metadata.name
        )));
    }
    let version = db.pd.spec.version.clone();
    let image = ctx.config.image(Component::Pd.as_str(), &version);
    let mut upgraded = 0;
    for member in db.pd.members.clone() {
        let Some(pod) = ctx.orchestrator.get_pod(&member.name).await? else {
            warn!(pod = %member.name, "placement pod missing, skipping upgrade");
            continue;
        };
        if pod.version() == Some(version.as_str()) {
            continue;
        }
        info!(pod = %member.name, from = ?pod.version(), to = %version, "upgrading placement member");
        ctx.orchestrator
            .set_pod_image(&member.name, Component::Pd.as_str(), &image, &version)
            .await?;
        tokio::time::sleep(ctx.config.timings.pd_upgrade_settle).await;
        wait_pod_running(ctx, &member.name, ctx.config.timings.pod_timeout).await?;
        wait_for_quorum(ctx, db).await?;
        upgraded += 1;
    }
    Ok(upgraded)
}

fn is_dead(pod: Option<&PodInfo>) -> bool {
    match pod {
        None => true,
        Some(pod) => {
            pod.terminating
                || matches!(
                    pod.phase,
                    PodPhase::Failed | PodPhase::Succeeded | PodPhase::Unknown
                )
        }
    }
}

/// Replace dead members and drop placement members nobody owns.
/// Returns whether anything changed.
pub async fn reconcile_members(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<bool> {
    let cell = db.cell().to_string();
    let endpoint = ControllerContext::pd_endpoint(db)?;
    let pods: BTreeMap<String, PodInfo> = ctx
        .orchestrator
        .list_pods(&component_labels(&cell, Component::Pd))
        .await?
        .into_iter()
        .map(|pod| (pod.name.clone(), pod))
        .collect();

    let mut changed = false;
    for index in 0..db.pd.members.len() {
        let name = db.pd.members[index].name.clone();
        if !is_dead(pods.get(&name)) {
            continue;
        }
        warn!(%cell, member = %name, "placement member down, replacing");
        ctx.placement.delete_member(&endpoint, &name).await?;
        ctx.orchestrator.delete_pod(&name).await?;

        let seq = db.pd.member_seq + 1;
        let pod = manifest::pd_pod(&ctx.config, db, seq, &PdBootstrap::Join);
        ctx.orchestrator.create_pod(&pod).await?;
        db.pd.member_seq = seq;
        db.pd.members[index] = Member { name: pod.name };
        ctx.persist(db)?;
        changed = true;
    }

    let known: BTreeSet<&str> = db.pd.members.iter().map(|m| m.name.as_str()).collect();
    for member in ctx.placement.members(&endpoint).await? {
        if !known.contains(member.name.as_str()) {
            warn!(%cell, member = %member.name, "removing unknown placement member");
            ctx.placement.delete_member(&endpoint, &member.name).await?;
            changed = true;
        }
    }
    Ok(changed)
}
