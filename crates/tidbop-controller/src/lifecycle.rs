//! Cluster lifecycle state machine.
//!
//! Functions here run without taking the cluster lock; callers hold it
//! (see [`crate::tasks`]). Compound operations such as reinstall simply
//! call the unlocked steps in sequence.
//!
//! ```text
//!   Undefined ─► PlacementPending ─► PlacementStarted ─► StoragePending ─►
//!       StorageStarted ─► SqlPending ─► SqlStarted ─► SqlInited
//!                 (each *Pending may end in its *Failed sibling)
//!   any ─► Uninstalling ─► Undefined
//! ```

use tracing::{info, warn};

use tidbop_state::{Db, Phase, Status, UpgradeState};

use crate::context::ControllerContext;
use crate::error::{ControllerError, ControllerResult};
use crate::naming::{Component, cell_labels};
use crate::wait::wait_pods_gone;
use crate::{migrate, placement, sql, storage, stores};

const UNSCHEDULABLE_REASON: &str = "Unschedulable";

pub(crate) fn set_phase(ctx: &ControllerContext, db: &mut Db, phase: Phase) -> ControllerResult<()> {
    info!(cell = %db.cell(), from = ?db.status.phase, to = ?phase, "phase change");
    db.status.phase = phase;
    ctx.persist(db)
}

/// Close a sub-install: `ok` on success, `failed` plus surfaced reason on
/// error.
pub(crate) fn finish_phase(
    ctx: &ControllerContext,
    db: &mut Db,
    result: &ControllerResult<()>,
    ok: Phase,
    failed: Phase,
) -> ControllerResult<()> {
    match result {
        Ok(()) => {
            db.status.clear_failure();
            set_phase(ctx, db, ok)
        }
        Err(e) => {
            surface_failure(&mut db.status, e);
            set_phase(ctx, db, failed)
        }
    }
}

/// Record an error on the status: a recognizable unschedulable condition
/// becomes a structured reason, anything else is kept as the message.
pub fn surface_failure(status: &mut Status, err: &ControllerError) {
    match err.unschedulable_message() {
        Some(msg) => {
            status.reason = UNSCHEDULABLE_REASON.to_string();
            status.message = msg;
        }
        None => {
            status.reason.clear();
            status.message = err.to_string();
        }
    }
}

pub async fn install(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    if db.phase() != Phase::Undefined {
        return Err(ControllerError::RepeatOperation(db.metadata.name.clone()));
    }
    let trace = ctx.events.trace(
        db.cell(),
        "tidb",
        "install",
        format!(
            "install {} pd, {} tikv, {} tidb",
            db.pd.spec.replicas, db.tikv.spec.replicas, db.tidb.spec.replicas
        ),
    );
    db.status.available = false;
    let result = install_tiers(ctx, db).await;
    trace.finish(&result);
    result
}

async fn install_tiers(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    placement::install(ctx, db).await?;
    storage::install(ctx, db).await?;
    sql::install(ctx, db).await?;
    tokio::time::sleep(ctx.config.timings.init_grace).await;
    init_schema(ctx, db).await
}

async fn init_schema(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    let result = run_schema_init(ctx, db).await;
    match &result {
        Ok(()) => {
            db.status.available = true;
            db.status.clear_failure();
            db.status.phase = Phase::SqlInited;
        }
        Err(e) => {
            surface_failure(&mut db.status, e);
            db.status.phase = Phase::SqlInitFailed;
        }
    }
    ctx.persist(db)?;
    result
}

async fn run_schema_init(ctx: &ControllerContext, db: &Db) -> ControllerResult<()> {
    let endpoint = db.status.outer_addresses.first().cloned().ok_or_else(|| {
        ControllerError::Unavailable(format!("{} has no sql endpoint", db.metadata.name))
    })?;
    let attempts = ctx.config.timings.sql_init_retries.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match ctx.schema.initialize(&endpoint, &db.schema).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(cell = %db.cell(), attempt, error = %e, "schema init failed");
                last = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(ctx.config.timings.poll_interval).await;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| ControllerError::Sql("schema init did not run".to_string())))
}

/// Mark the cluster as going away before any teardown call.
pub(crate) fn mark_uninstalling(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    db.status.available = false;
    set_phase(ctx, db, Phase::Uninstalling)
}

/// Tear everything down. A no-op for a cluster that was never installed.
pub async fn uninstall(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    if db.phase() <= Phase::Undefined {
        return Ok(());
    }
    if db.phase() != Phase::Uninstalling {
        mark_uninstalling(ctx, db)?;
    }
    let trace = ctx.events.trace(db.cell(), "tidb", "uninstall", "uninstall cluster");
    let result = teardown(ctx, db).await;

    db.status.migrate_state.clear();
    db.status.migrate_retries = 0;
    db.status.scale = Default::default();
    db.status.upgrade_state = UpgradeState::None;
    db.status.outer_addresses.clear();
    db.status.outer_status_addresses.clear();
    match &result {
        Ok(()) => {
            db.status.clear_failure();
            db.status.phase = Phase::Undefined;
        }
        Err(e) => surface_failure(&mut db.status, e),
    }
    ctx.persist(db)?;
    trace.finish(&result);
    result
}

async fn teardown(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    migrate::stop_migrator(ctx, db).await?;
    sql::uninstall(ctx, db).await?;
    storage::uninstall(ctx, db).await?;
    placement::uninstall(ctx, db).await?;
    wait_pods_gone(ctx, &cell_labels(db.cell()), ctx.config.timings.stop_timeout).await
}

pub async fn reinstall(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    uninstall(ctx, db).await?;
    install(ctx, db).await
}

/// Roll every tier onto its desired version.
pub async fn upgrade(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<()> {
    if !db.status.available {
        return Err(ControllerError::Unavailable(db.metadata.name.clone()));
    }
    let trace = ctx.events.trace(
        db.cell(),
        "tidb",
        "upgrade",
        format!(
            "upgrade to pd {}, tikv {}, tidb {}",
            db.pd.spec.version, db.tikv.spec.version, db.tidb.spec.version
        ),
    );
    db.status.upgrade_state = UpgradeState::Upgrading;
    ctx.persist(db)?;

    let result = upgrade_tiers(ctx, db).await;
    match &result {
        Ok(count) => {
            info!(cell = %db.cell(), pods = count, "upgrade finished");
            db.status.upgrade_state = UpgradeState::Upgraded;
            db.status.clear_failure();
        }
        Err(e) => {
            db.status.upgrade_state = UpgradeState::Failed;
            surface_failure(&mut db.status, e);
        }
    }
    ctx.persist(db)?;
    let result = result.map(|_| ());
    trace.finish(&result);
    result
}

async fn upgrade_tiers(ctx: &ControllerContext, db: &mut Db) -> ControllerResult<u32> {
    let mut count = placement::upgrade(ctx, db).await?;
    count += storage::upgrade(ctx, db).await?;
    count += sql::upgrade(ctx, db).await?;
    Ok(count)
}

/// Whether any pod of the cluster runs a version other than its tier's.
pub async fn needs_upgrade(ctx: &ControllerContext, db: &Db) -> ControllerResult<bool> {
    let pods = ctx.orchestrator.list_pods(&cell_labels(db.cell())).await?;
    Ok(pods.iter().filter(|p| !p.terminating).any(|pod| {
        let desired = match pod.labels.get("component").map(String::as_str) {
            Some(c) if c == Component::Pd.as_str() => &db.pd.spec.version,
            Some(c) if c == Component::Tikv.as_str() => &db.tikv.spec.version,
            Some(c) if c == Component::Tidb.as_str() => &db.tidb.spec.version,
            _ => return false,
        };
        pod.version() != Some(desired.as_str())
    }))
}

/// Bring the tiers to the replica counts already written into their specs.
///
/// The caller has set the sticky scaling flag; it is cleared here whatever
/// the outcome, with a failure bit per tier.
pub async fn scale(
    ctx: &ControllerContext,
    db: &mut Db,
    storage_replicas: Option<u32>,
    sql_replicas: Option<u32>,
) -> ControllerResult<()> {
    let trace = ctx.events.trace(
        db.cell(),
        "tidb",
        "scale",
        format!("scale tikv {storage_replicas:?}, tidb {sql_replicas:?}"),
    );
    let mut result = Ok(());
    if let Some(replicas) = storage_replicas {
        db.tikv.spec.replicas = replicas;
        if let Err(e) = stores::reconcile(ctx, db).await {
            db.status.scale.storage_failed = true;
            result = Err(e);
        }
    }
    if let Some(replicas) = sql_replicas {
        db.tidb.spec.replicas = replicas;
        if let Err(e) = sql::scale(ctx, db).await {
            db.status.scale.sql_failed = true;
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    db.status.scale.scaling = false;
    if let Err(e) = &result {
        surface_failure(&mut db.status, e);
    }
    ctx.persist(db)?;
    trace.finish(&result);
    result
}

/// What startup recovery should do with a cluster a crash interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Reinstall,
    Uninstall,
}

pub fn recovery_for(db: &Db) -> Option<Recovery> {
    let phase = db.phase();
    match db.operator.as_str() {
        "start" | "restart" if phase > Phase::Undefined && phase < Phase::SqlInited => {
            Some(Recovery::Reinstall)
        }
        "stop" if phase != Phase::Undefined && phase > Phase::Auditing => Some(Recovery::Uninstall),
        _ => None,
    }
}

/// Clear flags a crashed operation left behind; returns whether any was.
pub fn clear_stale_flags(db: &mut Db) -> bool {
    let mut changed = false;
    if db.status.scale.scaling {
        db.status.scale.scaling = false;
        changed = true;
    }
    if db.status.upgrade_state == UpgradeState::Upgrading {
        db.status.upgrade_state = UpgradeState::Failed;
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unschedulable_errors_become_a_reason() {
        let mut status = Status::default();
        surface_failure(&mut status, &ControllerError::Unschedulable("no nodes".into()));
        assert_eq!(status.reason, "Unschedulable");
        assert_eq!(status.message, "no nodes");

        surface_failure(&mut status, &ControllerError::Sql("access denied".into()));
        assert!(status.reason.is_empty());
        assert!(status.message.contains("access denied"));
    }

    #[test]
    fn recovery_decisions() {
        let mut db = Db::default();
        db.operator = "start".to_string();
        db.status.phase = Phase::StoragePending;
        assert_eq!(recovery_for(&db), Some(Recovery::Reinstall));
        db.status.phase = Phase::SqlInited;
        assert_eq!(recovery_for(&db), None);
        db.operator = "stop".to_string();
        db.status.phase = Phase::Uninstalling;
        assert_eq!(recovery_for(&db), Some(Recovery::Uninstall));
        db.status.phase = Phase::Undefined;
        assert_eq!(recovery_for(&db), None);
        db.operator = "scale".to_string();
        db.status.phase = Phase::SqlInited;
        assert_eq!(recovery_for(&db), None);
    }

    #[test]
    fn stale_flags_are_cleared() {
        let mut db = Db::default();
        assert!(!clear_stale_flags(&mut db));
        db.status.scale.scaling = true;
        db.status.upgrade_state = UpgradeState::Upgrading;
        assert!(clear_stale_flags(&mut db));
        assert!(!db.status.scale.scaling);
        assert_eq!(db.status.upgrade_state, UpgradeState::Failed);
    }
}
