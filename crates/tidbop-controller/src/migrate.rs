//! Data migration into a running cluster.
//!
//! A migrator pod copies an external MySQL database into the cluster and
//! reports progress back through `SyncMigrateStat`.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tidbop_state::{Db, EventKind};

use crate::context::ControllerContext;
use crate::error::{ControllerError, ControllerResult};
use crate::manifest;
use crate::naming::migrator_name;
use crate::wait::wait_pod_running;

/// Retries after which a failing migration is stopped.
pub const MAX_MIGRATE_RETRIES: u32 = 10;

pub const MIGRATING: &str = "Migrating";
pub const START_FAILED: &str = "StartMigrationTaskError";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateSource {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateRequest {
    pub source: MigrateSource,
    /// Where the migrator reports state changes.
    pub notify_url: String,
    /// Keep replicating after the initial load.
    #[serde(default)]
    pub sync: bool,
}

impl MigrateRequest {
    pub fn validate(&self, db: &Db) -> ControllerResult<()> {
        let s = &self.source;
        if s.host.is_empty() || s.port == 0 || s.user.is_empty() || s.database.is_empty() {
            return Err(ControllerError::Validation(
                "migration source needs host, port, user and database".to_string(),
            ));
        }
        if self.notify_url.is_empty() {
            return Err(ControllerError::Validation(
                "migration needs a notify url".to_string(),
            ));
        }
        if s.database != db.schema.name {
            return Err(ControllerError::Validation(format!(
                "source database {} differs from schema {}",
                s.database, db.schema.name
            )));
        }
        Ok(())
    }
}

/// Progress a migrator reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateStat {
    Finished,
    Syncing,
    Dumping,
    DumpError,
    Loading,
    LoadError,
}

impl MigrateStat {
    pub fn parse(state: &str) -> ControllerResult<Self> {
        match state {
            "Finished" => Ok(MigrateStat::Finished),
            "Syncing" => Ok(MigrateStat::Syncing),
            "Dumping" => Ok(MigrateStat::Dumping),
            "DumpError" => Ok(MigrateStat::DumpError),
            "Loading" => Ok(MigrateStat::Loading),
            "LoadError" => Ok(MigrateStat::LoadError),
            other => Err(ControllerError::Validation(format!(
                "unknown migration state {other:?}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrateStat::Finished => "Finished",
            MigrateStat::Syncing => "Syncing",
            MigrateStat::Dumping => "Dumping",
            MigrateStat::DumpError => "DumpError",
            MigrateStat::Loading => "Loading",
            MigrateStat::LoadError => "LoadError",
        }
    }
}

/// Whether a migration is underway according to the recorded state.
pub fn in_progress(db: &Db) -> bool {
    matches!(
        db.status.migrate_state.as_str(),
        MIGRATING | "Syncing" | "Dumping" | "Loading"
    )
}

/// Checks done while holding the lock, before the task is spawned.
pub fn prepare(db: &mut Db, req: &MigrateRequest) -> ControllerResult<()> {
    if !db.status.available {
        return Err(ControllerError::Unavailable(db.metadata.name.clone()));
    }
    req.validate(db)?;
    if db.status.migrate_state == MigrateStat::Finished.as_str() {
        return Err(ControllerError::Validation(format!(
            "{} has already been migrated",
            db.metadata.name
        )));
    }
    if in_progress(db) {
        return Err(ControllerError::RepeatOperation(db.metadata.name.clone()));
    }
    db.status.migrate_state = MIGRATING.to_string();
    db.status.migrate_retries = 0;
    db.operator = "migrate".to_string();
    Ok(())
}

/// Start the migrator pod.
pub async fn start(ctx: &ControllerContext, db: &mut Db, req: &MigrateRequest) -> ControllerResult<()> {
    let trace = ctx.events.trace(
        db.cell(),
        "tidb/migrator",
        "migrate",
        format!("migrate from {}:{}", req.source.host, req.source.port),
    );
    let result = launch(ctx, db, req).await;
    if result.is_err() {
        db.status.migrate_state = START_FAILED.to_string();
        ctx.persist(db)?;
    }
    trace.finish(&result);
    result
}

async fn launch(ctx: &ControllerContext, db: &Db, req: &MigrateRequest) -> ControllerResult<()> {
    let name = migrator_name(db.cell());
    if ctx.orchestrator.get_pod(&name).await?.is_some() {
        return Err(ControllerError::RepeatOperation(name));
    }
    ctx.orchestrator
        .create_pod(&manifest::migrator_pod(&ctx.config, db, req))
        .await?;
    wait_pod_running(ctx, &name, ctx.config.timings.pod_timeout).await?;
    info!(cell = %db.cell(), pod = %name, "migrator started");
    Ok(())
}

pub async fn stop_migrator(ctx: &ControllerContext, db: &Db) -> ControllerResult<()> {
    ctx.orchestrator.delete_pod(&migrator_name(db.cell())).await?;
    Ok(())
}

/// Count one retry; past the limit the migrator is stopped.
async fn count_retry(
    ctx: &ControllerContext,
    db: &mut Db,
    stat: MigrateStat,
    reason: &str,
) -> ControllerResult<()> {
    db.status.migrate_retries += 1;
    if db.status.migrate_retries <= MAX_MIGRATE_RETRIES {
        return Ok(());
    }
    warn!(cell = %db.cell(), state = stat.as_str(), %reason, "migration retries exhausted");
    stop_migrator(ctx, db).await?;
    ctx.events.record(
        db.cell(),
        "tidb/migrator",
        "migrate",
        EventKind::Error,
        format!("migration stopped after {MAX_MIGRATE_RETRIES} retries"),
    );
    Ok(())
}

/// Apply a progress report from the migrator.
pub async fn sync_stat(
    ctx: &ControllerContext,
    db: &mut Db,
    stat: MigrateStat,
    reason: &str,
) -> ControllerResult<()> {
    let cell = db.cell().to_string();
    match stat {
        MigrateStat::Finished => {
            stop_migrator(ctx, db).await?;
            ctx.events.record(
                &cell,
                "tidb/migrator",
                "migrate",
                EventKind::Ok,
                "migration finished".to_string(),
            );
        }
        MigrateStat::Syncing => ctx.events.record(
            &cell,
            "tidb/migrator",
            "migrate",
            EventKind::Ok,
            "data loaded, incremental sync running".to_string(),
        ),
        MigrateStat::Loading => {}
        MigrateStat::Dumping => match db.status.migrate_state.clone().as_str() {
            "" | MIGRATING => {}
            "DumpError" => count_retry(ctx, db, stat, reason).await?,
            prior => {
                // A restarted dump means the job moved nodes; its partial copy is unusable.
                warn!(%cell, %prior, "migrator restarted its dump, stopping it");
                stop_migrator(ctx, db).await?;
                ctx.events.record(
                    &cell,
                    "tidb/migrator",
                    "migrate",
                    EventKind::Error,
                    format!("migrator restarted after {prior}, stopped to keep data consistent"),
                );
            }
        },
        MigrateStat::DumpError | MigrateStat::LoadError => {
            warn!(%cell, state = stat.as_str(), %reason, "migration error");
            ctx.events.record(
                &cell,
                "tidb/migrator",
                "migrate",
                EventKind::Warning,
                format!("{}: {reason}", stat.as_str()),
            );
            count_retry(ctx, db, stat, reason).await?;
        }
    }
    db.status.migrate_state = stat.as_str().to_string();
    ctx.persist(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(database: &str) -> MigrateRequest {
        MigrateRequest {
            source: MigrateSource {
                host: "10.9.0.1".to_string(),
                port: 3306,
                user: "root".to_string(),
                password: "pw".to_string(),
                database: database.to_string(),
            },
            notify_url: "http://api/stat".to_string(),
            sync: false,
        }
    }

    fn available_db() -> Db {
        let mut db = Db::default();
        db.metadata.name = "001-shop".to_string();
        db.schema.name = "shop".to_string();
        db.status.available = true;
        db
    }

    #[test]
    fn prepare_marks_migrating() {
        let mut db = available_db();
        prepare(&mut db, &request("shop")).unwrap();
        assert_eq!(db.status.migrate_state, MIGRATING);
        assert!(in_progress(&db));
        let err = prepare(&mut db, &request("shop")).unwrap_err();
        assert!(matches!(err, ControllerError::RepeatOperation(_)));
    }

    #[test]
    fn prepare_rejects_bad_requests() {
        let mut db = available_db();
        assert!(prepare(&mut db, &request("other")).is_err());
        let mut incomplete = request("shop");
        incomplete.source.host.clear();
        assert!(prepare(&mut db, &incomplete).is_err());
        db.status.migrate_state = "Finished".to_string();
        assert!(prepare(&mut db, &request("shop")).is_err());
        let mut down = available_db();
        down.status.available = false;
        assert!(matches!(
            prepare(&mut down, &request("shop")),
            Err(ControllerError::Unavailable(_))
        ));
    }

    #[test]
    fn stat_parsing() {
        for s in ["Finished", "Syncing", "Dumping", "DumpError", "Loading", "LoadError"] {
            assert_eq!(MigrateStat::parse(s).unwrap().as_str(), s);
        }
        assert!(matches!(
            MigrateStat::parse("Exploded"),
            Err(ControllerError::Validation(_))
        ));
    }
}
