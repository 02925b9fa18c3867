//! Outward cluster API.
//!
//! Mutating calls validate synchronously and return a [`TaskHandle`]; the
//! lifecycle work itself runs in the background under the cluster lock.

use serde_json::Value;
use tracing::info;

use tidbop_state::{
    Db, Event, EventKind, ObjectMeta, Phase, Placement, ScaleStatus, Sql, StateError, Status,
    Storage, UpgradeState, epoch_secs,
};

use crate::context::{Context, ControllerContext};
use crate::error::{ControllerError, ControllerResult};
use crate::intent::Intent;
use crate::lifecycle::{self, Recovery};
use crate::migrate::{self, MigrateRequest, MigrateStat};
use crate::naming::{cell_labels, cluster_name, owner_prefix};
use crate::policy::{self, Tier};
use crate::tasks::{Prepared, TaskHandle, submit};

/// Entry point for every cluster operation.
#[derive(Clone)]
pub struct ClusterController {
    ctx: Context,
}

impl ClusterController {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Validate and store a new cluster; returns the stored object.
    pub async fn save(&self, db: Db) -> ControllerResult<Db> {
        let ctx = &self.ctx;
        let Db {
            owner,
            schema,
            pd,
            tikv,
            tidb,
            ..
        } = db;
        if owner.user_id.is_empty() {
            return Err(ControllerError::Validation("owner user id is empty".to_string()));
        }
        policy::validate_schema(&schema)?;
        let (mut pd_spec, mut tikv_spec, mut tidb_spec) = (pd.spec, tikv.spec, tidb.spec);
        for (spec, tier) in [
            (&mut pd_spec, Tier::Placement),
            (&mut tikv_spec, Tier::Storage),
            (&mut tidb_spec, Tier::Sql),
        ] {
            policy::normalize_spec(spec, tier, &ctx.config);
            policy::validate_spec(spec, tier, &ctx.config)?;
        }

        let name = cluster_name(&owner.user_id, &schema.name);
        if ctx.store.get_db(&name)?.is_some() {
            return Err(ControllerError::Validation(format!("cluster {name} already exists")));
        }
        let leftovers = ctx.orchestrator.list_pods(&cell_labels(&name)).await?;
        if !leftovers.is_empty() {
            return Err(ControllerError::Validation(format!(
                "{} pods of an earlier {name} still exist",
                leftovers.len()
            )));
        }

        let mut fresh = Db {
            metadata: ObjectMeta {
                name: name.clone(),
                resource_version: 0,
                created_at: epoch_secs(),
            },
            owner,
            schema,
            pd: Placement {
                spec: pd_spec,
                ..Placement::default()
            },
            tikv: Storage {
                spec: tikv_spec,
                ..Storage::default()
            },
            tidb: Sql {
                spec: tidb_spec,
                ..Sql::default()
            },
            operator: String::new(),
            status: Status::default(),
        };
        let mine: Vec<Db> = ctx
            .store
            .list_dbs()?
            .items
            .into_iter()
            .filter(|d| d.owner.user_id == fresh.owner.user_id)
            .collect();
        fresh.status.phase = if policy::needs_approval(&ctx.config, &mine, &fresh) {
            Phase::Auditing
        } else {
            Phase::Undefined
        };

        let created = ctx.store.create_db(&fresh).map_err(|e| match e {
            StateError::AlreadyExists(_) => {
                ControllerError::Validation(format!("cluster {name} already exists"))
            }
            other => other.into(),
        })?;
        ctx.locks.register(&name);
        let message = match created.phase() {
            Phase::Auditing => "cluster saved, waiting for approval",
            _ => "cluster saved",
        };
        ctx.events
            .record(&name, "tidb", "save", EventKind::Ok, message.to_string());
        info!(cluster = %name, phase = ?created.phase(), "cluster saved");
        Ok(created)
    }

    pub fn install(&self, name: &str) -> ControllerResult<TaskHandle> {
        submit(
            &self.ctx,
            name,
            "install",
            |ctx, db| {
                if db.phase() != Phase::Undefined {
                    return Err(ControllerError::RepeatOperation(db.metadata.name.clone()));
                }
                db.operator = "start".to_string();
                ctx.persist(db)?;
                Ok(Prepared::Run)
            },
            |ctx, mut db| async move { lifecycle::install(&ctx, &mut db).await },
        )
    }

    pub fn uninstall(&self, name: &str) -> ControllerResult<TaskHandle> {
        submit(
            &self.ctx,
            name,
            "uninstall",
            |ctx, db| {
                if db.phase() <= Phase::Undefined {
                    return Ok(Prepared::Done);
                }
                db.operator = "stop".to_string();
                lifecycle::mark_uninstalling(ctx, db)?;
                Ok(Prepared::Run)
            },
            |ctx, mut db| async move { lifecycle::uninstall(&ctx, &mut db).await },
        )
    }

    pub fn reinstall(&self, name: &str) -> ControllerResult<TaskHandle> {
        submit(
            &self.ctx,
            name,
            "reinstall",
            |ctx, db| {
                if db.phase() < Phase::Undefined {
                    return Err(ControllerError::Validation(format!(
                        "{} has not been approved",
                        db.metadata.name
                    )));
                }
                db.operator = "restart".to_string();
                if db.phase() > Phase::Undefined {
                    lifecycle::mark_uninstalling(ctx, db)?;
                } else {
                    ctx.persist(db)?;
                }
                Ok(Prepared::Run)
            },
            |ctx, mut db| async move { lifecycle::reinstall(&ctx, &mut db).await },
        )
    }

    /// Decode an update request and apply it.
    pub fn update(&self, name: &str, patch: &Value) -> ControllerResult<TaskHandle> {
        let intent = Intent::decode(patch)?;
        self.apply(name, intent)
    }

    pub fn apply(&self, name: &str, intent: Intent) -> ControllerResult<TaskHandle> {
        match intent {
            Intent::Audit { approved, reason } => self.locked(name, "audit", |ctx, db| {
                if !matches!(db.phase(), Phase::Auditing | Phase::Refuse) {
                    return Err(ControllerError::Validation(format!(
                        "{} is not waiting for approval",
                        db.metadata.name
                    )));
                }
                db.status.phase = if approved {
                    Phase::Undefined
                } else {
                    Phase::Refuse
                };
                db.owner.reason = reason.clone();
                db.operator = "audit".to_string();
                ctx.persist(db)?;
                let verdict = if approved { "approved" } else { "refused" };
                ctx.events.record(
                    db.cell(),
                    "tidb",
                    "audit",
                    EventKind::Ok,
                    format!("cluster {verdict}"),
                );
                Ok(())
            }),
            Intent::Start => self.install(name),
            Intent::Stop => self.uninstall(name),
            Intent::Restart => self.reinstall(name),
            Intent::Upgrade { pd, tikv, tidb } => self.upgrade(name, pd, tikv, tidb),
            Intent::Scale { tikv, tidb } => self.scale(name, tikv, tidb),
            Intent::SyncMigrateStat { state, reason } => {
                self.sync_migrate_stat(name, &state, &reason)
            }
            Intent::Patch { desc } => self.locked(name, "patch", |ctx, db| {
                db.owner.desc = desc.clone();
                ctx.persist(db)
            }),
        }
    }

    /// Run a short synchronous change under the cluster lock.
    fn locked<F>(&self, name: &str, op: &'static str, f: F) -> ControllerResult<TaskHandle>
    where
        F: FnOnce(&ControllerContext, &mut Db) -> ControllerResult<()>,
    {
        let (_guard, mut db) = self.ctx.locks.try_lock(&self.ctx.store, name)?;
        f(&self.ctx, &mut db)?;
        Ok(TaskHandle::ready(name, op, Ok(())))
    }

    fn upgrade(
        &self,
        name: &str,
        pd: Option<String>,
        tikv: Option<String>,
        tidb: Option<String>,
    ) -> ControllerResult<TaskHandle> {
        submit(
            &self.ctx,
            name,
            "upgrade",
            |ctx, db| {
                if !db.status.available {
                    return Err(ControllerError::Unavailable(db.metadata.name.clone()));
                }
                if db.status.upgrade_state == UpgradeState::Upgrading {
                    return Err(ControllerError::RepeatOperation(db.metadata.name.clone()));
                }
                let mut changed = false;
                for (target, spec) in [
                    (&pd, &mut db.pd.spec),
                    (&tikv, &mut db.tikv.spec),
                    (&tidb, &mut db.tidb.spec),
                ] {
                    let Some(version) = target else { continue };
                    if !ctx.config.allows_version(version) {
                        return Err(ControllerError::Validation(format!(
                            "version {version} is not allowed"
                        )));
                    }
                    if spec.version != *version {
                        spec.version = version.clone();
                        changed = true;
                    }
                }
                if !changed {
                    return Err(ControllerError::Validation("nothing to upgrade".to_string()));
                }
                db.operator = "upgrade".to_string();
                ctx.persist(db)?;
                Ok(Prepared::Run)
            },
            |ctx, mut db| async move { lifecycle::upgrade(&ctx, &mut db).await },
        )
    }

    fn scale(&self, name: &str, tikv: Option<u32>, tidb: Option<u32>) -> ControllerResult<TaskHandle> {
        submit(
            &self.ctx,
            name,
            "scale",
            |ctx, db| {
                if !db.status.available {
                    return Err(ControllerError::Unavailable(db.metadata.name.clone()));
                }
                if db.status.scale.scaling {
                    return Err(ControllerError::RepeatOperation(db.metadata.name.clone()));
                }
                let tikv_change = tikv.filter(|n| *n != db.tikv.spec.replicas);
                let tidb_change = tidb.filter(|n| *n != db.tidb.spec.replicas);
                if tikv_change.is_none() && tidb_change.is_none() {
                    return Err(ControllerError::Validation("nothing to scale".to_string()));
                }
                if let Some(n) = tikv_change {
                    policy::check_scale(Tier::Storage, db.tikv.spec.replicas, n, &ctx.config)?;
                }
                if let Some(n) = tidb_change {
                    policy::check_scale(Tier::Sql, db.tidb.spec.replicas, n, &ctx.config)?;
                }
                if let Some(n) = tikv_change {
                    db.tikv.spec.replicas = n;
                }
                if let Some(n) = tidb_change {
                    db.tidb.spec.replicas = n;
                }
                db.status.scale = ScaleStatus {
                    scaling: true,
                    ..ScaleStatus::default()
                };
                db.operator = "scale".to_string();
                ctx.persist(db)?;
                Ok(Prepared::Run)
            },
            move |ctx, mut db| async move {
                let storage = tikv.map(|_| db.tikv.spec.replicas);
                let sql = tidb.map(|_| db.tidb.spec.replicas);
                lifecycle::scale(&ctx, &mut db, storage, sql).await
            },
        )
    }

    pub fn get_db(&self, name: &str) -> ControllerResult<Db> {
        self.ctx.load(name)
    }

    /// Clusters visible to `user_id`; an admin sees all of them.
    pub fn get_dbs(&self, user_id: &str, admin: bool) -> ControllerResult<Vec<Db>> {
        let prefix = owner_prefix(user_id);
        Ok(self
            .ctx
            .store
            .list_dbs()?
            .items
            .into_iter()
            .filter(|db| admin || db.metadata.name.starts_with(&prefix))
            .collect())
    }

    /// Uninstall, then remove the object, its events and its lock.
    pub fn delete(&self, name: &str) -> ControllerResult<TaskHandle> {
        submit(
            &self.ctx,
            name,
            "delete",
            |ctx, db| {
                if db.phase() > Phase::Undefined {
                    db.operator = "stop".to_string();
                    lifecycle::mark_uninstalling(ctx, db)?;
                }
                Ok(Prepared::Run)
            },
            |ctx, mut db| async move {
                lifecycle::uninstall(&ctx, &mut db).await?;
                let name = db.metadata.name.clone();
                ctx.store.delete_db(&name)?;
                let events = ctx.store.delete_events(&name)?;
                ctx.locks.recycle(&name);
                info!(cluster = %name, events, "cluster deleted");
                Ok(())
            },
        )
    }

    pub fn migrate(&self, name: &str, req: MigrateRequest) -> ControllerResult<TaskHandle> {
        let task_req = req.clone();
        submit(
            &self.ctx,
            name,
            "migrate",
            |ctx, db| {
                migrate::prepare(db, &req)?;
                ctx.persist(db)?;
                Ok(Prepared::Run)
            },
            move |ctx, mut db| async move { migrate::start(&ctx, &mut db, &task_req).await },
        )
    }

    pub fn sync_migrate_stat(
        &self,
        name: &str,
        state: &str,
        reason: &str,
    ) -> ControllerResult<TaskHandle> {
        let stat = MigrateStat::parse(state)?;
        let reason = reason.to_string();
        submit(
            &self.ctx,
            name,
            "syncMigrateStat",
            |_, _| Ok(Prepared::Run),
            move |ctx, mut db| async move {
                migrate::sync_stat(&ctx, &mut db, stat, &reason).await
            },
        )
    }

    pub fn events(&self, name: &str) -> ControllerResult<Vec<Event>> {
        Ok(self.ctx.store.list_events(name)?)
    }

    /// Repair what a crash left behind: clear sticky flags and resume
    /// interrupted installs and uninstalls.
    pub fn recover(&self) -> ControllerResult<Vec<TaskHandle>> {
        let mut handles = Vec::new();
        for db in self.ctx.store.list_dbs()?.items {
            let name = db.metadata.name.clone();
            self.ctx.locks.register(&name);
            let mut probe = db.clone();
            if lifecycle::clear_stale_flags(&mut probe) {
                info!(cluster = %name, "clearing flags left by an interrupted operation");
                self.ctx.mutate(&name, |db| {
                    lifecycle::clear_stale_flags(db);
                    Ok(())
                })?;
            }
            let handle = match lifecycle::recovery_for(&db) {
                Some(Recovery::Reinstall) => self.reinstall(&name)?,
                Some(Recovery::Uninstall) => self.uninstall(&name)?,
                None => continue,
            };
            info!(cluster = %name, op = handle.op(), phase = ?db.phase(), "resuming interrupted operation");
            handles.push(handle);
        }
        Ok(handles)
    }
}
