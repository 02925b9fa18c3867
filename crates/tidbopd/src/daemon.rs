//! Controller wiring and shutdown.
//!
//! The daemon:
//! 1. Opens the cluster store
//! 2. Connects to Kubernetes and the cluster-facing HTTP/SQL clients
//! 3. Lists every cluster once so each has a lock
//! 4. Resumes operations a previous process left half done
//! 5. Follows the change feed and runs the periodic reconciler
//!
//! A diverged watch or a blocked watch handler stops the process; the
//! supervisor restarts it and recovery picks up from the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::watch;
use tracing::{error, info, warn};

use tidbop_controller::{
    ClusterController, ControllerContext, LockBookkeeper, MysqlSchemaInitializer, OperatorConfig,
    Reconciler, WatchController,
};
use tidbop_k8s::KubeOrchestrator;
use tidbop_pd::{HttpStatusProbe, PdClient};
use tidbop_state::ClusterStore;

pub async fn run(
    config_path: &Path,
    data_dir: PathBuf,
    kube_context: Option<String>,
) -> anyhow::Result<()> {
    info!("tidbop daemon starting");
    let config = OperatorConfig::from_file(config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    info!(path = %config_path.display(), namespace = %config.namespace, "config loaded");

    // ── Cluster store ──────────────────────────────────────────
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("tidbop.redb");
    let store = ClusterStore::open(&db_path)?;
    info!(path = ?db_path, revision = store.revision(), "cluster store opened");

    // ── External seams ─────────────────────────────────────────
    let orchestrator = KubeOrchestrator::connect(kube_context, &config.namespace).await?;
    let ctx = ControllerContext::new(
        config,
        store.clone(),
        Arc::new(orchestrator),
        Arc::new(PdClient::new()),
        Arc::new(HttpStatusProbe::default()),
        Arc::new(MysqlSchemaInitializer::default()),
    );
    let api = ClusterController::new(ctx.clone());
    let timings = ctx.config.timings.clone();

    // ── Watch + recovery ───────────────────────────────────────
    let bookkeeper = Arc::new(LockBookkeeper::new(ctx.locks.clone()));
    let mut watcher = WatchController::new(store, bookkeeper, timings.watch_handler_ceiling);
    watcher.initialize().await?;

    for handle in api.recover()? {
        tokio::spawn(async move {
            let (name, op) = (handle.name().to_string(), handle.op());
            match handle.wait().await {
                Ok(()) => info!(cluster = %name, %op, "recovered"),
                Err(e) => warn!(cluster = %name, %op, error = %e, "recovery failed"),
            }
        });
    }

    // ── Background tasks ───────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watch_shutdown = shutdown_rx.clone();
    let mut watch_handle = tokio::spawn(async move { watcher.watch(watch_shutdown).await });

    let reconciler = Reconciler::new(ctx);
    let reconcile_handle = tokio::spawn(async move {
        reconciler.run(timings.reconcile_interval, shutdown_rx).await;
    });

    let outcome: anyhow::Result<()> = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("installing CTRL+C handler")?;
            info!("shutdown signal received");
            Ok(())
        }
        ended = &mut watch_handle => match ended {
            Ok(Ok(())) => Err(anyhow::anyhow!("watch ended unexpectedly")),
            Ok(Err(e)) => {
                error!(error = %e, "watch failed");
                Err(e.into())
            }
            Err(e) => {
                error!(error = %e, "watch task aborted");
                Err(e.into())
            }
        },
    };

    let _ = shutdown_tx.send(true);
    let _ = reconcile_handle.await;
    if outcome.is_ok() {
        let _ = watch_handle.await;
    }
    info!("tidbop daemon stopped");
    outcome
}
