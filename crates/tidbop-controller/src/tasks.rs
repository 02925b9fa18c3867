//! Per-cluster task executor.
//!
//! Submission takes the cluster lock synchronously, so a second request for
//! a busy cluster fails at once with `RepeatOperation`. The work then runs
//! on its own task holding the lock, and reports through a oneshot channel.

use std::future::Future;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use tidbop_state::Db;

use crate::context::{Context, ControllerContext};
use crate::error::{ControllerError, ControllerResult};

/// Completion handle of a submitted operation.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    op: &'static str,
    rx: oneshot::Receiver<ControllerResult<()>>,
}

impl TaskHandle {
    /// A handle that is already complete.
    pub(crate) fn ready(name: &str, op: &'static str, result: ControllerResult<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self {
            name: name.to_string(),
            op,
            rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Wait for the operation's result.
    pub async fn wait(self) -> ControllerResult<()> {
        self.rx.await.unwrap_or_else(|_| {
            Err(ControllerError::Internal(format!(
                "{} task for {} ended without a result",
                self.op, self.name
            )))
        })
    }
}

/// Outcome of the synchronous preparation step.
pub(crate) enum Prepared {
    /// Spawn the work.
    Run,
    /// Nothing to do; complete immediately with success.
    Done,
}

/// Lock `name`, run `prepare` on the fresh copy, then spawn `work`.
///
/// `prepare` persists whatever it changes. Any error from locking or
/// preparing is returned directly and releases the lock.
pub(crate) fn submit<P, W, Fut>(
    ctx: &Context,
    name: &str,
    op: &'static str,
    prepare: P,
    work: W,
) -> ControllerResult<TaskHandle>
where
    P: FnOnce(&ControllerContext, &mut Db) -> ControllerResult<Prepared>,
    W: FnOnce(Context, Db) -> Fut + Send + 'static,
    Fut: Future<Output = ControllerResult<()>> + Send + 'static,
{
    let (guard, mut db) = ctx.locks.try_lock(&ctx.store, name)?;
    match prepare(ctx, &mut db)? {
        Prepared::Done => {
            debug!(cluster = %name, %op, "nothing to do");
            return Ok(TaskHandle::ready(name, op, Ok(())));
        }
        Prepared::Run => {}
    }

    let (tx, rx) = oneshot::channel();
    let task_ctx = Context::clone(ctx);
    let cluster = name.to_string();
    tokio::spawn(async move {
        let result = work(task_ctx, db).await;
        drop(guard);
        match &result {
            Ok(()) => debug!(%cluster, %op, "task finished"),
            Err(e) if e.is_severe() => error!(%cluster, %op, error = %e, "task failed"),
            Err(e) => warn!(%cluster, %op, error = %e, "task failed"),
        }
        // The submitter may have stopped listening.
        let _ = tx.send(result);
    });
    Ok(TaskHandle {
        name: name.to_string(),
        op,
        rx,
    })
}
