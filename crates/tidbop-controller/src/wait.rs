//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use tidbop_k8s::{Labels, PodInfo, selector_string};

use crate::context::ControllerContext;
use crate::error::{ControllerError, ControllerResult};

/// Poll `check` every `interval` until it yields a value or `budget` runs
/// out. `Ok(None)` means "not yet"; an `Err` aborts the wait immediately.
pub async fn retry_until<T, F, Fut>(
    what: &str,
    interval: Duration,
    budget: Duration,
    mut check: F,
) -> ControllerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControllerResult<Option<T>>>,
{
    let deadline = Instant::now() + budget;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if Instant::now() + interval > deadline {
            debug!(%what, attempts, "wait budget exhausted");
            return Err(ControllerError::Timeout(format!("{what} after {budget:?}")));
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait until a pod is running with all conditions true. An unplaceable pod
/// fails at once with [`ControllerError::Unschedulable`].
pub async fn wait_pod_running(
    ctx: &ControllerContext,
    name: &str,
    budget: Duration,
) -> ControllerResult<PodInfo> {
    let what = format!("pod {name} running");
    retry_until(&what, ctx.config.timings.poll_interval, budget, || async {
        match ctx.orchestrator.get_pod(name).await {
            Ok(Some(pod)) if pod.is_healthy() => Ok(Some(pod)),
            Ok(Some(pod)) => match pod.unschedulable {
                Some(msg) => Err(ControllerError::Unschedulable(msg)),
                None => Ok(None),
            },
            Ok(None) => Ok(None),
            Err(e) => {
                debug!(pod = %name, error = %e, "pod lookup failed, retrying");
                Ok(None)
            }
        }
    })
    .await
}

/// Wait until no pod matches `selector`.
pub async fn wait_pods_gone(
    ctx: &ControllerContext,
    selector: &Labels,
    budget: Duration,
) -> ControllerResult<()> {
    let what = format!("pods {} gone", selector_string(selector));
    retry_until(&what, ctx.config.timings.poll_interval, budget, || async {
        match ctx.orchestrator.list_pods(selector).await {
            Ok(pods) if pods.is_empty() => Ok(Some(())),
            Ok(pods) => {
                debug!(remaining = pods.len(), "pods still terminating");
                Ok(None)
            }
            Err(e) => {
                debug!(error = %e, "pod listing failed, retrying");
                Ok(None)
            }
        }
    })
    .await
}
