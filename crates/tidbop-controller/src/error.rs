//! Controller error types.

use thiserror::Error;

use tidbop_k8s::K8sError;
use tidbop_pd::PdError;
use tidbop_state::StateError;

/// Coarse classification used for log severity and API mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is wrong; retrying will not help.
    Validation,
    /// Another operation holds the cluster or changed it concurrently.
    Conflict,
    /// A dependency (placement, orchestrator, store, SQL) failed.
    Infrastructure,
    /// A bounded wait ran out.
    Timeout,
}

/// Errors returned by lifecycle operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("repeat operation: the previous operation on {0} is still running")]
    RepeatOperation(String),

    #[error("concurrent modification of {0} kept conflicting")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported operator: {0}")]
    Unsupported(String),

    #[error("cluster not found: {0}")]
    NotFound(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("Unschedulable:{0}")]
    Unschedulable(String),

    #[error("placement service error: {0}")]
    Placement(#[from] PdError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] K8sError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("sql error: {0}")]
    Sql(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Validation(_)
            | ControllerError::Unsupported(_)
            | ControllerError::NotFound(_) => ErrorKind::Validation,
            ControllerError::RepeatOperation(_) | ControllerError::Conflict(_) => {
                ErrorKind::Conflict
            }
            ControllerError::State(e) if e.is_conflict() => ErrorKind::Conflict,
            ControllerError::State(e) if e.is_not_found() => ErrorKind::Validation,
            ControllerError::Timeout(_) => ErrorKind::Timeout,
            ControllerError::Unavailable(_)
            | ControllerError::Unschedulable(_)
            | ControllerError::Placement(_)
            | ControllerError::Orchestrator(_)
            | ControllerError::State(_)
            | ControllerError::Sql(_)
            | ControllerError::Internal(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether the error deserves `error!` rather than `warn!`.
    pub fn is_severe(&self) -> bool {
        matches!(self.kind(), ErrorKind::Infrastructure | ErrorKind::Timeout)
    }

    /// The scheduler message if this error reports an unplaceable pod.
    ///
    /// Errors from the platform arrive as opaque strings, so the rendered
    /// message is searched for the `Unschedulable:` marker as well.
    pub fn unschedulable_message(&self) -> Option<String> {
        if let ControllerError::Unschedulable(msg) = self {
            return Some(msg.clone());
        }
        let rendered = self.to_string();
        rendered
            .find(UNSCHEDULABLE_MARKER)
            .map(|at| rendered[at + UNSCHEDULABLE_MARKER.len()..].trim().to_string())
    }
}

const UNSCHEDULABLE_MARKER: &str = "Unschedulable:";

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors that end a watch session.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The feed history is gone and the re-listed objects no longer match
    /// what this process has seen.
    #[error("change feed diverged from local state: {0}")]
    Diverged(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
