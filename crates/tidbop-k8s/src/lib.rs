//! tidbop-k8s — the orchestration-platform seam.
//!
//! Sub-service controllers describe what they want with typed requests
//! ([`PodRequest`], [`ServiceRequest`], [`ReplicaGroupRequest`]) and talk to
//! the platform through the [`Orchestrator`] trait. [`KubeOrchestrator`]
//! implements it on top of kube-rs; tests use in-process fakes.
//!
//! Deleting an object that does not exist succeeds, so teardown is
//! idempotent. Waiting for conditions is left to callers, which poll
//! [`Orchestrator::get_pod`] / [`Orchestrator::list_pods`].

pub mod error;
pub mod kube_backend;
pub mod orchestrator;
pub mod types;

pub use error::{K8sError, K8sResult};
pub use kube_backend::KubeOrchestrator;
pub use orchestrator::Orchestrator;
pub use types::*;
