//! The orchestration-platform interface used by sub-service controllers.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::K8sResult;
use crate::types::*;

/// Primitive operations on pods, services and replica groups in one
/// namespace. Deleting a missing object is not an error.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn create_pod(&self, pod: &PodRequest) -> K8sResult<()>;

    async fn get_pod(&self, name: &str) -> K8sResult<Option<PodInfo>>;

    async fn delete_pod(&self, name: &str) -> K8sResult<()>;

    async fn list_pods(&self, selector: &Labels) -> K8sResult<Vec<PodInfo>>;

    async fn create_service(&self, service: &ServiceRequest) -> K8sResult<ServiceInfo>;

    async fn delete_service(&self, name: &str) -> K8sResult<()>;

    async fn create_replica_group(&self, group: &ReplicaGroupRequest) -> K8sResult<()>;

    async fn delete_replica_group(&self, name: &str) -> K8sResult<()>;

    /// Strategic-merge patch of an arbitrary object.
    async fn patch(
        &self,
        kind: ResourceKind,
        name: &str,
        patch: &serde_json::Value,
    ) -> K8sResult<()>;

    /// Swap a pod's container image in place and relabel its version.
    async fn set_pod_image(
        &self,
        name: &str,
        container: &str,
        image: &str,
        version: &str,
    ) -> K8sResult<()> {
        let patch = json!({
            "metadata": { "labels": { "version": version } },
            "spec": { "containers": [ { "name": container, "image": image } ] }
        });
        self.patch(ResourceKind::Pod, name, &patch).await
    }

    async fn scale_replica_group(&self, name: &str, replicas: u32) -> K8sResult<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.patch(ResourceKind::ReplicaGroup, name, &patch).await
    }

    /// Change the image new replicas are created from; running replicas keep
    /// theirs until replaced.
    async fn set_replica_group_image(
        &self,
        name: &str,
        container: &str,
        image: &str,
        version: &str,
    ) -> K8sResult<()> {
        let patch = json!({
            "metadata": { "labels": { "version": version } },
            "spec": { "template": {
                "metadata": { "labels": { "version": version } },
                "spec": { "containers": [ { "name": container, "image": image } ] }
            } }
        });
        self.patch(ResourceKind::ReplicaGroup, name, &patch).await
    }

    /// Delete every pod matching `selector`; returns how many were deleted.
    async fn delete_pods(&self, selector: &Labels) -> K8sResult<usize> {
        let pods = self.list_pods(selector).await?;
        for pod in &pods {
            self.delete_pod(&pod.name).await?;
        }
        debug!(selector = %selector_string(selector), count = pods.len(), "pods deleted");
        Ok(pods.len())
    }
}
