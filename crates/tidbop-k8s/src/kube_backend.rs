//! [`Orchestrator`] backed by a Kubernetes API server through kube-rs.
//!
//! Replica groups map to `ReplicationController` objects; the SQL tier is
//! stateless, so the controller replaces its pods by deleting them and
//! letting the controller recreate them from the (patched) template.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource, Pod, PodSpec,
    PodTemplateSpec, ReplicationController, ReplicationControllerSpec, ResourceRequirements,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use tracing::{debug, info};

use crate::error::{K8sError, K8sResult};
use crate::orchestrator::Orchestrator;
use crate::types::*;

const DATA_VOLUME: &str = "data";

/// Kubernetes-backed orchestrator scoped to one namespace.
#[derive(Clone)]
pub struct KubeOrchestrator {
    namespace: String,
    pods: Api<Pod>,
    services: Api<Service>,
    groups: Api<ReplicationController>,
}

impl KubeOrchestrator {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            pods: Api::namespaced(client.clone(), namespace),
            services: Api::namespaced(client.clone(), namespace),
            groups: Api::namespaced(client, namespace),
        }
    }

    /// Connect using in-cluster config or the local kubeconfig, optionally
    /// selecting a named kubeconfig context.
    pub async fn connect(context: Option<String>, namespace: &str) -> K8sResult<Self> {
        let client = match context {
            Some(context) => {
                let kubeconfig =
                    Kubeconfig::read().map_err(|e| K8sError::Client(e.to_string()))?;
                let options = KubeConfigOptions {
                    context: Some(context),
                    ..Default::default()
                };
                let config = Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| K8sError::Client(e.to_string()))?;
                Client::try_from(config).map_err(|e| K8sError::Client(e.to_string()))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| K8sError::Client(e.to_string()))?,
        };
        info!(%namespace, "connected to kubernetes");
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Treat 404 on delete as success.
fn ignore_missing(result: K8sResult<()>) -> K8sResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create_pod(&self, pod: &PodRequest) -> K8sResult<()> {
        self.pods
            .create(&PostParams::default(), &build_pod(pod))
            .await
            .map_err(|e| K8sError::from_kube("pod", &pod.name, e))?;
        debug!(pod = %pod.name, "pod created");
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> K8sResult<Option<PodInfo>> {
        let pod = self
            .pods
            .get_opt(name)
            .await
            .map_err(|e| K8sError::from_kube("pod", name, e))?;
        Ok(pod.as_ref().map(pod_info))
    }

    async fn delete_pod(&self, name: &str) -> K8sResult<()> {
        let result = self
            .pods
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| K8sError::from_kube("pod", name, e));
        ignore_missing(result)
    }

    async fn list_pods(&self, selector: &Labels) -> K8sResult<Vec<PodInfo>> {
        let selector = selector_string(selector);
        let list = self
            .pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| K8sError::from_kube("pod", &selector, e))?;
        Ok(list.items.iter().map(pod_info).collect())
    }

    async fn create_service(&self, service: &ServiceRequest) -> K8sResult<ServiceInfo> {
        let created = self
            .services
            .create(&PostParams::default(), &build_service(service))
            .await
            .map_err(|e| K8sError::from_kube("service", &service.name, e))?;
        debug!(service = %service.name, "service created");
        Ok(service_info(&created))
    }

    async fn delete_service(&self, name: &str) -> K8sResult<()> {
        let result = self
            .services
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| K8sError::from_kube("service", name, e));
        ignore_missing(result)
    }

    async fn create_replica_group(&self, group: &ReplicaGroupRequest) -> K8sResult<()> {
        self.groups
            .create(&PostParams::default(), &build_replica_group(group))
            .await
            .map_err(|e| K8sError::from_kube("replicationcontroller", &group.name, e))?;
        debug!(group = %group.name, replicas = group.replicas, "replica group created");
        Ok(())
    }

    async fn delete_replica_group(&self, name: &str) -> K8sResult<()> {
        // Orphaned pods are removed by the callers' label-based sweeps.
        let result = self
            .groups
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| K8sError::from_kube("replicationcontroller", name, e));
        ignore_missing(result)
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        name: &str,
        patch: &serde_json::Value,
    ) -> K8sResult<()> {
        let params = PatchParams::default();
        let patch = Patch::Strategic(patch);
        let result = match kind {
            ResourceKind::Pod => self.pods.patch(name, &params, &patch).await.map(|_| ()),
            ResourceKind::Service => self.services.patch(name, &params, &patch).await.map(|_| ()),
            ResourceKind::ReplicaGroup => {
                self.groups.patch(name, &params, &patch).await.map(|_| ())
            }
        };
        result.map_err(|e| K8sError::from_kube(kind.as_str(), name, e))?;
        debug!(kind = kind.as_str(), %name, "object patched");
        Ok(())
    }
}

// ── Request conversion ─────────────────────────────────────────────

fn build_pod_spec(req: &PodRequest) -> PodSpec {
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(format!("{}m", req.cpu_millis)));
    limits.insert(
        "memory".to_string(),
        Quantity(format!("{}Mi", req.memory_mib)),
    );

    let (volumes, mounts) = match &req.volume {
        Some(volume) => {
            let mut v = Volume {
                name: DATA_VOLUME.to_string(),
                ..Default::default()
            };
            match &volume.source {
                VolumeSource::EmptyDir => v.empty_dir = Some(EmptyDirVolumeSource::default()),
                VolumeSource::HostPath(path) => {
                    v.host_path = Some(HostPathVolumeSource {
                        path: path.clone(),
                        type_: Some("DirectoryOrCreate".to_string()),
                    })
                }
            }
            let mount = VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: volume.mount_path.clone(),
                ..Default::default()
            };
            (Some(vec![v]), Some(vec![mount]))
        }
        None => (None, None),
    };

    let container = Container {
        name: req.container.clone(),
        image: Some(req.image.clone()),
        command: (!req.command.is_empty()).then(|| req.command.clone()),
        args: (!req.args.is_empty()).then(|| req.args.clone()),
        env: (!req.env.is_empty()).then(|| {
            req.env
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    ..Default::default()
                })
                .collect()
        }),
        ports: Some(
            req.ports
                .iter()
                .map(|p| ContainerPort {
                    name: Some(p.name.clone()),
                    container_port: i32::from(p.port),
                    ..Default::default()
                })
                .collect(),
        ),
        resources: Some(ResourceRequirements {
            requests: Some(limits.clone()),
            limits: Some(limits),
            ..Default::default()
        }),
        volume_mounts: mounts,
        ..Default::default()
    };

    PodSpec {
        containers: vec![container],
        volumes,
        hostname: req.hostname.clone(),
        subdomain: req.subdomain.clone(),
        restart_policy: Some(req.restart_policy.as_str().to_string()),
        termination_grace_period_seconds: Some(req.termination_grace_secs),
        ..Default::default()
    }
}

pub(crate) fn build_pod(req: &PodRequest) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(req.name.clone()),
            labels: Some(req.labels.clone()),
            ..Default::default()
        },
        spec: Some(build_pod_spec(req)),
        ..Default::default()
    }
}

pub(crate) fn build_service(req: &ServiceRequest) -> Service {
    let service_type = match req.kind {
        ServiceKind::NodePort => "NodePort",
        ServiceKind::ClusterIp | ServiceKind::Headless => "ClusterIP",
    };
    Service {
        metadata: ObjectMeta {
            name: Some(req.name.clone()),
            labels: Some(req.labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            cluster_ip: (req.kind == ServiceKind::Headless).then(|| "None".to_string()),
            selector: Some(req.selector.clone()),
            ports: Some(
                req.ports
                    .iter()
                    .map(|p| ServicePort {
                        name: Some(p.name.clone()),
                        port: i32::from(p.port),
                        target_port: Some(IntOrString::Int(i32::from(p.port))),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn build_replica_group(req: &ReplicaGroupRequest) -> ReplicationController {
    ReplicationController {
        metadata: ObjectMeta {
            name: Some(req.name.clone()),
            labels: Some(req.labels.clone()),
            ..Default::default()
        },
        spec: Some(ReplicationControllerSpec {
            replicas: Some(req.replicas as i32),
            selector: Some(req.labels.clone()),
            template: Some(PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(req.template.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(build_pod_spec(&req.template)),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ── Observed state conversion ──────────────────────────────────────

pub(crate) fn pod_info(pod: &Pod) -> PodInfo {
    let status = pod.status.as_ref();
    let conditions = status.and_then(|s| s.conditions.as_deref()).unwrap_or(&[]);
    let unschedulable = conditions
        .iter()
        .find(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref() == Some("Unschedulable")
        })
        .map(|c| c.message.clone().unwrap_or_default());

    PodInfo {
        name: pod.name_any(),
        labels: pod.labels().clone(),
        ip: status.and_then(|s| s.pod_ip.clone()),
        node: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        phase: PodPhase::parse(status.and_then(|s| s.phase.as_deref()).unwrap_or("")),
        conditions_ok: !conditions.is_empty() && conditions.iter().all(|c| c.status == "True"),
        unschedulable,
        terminating: pod.metadata.deletion_timestamp.is_some(),
    }
}

fn service_info(service: &Service) -> ServiceInfo {
    let spec = service.spec.as_ref();
    let node_ports = spec
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    let name = p.name.clone()?;
                    let node_port = u16::try_from(p.node_port?).ok()?;
                    Some((name, node_port))
                })
                .collect()
        })
        .unwrap_or_default();
    ServiceInfo {
        name: service.name_any(),
        cluster_ip: spec
            .and_then(|s| s.cluster_ip.clone())
            .filter(|ip| ip != "None"),
        node_ports,
    }
}
