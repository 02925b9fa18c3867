//! Typed descriptions of platform objects and observed pod state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Label set; also used as an equality label selector.
pub type Labels = BTreeMap<String, String>;

/// Label carrying the component image version of a pod.
pub const VERSION_LABEL: &str = "version";

/// Render a label map as a selector string (`a=b,c=d`).
pub fn selector_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub port: u16,
}

impl PortSpec {
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    EmptyDir,
    HostPath(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataVolume {
    pub mount_path: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    Always,
    Never,
}

impl RestartPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RestartPolicy::Always => "Always",
            RestartPolicy::Never => "Never",
        }
    }
}

/// A single-container pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodRequest {
    pub name: String,
    pub labels: Labels,
    /// Container name; patches address the container by it.
    pub container: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub ports: Vec<PortSpec>,
    pub cpu_millis: u32,
    pub memory_mib: u32,
    pub volume: Option<DataVolume>,
    pub hostname: Option<String>,
    pub subdomain: Option<String>,
    pub restart_policy: RestartPolicy,
    pub termination_grace_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    ClusterIp,
    /// No cluster IP; gives pods stable DNS names.
    Headless,
    NodePort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub name: String,
    pub labels: Labels,
    pub selector: Labels,
    pub kind: ServiceKind,
    pub ports: Vec<PortSpec>,
}

/// What the platform assigned to a created service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub cluster_ip: Option<String>,
    /// Port name to allocated node port.
    pub node_ports: BTreeMap<String, u16>,
}

/// A replicated pod group (replication controller).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaGroupRequest {
    pub name: String,
    pub labels: Labels,
    pub replicas: u32,
    /// Template for every replica; its `name` is ignored.
    pub template: PodRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Pod,
    Service,
    ReplicaGroup,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "service",
            ResourceKind::ReplicaGroup => "replicationcontroller",
        }
    }
}

// ── Observed state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// A pod as observed on the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct PodInfo {
    pub name: String,
    pub labels: Labels,
    pub ip: Option<String>,
    pub node: Option<String>,
    pub phase: PodPhase,
    /// Every pod condition reports `True`.
    pub conditions_ok: bool,
    /// Scheduler message when the pod cannot be placed.
    pub unschedulable: Option<String>,
    /// A deletion is pending.
    pub terminating: bool,
}

impl PodInfo {
    pub fn version(&self) -> Option<&str> {
        self.labels.get(VERSION_LABEL).map(String::as_str)
    }

    /// Running, all conditions true and not being deleted.
    pub fn is_healthy(&self) -> bool {
        self.phase == PodPhase::Running && self.conditions_ok && !self.terminating
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_is_sorted_and_comma_joined() {
        let mut labels = Labels::new();
        labels.insert("component".to_string(), "tikv".to_string());
        labels.insert("app".to_string(), "tidb".to_string());
        labels.insert("cell".to_string(), "001-app".to_string());
        assert_eq!(
            selector_string(&labels),
            "app=tidb,cell=001-app,component=tikv"
        );
    }

    #[test]
    fn healthy_needs_running_ready_and_alive() {
        let mut pod = PodInfo {
            name: "pd-c-001".to_string(),
            labels: Labels::new(),
            ip: Some("10.0.0.1".to_string()),
            node: None,
            phase: PodPhase::Running,
            conditions_ok: true,
            unschedulable: None,
            terminating: false,
        };
        assert!(pod.is_healthy());
        pod.terminating = true;
        assert!(!pod.is_healthy());
        pod.terminating = false;
        pod.phase = PodPhase::parse("Pending");
        assert!(!pod.is_healthy());
    }
}
