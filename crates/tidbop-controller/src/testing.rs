//! In-process fakes for controller tests.
//!
//! [`FakeCluster`] plays the orchestrator, the placement service, the SQL
//! status probe and the schema initializer at once, so one object both
//! drives and records a whole lifecycle. Pods start Running immediately and
//! storage pods register an Up store at their address.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use tidbop_k8s::{
    K8sError, K8sResult, Labels, Orchestrator, PodInfo, PodPhase, PodRequest, ReplicaGroupRequest,
    ResourceKind, ServiceInfo, ServiceRequest,
};
use tidbop_pd::{MemberInfo, PdError, PdResult, PlacementApi, ProbeResult, StatusProbe, StoreInfo};
use tidbop_state::{ClusterStore, Db, Schema, Spec};

use crate::config::OperatorConfig;
use crate::context::{Context, ControllerContext};
use crate::error::{ControllerError, ControllerResult};
use crate::naming::{TIKV_PORT, cluster_name};
use crate::schema::SchemaInitializer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    CreatePod { name: String, component: String },
    DeletePod(String),
    CreateService(String),
    DeleteService(String),
    CreateGroup(String),
    DeleteGroup(String),
    Patch { kind: &'static str, name: String },
    DeleteStore(u64),
    DeleteMember(String),
    InitSchema(String),
}

struct FakePod {
    info: PodInfo,
    image: String,
    group: Option<String>,
}

struct FakeGroup {
    request: ReplicaGroupRequest,
    next: u32,
}

#[derive(Default)]
struct FakeState {
    pods: BTreeMap<String, FakePod>,
    services: BTreeMap<String, ServiceInfo>,
    groups: BTreeMap<String, FakeGroup>,
    stores: BTreeMap<u64, StoreInfo>,
    pd_members: BTreeSet<String>,
    calls: Vec<Call>,
    next_ip: u32,
    next_store: u64,
    next_port: u16,
    fail_component: Option<String>,
    unschedulable: Option<String>,
    schema_fails: bool,
    /// Pods whose deletion never completes.
    pinned: BTreeSet<String>,
}

#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<FakeState>,
}

fn component_of(labels: &Labels) -> String {
    labels.get("component").cloned().unwrap_or_default()
}

fn store_info(id: u64, address: String, state_name: &str) -> StoreInfo {
    StoreInfo {
        id,
        address,
        state: 0,
        state_name: state_name.to_string(),
    }
}

impl FakeState {
    fn spawn_pod(&mut self, req: &PodRequest, group: Option<String>) {
        self.next_ip += 1;
        let ip = format!("10.0.0.{}", self.next_ip);
        let component = component_of(&req.labels);
        let (phase, conditions_ok) = match self.unschedulable {
            Some(_) => (PodPhase::Pending, false),
            None => (PodPhase::Running, true),
        };
        self.calls.push(Call::CreatePod {
            name: req.name.clone(),
            component: component.clone(),
        });
        if phase == PodPhase::Running {
            match component.as_str() {
                "tikv" => {
                    self.next_store += 1;
                    let id = self.next_store;
                    self.stores
                        .insert(id, store_info(id, format!("{ip}:{TIKV_PORT}"), "Up"));
                }
                "pd" => {
                    self.pd_members.insert(req.name.clone());
                }
                _ => {}
            }
        }
        self.pods.insert(
            req.name.clone(),
            FakePod {
                info: PodInfo {
                    name: req.name.clone(),
                    labels: req.labels.clone(),
                    ip: Some(ip),
                    node: Some("node-1".to_string()),
                    phase,
                    conditions_ok,
                    unschedulable: self.unschedulable.clone(),
                    terminating: false,
                },
                image: req.image.clone(),
                group,
            },
        );
    }

    /// Converge a replica group's pods on its replica count.
    fn sync_group(&mut self, name: &str) {
        let Some(group) = self.groups.get(name) else {
            return;
        };
        let replicas = group.request.replicas as usize;
        let mut owned: Vec<String> = self
            .pods
            .values()
            .filter(|p| p.group.as_deref() == Some(name))
            .map(|p| p.info.name.clone())
            .collect();
        owned.sort();
        while owned.len() > replicas {
            if let Some(victim) = owned.pop() {
                self.pods.remove(&victim);
            }
        }
        let missing = replicas - owned.len();
        for _ in 0..missing {
            let Some(group) = self.groups.get_mut(name) else {
                return;
            };
            group.next += 1;
            let mut pod = group.request.template.clone();
            pod.name = format!("{name}-{:04}", group.next);
            self.spawn_pod(&pod, Some(name.to_string()));
        }
    }
}

impl FakeCluster {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Components of created pods, in creation order.
    pub(crate) fn created_components(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::CreatePod { component, .. } => Some(component.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn pod_names(&self, component: &str) -> Vec<String> {
        self.lock()
            .pods
            .values()
            .filter(|p| component_of(&p.info.labels) == component)
            .map(|p| p.info.name.clone())
            .collect()
    }

    pub(crate) fn pod(&self, name: &str) -> Option<PodInfo> {
        self.lock().pods.get(name).map(|p| p.info.clone())
    }

    pub(crate) fn pod_image(&self, name: &str) -> Option<String> {
        self.lock().pods.get(name).map(|p| p.image.clone())
    }

    pub(crate) fn pod_count(&self) -> usize {
        self.lock().pods.len()
    }

    pub(crate) fn set_pod_phase(&self, name: &str, phase: PodPhase) {
        if let Some(pod) = self.lock().pods.get_mut(name) {
            pod.info.phase = phase;
            pod.info.conditions_ok = phase == PodPhase::Running;
        }
    }

    /// Remove a pod without recording a call, as if its node vanished.
    pub(crate) fn lose_pod(&self, name: &str) {
        self.lock().pods.remove(name);
    }

    /// Keep the pod terminating forever once deleted, like a stuck finalizer.
    pub(crate) fn pin_pod(&self, name: &str) {
        self.lock().pinned.insert(name.to_string());
    }

    pub(crate) fn set_store_state(&self, id: u64, state_name: &str) {
        if let Some(store) = self.lock().stores.get_mut(&id) {
            store.state_name = state_name.to_string();
        }
    }

    pub(crate) fn store_state(&self, id: u64) -> Option<String> {
        self.lock().stores.get(&id).map(|s| s.state_name.clone())
    }

    pub(crate) fn forget_store(&self, id: u64) {
        self.lock().stores.remove(&id);
    }

    /// Register a store no cluster asked for.
    pub(crate) fn add_stray_store(&self, address: &str) -> u64 {
        let mut state = self.lock();
        state.next_store += 1;
        let id = state.next_store;
        state.stores.insert(id, store_info(id, address.to_string(), "Up"));
        id
    }

    pub(crate) fn add_stray_member(&self, name: &str) {
        self.lock().pd_members.insert(name.to_string());
    }

    pub(crate) fn has_member(&self, name: &str) -> bool {
        self.lock().pd_members.contains(name)
    }

    pub(crate) fn fail_pod_creation(&self, component: &str) {
        self.lock().fail_component = Some(component.to_string());
    }

    pub(crate) fn set_unschedulable(&self, message: &str) {
        self.lock().unschedulable = Some(message.to_string());
    }

    pub(crate) fn fail_schema(&self) {
        self.lock().schema_fails = true;
    }
}

#[async_trait]
impl Orchestrator for FakeCluster {
    async fn create_pod(&self, pod: &PodRequest) -> K8sResult<()> {
        let mut state = self.lock();
        if state.pods.contains_key(&pod.name) {
            return Err(K8sError::AlreadyExists {
                kind: "pod",
                name: pod.name.clone(),
            });
        }
        if state.fail_component.as_deref() == Some(component_of(&pod.labels).as_str()) {
            return Err(K8sError::Api {
                kind: "pod",
                name: pod.name.clone(),
                code: 500,
                message: "injected failure".to_string(),
            });
        }
        state.spawn_pod(pod, None);
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> K8sResult<Option<PodInfo>> {
        Ok(self.pod(name))
    }

    async fn delete_pod(&self, name: &str) -> K8sResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::DeletePod(name.to_string()));
        if state.pinned.contains(name) {
            if let Some(pod) = state.pods.get_mut(name) {
                pod.info.terminating = true;
            }
            return Ok(());
        }
        if let Some(pod) = state.pods.remove(name) {
            if let Some(group) = pod.group {
                state.sync_group(&group);
            }
        }
        Ok(())
    }

    async fn list_pods(&self, selector: &Labels) -> K8sResult<Vec<PodInfo>> {
        Ok(self
            .lock()
            .pods
            .values()
            .filter(|p| selector.iter().all(|(k, v)| p.info.labels.get(k) == Some(v)))
            .map(|p| p.info.clone())
            .collect())
    }

    async fn create_service(&self, service: &ServiceRequest) -> K8sResult<ServiceInfo> {
        let mut state = self.lock();
        state.calls.push(Call::CreateService(service.name.clone()));
        let mut node_ports = BTreeMap::new();
        for port in &service.ports {
            state.next_port += 1;
            node_ports.insert(port.name.clone(), 30000 + state.next_port);
        }
        let info = ServiceInfo {
            name: service.name.clone(),
            cluster_ip: Some(format!("10.96.0.{}", state.services.len() + 1)),
            node_ports,
        };
        state.services.insert(service.name.clone(), info.clone());
        Ok(info)
    }

    async fn delete_service(&self, name: &str) -> K8sResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::DeleteService(name.to_string()));
        state.services.remove(name);
        Ok(())
    }

    async fn create_replica_group(&self, group: &ReplicaGroupRequest) -> K8sResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::CreateGroup(group.name.clone()));
        state.groups.insert(
            group.name.clone(),
            FakeGroup {
                request: group.clone(),
                next: 0,
            },
        );
        state.sync_group(&group.name);
        Ok(())
    }

    async fn delete_replica_group(&self, name: &str) -> K8sResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::DeleteGroup(name.to_string()));
        state.groups.remove(name);
        state.pods.retain(|_, p| p.group.as_deref() != Some(name));
        Ok(())
    }

    async fn patch(&self, kind: ResourceKind, name: &str, patch: &Value) -> K8sResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::Patch {
            kind: kind.as_str(),
            name: name.to_string(),
        });
        let text = |pointer: &str| patch.pointer(pointer).and_then(Value::as_str).map(str::to_string);
        match kind {
            ResourceKind::Pod => {
                let pod = state.pods.get_mut(name).ok_or_else(|| K8sError::NotFound {
                    kind: "pod",
                    name: name.to_string(),
                })?;
                if let Some(version) = text("/metadata/labels/version") {
                    pod.info.labels.insert("version".to_string(), version);
                }
                if let Some(image) = text("/spec/containers/0/image") {
                    pod.image = image;
                }
            }
            ResourceKind::ReplicaGroup => {
                let group = state.groups.get_mut(name).ok_or_else(|| K8sError::NotFound {
                    kind: "replicationcontroller",
                    name: name.to_string(),
                })?;
                if let Some(replicas) = patch.pointer("/spec/replicas").and_then(Value::as_u64) {
                    group.request.replicas = replicas as u32;
                }
                if let Some(version) = text("/spec/template/metadata/labels/version") {
                    group
                        .request
                        .template
                        .labels
                        .insert("version".to_string(), version);
                }
                if let Some(image) = text("/spec/template/spec/containers/0/image") {
                    group.request.template.image = image;
                }
                state.sync_group(name);
            }
            ResourceKind::Service => {}
        }
        Ok(())
    }
}

#[async_trait]
impl PlacementApi for FakeCluster {
    async fn list_stores(&self, _endpoint: &str) -> PdResult<Vec<StoreInfo>> {
        Ok(self.lock().stores.values().cloned().collect())
    }

    async fn get_store(&self, _endpoint: &str, id: u64) -> PdResult<StoreInfo> {
        self.lock()
            .stores
            .get(&id)
            .cloned()
            .ok_or_else(|| PdError::NotFound(format!("store {id}")))
    }

    async fn delete_store(&self, _endpoint: &str, id: u64) -> PdResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::DeleteStore(id));
        if let Some(store) = state.stores.get_mut(&id) {
            if !store.is_tombstone() {
                store.state_name = "Offline".to_string();
            }
        }
        Ok(())
    }

    async fn leader(&self, endpoint: &str) -> PdResult<MemberInfo> {
        let state = self.lock();
        let name = state.pd_members.iter().next().cloned().ok_or_else(|| PdError::Status {
            uri: format!("http://{endpoint}/pd/api/v1/leader"),
            status: 503,
            body: "no leader".to_string(),
        })?;
        Ok(MemberInfo {
            name,
            member_id: 1,
            client_urls: Vec::new(),
            peer_urls: Vec::new(),
        })
    }

    async fn members(&self, _endpoint: &str) -> PdResult<Vec<MemberInfo>> {
        Ok(self
            .lock()
            .pd_members
            .iter()
            .enumerate()
            .map(|(i, name)| MemberInfo {
                name: name.clone(),
                member_id: i as u64 + 1,
                client_urls: Vec::new(),
                peer_urls: Vec::new(),
            })
            .collect())
    }

    async fn delete_member(&self, _endpoint: &str, name: &str) -> PdResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::DeleteMember(name.to_string()));
        state.pd_members.remove(name);
        Ok(())
    }
}

#[async_trait]
impl StatusProbe for FakeCluster {
    async fn probe(&self, _address: &str) -> ProbeResult {
        ProbeResult::Healthy
    }
}

#[async_trait]
impl SchemaInitializer for FakeCluster {
    async fn initialize(&self, endpoint: &str, _schema: &Schema) -> ControllerResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::InitSchema(endpoint.to_string()));
        if state.schema_fails {
            return Err(ControllerError::Sql("access denied for user 'root'".to_string()));
        }
        Ok(())
    }
}

/// Configuration with millisecond timings and no approval gate.
pub(crate) fn fast_config() -> OperatorConfig {
    let mut config = OperatorConfig {
        proxies: vec!["192.168.0.1".to_string()],
        ..OperatorConfig::default()
    };
    config.approval.kv_replicas = 100;
    config.approval.db_replicas = 100;
    let t = &mut config.timings;
    t.poll_interval = Duration::from_millis(1);
    t.pod_timeout = Duration::from_millis(300);
    t.component_timeout = Duration::from_millis(300);
    t.init_grace = Duration::ZERO;
    t.stop_timeout = Duration::from_millis(300);
    t.reconcile_interval = Duration::from_millis(10);
    t.pd_upgrade_settle = Duration::ZERO;
    t.tikv_upgrade_settle = Duration::ZERO;
    t.tidb_upgrade_settle = Duration::ZERO;
    t.watch_handler_ceiling = Duration::from_secs(1);
    config
}

pub(crate) fn context_with(fake: Arc<FakeCluster>, config: OperatorConfig) -> Context {
    let store = ClusterStore::open_in_memory().unwrap();
    ControllerContext::new(
        config,
        store,
        fake.clone(),
        fake.clone(),
        fake.clone(),
        fake,
    )
}

pub(crate) fn test_context(fake: Arc<FakeCluster>) -> Context {
    context_with(fake, fast_config())
}

/// A cluster request with 3 pd, 3 tikv and 2 tidb replicas.
pub(crate) fn sample_db(user_id: &str, schema: &str) -> Db {
    let spec = |replicas| Spec {
        cpu: 500,
        mem: 1024,
        version: "rc4".to_string(),
        replicas,
        ..Spec::default()
    };
    let mut db = Db::default();
    db.metadata.name = cluster_name(user_id, schema);
    db.owner.user_id = user_id.to_string();
    db.owner.user_name = "tester".to_string();
    db.schema = Schema {
        name: schema.to_string(),
        user: "app".to_string(),
        password: "pw".to_string(),
    };
    db.pd.spec = spec(3);
    db.tikv.spec = spec(3);
    db.tidb.spec = spec(2);
    db
}
