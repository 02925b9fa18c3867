//! Domain types for the tidbop object store.
//!
//! A cluster (`Db`) is composed of three sub-services (placement, storage,
//! SQL), each holding its own `Spec` plus the runtime state the controller
//! records about it. All types are serializable to/from JSON for storage in
//! redb tables.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ── Cluster ────────────────────────────────────────────────────────

/// One managed TiDB cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Db {
    pub metadata: ObjectMeta,
    pub owner: Owner,
    pub schema: Schema,
    pub pd: Placement,
    pub tikv: Storage,
    pub tidb: Sql,
    /// Last requested action (`start`, `stop`, `scale`, ...).
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub status: Status,
}

impl Db {
    /// Cluster name, also used as the cell label on every pod.
    pub fn cell(&self) -> &str {
        &self.metadata.name
    }

    pub fn phase(&self) -> Phase {
        self.status.phase
    }
}

/// Object identity and optimistic-concurrency cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    /// Revision of the last write to this object; 0 before creation.
    #[serde(default)]
    pub resource_version: u64,
    /// Unix timestamp (seconds) when this object was created.
    #[serde(default)]
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub user_id: String,
    pub user_name: String,
    #[serde(default)]
    pub desc: String,
    /// Admin's reason when a request was refused.
    #[serde(default)]
    pub reason: String,
}

/// The application database created on the SQL tier after install.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Schema {
    pub name: String,
    pub user: String,
    pub password: String,
}

// ── Phase ──────────────────────────────────────────────────────────

/// Position of a cluster in its lifecycle.
///
/// The declaration order is the lifecycle order; `Ord` follows it. A
/// `*Failed` phase sits between its `*Pending` and `*Started` siblings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Refuse,
    Auditing,
    #[default]
    Undefined,
    PlacementPending,
    PlacementFailed,
    PlacementStarted,
    StoragePending,
    StorageFailed,
    StorageStarted,
    SqlPending,
    SqlFailed,
    SqlStarted,
    SqlInitFailed,
    SqlInited,
    Uninstalling,
}

impl Phase {
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            Phase::PlacementFailed | Phase::StorageFailed | Phase::SqlFailed | Phase::SqlInitFailed
        )
    }

    /// The `*Pending` phase that must precede this failure phase.
    pub fn pending_for_failure(self) -> Option<Phase> {
        match self {
            Phase::PlacementFailed => Some(Phase::PlacementPending),
            Phase::StorageFailed => Some(Phase::StoragePending),
            Phase::SqlFailed => Some(Phase::SqlPending),
            Phase::SqlInitFailed => Some(Phase::SqlStarted),
            _ => None,
        }
    }

    /// Whether the cluster sits somewhere inside an install pass.
    pub fn is_installing(self) -> bool {
        self > Phase::Undefined && self < Phase::SqlInited
    }
}

// ── Spec ───────────────────────────────────────────────────────────

/// Resource shape shared by all three sub-services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Spec {
    /// CPU in millicores.
    pub cpu: u32,
    /// Memory in MiB.
    pub mem: u32,
    pub version: String,
    pub replicas: u32,
    /// Host path for data; `None` uses an ephemeral volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    /// Storage capacity in GiB (storage tier only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
}

// ── Sub-services ───────────────────────────────────────────────────

/// A named runtime unit of the placement or SQL tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Member {
    pub name: String,
}

/// Placement (PD) tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub spec: Spec,
    #[serde(default)]
    pub members: Vec<Member>,
    /// Monotonic counter used to name new pods.
    #[serde(default)]
    pub member_seq: u32,
    /// In-cluster client endpoints (`clusterIP:2379`).
    #[serde(default)]
    pub inner_addresses: Vec<String>,
    /// Client endpoints reachable from the controller (`proxy:nodePort`).
    #[serde(default)]
    pub outer_addresses: Vec<String>,
}

impl Placement {
    /// Endpoint the controller uses for placement API calls.
    pub fn api_endpoint(&self) -> Option<&str> {
        self.outer_addresses
            .first()
            .or(self.inner_addresses.first())
            .map(String::as_str)
    }
}

/// Membership state of one storage replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum StoreState {
    Online,
    #[default]
    Offline,
    Tombstone,
}

/// One storage replica and its placement-side registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    /// Placement-assigned id; 0 until the store has joined.
    #[serde(default)]
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub state: StoreState,
    /// Consecutive checks in which the store was missing from the Up set.
    #[serde(default)]
    pub down_checks: u32,
}

impl Store {
    pub fn joined(&self) -> bool {
        self.id != 0
    }
}

/// Storage (TiKV) tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    pub spec: Spec,
    #[serde(default)]
    pub member_seq: u32,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub available_replicas: u32,
    /// Stores keyed by pod name; ordered so "oldest first" is iteration order.
    #[serde(default)]
    pub stores: BTreeMap<String, Store>,
}

impl Storage {
    pub fn online_count(&self) -> u32 {
        self.stores
            .values()
            .filter(|s| s.state == StoreState::Online)
            .count() as u32
    }

    pub fn store_count(&self) -> u32 {
        self.stores.len() as u32
    }

    /// Whether the replica counters agree with the store map.
    pub fn counters_consistent(&self) -> bool {
        self.ready_replicas == self.store_count() && self.available_replicas == self.online_count()
    }
}

/// SQL (TiDB) tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Sql {
    pub spec: Spec,
    #[serde(default)]
    pub members: Vec<Member>,
}

// ── Status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum UpgradeState {
    #[default]
    None,
    Upgrading,
    Upgraded,
    Failed,
}

/// Scale bookkeeping: a sticky in-progress flag plus per-tier error bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScaleStatus {
    pub scaling: bool,
    pub storage_failed: bool,
    pub sql_failed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub phase: Phase,
    pub available: bool,
    #[serde(default)]
    pub message: String,
    /// Machine-readable failure reason, e.g. `Unschedulable`.
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub migrate_state: String,
    #[serde(default)]
    pub migrate_retries: u32,
    #[serde(default)]
    pub upgrade_state: UpgradeState,
    #[serde(default)]
    pub scale: ScaleStatus,
    /// MySQL endpoints reachable by clients.
    #[serde(default)]
    pub outer_addresses: Vec<String>,
    /// SQL status endpoints reachable by the controller.
    #[serde(default)]
    pub outer_status_addresses: Vec<String>,
}

impl Status {
    pub fn clear_failure(&mut self) {
        self.reason.clear();
        self.message.clear();
    }
}

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Ok,
    Warning,
    Error,
}

/// An operator-visible audit record for one cluster operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub cell: String,
    /// Which component emitted it (`tidb`, `tidb/tikv`, ...).
    pub component: String,
    /// Operation key (`install`, `scale`, ...).
    pub key: String,
    pub kind: EventKind,
    pub message: String,
    pub first_seen: u64,
    pub last_seen: u64,
    pub count: u32,
}

impl Event {
    pub fn new(cell: &str, component: &str, key: &str, kind: EventKind, message: String) -> Self {
        let now = epoch_secs();
        Self {
            cell: cell.to_string(),
            component: component.to_string(),
            key: key.to_string(),
            kind,
            message,
            first_seen: now,
            last_seen: now,
            count: 1,
        }
    }

    /// Two events describe the same occurrence if component and message match.
    pub fn same_occurrence(&self, other: &Event) -> bool {
        self.component == other.component && self.message == other.message
    }
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
