//! Cluster, pod and service names plus the label scheme.

use std::fmt;

use tidbop_k8s::Labels;

pub const PD_CLIENT_PORT: u16 = 2379;
pub const PD_PEER_PORT: u16 = 2380;
pub const TIKV_PORT: u16 = 20160;
pub const TIDB_PORT: u16 = 4000;
pub const TIDB_STATUS_PORT: u16 = 10080;

const APP: &str = "tidb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Pd,
    Tikv,
    Tidb,
    Migrator,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Pd => "pd",
            Component::Tikv => "tikv",
            Component::Tidb => "tidb",
            Component::Migrator => "migrator",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compact, fixed-width rendering of an owner id. Numeric ids become hex.
pub fn encode_user_id(user_id: &str) -> String {
    let rendered = match user_id.parse::<u64>() {
        Ok(n) => format!("{n:03x}"),
        Err(_) => format!("{user_id:0>3}"),
    };
    let start = rendered.len().saturating_sub(3);
    rendered[start..].to_string()
}

/// Cluster name: `{owner}-{schema}`, lowercase with `_` turned into `-`.
pub fn cluster_name(user_id: &str, schema: &str) -> String {
    format!("{}-{}", encode_user_id(user_id), schema.replace('_', "-")).to_lowercase()
}

/// Prefix all of a user's clusters share.
pub fn owner_prefix(user_id: &str) -> String {
    format!("{}-", encode_user_id(user_id)).to_lowercase()
}

pub fn pod_name(component: Component, cell: &str, seq: u32) -> String {
    format!("{component}-{cell}-{seq:03}")
}

pub fn pd_client_service(cell: &str) -> String {
    format!("pd-{cell}")
}

pub fn pd_peer_service(cell: &str) -> String {
    format!("pd-{cell}-srv")
}

/// Name of both the SQL service and its replica group.
pub fn tidb_name(cell: &str) -> String {
    format!("tidb-{cell}")
}

pub fn migrator_name(cell: &str) -> String {
    format!("migrator-{cell}")
}

/// Selector for every object of a cluster.
pub fn cell_labels(cell: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert("app".to_string(), APP.to_string());
    labels.insert("cell".to_string(), cell.to_string());
    labels
}

/// Selector for one component of a cluster.
pub fn component_labels(cell: &str, component: Component) -> Labels {
    let mut labels = cell_labels(cell);
    labels.insert("component".to_string(), component.as_str().to_string());
    labels
}

/// Full label set stamped on created pods.
pub fn pod_labels(cell: &str, component: Component, version: &str) -> Labels {
    let mut labels = component_labels(cell, component);
    labels.insert(tidbop_k8s::VERSION_LABEL.to_string(), version.to_string());
    labels
}
