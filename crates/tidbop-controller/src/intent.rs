//! Typed update intents.
//!
//! An update request is a JSON object whose `operator` field selects the
//! intent; the remaining fields are its arguments.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ControllerError, ControllerResult};

const OPERATORS: &[&str] = &[
    "audit",
    "start",
    "stop",
    "restart",
    "upgrade",
    "scale",
    "syncMigrateStat",
    "patch",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "operator", rename_all = "camelCase")]
pub enum Intent {
    /// Admin decision on a cluster waiting for approval.
    Audit {
        approved: bool,
        #[serde(default)]
        reason: String,
    },
    Start,
    Stop,
    Restart,
    /// Target versions; absent tiers keep theirs.
    Upgrade {
        #[serde(default)]
        pd: Option<String>,
        #[serde(default)]
        tikv: Option<String>,
        #[serde(default)]
        tidb: Option<String>,
    },
    /// Target replica counts; absent tiers keep theirs.
    Scale {
        #[serde(default)]
        tikv: Option<u32>,
        #[serde(default)]
        tidb: Option<u32>,
    },
    SyncMigrateStat {
        state: String,
        #[serde(default)]
        reason: String,
    },
    Patch {
        desc: String,
    },
}

impl Intent {
    pub fn decode(value: &Value) -> ControllerResult<Self> {
        let operator = value
            .get("operator")
            .and_then(Value::as_str)
            .ok_or_else(|| ControllerError::Validation("missing operator".to_string()))?;
        if !OPERATORS.contains(&operator) {
            return Err(ControllerError::Unsupported(operator.to_string()));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| ControllerError::Validation(format!("bad {operator} request: {e}")))
    }

    /// The operator name recorded on the cluster.
    pub fn operator(&self) -> &'static str {
        match self {
            Intent::Audit { .. } => "audit",
            Intent::Start => "start",
            Intent::Stop => "stop",
            Intent::Restart => "restart",
            Intent::Upgrade { .. } => "upgrade",
            Intent::Scale { .. } => "scale",
            Intent::SyncMigrateStat { .. } => "syncMigrateStat",
            Intent::Patch { .. } => "patch",
        }
    }
}
