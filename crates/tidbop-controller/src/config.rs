//! tidbop.toml configuration.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! Durations are written as strings: `"15s"`, `"500ms"`, `"3m"`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Namespace every cluster's pods and services live in.
    pub namespace: String,
    /// Image registry prefix; images are `{registry}/{component}:{version}`.
    pub registry: String,
    /// Node addresses clients reach node ports through.
    pub proxies: Vec<String>,
    /// Host directory for data volumes; empty-dir volumes when unset.
    pub host_path: Option<String>,
    /// Versions an upgrade may move to.
    pub versions: Vec<String>,
    pub migrator_image: String,
    pub limits: Limits,
    pub approval: Approval,
    pub stores: StorePolicy,
    pub timings: Timings,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            registry: "pingcap".to_string(),
            proxies: Vec::new(),
            host_path: None,
            versions: vec!["rc4".to_string(), "latest".to_string()],
            migrator_image: "pingcap/migrator:latest".to_string(),
            limits: Limits::default(),
            approval: Approval::default(),
            stores: StorePolicy::default(),
            timings: Timings::default(),
        }
    }
}

/// Per-tier defaults and upper bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub pd: TierLimit,
    pub tikv: TierLimit,
    pub tidb: TierLimit,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            pd: TierLimit {
                cpu: 500,
                mem: 1024,
                max: 3,
                capacity: None,
            },
            tikv: TierLimit {
                cpu: 500,
                mem: 1024,
                max: 10,
                capacity: Some(100),
            },
            tidb: TierLimit {
                cpu: 500,
                mem: 1024,
                max: 10,
                capacity: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimit {
    /// Default CPU (millicores) for a spec that leaves it at 0.
    pub cpu: u32,
    /// Default memory (MiB) for a spec that leaves it at 0.
    pub mem: u32,
    /// Largest replica count a cluster may ask for.
    pub max: u32,
    /// Default store capacity in GiB.
    #[serde(default)]
    pub capacity: Option<u32>,
}

/// Per-user replica totals above which a new cluster waits for an admin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Approval {
    pub kv_replicas: u32,
    pub db_replicas: u32,
}

impl Default for Approval {
    fn default() -> Self {
        Self {
            kv_replicas: 3,
            db_replicas: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorePolicy {
    /// Missed Up checks after which an Online store turns Offline.
    pub offline_after_checks: u32,
    /// Missed Up checks after which a store without a live pod is purged.
    pub max_down_checks: u32,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            offline_after_checks: 3,
            max_down_checks: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub pod_timeout: Duration,
    /// Leader election, store join and SQL health waits.
    #[serde(with = "duration_str")]
    pub component_timeout: Duration,
    /// Pause between SQL readiness and schema creation.
    #[serde(with = "duration_str")]
    pub init_grace: Duration,
    /// How long uninstall waits for the cell's pods to disappear.
    #[serde(with = "duration_str")]
    pub stop_timeout: Duration,
    #[serde(with = "duration_str")]
    pub reconcile_interval: Duration,
    #[serde(with = "duration_str")]
    pub pd_upgrade_settle: Duration,
    #[serde(with = "duration_str")]
    pub tikv_upgrade_settle: Duration,
    #[serde(with = "duration_str")]
    pub tidb_upgrade_settle: Duration,
    /// Longest a watch handler may block before the process aborts.
    #[serde(with = "duration_str")]
    pub watch_handler_ceiling: Duration,
    pub persist_retries: u32,
    pub sql_init_retries: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            pod_timeout: Duration::from_secs(180),
            component_timeout: Duration::from_secs(180),
            init_grace: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(15),
            pd_upgrade_settle: Duration::from_secs(5),
            tikv_upgrade_settle: Duration::from_secs(15),
            tidb_upgrade_settle: Duration::from_secs(5),
            watch_handler_ceiling: Duration::from_secs(60),
            persist_retries: 5,
            sql_init_retries: 3,
        }
    }
}

impl OperatorConfig {
    /// Parse a config file from disk.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    /// Parse and validate a config from a TOML string.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: OperatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.namespace.is_empty() {
            anyhow::bail!("namespace must not be empty");
        }
        if self.versions.is_empty() {
            anyhow::bail!("at least one allowed version is required");
        }
        let pd_max = self.limits.pd.max;
        if pd_max < 3 || pd_max % 2 == 0 {
            anyhow::bail!("limits.pd.max must be odd and at least 3, got {pd_max}");
        }
        if self.limits.tikv.max < 3 {
            anyhow::bail!("limits.tikv.max must be at least 3");
        }
        if self.limits.tidb.max < 2 {
            anyhow::bail!("limits.tidb.max must be at least 2");
        }
        if self.timings.poll_interval.is_zero() {
            anyhow::bail!("timings.poll_interval must be positive");
        }
        if self.timings.persist_retries == 0 {
            anyhow::bail!("timings.persist_retries must be positive");
        }
        Ok(())
    }

    pub fn image(&self, component: &str, version: &str) -> String {
        format!("{}/{}:{}", self.registry, component, version)
    }

    pub fn allows_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }
}

/// Parse a duration string like "5s", "500ms" or "1m". A bare number is
/// seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid duration {raw:?}")))
    }
}
