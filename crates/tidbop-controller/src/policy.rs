//! Request validation and scale guardrails.

use tidbop_state::{Db, Schema, Spec};

use crate::config::{OperatorConfig, TierLimit};
use crate::error::{ControllerError, ControllerResult};

pub const MIN_STORAGE_REPLICAS: u32 = 3;
pub const MIN_SQL_REPLICAS: u32 = 2;

const CPU_RANGE: std::ops::RangeInclusive<u32> = 200..=2000;
const MEM_RANGE: std::ops::RangeInclusive<u32> = 256..=8184;
const SCHEMA_FIELD_MAX: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Placement,
    Storage,
    Sql,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Placement => "pd",
            Tier::Storage => "tikv",
            Tier::Sql => "tidb",
        }
    }

    fn limit(self, config: &OperatorConfig) -> &TierLimit {
        match self {
            Tier::Placement => &config.limits.pd,
            Tier::Storage => &config.limits.tikv,
            Tier::Sql => &config.limits.tidb,
        }
    }
}

fn invalid(msg: String) -> ControllerError {
    ControllerError::Validation(msg)
}

/// Fill unset resources from the tier defaults.
pub fn normalize_spec(spec: &mut Spec, tier: Tier, config: &OperatorConfig) {
    let limit = tier.limit(config);
    if spec.cpu == 0 {
        spec.cpu = limit.cpu;
    }
    if spec.mem == 0 {
        spec.mem = limit.mem;
    }
    if spec.capacity.is_none() {
        spec.capacity = limit.capacity;
    }
}

/// Shape checks shared by every tier, then the tier's own bounds.
pub fn validate_spec(spec: &Spec, tier: Tier, config: &OperatorConfig) -> ControllerResult<()> {
    let name = tier.as_str();
    if !CPU_RANGE.contains(&spec.cpu) {
        return Err(invalid(format!(
            "{name} cpu {} outside {}..={}",
            spec.cpu,
            CPU_RANGE.start(),
            CPU_RANGE.end()
        )));
    }
    if !MEM_RANGE.contains(&spec.mem) {
        return Err(invalid(format!(
            "{name} mem {} outside {}..={}",
            spec.mem,
            MEM_RANGE.start(),
            MEM_RANGE.end()
        )));
    }
    if spec.replicas < 1 {
        return Err(invalid(format!("{name} needs at least one replica")));
    }
    if spec.version.trim().is_empty() {
        return Err(invalid(format!("{name} version is empty")));
    }

    let max = tier.limit(config).max;
    let replicas = spec.replicas;
    match tier {
        Tier::Placement if replicas % 2 == 0 || replicas < 3 || replicas > max => Err(invalid(
            format!("pd replicas must be odd and within 3..={max}, got {replicas}"),
        )),
        Tier::Storage if !(MIN_STORAGE_REPLICAS..=max).contains(&replicas) => Err(invalid(
            format!("tikv replicas must be within {MIN_STORAGE_REPLICAS}..={max}, got {replicas}"),
        )),
        Tier::Sql if replicas > max => Err(invalid(format!(
            "tidb replicas must be within 1..={max}, got {replicas}"
        ))),
        _ => Ok(()),
    }
}

fn is_identifier(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn validate_schema(schema: &Schema) -> ControllerResult<()> {
    for (field, value) in [
        ("name", &schema.name),
        ("user", &schema.user),
        ("password", &schema.password),
    ] {
        if value.is_empty() || value.chars().count() > SCHEMA_FIELD_MAX {
            return Err(invalid(format!(
                "schema {field} must be 1..={SCHEMA_FIELD_MAX} characters"
            )));
        }
    }
    if !is_identifier(&schema.name) {
        return Err(invalid(format!("schema name {:?} has invalid characters", schema.name)));
    }
    if !is_identifier(&schema.user) {
        return Err(invalid(format!("schema user {:?} has invalid characters", schema.user)));
    }
    if schema.password.contains(['\'', '\\']) {
        return Err(invalid("schema password must not contain quotes or backslashes".to_string()));
    }
    Ok(())
}

/// Check a replica change against the tier's guardrails.
pub fn check_scale(
    tier: Tier,
    current: u32,
    desired: u32,
    config: &OperatorConfig,
) -> ControllerResult<()> {
    let name = tier.as_str();
    let max = tier.limit(config).max;
    let floor = match tier {
        Tier::Storage => MIN_STORAGE_REPLICAS,
        Tier::Sql => MIN_SQL_REPLICAS,
        Tier::Placement => {
            return Err(ControllerError::Unsupported(
                "placement replicas cannot be scaled".to_string(),
            ));
        }
    };
    if desired > max {
        return Err(invalid(format!("{name} replicas {desired} exceed the limit {max}")));
    }
    if desired < floor {
        return Err(invalid(format!("{name} needs at least {floor} replicas, got {desired}")));
    }
    if desired > current.saturating_mul(2) {
        return Err(invalid(format!(
            "{name} may at most double per step ({current} -> {desired})"
        )));
    }
    // Removing more than two thirds at once risks losing quorum of data.
    if desired < current && (current - desired) * 3 > current * 2 {
        return Err(invalid(format!(
            "{name} may remove at most two thirds per step ({current} -> {desired})"
        )));
    }
    Ok(())
}

/// Whether the owner's clusters plus `new` exceed the self-service totals.
pub fn needs_approval(config: &OperatorConfig, existing: &[Db], new: &Db) -> bool {
    let (kv, db) = existing
        .iter()
        .chain(std::iter::once(new))
        .fold((0u32, 0u32), |(kv, db), c| {
            (kv + c.tikv.spec.replicas, db + c.tidb.spec.replicas)
        });
    kv > config.approval.kv_replicas || db > config.approval.db_replicas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(replicas: u32) -> Spec {
        Spec {
            cpu: 500,
            mem: 1024,
            version: "rc4".to_string(),
            replicas,
            ..Spec::default()
        }
    }

    #[test]
    fn shared_spec_bounds() {
        let config = OperatorConfig::default();
        assert!(validate_spec(&spec(3), Tier::Storage, &config).is_ok());
        let mut s = spec(3);
        s.cpu = 100;
        assert!(validate_spec(&s, Tier::Storage, &config).is_err());
        let mut s = spec(3);
        s.mem = 9000;
        assert!(validate_spec(&s, Tier::Sql, &config).is_err());
        let mut s = spec(3);
        s.version = " ".to_string();
        assert!(validate_spec(&s, Tier::Placement, &config).is_err());
        assert!(validate_spec(&spec(0), Tier::Sql, &config).is_err());
    }

    #[test]
    fn tier_bounds() {
        let config = OperatorConfig::default();
        assert!(validate_spec(&spec(3), Tier::Placement, &config).is_ok());
        assert!(validate_spec(&spec(1), Tier::Placement, &config).is_err());
        assert!(validate_spec(&spec(2), Tier::Placement, &config).is_err());
        assert!(validate_spec(&spec(5), Tier::Placement, &config).is_err());
        assert!(validate_spec(&spec(2), Tier::Storage, &config).is_err());
        assert!(validate_spec(&spec(11), Tier::Storage, &config).is_err());
        assert!(validate_spec(&spec(1), Tier::Sql, &config).is_ok());
    }

    #[test]
    fn normalize_fills_defaults_only() {
        let config = OperatorConfig::default();
        let mut s = Spec {
            cpu: 0,
            mem: 2048,
            replicas: 3,
            version: "rc4".to_string(),
            ..Spec::default()
        };
        normalize_spec(&mut s, Tier::Storage, &config);
        assert_eq!(s.cpu, 500);
        assert_eq!(s.mem, 2048);
        assert_eq!(s.capacity, Some(100));
    }

    #[test]
    fn schema_rules() {
        let ok = Schema {
            name: "shop_1".to_string(),
            user: "app".to_string(),
            password: "p@ss-word".to_string(),
        };
        assert!(validate_schema(&ok).is_ok());
        let mut s = ok.clone();
        s.name = "shop-1".to_string();
        assert!(validate_schema(&s).is_err());
        let mut s = ok.clone();
        s.user = "a".repeat(33);
        assert!(validate_schema(&s).is_err());
        let mut s = ok.clone();
        s.password = "it's".to_string();
        assert!(validate_schema(&s).is_err());
        let mut s = ok;
        s.password = String::new();
        assert!(validate_schema(&s).is_err());
    }

    #[test]
    fn scale_guardrails() {
        let config = OperatorConfig::default();
        // Floors and ceilings.
        assert!(check_scale(Tier::Storage, 3, 2, &config).is_err());
        assert!(check_scale(Tier::Sql, 2, 1, &config).is_err());
        assert!(check_scale(Tier::Storage, 6, 11, &config).is_err());
        // Doubling.
        assert!(check_scale(Tier::Storage, 3, 6, &config).is_ok());
        assert!(check_scale(Tier::Storage, 3, 7, &config).is_err());
        // Two thirds.
        assert!(check_scale(Tier::Storage, 9, 3, &config).is_ok());
        assert!(check_scale(Tier::Storage, 10, 3, &config).is_err());
        assert!(check_scale(Tier::Sql, 6, 2, &config).is_ok());
        assert!(check_scale(Tier::Sql, 7, 2, &config).is_err());
        assert!(matches!(
            check_scale(Tier::Placement, 3, 5, &config),
            Err(ControllerError::Unsupported(_))
        ));
    }

    #[test]
    fn approval_counts_all_of_the_owners_clusters() {
        let config = OperatorConfig::default();
        let mut small = Db::default();
        small.tikv.spec.replicas = 3;
        small.tidb.spec.replicas = 2;
        assert!(!needs_approval(&config, &[], &small));
        assert!(needs_approval(&config, &[small.clone()], &small));
    }
}
