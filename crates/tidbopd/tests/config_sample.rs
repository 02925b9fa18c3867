//! The shipped sample configuration and config validation.

use std::path::Path;
use std::time::Duration;

use tidbop_controller::OperatorConfig;

fn sample_path() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tidbop.toml")
}

#[test]
fn sample_config_is_valid() {
    let config = OperatorConfig::from_file(&sample_path()).unwrap();
    assert_eq!(config.namespace, "tidb");
    assert_eq!(config.proxies.len(), 2);
    assert_eq!(config.limits.tikv.capacity, Some(200));
    assert_eq!(config.timings.pod_timeout, Duration::from_secs(180));
    assert_eq!(config.timings.watch_handler_ceiling, Duration::from_secs(60));
    assert!(config.allows_version("latest"));
    assert_eq!(config.image("tikv", "rc4"), "pingcap/tikv:rc4");
}

#[test]
fn empty_config_uses_defaults() {
    let config = OperatorConfig::parse("").unwrap();
    assert_eq!(config.namespace, "default");
    assert_eq!(config.stores.offline_after_checks, 3);
    assert_eq!(config.timings.reconcile_interval, Duration::from_secs(15));
}

#[test]
fn invalid_configs_are_rejected() {
    let even_pd = "[limits.pd]\ncpu = 500\nmem = 1024\nmax = 4\n";
    let err = OperatorConfig::parse(even_pd).unwrap_err();
    assert!(err.to_string().contains("limits.pd.max"), "got {err}");

    assert!(OperatorConfig::parse("[timings]\npoll_interval = \"soon\"\n").is_err());
    assert!(OperatorConfig::parse("versions = []\n").is_err());
    assert!(OperatorConfig::from_file(Path::new("/nonexistent/tidbop.toml")).is_err());
}
