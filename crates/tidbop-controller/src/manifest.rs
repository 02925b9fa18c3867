//! Builders for the pods, services and replica groups of one cluster.

use tidbop_k8s::{
    DataVolume, PodRequest, PortSpec, ReplicaGroupRequest, RestartPolicy, ServiceKind,
    ServiceRequest, VolumeSource,
};
use tidbop_state::{Db, Spec};

use crate::config::OperatorConfig;
use crate::migrate::MigrateRequest;
use crate::naming::*;

/// How a new placement member finds its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdBootstrap {
    /// Part of the first quorum; lists every initial member name.
    Initial(Vec<String>),
    /// Joins a running placement service.
    Join,
}

fn peer_url(name: &str, cell: &str) -> String {
    format!("http://{name}.{}:{PD_PEER_PORT}", pd_peer_service(cell))
}

fn data_volume(config: &OperatorConfig, spec: &Spec, pod: &str, mount_path: &str) -> DataVolume {
    let source = match spec.volume.as_deref().or(config.host_path.as_deref()) {
        Some(base) => VolumeSource::HostPath(format!("{}/{pod}", base.trim_end_matches('/'))),
        None => VolumeSource::EmptyDir,
    };
    DataVolume {
        mount_path: mount_path.to_string(),
        source,
    }
}

fn base_pod(config: &OperatorConfig, db: &Db, component: Component, spec: &Spec, name: String) -> PodRequest {
    PodRequest {
        labels: pod_labels(db.cell(), component, &spec.version),
        container: component.as_str().to_string(),
        image: config.image(component.as_str(), &spec.version),
        command: Vec::new(),
        args: Vec::new(),
        env: Vec::new(),
        ports: Vec::new(),
        cpu_millis: spec.cpu,
        memory_mib: spec.mem,
        volume: None,
        hostname: None,
        subdomain: None,
        restart_policy: RestartPolicy::Always,
        termination_grace_secs: 5,
        name,
    }
}

pub fn pd_pod(config: &OperatorConfig, db: &Db, seq: u32, bootstrap: &PdBootstrap) -> PodRequest {
    let cell = db.cell();
    let name = pod_name(Component::Pd, cell, seq);
    let spec = &db.pd.spec;
    let mut pod = base_pod(config, db, Component::Pd, spec, name.clone());
    let mut args = vec![
        format!("--name={name}"),
        "--data-dir=/var/lib/pd".to_string(),
        format!("--client-urls=http://0.0.0.0:{PD_CLIENT_PORT}"),
        format!(
            "--advertise-client-urls=http://{name}.{}:{PD_CLIENT_PORT}",
            pd_peer_service(cell)
        ),
        format!("--peer-urls=http://0.0.0.0:{PD_PEER_PORT}"),
        format!("--advertise-peer-urls={}", peer_url(&name, cell)),
    ];
    match bootstrap {
        PdBootstrap::Initial(members) => {
            let initial = members
                .iter()
                .map(|m| format!("{m}={}", peer_url(m, cell)))
                .collect::<Vec<_>>()
                .join(",");
            args.push(format!("--initial-cluster={initial}"));
        }
        PdBootstrap::Join => {
            args.push(format!(
                "--join=http://{}:{PD_CLIENT_PORT}",
                pd_client_service(cell)
            ));
        }
    }
    pod.command = vec!["/pd-server".to_string()];
    pod.args = args;
    pod.ports = vec![
        PortSpec::new("client", PD_CLIENT_PORT),
        PortSpec::new("peer", PD_PEER_PORT),
    ];
    pod.volume = Some(data_volume(config, spec, &name, "/var/lib/pd"));
    pod.subdomain = Some(pd_peer_service(cell));
    pod.hostname = Some(name);
    pod
}

pub fn tikv_pod(config: &OperatorConfig, db: &Db, seq: u32) -> PodRequest {
    let cell = db.cell();
    let name = pod_name(Component::Tikv, cell, seq);
    let spec = &db.tikv.spec;
    let capacity = spec
        .capacity
        .or(config.limits.tikv.capacity)
        .unwrap_or_default();
    let mut pod = base_pod(config, db, Component::Tikv, spec, name.clone());
    // The store registers under its pod IP, which is only known at runtime.
    pod.command = vec!["/bin/sh".to_string(), "-c".to_string()];
    pod.args = vec![format!(
        "exec /tikv-server --addr=0.0.0.0:{TIKV_PORT} --advertise-addr=$(hostname -i):{TIKV_PORT} \
         --pd={}:{PD_CLIENT_PORT} --data-dir=/var/lib/tikv --capacity={capacity}GB",
        pd_client_service(cell)
    )];
    pod.ports = vec![PortSpec::new("server", TIKV_PORT)];
    pod.volume = Some(data_volume(config, spec, &name, "/var/lib/tikv"));
    pod.termination_grace_secs = 30;
    pod
}

pub fn tidb_group(config: &OperatorConfig, db: &Db) -> ReplicaGroupRequest {
    let cell = db.cell();
    let spec = &db.tidb.spec;
    let name = tidb_name(cell);
    let mut template = base_pod(config, db, Component::Tidb, spec, name.clone());
    template.command = vec!["/tidb-server".to_string()];
    template.args = vec![
        "--store=tikv".to_string(),
        format!("--path={}:{PD_CLIENT_PORT}", pd_client_service(cell)),
        format!("--P={TIDB_PORT}"),
        format!("--status={TIDB_STATUS_PORT}"),
    ];
    template.ports = vec![
        PortSpec::new("mysql", TIDB_PORT),
        PortSpec::new("status", TIDB_STATUS_PORT),
    ];
    ReplicaGroupRequest {
        labels: component_labels(cell, Component::Tidb),
        replicas: spec.replicas,
        name,
        template,
    }
}

/// Headless peer service and client node-port service for placement.
pub fn pd_services(db: &Db) -> [ServiceRequest; 2] {
    let cell = db.cell();
    let selector = component_labels(cell, Component::Pd);
    [
        ServiceRequest {
            name: pd_peer_service(cell),
            labels: selector.clone(),
            selector: selector.clone(),
            kind: ServiceKind::Headless,
            ports: vec![PortSpec::new("peer", PD_PEER_PORT)],
        },
        ServiceRequest {
            name: pd_client_service(cell),
            labels: selector.clone(),
            selector,
            kind: ServiceKind::NodePort,
            ports: vec![PortSpec::new("client", PD_CLIENT_PORT)],
        },
    ]
}

pub fn tidb_service(db: &Db) -> ServiceRequest {
    let selector = component_labels(db.cell(), Component::Tidb);
    ServiceRequest {
        name: tidb_name(db.cell()),
        labels: selector.clone(),
        selector,
        kind: ServiceKind::NodePort,
        ports: vec![
            PortSpec::new("mysql", TIDB_PORT),
            PortSpec::new("status", TIDB_STATUS_PORT),
        ],
    }
}

pub fn migrator_pod(config: &OperatorConfig, db: &Db, req: &MigrateRequest) -> PodRequest {
    let cell = db.cell();
    let dest = db
        .status
        .outer_addresses
        .first()
        .cloned()
        .unwrap_or_else(|| format!("{}:{TIDB_PORT}", tidb_name(cell)));
    let (dest_host, dest_port) = match dest.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => (dest, TIDB_PORT.to_string()),
    };
    let env = vec![
        ("M_S_HOST".to_string(), req.source.host.clone()),
        ("M_S_PORT".to_string(), req.source.port.to_string()),
        ("M_S_USER".to_string(), req.source.user.clone()),
        ("M_S_PASSWORD".to_string(), req.source.password.clone()),
        ("M_S_DB".to_string(), req.source.database.clone()),
        ("M_D_HOST".to_string(), dest_host),
        ("M_D_PORT".to_string(), dest_port),
        ("M_D_USER".to_string(), db.schema.user.clone()),
        ("M_D_PASSWORD".to_string(), db.schema.password.clone()),
        ("M_D_DB".to_string(), db.schema.name.clone()),
        ("M_STAT_API".to_string(), req.notify_url.clone()),
        ("M_SYNC".to_string(), req.sync.to_string()),
    ];
    PodRequest {
        name: migrator_name(cell),
        labels: pod_labels(cell, Component::Migrator, "latest"),
        container: Component::Migrator.as_str().to_string(),
        image: config.migrator_image.clone(),
        command: Vec::new(),
        args: vec!["migrate".to_string()],
        env,
        ports: Vec::new(),
        cpu_millis: 200,
        memory_mib: 256,
        volume: None,
        hostname: None,
        subdomain: None,
        restart_policy: RestartPolicy::Never,
        termination_grace_secs: 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidbop_state::Db;

    fn db() -> Db {
        let mut db = Db::default();
        db.metadata.name = "001-app".to_string();
        db.pd.spec = Spec {
            cpu: 500,
            mem: 1024,
            version: "rc4".to_string(),
            replicas: 3,
            ..Spec::default()
        };
        db.tikv.spec = db.pd.spec.clone();
        db.tidb.spec = Spec {
            replicas: 2,
            ..db.pd.spec.clone()
        };
        db
    }

    #[test]
    fn initial_pd_members_list_the_whole_quorum() {
        let names = vec!["pd-001-app-001".to_string(), "pd-001-app-002".to_string()];
        let pod = pd_pod(&OperatorConfig::default(), &db(), 2, &PdBootstrap::Initial(names));
        assert_eq!(pod.name, "pd-001-app-002");
        assert_eq!(pod.hostname.as_deref(), Some("pd-001-app-002"));
        assert_eq!(pod.subdomain.as_deref(), Some("pd-001-app-srv"));
        assert_eq!(pod.image, "pingcap/pd:rc4");
        let initial = pod
            .args
            .iter()
            .find(|a| a.starts_with("--initial-cluster="))
            .unwrap();
        assert!(initial.contains("pd-001-app-001=http://pd-001-app-001.pd-001-app-srv:2380"));
        assert!(!pod.args.iter().any(|a| a.starts_with("--join")));
    }

    #[test]
    fn joining_pd_member_points_at_client_service() {
        let pod = pd_pod(&OperatorConfig::default(), &db(), 4, &PdBootstrap::Join);
        assert!(pod.args.contains(&"--join=http://pd-001-app:2379".to_string()));
    }

    #[test]
    fn host_path_volume_is_per_pod() {
        let mut config = OperatorConfig::default();
        config.host_path = Some("/data/".to_string());
        let pod = tikv_pod(&config, &db(), 1);
        assert_eq!(
            pod.volume.unwrap().source,
            VolumeSource::HostPath("/data/tikv-001-app-001".to_string())
        );
        assert!(pod.args[0].contains("--capacity=100GB"));
        assert_eq!(pod.labels["component"], "tikv");
    }

    #[test]
    fn sql_group_is_sized_from_spec() {
        let group = tidb_group(&OperatorConfig::default(), &db());
        assert_eq!(group.name, "tidb-001-app");
        assert_eq!(group.replicas, 2);
        assert_eq!(group.template.labels["version"], "rc4");
        assert!(!group.labels.contains_key("version"));
    }

    #[test]
    fn pd_services_pair() {
        let [peer, client] = pd_services(&db());
        assert_eq!(peer.kind, ServiceKind::Headless);
        assert_eq!(peer.ports[0].port, 2380);
        assert_eq!(client.name, "pd-001-app");
        assert_eq!(client.kind, ServiceKind::NodePort);
    }
}
