//! Drover node containers: keep one system daemon per (cluster, container, pool)
//! scheduled on exactly the nodes a [`PoolFilter`] selects.
//!
//! A reconciliation either rebuilds the whole daemon object from its
//! [`NodeContainerConfig`] or, when `placement_only` is set and the daemon
//! exists, rewrites nothing but its affinity and the matching annotation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use drover_core::parse::{parse_bind_list, parse_env_list};
use drover_core::{NodeContainerConfig, PoolFilter, ProvisionError, ProvisionResult, LABEL_NODE_POOL};
use drover_kubehub::{ClusterApi, ClusterRegistry};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, RollingUpdateDaemonSet};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, HostPathVolumeSource, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PodSpec, PodTemplateSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use metrics::counter;
use tracing::{debug, info, warn};

pub mod labels;
pub mod registry;

pub use labels::NodeContainerLabels;
pub use registry::{ensure_node_containers, ensure_node_containers_running, NodeContainerRegistry, YamlNodeContainerRegistry};

pub const ALPHA_AFFINITY_ANNOTATION: &str = "scheduler.alpha.kubernetes.io/affinity";
/// The default system monitor; it also gets the host log directories.
pub const NODE_MONITOR: &str = "node-monitor";
pub const MAX_UNAVAILABLE: &str = "20%";

const MONITOR_BINDS: [&str; 3] = [
    "/var/log:/var/log:rw",
    "/var/lib/docker/containers:/var/lib/docker/containers:ro",
    "/mnt/sda1/var/lib/docker/containers:/mnt/sda1/var/lib/docker/containers:ro",
];

pub fn daemon_set_name(name: &str, pool: &str) -> String {
    if pool.is_empty() {
        format!("node-container-{}-all", name)
    } else {
        format!("node-container-{}-pool-{}", name, pool)
    }
}

/// Scheduling constraint derived from a pool filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Placement {
    pub affinity: Option<Affinity>,
    /// Empty, or the affinity serialized under [`ALPHA_AFFINITY_ANNOTATION`].
    pub annotations: BTreeMap<String, String>,
}

impl Placement {
    pub fn from_filter(filter: &PoolFilter) -> ProvisionResult<Self> {
        let (op, values) = filter.requirement();
        if values.is_empty() {
            return Ok(Self::default());
        }
        let affinity = Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: LABEL_NODE_POOL.to_string(),
                            operator: op.as_str().to_string(),
                            values: Some(values.to_vec()),
                        }]),
                        ..Default::default()
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let data = serde_json::to_string(&affinity)
            .map_err(|e| ProvisionError::Configuration(format!("encoding affinity: {}", e)))?;
        Ok(Self {
            affinity: Some(affinity),
            annotations: BTreeMap::from([(ALPHA_AFFINITY_ANNOTATION.to_string(), data)]),
        })
    }

    fn annotation(&self) -> Option<&String> {
        self.annotations.get(ALPHA_AFFINITY_ANNOTATION)
    }

    /// Compares the affinity and the affinity annotation only; other
    /// template annotations are ignored.
    pub fn matches(&self, ds: &DaemonSet) -> bool {
        let template = ds.spec.as_ref().map(|s| &s.template);
        let annotation = template
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(ALPHA_AFFINITY_ANNOTATION));
        let affinity = template.and_then(|t| t.spec.as_ref()).and_then(|s| s.affinity.as_ref());
        annotation == self.annotation() && affinity == self.affinity.as_ref()
    }

    /// Set or clear the affinity annotation and the affinity. Other template
    /// annotations are kept.
    pub fn apply_to(&self, ds: &mut DaemonSet) {
        let spec = ds.spec.get_or_insert_with(Default::default);
        let meta = spec.template.metadata.get_or_insert_with(Default::default);
        let mut annotations = meta.annotations.take().unwrap_or_default();
        match self.annotation() {
            Some(data) => {
                annotations.insert(ALPHA_AFFINITY_ANNOTATION.to_string(), data.clone());
            }
            None => {
                annotations.remove(ALPHA_AFFINITY_ANNOTATION);
            }
        }
        meta.annotations = (!annotations.is_empty()).then_some(annotations);
        spec.template.spec.get_or_insert_with(Default::default).affinity = self.affinity.clone();
    }
}

fn restart_policy(name: &str) -> &'static str {
    match name {
        "on-failure" => "OnFailure",
        "no" => "Never",
        _ => "Always",
    }
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    (!v.is_empty()).then_some(v)
}

/// Complete desired daemon object for `config` in `pool`.
pub fn build_daemon_set(
    config: &NodeContainerConfig,
    pool: &str,
    namespace: &str,
    placement: &Placement,
) -> ProvisionResult<DaemonSet> {
    let ls = NodeContainerLabels::new(&config.name, pool, &config.config.labels);
    let env: Vec<EnvVar> = parse_env_list(&config.config.env)?
        .into_iter()
        .map(|e| EnvVar { name: e.name, value: Some(e.value), ..Default::default() })
        .collect();
    let mut binds = config.host_config.binds.clone();
    if config.name == NODE_MONITOR {
        binds.extend(MONITOR_BINDS.iter().map(|b| b.to_string()));
    }
    let mut volumes = Vec::with_capacity(binds.len());
    let mut mounts = Vec::with_capacity(binds.len());
    for (i, bind) in parse_bind_list(&binds)?.into_iter().enumerate() {
        let name = format!("volume-{}", i);
        volumes.push(Volume {
            name: name.clone(),
            host_path: Some(HostPathVolumeSource { path: bind.source, ..Default::default() }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name,
            mount_path: bind.destination,
            read_only: bind.read_only.then_some(true),
            ..Default::default()
        });
    }
    let security_context = config
        .host_config
        .privileged
        .then(|| SecurityContext { privileged: Some(true), ..Default::default() });
    let c = &config.config;
    let container = Container {
        name: config.name.clone(),
        image: Some(config.image().to_string()),
        command: non_empty(c.entrypoint.clone()),
        args: non_empty(c.cmd.clone()),
        env: non_empty(env),
        working_dir: (!c.working_dir.is_empty()).then(|| c.working_dir.clone()),
        tty: c.tty.then_some(true),
        volume_mounts: non_empty(mounts),
        security_context,
        ..Default::default()
    };
    Ok(DaemonSet {
        metadata: ObjectMeta {
            name: Some(daemon_set_name(&config.name, pool)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector { match_labels: Some(ls.to_selector()), ..Default::default() },
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDaemonSet {
                    max_unavailable: Some(IntOrString::String(MAX_UNAVAILABLE.to_string())),
                    ..Default::default()
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(ls.to_labels()),
                    annotations: (!placement.annotations.is_empty()).then(|| placement.annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity: placement.affinity.clone(),
                    volumes: non_empty(volumes),
                    restart_policy: Some(restart_policy(&config.host_config.restart_policy.name).to_string()),
                    host_network: (config.host_config.network_mode == "host").then_some(true),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonChange {
    Created,
    Updated,
    PlacementUpdated,
    Unchanged,
}

/// Reconcile one daemon on one cluster.
pub async fn reconcile_daemon(
    client: &dyn ClusterApi,
    config: &NodeContainerConfig,
    pool: &str,
    filter: &PoolFilter,
    placement_only: bool,
) -> ProvisionResult<DaemonChange> {
    let name = daemon_set_name(&config.name, pool);
    let existing = client.get_daemon_set(&name).await?;
    let placement = Placement::from_filter(filter)?;
    if let (Some(current), true) = (existing.as_ref(), placement_only) {
        if placement.matches(current) {
            debug!(cluster = %client.name(), daemonset = %name, "placement already up to date");
            return Ok(DaemonChange::Unchanged);
        }
        let mut updated = current.clone();
        placement.apply_to(&mut updated);
        client.update_daemon_set(&updated).await?;
        info!(cluster = %client.name(), daemonset = %name, "daemon placement updated");
        return Ok(DaemonChange::PlacementUpdated);
    }
    let mut desired = build_daemon_set(config, pool, client.namespace(), &placement)?;
    match existing {
        Some(current) => {
            desired.metadata.resource_version = current.metadata.resource_version;
            client.update_daemon_set(&desired).await?;
            info!(cluster = %client.name(), daemonset = %name, "daemon replaced");
            Ok(DaemonChange::Updated)
        }
        None => {
            client.create_daemon_set(&desired).await?;
            info!(cluster = %client.name(), daemonset = %name, "daemon created");
            Ok(DaemonChange::Created)
        }
    }
}

/// Applies node-container reconciliation to every registered cluster.
pub struct NodeContainerManager {
    clusters: Arc<dyn ClusterRegistry>,
}

impl NodeContainerManager {
    pub fn new(clusters: Arc<dyn ClusterRegistry>) -> Self {
        Self { clusters }
    }

    /// Every cluster is attempted; failures are reported together afterwards.
    /// No registered cluster is not an error.
    pub async fn deploy_node_container(
        &self,
        config: &NodeContainerConfig,
        pool: &str,
        filter: &PoolFilter,
        placement_only: bool,
    ) -> ProvisionResult<()> {
        let clusters = self.clusters.clusters().await?;
        if clusters.is_empty() {
            debug!(node_container = %config.name, pool = %pool, "no cluster registered");
            return Ok(());
        }
        let mut failures: Vec<String> = Vec::new();
        for cluster in clusters.iter() {
            match reconcile_daemon(cluster.as_ref(), config, pool, filter, placement_only).await {
                Ok(change) => {
                    counter!("node_container_reconcile_total", 1u64, "change" => format!("{:?}", change));
                }
                Err(e) => {
                    counter!("node_container_reconcile_err", 1u64, "cluster" => cluster.name().to_string());
                    warn!(cluster = %cluster.name(), node_container = %config.name, pool = %pool, error = %e, "node container reconciliation failed");
                    failures.push(format!("{}: {}", cluster.name(), e));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::cluster(
                format!("deploying {}", daemon_set_name(&config.name, pool)),
                failures.join("; "),
            ))
        }
    }
}
