//! Drover core types shared by the deploy and node-container reconcilers.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod parse;

pub use config::{ConfigSource, YamlConfig};
pub use error::{Advisory, ProvisionError, ProvisionResult};

/// Node label carrying the pool a node belongs to.
pub const LABEL_NODE_POOL: &str = "drover.io/pool";

/// How a single process of an image is started.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessSpec {
    pub command: String,
}

/// Metadata of a built image: its declared processes keyed by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageMetadata {
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessSpec>,
}

impl ImageMetadata {
    pub fn new(processes: BTreeMap<String, ProcessSpec>) -> Self {
        Self { processes }
    }

    /// Process names in ascending lexicographic order.
    pub fn process_names(&self) -> Vec<String> {
        self.processes.keys().cloned().collect()
    }

    pub fn has_process(&self, name: &str) -> bool {
        self.processes.contains_key(name)
    }

    pub fn process(&self, name: &str) -> Option<&ProcessSpec> {
        self.processes.get(name)
    }
}

/// Owning application of a set of services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub name: String,
    #[serde(default)]
    pub pool: String,
}

impl App {
    pub fn new(name: impl Into<String>, pool: impl Into<String>) -> Self {
        Self { name: name.into(), pool: pool.into() }
    }
}

/// Set difference over process names: everything `old` declares that `new` does not.
pub fn process_difference(old: &ImageMetadata, new: &ImageMetadata) -> BTreeSet<String> {
    old.processes
        .keys()
        .filter(|name| !new.processes.contains_key(*name))
        .cloned()
        .collect()
}

/// Include XOR exclude set of pool-label values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOperator {
    In,
    NotIn,
}

impl PoolOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolOperator::In => "In",
            PoolOperator::NotIn => "NotIn",
        }
    }
}

impl PoolFilter {
    pub fn include(pools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { include: pools.into_iter().map(Into::into).collect(), exclude: Vec::new() }
    }

    pub fn exclude(pools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { include: Vec::new(), exclude: pools.into_iter().map(Into::into).collect() }
    }

    /// Exclude wins when non-empty.
    pub fn requirement(&self) -> (PoolOperator, &[String]) {
        if !self.exclude.is_empty() {
            (PoolOperator::NotIn, &self.exclude)
        } else {
            (PoolOperator::In, &self.include)
        }
    }
}

/// Restart policy as named by the container runtime (`always`, `on-failure`, `no`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartPolicy {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "maximum-retry-count")]
    pub maximum_retry_count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    /// Bind mounts in runtime wire format `src:dst[:mode]`.
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default, rename = "restart-policy")]
    pub restart_policy: RestartPolicy,
    #[serde(default, rename = "network-mode")]
    pub network_mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerConfig {
    #[serde(default)]
    pub image: String,
    /// Environment in runtime wire format `KEY=VALUE`.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default, rename = "working-dir")]
    pub working_dir: String,
    #[serde(default)]
    pub tty: bool,
}

/// Declarative spec of a node-level system daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeContainerConfig {
    pub name: String,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default, rename = "host-config")]
    pub host_config: HostConfig,
}

impl NodeContainerConfig {
    pub fn image(&self) -> &str {
        &self.config.image
    }

    /// Overlay non-empty fields of `other` on top of `self`.
    pub fn merged_with(&self, other: &NodeContainerConfig) -> NodeContainerConfig {
        let mut out = self.clone();
        let c = &other.config;
        if !c.image.is_empty() { out.config.image = c.image.clone(); }
        if !c.env.is_empty() { out.config.env.extend(c.env.iter().cloned()); }
        for (k, v) in c.labels.iter() { out.config.labels.insert(k.clone(), v.clone()); }
        if !c.entrypoint.is_empty() { out.config.entrypoint = c.entrypoint.clone(); }
        if !c.cmd.is_empty() { out.config.cmd = c.cmd.clone(); }
        if !c.working_dir.is_empty() { out.config.working_dir = c.working_dir.clone(); }
        out.config.tty |= c.tty;
        let h = &other.host_config;
        if !h.binds.is_empty() { out.host_config.binds.extend(h.binds.iter().cloned()); }
        out.host_config.privileged |= h.privileged;
        if !h.restart_policy.name.is_empty() { out.host_config.restart_policy = h.restart_policy.clone(); }
        if !h.network_mode.is_empty() { out.host_config.network_mode = h.network_mode.clone(); }
        out
    }
}

/// Low-level runtime container: a name plus the runtime-assigned instance id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub instance_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(names: &[&str]) -> ImageMetadata {
        ImageMetadata::new(
            names.iter().map(|n| (n.to_string(), ProcessSpec { command: format!("run-{}", n) })).collect(),
        )
    }

    #[test]
    fn process_names_are_sorted() {
        let m = meta(&["worker", "web", "clock"]);
        assert_eq!(m.process_names(), vec!["clock", "web", "worker"]);
    }

    #[test]
    fn difference_is_old_minus_new() {
        let old = meta(&["web", "worker"]);
        let new = meta(&["web"]);
        let diff: Vec<_> = process_difference(&old, &new).into_iter().collect();
        assert_eq!(diff, vec!["worker"]);
        assert!(process_difference(&new, &old).is_empty());
    }

    #[test]
    fn exclude_takes_precedence() {
        let f = PoolFilter { include: vec!["a".into()], exclude: vec!["b".into()] };
        let (op, values) = f.requirement();
        assert_eq!(op, PoolOperator::NotIn);
        assert_eq!(values, ["b".to_string()]);

        let f = PoolFilter::include(["a"]);
        let (op, values) = f.requirement();
        assert_eq!(op, PoolOperator::In);
        assert_eq!(values, ["a".to_string()]);

        let empty = PoolFilter::default();
        let (op, values) = empty.requirement();
        assert_eq!(op, PoolOperator::In);
        assert!(values.is_empty());
    }

    #[test]
    fn merge_overlays_pool_config() {
        let base = NodeContainerConfig {
            name: "agent".into(),
            config: ContainerConfig { image: "agent:1".into(), env: vec!["A=1".into()], ..Default::default() },
            host_config: HostConfig { binds: vec!["/a:/a".into()], ..Default::default() },
        };
        let pool = NodeContainerConfig {
            name: "agent".into(),
            config: ContainerConfig { image: "agent:2".into(), env: vec!["B=2".into()], ..Default::default() },
            host_config: HostConfig { privileged: true, ..Default::default() },
        };
        let m = base.merged_with(&pool);
        assert_eq!(m.image(), "agent:2");
        assert_eq!(m.config.env, vec!["A=1", "B=2"]);
        assert_eq!(m.host_config.binds, vec!["/a:/a"]);
        assert!(m.host_config.privileged);
    }

    #[test]
    fn image_metadata_reads_yaml() {
        let y = "processes:\n  web: ./serve\n  worker:\n    command: ./work\n";
        // Short form is not accepted; commands live under `command`.
        assert!(serde_yaml::from_str::<ImageMetadata>(y).is_err());
        let y = "processes:\n  web:\n    command: ./serve\n  worker:\n    command: ./work\n";
        let m: ImageMetadata = serde_yaml::from_str(y).unwrap();
        assert_eq!(m.process("web").map(|p| p.command.as_str()), Some("./serve"));
        assert!(m.has_process("worker"));
    }
}
