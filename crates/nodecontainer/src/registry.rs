//! Declared node containers and the "ensure everything" entry points.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use drover_core::{ContainerConfig, HostConfig, NodeContainerConfig, PoolFilter, ProvisionError, ProvisionResult};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::NodeContainerManager;

/// Source of node-container definitions. The empty pool is the default
/// definition; a specific pool's entry is overlaid on it.
pub trait NodeContainerRegistry: Send + Sync {
    /// Sorted container names.
    fn names(&self) -> Vec<String>;
    /// Sorted pools `name` is declared for, `""` included when present.
    fn pools_for(&self, name: &str) -> Vec<String>;
    fn load(&self, pool: &str, name: &str) -> ProvisionResult<NodeContainerConfig>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolEntry {
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default, rename = "host-config")]
    pub host_config: HostConfig,
}

/// Registry file layout: `name -> pool -> entry`, with `""` as the default pool.
#[derive(Debug, Clone, Default)]
pub struct YamlNodeContainerRegistry {
    entries: BTreeMap<String, BTreeMap<String, PoolEntry>>,
}

impl YamlNodeContainerRegistry {
    pub fn from_yaml(doc: &str) -> ProvisionResult<Self> {
        if doc.trim().is_empty() {
            return Ok(Self::default());
        }
        let entries = serde_yaml::from_str::<Option<BTreeMap<String, BTreeMap<String, PoolEntry>>>>(doc)
            .map_err(|e| ProvisionError::Configuration(format!("node container registry: {}", e)))?
            .unwrap_or_default();
        Ok(Self { entries })
    }

    pub fn from_file(path: &Path) -> ProvisionResult<Self> {
        let doc = std::fs::read_to_string(path)
            .map_err(|e| ProvisionError::Configuration(format!("reading {}: {}", path.display(), e)))?;
        Self::from_yaml(&doc)
    }

    pub fn insert(&mut self, pool: &str, config: NodeContainerConfig) {
        let entry = PoolEntry { config: config.config, host_config: config.host_config };
        self.entries.entry(config.name).or_default().insert(pool.to_string(), entry);
    }
}

impl NodeContainerRegistry for YamlNodeContainerRegistry {
    fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn pools_for(&self, name: &str) -> Vec<String> {
        self.entries.get(name).map(|p| p.keys().cloned().collect()).unwrap_or_default()
    }

    fn load(&self, pool: &str, name: &str) -> ProvisionResult<NodeContainerConfig> {
        let pools = self
            .entries
            .get(name)
            .ok_or_else(|| ProvisionError::Configuration(format!("node container {} not found", name)))?;
        let as_config = |e: &PoolEntry| NodeContainerConfig {
            name: name.to_string(),
            config: e.config.clone(),
            host_config: e.host_config.clone(),
        };
        let base = pools.get("").map(as_config);
        let specific = if pool.is_empty() { None } else { pools.get(pool).map(as_config) };
        match (base, specific) {
            (Some(b), Some(s)) => Ok(b.merged_with(&s)),
            (Some(b), None) => Ok(b),
            (None, Some(s)) => Ok(s),
            (None, None) => Err(ProvisionError::Configuration(format!(
                "node container {} has no config for pool {:?}",
                name, pool
            ))),
        }
    }
}

/// Deploy every declared node container: the default pool on all nodes outside
/// the specific pools, then each specific pool on its own nodes.
pub async fn ensure_node_containers(
    manager: &NodeContainerManager,
    registry: &dyn NodeContainerRegistry,
    out: &mut String,
) -> ProvisionResult<()> {
    for name in registry.names() {
        let pools = registry.pools_for(&name);
        let specific: Vec<String> = pools.iter().filter(|p| !p.is_empty()).cloned().collect();
        if pools.iter().any(|p| p.is_empty()) {
            let config = registry.load("", &name)?;
            let _ = writeln!(out, "creating node container {} in all pools", name);
            manager.deploy_node_container(&config, "", &PoolFilter::exclude(specific.clone()), false).await?;
        }
        for pool in specific.iter() {
            let config = registry.load(pool, &name)?;
            let _ = writeln!(out, "creating node container {} in pool {}", name, pool);
            manager.deploy_node_container(&config, pool, &PoolFilter::include([pool.clone()]), false).await?;
        }
    }
    Ok(())
}

pub async fn ensure_node_containers_running(
    manager: &NodeContainerManager,
    registry: &dyn NodeContainerRegistry,
) -> ProvisionResult<()> {
    let mut diag = String::new();
    match ensure_node_containers(manager, registry, &mut diag).await {
        Ok(()) => {
            info!(containers = registry.names().len(), "node containers ensured");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "unable to ensure node containers running");
            Err(ProvisionError::cluster(
                format!("unable to ensure node containers running: {}", diag.trim_end()),
                e,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
agent:
  "":
    config:
      image: agent:1
      env: ["A=1"]
  prod:
    config:
      image: agent:2
      env: ["B=2"]
    host-config:
      privileged: true
only-pool:
  edge:
    config:
      image: edge:1
"#;

    #[test]
    fn names_and_pools_sorted() {
        let r = YamlNodeContainerRegistry::from_yaml(DOC).unwrap();
        assert_eq!(r.names(), vec!["agent", "only-pool"]);
        assert_eq!(r.pools_for("agent"), vec!["", "prod"]);
        assert!(r.pools_for("missing").is_empty());
    }

    #[test]
    fn load_overlays_pool_on_default() {
        let r = YamlNodeContainerRegistry::from_yaml(DOC).unwrap();
        let base = r.load("", "agent").unwrap();
        assert_eq!(base.image(), "agent:1");
        let prod = r.load("prod", "agent").unwrap();
        assert_eq!(prod.name, "agent");
        assert_eq!(prod.image(), "agent:2");
        assert_eq!(prod.config.env, vec!["A=1", "B=2"]);
        assert!(prod.host_config.privileged);
        // unknown pool falls back to the default definition
        assert_eq!(r.load("staging", "agent").unwrap().image(), "agent:1");
        assert_eq!(r.load("edge", "only-pool").unwrap().image(), "edge:1");
        assert!(r.load("", "only-pool").is_err());
        assert!(r.load("", "missing").is_err());
    }

    #[test]
    fn inserted_entries_overlay_like_parsed_ones() {
        let mut r = YamlNodeContainerRegistry::default();
        let base = NodeContainerConfig {
            name: "agent".into(),
            config: ContainerConfig { image: "agent:1".into(), env: vec!["A=1".into()], ..Default::default() },
            ..Default::default()
        };
        let gpu = NodeContainerConfig {
            name: "agent".into(),
            config: ContainerConfig { image: "agent:gpu".into(), ..Default::default() },
            ..Default::default()
        };
        r.insert("", base);
        r.insert("gpu", gpu);
        assert_eq!(r.pools_for("agent"), vec!["", "gpu"]);
        let loaded = r.load("gpu", "agent").unwrap();
        assert_eq!(loaded.image(), "agent:gpu");
        assert_eq!(loaded.config.env, vec!["A=1"]);
    }

    #[test]
    fn empty_document_is_empty_registry() {
        assert!(YamlNodeContainerRegistry::from_yaml("").unwrap().names().is_empty());
        assert!(YamlNodeContainerRegistry::from_yaml("agent: 3").is_err());
    }
}
