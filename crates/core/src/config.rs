//! Dotted-key configuration lookups.
//!
//! `YamlConfig` reads a YAML document and lets environment variables override
//! individual keys: `docker.registry-user` is read from `DROVER_DOCKER_REGISTRY_USER`
//! (with the default prefix). List values taken from the environment are comma separated.

use serde::de::DeserializeOwned;
use serde_yaml::Value as Yaml;

use crate::error::{ProvisionError, ProvisionResult};

pub const DEFAULT_ENV_PREFIX: &str = "DROVER";

/// Read-only key lookups. A missing key is a `Configuration` error.
pub trait ConfigSource: Send + Sync {
    fn get_string(&self, key: &str) -> ProvisionResult<String>;
    fn get_list(&self, key: &str) -> ProvisionResult<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct YamlConfig {
    root: Yaml,
    env_prefix: Option<String>,
}

impl Default for YamlConfig {
    fn default() -> Self {
        Self { root: Yaml::Null, env_prefix: Some(DEFAULT_ENV_PREFIX.to_string()) }
    }
}

impl YamlConfig {
    pub fn from_yaml(doc: &str) -> ProvisionResult<Self> {
        let root: Yaml = serde_yaml::from_str(doc)
            .map_err(|e| ProvisionError::Configuration(format!("parsing config: {}", e)))?;
        Ok(Self { root, ..Self::default() })
    }

    pub fn from_file(path: &std::path::Path) -> ProvisionResult<Self> {
        let doc = std::fs::read_to_string(path)
            .map_err(|e| ProvisionError::Configuration(format!("reading {}: {}", path.display(), e)))?;
        Self::from_yaml(&doc)
    }

    /// Replace the env override prefix; `None` disables env overrides.
    pub fn with_env_prefix(mut self, prefix: Option<&str>) -> Self {
        self.env_prefix = prefix.map(|p| p.to_string());
        self
    }

    /// Deserialize a whole subtree, e.g. the `clusters` section.
    pub fn section<T: DeserializeOwned>(&self, key: &str) -> ProvisionResult<Option<T>> {
        match self.lookup(key) {
            None => Ok(None),
            Some(v) => serde_yaml::from_value(v.clone())
                .map(Some)
                .map_err(|e| ProvisionError::Configuration(format!("invalid section {}: {}", key, e))),
        }
    }

    fn env_name(&self, key: &str) -> Option<String> {
        let prefix = self.env_prefix.as_deref()?;
        let tail: String = key
            .chars()
            .map(|c| if c == '.' || c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        Some(format!("{}_{}", prefix, tail))
    }

    fn env_value(&self, key: &str) -> Option<String> {
        self.env_name(key).and_then(|n| std::env::var(n).ok())
    }

    fn lookup(&self, key: &str) -> Option<&Yaml> {
        let mut cur = &self.root;
        for segment in key.split('.') {
            cur = cur.as_mapping()?.get(segment)?;
        }
        if cur.is_null() { None } else { Some(cur) }
    }
}

fn scalar_string(v: &Yaml) -> Option<String> {
    match v {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Number(n) => Some(n.to_string()),
        Yaml::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn missing(key: &str) -> ProvisionError {
    ProvisionError::Configuration(format!("key {:?} not found", key))
}

impl ConfigSource for YamlConfig {
    fn get_string(&self, key: &str) -> ProvisionResult<String> {
        if let Some(v) = self.env_value(key) {
            return Ok(v);
        }
        let v = self.lookup(key).ok_or_else(|| missing(key))?;
        scalar_string(v).ok_or_else(|| ProvisionError::Configuration(format!("key {:?} is not a string", key)))
    }

    fn get_list(&self, key: &str) -> ProvisionResult<Vec<String>> {
        if let Some(v) = self.env_value(key) {
            return Ok(v.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()).map(|s| s.to_string()).collect());
        }
        let v = self.lookup(key).ok_or_else(|| missing(key))?;
        let seq = v
            .as_sequence()
            .ok_or_else(|| ProvisionError::Configuration(format!("key {:?} is not a list", key)))?;
        seq.iter()
            .map(|item| {
                scalar_string(item)
                    .ok_or_else(|| ProvisionError::Configuration(format!("key {:?} has a non-scalar item", key)))
            })
            .collect()
    }
}
