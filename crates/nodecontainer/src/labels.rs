//! Labels stamped on node-container daemons and the subset used as selector.

use std::collections::BTreeMap;

use smallvec::SmallVec;

pub const LABEL_PREFIX: &str = "drover.io/";
pub const PROVISIONER: &str = "kubernetes";

const IS_DROVER: &str = "is-drover";
const IS_NODE_CONTAINER: &str = "is-node-container";
const PROVISIONER_KEY: &str = "provisioner";
const NODE_CONTAINER_NAME: &str = "node-container-name";
const NODE_CONTAINER_POOL: &str = "node-container-pool";

#[derive(Debug, Clone)]
pub struct NodeContainerLabels<'a> {
    pub name: &'a str,
    pub pool: &'a str,
    pub custom: &'a BTreeMap<String, String>,
}

impl<'a> NodeContainerLabels<'a> {
    pub fn new(name: &'a str, pool: &'a str, custom: &'a BTreeMap<String, String>) -> Self {
        Self { name, pool, custom }
    }

    fn selector_pairs(&self) -> SmallVec<[(&'static str, String); 5]> {
        let mut out: SmallVec<[(&'static str, String); 5]> = SmallVec::new();
        out.push((IS_NODE_CONTAINER, "true".to_string()));
        out.push((NODE_CONTAINER_NAME, self.name.to_string()));
        out.push((NODE_CONTAINER_POOL, self.pool.to_string()));
        out
    }

    /// Full pod label set. Custom labels never override the managed ones.
    pub fn to_labels(&self) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = self.custom.clone();
        let mut pairs = self.selector_pairs();
        pairs.push((IS_DROVER, "true".to_string()));
        pairs.push((PROVISIONER_KEY, PROVISIONER.to_string()));
        for (k, v) in pairs {
            out.insert(format!("{}{}", LABEL_PREFIX, k), v);
        }
        out
    }

    pub fn to_selector(&self) -> BTreeMap<String, String> {
        self.selector_pairs().into_iter().map(|(k, v)| (format!("{}{}", LABEL_PREFIX, k), v)).collect()
    }
}
