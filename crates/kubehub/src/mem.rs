//! In-memory cluster with a call log and failure injection.

use std::collections::BTreeMap;
use std::sync::Mutex;

use drover_core::{ProvisionError, ProvisionResult};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};

use crate::ClusterApi;

#[derive(Default)]
struct State {
    daemon_sets: BTreeMap<String, DaemonSet>,
    deployments: BTreeMap<String, Deployment>,
    calls: Vec<String>,
    /// `(op, object name)` -> message; name `*` matches any object.
    failures: BTreeMap<(String, String), String>,
}

pub struct MemCluster {
    name: String,
    namespace: String,
    state: Mutex<State>,
}

impl MemCluster {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into(), state: Mutex::new(State::default()) }
    }

    /// Make `op` (e.g. `create_deployment`) fail for `object` (or `*`).
    pub fn fail_on(&self, op: &str, object: &str, message: &str) {
        self.lock().failures.insert((op.to_string(), object.to_string()), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Calls as `op name`, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn daemon_set(&self, name: &str) -> Option<DaemonSet> {
        self.lock().daemon_sets.get(name).cloned()
    }

    pub fn insert_daemon_set(&self, ds: DaemonSet) {
        let name = ds.metadata.name.clone().unwrap_or_default();
        self.lock().daemon_sets.insert(name, ds);
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.lock().deployments.get(name).cloned()
    }

    pub fn deployment_names(&self) -> Vec<String> {
        self.lock().deployments.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, op: &str, object: &str) -> ProvisionResult<std::sync::MutexGuard<'_, State>> {
        let mut st = self.lock();
        st.calls.push(format!("{} {}", op, object));
        let hit = st
            .failures
            .get(&(op.to_string(), object.to_string()))
            .or_else(|| st.failures.get(&(op.to_string(), "*".to_string())))
            .cloned();
        match hit {
            Some(msg) => Err(ProvisionError::cluster(format!("{}: {} {}", self.name, op, object), msg)),
            None => Ok(st),
        }
    }

    fn not_found(&self, op: &str, object: &str) -> ProvisionError {
        ProvisionError::cluster(format!("{}: {} {}", self.name, op, object), "not found")
    }

    fn already_exists(&self, op: &str, object: &str) -> ProvisionError {
        ProvisionError::cluster(format!("{}: {} {}", self.name, op, object), "already exists")
    }
}

fn name_of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

#[async_trait::async_trait]
impl ClusterApi for MemCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_daemon_set(&self, name: &str) -> ProvisionResult<Option<DaemonSet>> {
        let st = self.record("get_daemon_set", name)?;
        Ok(st.daemon_sets.get(name).cloned())
    }

    async fn create_daemon_set(&self, ds: &DaemonSet) -> ProvisionResult<DaemonSet> {
        let name = name_of(&ds.metadata);
        let mut st = self.record("create_daemon_set", &name)?;
        if st.daemon_sets.contains_key(&name) {
            return Err(self.already_exists("create_daemon_set", &name));
        }
        st.daemon_sets.insert(name, ds.clone());
        Ok(ds.clone())
    }

    async fn update_daemon_set(&self, ds: &DaemonSet) -> ProvisionResult<DaemonSet> {
        let name = name_of(&ds.metadata);
        let mut st = self.record("update_daemon_set", &name)?;
        if !st.daemon_sets.contains_key(&name) {
            return Err(self.not_found("update_daemon_set", &name));
        }
        st.daemon_sets.insert(name, ds.clone());
        Ok(ds.clone())
    }

    async fn get_deployment(&self, name: &str) -> ProvisionResult<Option<Deployment>> {
        let st = self.record("get_deployment", name)?;
        Ok(st.deployments.get(name).cloned())
    }

    async fn create_deployment(&self, dep: &Deployment) -> ProvisionResult<Deployment> {
        let name = name_of(&dep.metadata);
        let mut st = self.record("create_deployment", &name)?;
        if st.deployments.contains_key(&name) {
            return Err(self.already_exists("create_deployment", &name));
        }
        st.deployments.insert(name, dep.clone());
        Ok(dep.clone())
    }

    async fn replace_deployment(&self, dep: &Deployment) -> ProvisionResult<Deployment> {
        let name = name_of(&dep.metadata);
        let mut st = self.record("replace_deployment", &name)?;
        if !st.deployments.contains_key(&name) {
            return Err(self.not_found("replace_deployment", &name));
        }
        st.deployments.insert(name, dep.clone());
        Ok(dep.clone())
    }

    async fn delete_deployment(&self, name: &str) -> ProvisionResult<bool> {
        let mut st = self.record("delete_deployment", name)?;
        Ok(st.deployments.remove(name).is_some())
    }
}
