//! Drover kubehub: the cluster API seam used by both reconcilers.
//!
//! [`ClusterApi`] exposes only the calls the reconcilers need. A missing object
//! is `Ok(None)` (or `Ok(false)` for deletes) so callers can tell "not found"
//! apart from real failures without inspecting errors.

#![forbid(unsafe_code)]

use std::sync::Arc;

use drover_core::{ProvisionError, ProvisionResult, YamlConfig};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::{
    api::{Api, DeleteParams, PostParams},
    config::KubeConfigOptions,
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(any(test, feature = "mem"))]
pub mod mem;

pub const DEFAULT_NAMESPACE: &str = "drover-system";

#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    fn name(&self) -> &str;
    fn namespace(&self) -> &str;

    async fn get_daemon_set(&self, name: &str) -> ProvisionResult<Option<DaemonSet>>;
    async fn create_daemon_set(&self, ds: &DaemonSet) -> ProvisionResult<DaemonSet>;
    /// Unconditional replace of the stored object with `ds`.
    async fn update_daemon_set(&self, ds: &DaemonSet) -> ProvisionResult<DaemonSet>;

    async fn get_deployment(&self, name: &str) -> ProvisionResult<Option<Deployment>>;
    async fn create_deployment(&self, dep: &Deployment) -> ProvisionResult<Deployment>;
    async fn replace_deployment(&self, dep: &Deployment) -> ProvisionResult<Deployment>;
    /// Returns `false` when there was nothing to delete.
    async fn delete_deployment(&self, name: &str) -> ProvisionResult<bool>;
}

/// Enumerates the registered clusters.
#[async_trait::async_trait]
pub trait ClusterRegistry: Send + Sync {
    async fn clusters(&self) -> ProvisionResult<Vec<Arc<dyn ClusterApi>>>;
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

fn cluster_err(cluster: &str, context: String, e: kube::Error) -> ProvisionError {
    counter!("cluster_api_err", 1u64, "cluster" => cluster.to_string());
    ProvisionError::cluster(format!("{}: {}", cluster, context), e)
}

fn object_name<'a>(meta: &'a k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta, kind: &str) -> ProvisionResult<&'a str> {
    meta.name
        .as_deref()
        .ok_or_else(|| ProvisionError::cluster(format!("{} without name", kind), "metadata.name is required"))
}

/// One cluster reached through kube-rs.
pub struct KubeCluster {
    name: String,
    namespace: String,
    client: Client,
}

impl KubeCluster {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, client: Client) -> Self {
        Self { name: name.into(), namespace: namespace.into(), client }
    }

    fn daemon_sets(&self) -> Api<DaemonSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_daemon_set(&self, name: &str) -> ProvisionResult<Option<DaemonSet>> {
        debug!(cluster = %self.name, daemonset = %name, "get daemonset");
        self.daemon_sets()
            .get_opt(name)
            .await
            .map_err(|e| cluster_err(&self.name, format!("getting daemonset {}", name), e))
    }

    async fn create_daemon_set(&self, ds: &DaemonSet) -> ProvisionResult<DaemonSet> {
        let name = object_name(&ds.metadata, "daemonset")?;
        self.daemon_sets()
            .create(&PostParams::default(), ds)
            .await
            .map_err(|e| cluster_err(&self.name, format!("creating daemonset {}", name), e))
    }

    async fn update_daemon_set(&self, ds: &DaemonSet) -> ProvisionResult<DaemonSet> {
        let name = object_name(&ds.metadata, "daemonset")?;
        self.daemon_sets()
            .replace(name, &PostParams::default(), ds)
            .await
            .map_err(|e| cluster_err(&self.name, format!("updating daemonset {}", name), e))
    }

    async fn get_deployment(&self, name: &str) -> ProvisionResult<Option<Deployment>> {
        debug!(cluster = %self.name, deployment = %name, "get deployment");
        self.deployments()
            .get_opt(name)
            .await
            .map_err(|e| cluster_err(&self.name, format!("getting deployment {}", name), e))
    }

    async fn create_deployment(&self, dep: &Deployment) -> ProvisionResult<Deployment> {
        let name = object_name(&dep.metadata, "deployment")?;
        self.deployments()
            .create(&PostParams::default(), dep)
            .await
            .map_err(|e| cluster_err(&self.name, format!("creating deployment {}", name), e))
    }

    async fn replace_deployment(&self, dep: &Deployment) -> ProvisionResult<Deployment> {
        let name = object_name(&dep.metadata, "deployment")?;
        self.deployments()
            .replace(name, &PostParams::default(), dep)
            .await
            .map_err(|e| cluster_err(&self.name, format!("replacing deployment {}", name), e))
    }

    async fn delete_deployment(&self, name: &str) -> ProvisionResult<bool> {
        match self.deployments().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(cluster_err(&self.name, format!("deleting deployment {}", name), e)),
        }
    }
}

/// One entry of the `clusters` config section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterSpec {
    pub name: String,
    /// kubeconfig context; the current context when absent.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Registry backed by kubeconfig contexts listed in configuration.
pub struct KubeClusterRegistry {
    specs: Vec<ClusterSpec>,
}

impl KubeClusterRegistry {
    pub fn new(specs: Vec<ClusterSpec>) -> Self {
        Self { specs }
    }

    pub fn from_config(config: &YamlConfig) -> ProvisionResult<Self> {
        let specs: Vec<ClusterSpec> = config.section("clusters")?.unwrap_or_default();
        Ok(Self::new(specs))
    }

    pub fn specs(&self) -> &[ClusterSpec] {
        &self.specs
    }

    async fn connect(spec: &ClusterSpec) -> ProvisionResult<KubeCluster> {
        let client = match spec.context.as_deref() {
            Some(ctx) => {
                let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
                let cfg = kube::Config::from_kubeconfig(&opts)
                    .await
                    .map_err(|e| ProvisionError::cluster(format!("{}: loading kubeconfig context {}", spec.name, ctx), e))?;
                Client::try_from(cfg).map_err(|e| cluster_err(&spec.name, "building client".into(), e))?
            }
            None => Client::try_default().await.map_err(|e| cluster_err(&spec.name, "building default client".into(), e))?,
        };
        let namespace = spec.namespace.clone().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        info!(cluster = %spec.name, namespace = %namespace, "cluster client ready");
        Ok(KubeCluster::new(spec.name.clone(), namespace, client))
    }
}

#[async_trait::async_trait]
impl ClusterRegistry for KubeClusterRegistry {
    async fn clusters(&self) -> ProvisionResult<Vec<Arc<dyn ClusterApi>>> {
        let mut out: Vec<Arc<dyn ClusterApi>> = Vec::with_capacity(self.specs.len());
        for spec in self.specs.iter() {
            out.push(Arc::new(Self::connect(spec).await?));
        }
        Ok(out)
    }
}

/// Fixed list of already connected clusters.
pub struct StaticRegistry {
    clusters: Vec<Arc<dyn ClusterApi>>,
}

impl StaticRegistry {
    pub fn new(clusters: Vec<Arc<dyn ClusterApi>>) -> Self {
        Self { clusters }
    }
}

#[async_trait::async_trait]
impl ClusterRegistry for StaticRegistry {
    async fn clusters(&self) -> ProvisionResult<Vec<Arc<dyn ClusterApi>>> {
        Ok(self.clusters.clone())
    }
}

/// Pick a cluster by name, or the first registered one.
pub async fn select_cluster(registry: &dyn ClusterRegistry, name: Option<&str>) -> anyhow::Result<Arc<dyn ClusterApi>> {
    let clusters = registry.clusters().await?;
    let found = match name {
        Some(n) => clusters.into_iter().find(|c| c.name() == n),
        None => clusters.into_iter().next(),
    };
    found.ok_or_else(|| match name {
        Some(n) => anyhow::anyhow!("cluster {} is not registered", n),
        None => anyhow::anyhow!("no cluster registered"),
    })
}
