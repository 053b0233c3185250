//! Drover service convergence: keep exactly one service per (app, process),
//! running the requested image.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use drover_core::{App, ImageMetadata, ProcessSpec, ProvisionError, ProvisionResult, LABEL_NODE_POOL};
use drover_kubehub::ClusterApi;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use metrics::counter;
use tracing::{debug, info};

pub const LABEL_APP: &str = "drover.io/app";
pub const LABEL_PROCESS: &str = "drover.io/process";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceChange {
    Created,
    Replaced,
    Unchanged,
}

pub fn service_name(app: &App, process: &str) -> String {
    format!("{}-{}", app.name, process)
}

fn selector_labels(app: &App, process: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), app.name.clone()),
        (LABEL_PROCESS.to_string(), process.to_string()),
    ])
}

/// Desired service object for one process of `app` running `image`.
pub fn build_service(app: &App, process: &str, image: &str, spec: &ProcessSpec, namespace: &str) -> Deployment {
    let name = service_name(app, process);
    let mut labels = selector_labels(app, process);
    labels.insert(LABEL_NODE_POOL.to_string(), app.pool.clone());
    let command = if spec.command.is_empty() {
        None
    } else {
        Some(vec!["/bin/sh".to_string(), "-c".to_string(), spec.command.clone()])
    };
    let node_selector = if app.pool.is_empty() {
        None
    } else {
        Some(BTreeMap::from([(LABEL_NODE_POOL.to_string(), app.pool.clone())]))
    };
    Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(selector_labels(app, process)), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    node_selector,
                    containers: vec![Container {
                        name: process.to_string(),
                        image: Some(image.to_string()),
                        command,
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Image the service currently runs, if it has one.
pub fn service_image(dep: &Deployment) -> Option<&str> {
    dep.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .as_deref()
}

fn convergence(process: &str) -> impl Fn(ProvisionError) -> ProvisionError + '_ {
    move |e| match e {
        ProvisionError::Convergence { .. } => e,
        other => ProvisionError::convergence(process, other),
    }
}

/// Make the service of `process` run `image`: create it when absent, replace it
/// wholesale when it runs another image, leave it alone otherwise.
pub async fn deploy(
    client: &dyn ClusterApi,
    app: &App,
    process: &str,
    image: &str,
    metadata: &ImageMetadata,
) -> ProvisionResult<ServiceChange> {
    let spec = metadata
        .process(process)
        .ok_or_else(|| ProvisionError::convergence(process, format!("image {} does not declare it", image)))?;
    let desired = build_service(app, process, image, spec, client.namespace());
    let name = service_name(app, process);
    let existing = client.get_deployment(&name).await.map_err(convergence(process))?;
    let change = match existing {
        None => {
            client.create_deployment(&desired).await.map_err(convergence(process))?;
            ServiceChange::Created
        }
        Some(current) if service_image(&current) == Some(image) => {
            debug!(app = %app.name, process = %process, image = %image, "service already up to date");
            ServiceChange::Unchanged
        }
        Some(current) => {
            let mut replacement = desired;
            replacement.metadata.resource_version = current.metadata.resource_version.clone();
            client.replace_deployment(&replacement).await.map_err(convergence(process))?;
            ServiceChange::Replaced
        }
    };
    counter!("service_deploy_total", 1u64, "change" => format!("{:?}", change));
    info!(app = %app.name, process = %process, image = %image, change = ?change, "service converged");
    Ok(change)
}

/// Delete the service of `process`; absence is not an error.
pub async fn remove_service(client: &dyn ClusterApi, app: &App, process: &str) -> ProvisionResult<()> {
    let name = service_name(app, process);
    let removed = client.delete_deployment(&name).await.map_err(convergence(process))?;
    if removed {
        counter!("service_remove_total", 1u64);
        info!(app = %app.name, process = %process, "service removed");
    } else {
        debug!(app = %app.name, process = %process, "no service to remove");
    }
    Ok(())
}
