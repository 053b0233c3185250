//! Drover process deployment: `update-services -> update-image-in-db -> remove-old-services`.
//!
//! Processes are always visited in ascending name order, both when deploying
//! and when rolling back, so repeated runs touch services in the same order.

#![forbid(unsafe_code)]

use std::sync::Arc;

use drover_action::{Action, BwContext, FwContext, Pipeline, PipelineError, PipelineOutcome};
use drover_converge as converge;
use drover_core::{process_difference, Advisory, App, ImageMetadata, ProvisionError, ProvisionResult};
use drover_kubehub::ClusterApi;
use drover_persist::ImageStore;
use metrics::counter;
use tracing::{error, info};

pub const UPDATE_SERVICES: &str = "update-services";
pub const UPDATE_IMAGE_IN_DB: &str = "update-image-in-db";
pub const REMOVE_OLD_SERVICES: &str = "remove-old-services";

/// Shared, read-only input of one deploy run.
pub struct PipelineArgs {
    pub client: Arc<dyn ClusterApi>,
    pub store: Arc<dyn ImageStore>,
    pub app: App,
    pub new_image: String,
    pub new_img_data: ImageMetadata,
    /// Empty on first deploy.
    pub current_image: String,
    pub current_img_data: ImageMetadata,
}

/// What the operator asked to deploy, before the current state is looked up.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub app: App,
    pub image: String,
    pub metadata: ImageMetadata,
}

impl DeployRequest {
    pub fn new(app: App, image: impl Into<String>, metadata: ImageMetadata) -> Self {
        Self { app, image: image.into(), metadata }
    }

    /// Resolve the currently deployed image and record the new image's metadata.
    pub fn prepare(self, store: Arc<dyn ImageStore>, client: Arc<dyn ClusterApi>) -> ProvisionResult<PipelineArgs> {
        let current_image = store.current_app_image(&self.app.name).map_err(store_err)?.unwrap_or_default();
        let current_img_data = if current_image.is_empty() {
            ImageMetadata::default()
        } else {
            store.image_metadata(&current_image).map_err(store_err)?.ok_or_else(|| {
                error!(app = %self.app.name, image = %current_image, "no metadata for current image");
                ProvisionError::Store(format!("image metadata for {} not found", current_image))
            })?
        };
        store.save_image_metadata(&self.image, &self.metadata).map_err(store_err)?;
        Ok(PipelineArgs {
            client,
            store,
            app: self.app,
            new_image: self.image,
            new_img_data: self.metadata,
            current_image,
            current_img_data,
        })
    }
}

fn store_err(e: anyhow::Error) -> ProvisionError {
    ProvisionError::Store(format!("{:#}", e))
}

/// Undo this run's deploys: restore processes the current image declares,
/// remove the ones it does not. Failures become advisories.
pub async fn rollback_added_processes(args: &PipelineArgs, processes: &[String], advisories: &mut Vec<Advisory>) {
    let mut ordered: Vec<&String> = processes.iter().collect();
    ordered.sort();
    for process in ordered {
        let client = args.client.as_ref();
        let res = if args.current_img_data.has_process(process) {
            converge::deploy(client, &args.app, process, &args.current_image, &args.current_img_data)
                .await
                .map(|_| ())
        } else {
            converge::remove_service(client, &args.app, process).await
        };
        if let Err(e) = res {
            counter!("deploy_rollback_err", 1u64);
            error!(app = %args.app.name, process = %process, error = %e, "error rolling back updated service");
            advisories.push(Advisory::new(format!("{}/{}", UPDATE_SERVICES, process), &e));
        }
    }
}

pub struct UpdateServices;

#[async_trait::async_trait]
impl Action<PipelineArgs, Vec<String>, ProvisionError> for UpdateServices {
    fn name(&self) -> &'static str {
        UPDATE_SERVICES
    }

    async fn forward(&self, ctx: FwContext<'_, PipelineArgs, Vec<String>>) -> ProvisionResult<Vec<String>> {
        let args = ctx.args;
        let mut deployed = Vec::new();
        for process in args.new_img_data.process_names() {
            let res = converge::deploy(args.client.as_ref(), &args.app, &process, &args.new_image, &args.new_img_data).await;
            if let Err(e) = res {
                rollback_added_processes(args, &deployed, ctx.advisories).await;
                return Err(e);
            }
            deployed.push(process);
        }
        Ok(deployed)
    }

    async fn backward(&self, ctx: BwContext<'_, PipelineArgs, Vec<String>>) -> ProvisionResult<()> {
        rollback_added_processes(ctx.args, ctx.fw_result, ctx.advisories).await;
        Ok(())
    }
}

/// Irreversible: a later failure leaves the history entry in place.
pub struct UpdateImageInDb;

#[async_trait::async_trait]
impl Action<PipelineArgs, Vec<String>, ProvisionError> for UpdateImageInDb {
    fn name(&self) -> &'static str {
        UPDATE_IMAGE_IN_DB
    }

    async fn forward(&self, ctx: FwContext<'_, PipelineArgs, Vec<String>>) -> ProvisionResult<Vec<String>> {
        let args = ctx.args;
        args.store.append_app_image_name(&args.app.name, &args.new_image).map_err(store_err)?;
        Ok(ctx.previous.cloned().unwrap_or_default())
    }
}

/// Removes services of processes the new image dropped. Never fails.
pub struct RemoveOldServices;

#[async_trait::async_trait]
impl Action<PipelineArgs, Vec<String>, ProvisionError> for RemoveOldServices {
    fn name(&self) -> &'static str {
        REMOVE_OLD_SERVICES
    }

    async fn forward(&self, ctx: FwContext<'_, PipelineArgs, Vec<String>>) -> ProvisionResult<Vec<String>> {
        let args = ctx.args;
        for process in process_difference(&args.current_img_data, &args.new_img_data) {
            if let Err(e) = converge::remove_service(args.client.as_ref(), &args.app, &process).await {
                counter!("deploy_remove_old_err", 1u64);
                error!(app = %args.app.name, process = %process, error = %e, "ignored error removing unwanted service");
                ctx.advisories.push(Advisory::new(format!("{}/{}", REMOVE_OLD_SERVICES, process), &e));
            }
        }
        Ok(ctx.previous.cloned().unwrap_or_default())
    }
}

pub fn deploy_pipeline() -> Pipeline<PipelineArgs, Vec<String>, ProvisionError> {
    Pipeline::default().push(UpdateServices).push(UpdateImageInDb).push(RemoveOldServices)
}

/// Deploy `args.new_image`; the outcome carries the deployed process names.
pub async fn deploy_image(
    args: &PipelineArgs,
) -> Result<PipelineOutcome<Vec<String>>, PipelineError<ProvisionError>> {
    info!(app = %args.app.name, image = %args.new_image, current = %args.current_image, "deploying image");
    let res = deploy_pipeline().execute(args).await;
    match &res {
        Ok(out) => {
            counter!("deploy_total", 1u64, "outcome" => "ok");
            info!(app = %args.app.name, image = %args.new_image, advisories = out.advisories.len(), "image deployed");
        }
        Err(e) => {
            counter!("deploy_total", 1u64, "outcome" => "err");
            error!(app = %args.app.name, image = %args.new_image, action = e.action, error = %e.cause, "deploy failed");
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::ProcessSpec;
    use drover_kubehub::mem::MemCluster;
    use drover_persist::MemImageStore;
    use std::collections::BTreeMap;

    fn meta(names: &[&str]) -> ImageMetadata {
        ImageMetadata::new(
            names.iter().map(|n| (n.to_string(), ProcessSpec { command: format!("./{}", n) })).collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn pipeline_order() {
        assert_eq!(deploy_pipeline().names(), vec![UPDATE_SERVICES, UPDATE_IMAGE_IN_DB, REMOVE_OLD_SERVICES]);
    }

    #[test]
    fn prepare_reads_current_and_saves_new() {
        let store = Arc::new(MemImageStore::new());
        store.append_app_image_name("myapp", "myapp:v1").unwrap();
        store.save_image_metadata("myapp:v1", &meta(&["web"])).unwrap();
        let client: Arc<dyn ClusterApi> = Arc::new(MemCluster::new("c", "ns"));
        let args = DeployRequest::new(App::new("myapp", ""), "myapp:v2", meta(&["web", "worker"]))
            .prepare(store.clone(), client)
            .unwrap();
        assert_eq!(args.current_image, "myapp:v1");
        assert_eq!(args.current_img_data, meta(&["web"]));
        assert_eq!(store.image_metadata("myapp:v2").unwrap(), Some(meta(&["web", "worker"])));
        // history is only written by the pipeline
        assert_eq!(store.app_images("myapp").unwrap(), vec!["myapp:v1"]);
    }

    #[test]
    fn prepare_fails_without_current_metadata() {
        let store = Arc::new(MemImageStore::new());
        store.append_app_image_name("myapp", "myapp:v1").unwrap();
        let client: Arc<dyn ClusterApi> = Arc::new(MemCluster::new("c", "ns"));
        let err = DeployRequest::new(App::new("myapp", ""), "myapp:v2", meta(&["web"]))
            .prepare(store.clone(), client)
            .err()
            .unwrap();
        assert!(matches!(err, ProvisionError::Store(ref m) if m.contains("myapp:v1")));
        // nothing recorded for the new image either
        assert_eq!(store.image_metadata("myapp:v2").unwrap(), None);
    }

    #[test]
    fn prepare_on_first_deploy() {
        let store: Arc<dyn ImageStore> = Arc::new(MemImageStore::new());
        let client: Arc<dyn ClusterApi> = Arc::new(MemCluster::new("c", "ns"));
        let args = DeployRequest::new(App::new("fresh", ""), "fresh:v1", meta(&["web"])).prepare(store, client).unwrap();
        assert!(args.current_image.is_empty());
        assert!(args.current_img_data.processes.is_empty());
    }
}
