use std::collections::BTreeMap;
use std::sync::Arc;

use drover_converge::{service_image, service_name};
use drover_core::{Advisory, App, ImageMetadata, ProcessSpec, ProvisionError};
use drover_deploy::{deploy_image, rollback_added_processes, PipelineArgs, UPDATE_IMAGE_IN_DB, UPDATE_SERVICES};
use drover_kubehub::{mem::MemCluster, ClusterApi};
use drover_persist::{ImageStore, MemImageStore};

const OLD: &str = "myapp:v1";
const NEW: &str = "myapp:v2";

fn meta(names: &[&str]) -> ImageMetadata {
    ImageMetadata::new(
        names.iter().map(|n| (n.to_string(), ProcessSpec { command: format!("./{}", n) })).collect::<BTreeMap<_, _>>(),
    )
}

fn app() -> App {
    App::new("myapp", "prod")
}

struct Fixture {
    cluster: Arc<MemCluster>,
    store: Arc<MemImageStore>,
}

impl Fixture {
    /// Cluster already running `current` at OLD.
    async fn new(current: &[&str]) -> Self {
        let cluster = Arc::new(MemCluster::new("c1", "ns"));
        let store = Arc::new(MemImageStore::new());
        let current_meta = meta(current);
        for p in current {
            drover_converge::deploy(cluster.as_ref(), &app(), p, OLD, &current_meta).await.unwrap();
        }
        if !current.is_empty() {
            store.append_app_image_name("myapp", OLD).unwrap();
        }
        cluster.clear_calls();
        Self { cluster, store }
    }

    fn args(&self, current: &[&str], new: &[&str]) -> PipelineArgs {
        let client: Arc<dyn ClusterApi> = self.cluster.clone();
        let store: Arc<dyn ImageStore> = self.store.clone();
        PipelineArgs {
            client,
            store,
            app: app(),
            new_image: NEW.to_string(),
            new_img_data: meta(new),
            current_image: if current.is_empty() { String::new() } else { OLD.to_string() },
            current_img_data: meta(current),
        }
    }

    fn running(&self) -> BTreeMap<String, String> {
        self.cluster
            .deployment_names()
            .into_iter()
            .map(|n| {
                let img = self.cluster.deployment(&n).as_ref().and_then(service_image).unwrap_or_default().to_string();
                (n, img)
            })
            .collect()
    }
}

fn svc(p: &str) -> String {
    service_name(&app(), p)
}

#[tokio::test]
async fn scenario_a_adds_new_process() {
    let fx = Fixture::new(&["web"]).await;
    let out = deploy_image(&fx.args(&["web"], &["web", "worker"])).await.unwrap();
    assert_eq!(out.result, Some(vec!["web".to_string(), "worker".to_string()]));
    assert!(out.advisories.is_empty());
    assert_eq!(
        fx.running(),
        BTreeMap::from([(svc("web"), NEW.to_string()), (svc("worker"), NEW.to_string())])
    );
    assert!(!fx.cluster.calls().iter().any(|c| c.starts_with("delete_deployment")));
    assert_eq!(fx.store.current_app_image("myapp").unwrap().as_deref(), Some(NEW));
}

#[tokio::test]
async fn scenario_b_removes_dropped_process() {
    let fx = Fixture::new(&["web", "worker"]).await;
    let out = deploy_image(&fx.args(&["web", "worker"], &["web"])).await.unwrap();
    assert_eq!(out.result, Some(vec!["web".to_string()]));
    assert_eq!(fx.running(), BTreeMap::from([(svc("web"), NEW.to_string())]));
}

#[tokio::test]
async fn scenario_b_removal_failure_is_only_advisory() {
    let fx = Fixture::new(&["web", "worker"]).await;
    fx.cluster.fail_on("delete_deployment", &svc("worker"), "api timeout");
    let out = deploy_image(&fx.args(&["web", "worker"], &["web"])).await.unwrap();
    assert_eq!(out.advisories.len(), 1);
    assert_eq!(out.advisories[0].scope, "remove-old-services/worker");
    assert!(out.advisories[0].message.contains("api timeout"));
    assert_eq!(fx.store.current_app_image("myapp").unwrap().as_deref(), Some(NEW));
}

#[tokio::test]
async fn scenario_c_failure_rolls_back_and_skips_history() {
    let fx = Fixture::new(&["web"]).await;
    fx.cluster.fail_on("create_deployment", &svc("worker"), "quota exceeded");
    let err = deploy_image(&fx.args(&["web"], &["web", "worker"])).await.unwrap_err();
    assert_eq!(err.action, UPDATE_SERVICES);
    assert!(matches!(err.cause, ProvisionError::Convergence { ref process, .. } if process == "worker"));
    assert!(err.completed.is_empty());
    assert!(err.advisories.is_empty());
    assert_eq!(fx.running(), BTreeMap::from([(svc("web"), OLD.to_string())]));
    assert_eq!(fx.store.app_images("myapp").unwrap(), vec![OLD]);
}

#[tokio::test]
async fn kth_failure_restores_or_removes_earlier_processes() {
    let current = ["b", "d"];
    let new = ["a", "b", "c", "d", "e"];
    for k in 0..new.len() {
        let fx = Fixture::new(&current).await;
        let failing = new[k];
        fx.cluster.fail_on("create_deployment", &svc(failing), "boom");
        fx.cluster.fail_on("replace_deployment", &svc(failing), "boom");
        let err = deploy_image(&fx.args(&current, &new)).await.unwrap_err();
        assert!(matches!(err.cause, ProvisionError::Convergence { ref process, .. } if process == failing));

        // Nothing past the failing process was touched.
        for later in &new[k + 1..] {
            assert!(!fx.cluster.calls().iter().any(|c| c.ends_with(&svc(later))), "k={} touched {}", k, later);
        }
        // Earlier ones are back at the old image or gone; current ones stay at OLD.
        let expected: BTreeMap<_, _> = current.iter().map(|p| (svc(p), OLD.to_string())).collect();
        assert_eq!(fx.running(), expected, "k={}", k);
    }
}

#[tokio::test]
async fn later_step_failure_unwinds_update_services() {
    struct FailingStore(MemImageStore);
    impl ImageStore for FailingStore {
        fn append_app_image_name(&self, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
        fn app_images(&self, app: &str) -> anyhow::Result<Vec<String>> {
            self.0.app_images(app)
        }
        fn current_app_image(&self, app: &str) -> anyhow::Result<Option<String>> {
            self.0.current_app_image(app)
        }
        fn save_image_metadata(&self, image: &str, meta: &ImageMetadata) -> anyhow::Result<()> {
            self.0.save_image_metadata(image, meta)
        }
        fn image_metadata(&self, image: &str) -> anyhow::Result<Option<ImageMetadata>> {
            self.0.image_metadata(image)
        }
    }

    let fx = Fixture::new(&["web"]).await;
    let mut args = fx.args(&["web"], &["web", "worker"]);
    args.store = Arc::new(FailingStore(MemImageStore::new()));
    let err = deploy_image(&args).await.unwrap_err();
    assert_eq!(err.action, UPDATE_IMAGE_IN_DB);
    assert_eq!(err.completed, vec![UPDATE_SERVICES]);
    assert!(matches!(err.cause, ProvisionError::Store(ref m) if m.contains("disk full")));
    assert_eq!(fx.running(), BTreeMap::from([(svc("web"), OLD.to_string())]));
}

#[tokio::test]
async fn rollback_is_idempotent() {
    let fx = Fixture::new(&["web"]).await;
    let args = fx.args(&["web"], &["web", "worker"]);
    deploy_image(&args).await.unwrap();
    let deployed = vec!["web".to_string(), "worker".to_string()];

    let mut advisories: Vec<Advisory> = Vec::new();
    rollback_added_processes(&args, &deployed, &mut advisories).await;
    let once = fx.running();
    rollback_added_processes(&args, &deployed, &mut advisories).await;
    assert_eq!(fx.running(), once);
    assert!(advisories.is_empty());
    assert_eq!(once, BTreeMap::from([(svc("web"), OLD.to_string())]));
}

#[tokio::test]
async fn rollback_failures_surface_as_advisories() {
    let fx = Fixture::new(&["web"]).await;
    let args = fx.args(&["web"], &["web", "worker"]);
    drover_converge::deploy(fx.cluster.as_ref(), &app(), "web", NEW, &meta(&["web"])).await.unwrap();
    fx.cluster.fail_on("replace_deployment", &svc("web"), "restore refused");

    let mut advisories = Vec::new();
    rollback_added_processes(&args, &["web".to_string()], &mut advisories).await;
    assert_eq!(advisories.len(), 1);
    assert_eq!(advisories[0].scope, "update-services/web");
    assert!(advisories[0].message.contains("restore refused"));
}
