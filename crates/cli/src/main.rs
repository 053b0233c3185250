use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use drover_core::{App, Container, ImageMetadata, PoolFilter, YamlConfig};
use drover_deploy::{deploy_image, DeployRequest};
use drover_kubehub::{select_cluster, ClusterRegistry, KubeClusterRegistry};
use drover_nodecontainer::{
    ensure_node_containers_running, NodeContainerManager, NodeContainerRegistry, YamlNodeContainerRegistry,
};
use drover_persist::{ImageStore, SqliteImageStore};
use drover_runtime::{ContainerRuntime, ProcessRunner};
use metrics::describe_counter;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "droverctl", version, about = "Drover deployment and node-container reconciler")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// YAML configuration file
    #[arg(long = "config", env = "DROVER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Image store database (default: ~/.drover/drover.db)
    #[arg(long = "db", env = "DROVER_DB_PATH", global = true)]
    db: Option<String>,

    /// Raise drover's log level (-v debug, -vv trace); ignored when DROVER_LOG is set
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy an image: converge services, record history, drop stale processes
    Deploy {
        #[arg(long = "app")]
        app: String,
        #[arg(long = "pool", default_value = "")]
        pool: String,
        #[arg(long = "image")]
        image: String,
        /// YAML file with the image's `processes`
        #[arg(long = "metadata")]
        metadata: PathBuf,
        /// Target cluster (default: first registered)
        #[arg(long = "cluster")]
        cluster: Option<String>,
    },
    /// Show an app's image history, oldest first
    Images {
        #[arg(long = "app")]
        app: String,
    },
    /// Reconcile node-level system daemons
    #[command(name = "node-containers", subcommand)]
    NodeContainers(NodeContainerCmd),
    /// Drive the container runtime directly
    #[command(subcommand)]
    Container(ContainerCmd),
}

#[derive(Subcommand, Debug)]
enum NodeContainerCmd {
    /// Deploy every registered node container to every pool
    Ensure {
        #[arg(long = "registry")]
        registry: PathBuf,
    },
    /// Deploy one node container to one pool
    Deploy {
        name: String,
        #[arg(long = "pool", default_value = "")]
        pool: String,
        /// Only rewrite affinity/annotations of an existing daemon
        #[arg(long = "placement-only", action = ArgAction::SetTrue)]
        placement_only: bool,
        #[arg(long = "registry")]
        registry: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ContainerCmd {
    Create {
        #[arg(long = "name", default_value = "")]
        name: String,
    },
    Stop { id: String },
    Destroy { id: String },
    Ip { id: String },
    Commit { id: String, image: String },
}

const DROVER_TARGETS: [&str; 7] = [
    "droverctl",
    "drover_action",
    "drover_converge",
    "drover_deploy",
    "drover_kubehub",
    "drover_nodecontainer",
    "drover_runtime",
];

/// Drover's own crates at `info` (or louder with -v), everything else at `warn`.
fn log_filter(verbose: u8) -> String {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut filter = String::from("warn");
    for target in DROVER_TARGETS {
        filter.push_str(&format!(",{}={}", target, level));
    }
    filter
}

fn init_tracing(verbose: u8) {
    let default = log_filter(verbose);
    let env = std::env::var("DROVER_LOG").unwrap_or_else(|_| default.clone());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn describe_metrics() {
    describe_counter!("deploy_total", "Deploy pipeline runs by outcome");
    describe_counter!("deploy_rollback_err", "Services that could not be restored or removed during rollback");
    describe_counter!("deploy_remove_old_err", "Stale services that could not be removed");
    describe_counter!("service_deploy_total", "Service convergence results by change");
    describe_counter!("node_container_reconcile_total", "Node-container daemons reconciled");
    describe_counter!("node_container_reconcile_err", "Node-container reconciliations that failed on a cluster");
    describe_counter!("cluster_api_err", "Cluster API calls that failed");
    describe_counter!("runtime_cmd_err", "Container runtime commands that failed");
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DROVER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => {
                    describe_metrics();
                    tracing::info!(addr = %addr, "Prometheus metrics exporter listening")
                }
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DROVER_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<YamlConfig> {
    match path {
        Some(p) => Ok(YamlConfig::from_file(p)?),
        None => Ok(YamlConfig::default()),
    }
}

fn open_store(db: Option<&str>) -> Result<Arc<dyn ImageStore>> {
    let store = match db {
        Some(path) => SqliteImageStore::open(path)?,
        None => SqliteImageStore::open_default()?,
    };
    Ok(Arc::new(store))
}

fn read_metadata(path: &Path) -> Result<ImageMetadata> {
    let doc = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&doc).with_context(|| format!("parsing image metadata {}", path.display()))
}

fn cluster_registry(config: &YamlConfig) -> Result<Arc<dyn ClusterRegistry>> {
    Ok(Arc::new(KubeClusterRegistry::from_config(config)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    init_metrics();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Deploy { app, pool, image, metadata, cluster } => {
            info!(app = %app, image = %image, "deploy invoked");
            let meta = read_metadata(&metadata)?;
            let store = open_store(cli.db.as_deref())?;
            let registry = cluster_registry(&config)?;
            let client = select_cluster(registry.as_ref(), cluster.as_deref()).await?;
            let args = DeployRequest::new(App::new(app.clone(), pool), image.clone(), meta)
                .prepare(store, client)
                .context("preparing deploy")?;
            match deploy_image(&args).await {
                Ok(out) => {
                    let processes = out.result.unwrap_or_default();
                    match cli.output {
                        Output::Human => {
                            println!("deployed {} to {}: {}", image, app, processes.join(", "));
                            for a in out.advisories.iter() {
                                println!("warning: {}", a);
                            }
                        }
                        Output::Json => println!(
                            "{}",
                            serde_json::to_string_pretty(&serde_json::json!({
                                "app": app,
                                "image": image,
                                "processes": processes,
                                "advisories": out.advisories,
                            }))?
                        ),
                    }
                }
                Err(e) => {
                    for a in e.advisories.iter() {
                        eprintln!("warning: {}", a);
                    }
                    error!(action = e.action, error = %e.cause, "deploy failed");
                    return Err(anyhow::Error::new(e).context(format!("deploying {} to {}", image, app)));
                }
            }
        }
        Commands::Images { app } => {
            let store = open_store(cli.db.as_deref())?;
            let images = store.app_images(&app)?;
            match cli.output {
                Output::Human => {
                    for (i, img) in images.iter().enumerate() {
                        let marker = if i + 1 == images.len() { " (current)" } else { "" };
                        println!("{}{}", img, marker);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&images)?),
            }
        }
        Commands::NodeContainers(cmd) => {
            let manager = NodeContainerManager::new(cluster_registry(&config)?);
            match cmd {
                NodeContainerCmd::Ensure { registry } => {
                    let reg = YamlNodeContainerRegistry::from_file(&registry)?;
                    ensure_node_containers_running(&manager, &reg).await?;
                    println!("node containers ensured: {}", reg.names().join(", "));
                }
                NodeContainerCmd::Deploy { name, pool, placement_only, registry } => {
                    let reg = YamlNodeContainerRegistry::from_file(&registry)?;
                    let nc = reg.load(&pool, &name)?;
                    let filter = if pool.is_empty() {
                        let specific: Vec<String> = reg.pools_for(&name).into_iter().filter(|p| !p.is_empty()).collect();
                        PoolFilter::exclude(specific)
                    } else {
                        PoolFilter::include([pool.clone()])
                    };
                    manager
                        .deploy_node_container(&nc, &pool, &filter, placement_only)
                        .await
                        .with_context(|| format!("deploying node container {}", name))?;
                    println!("node container {} reconciled", drover_nodecontainer::daemon_set_name(&name, &pool));
                }
            }
        }
        Commands::Container(cmd) => {
            let rt = ContainerRuntime::new(Arc::new(config), Arc::new(ProcessRunner));
            let by_id = |id: &str| Container { name: id.to_string(), instance_id: id.to_string() };
            match cmd {
                ContainerCmd::Create { name } => {
                    let c = rt.create(&name).await?;
                    match cli.output {
                        Output::Human => println!("{}", c.instance_id),
                        Output::Json => println!("{}", serde_json::to_string_pretty(&c)?),
                    }
                }
                ContainerCmd::Stop { id } => rt.stop(&by_id(&id)).await?,
                ContainerCmd::Destroy { id } => rt.destroy(&by_id(&id)).await?,
                ContainerCmd::Ip { id } => println!("{}", rt.ip(&by_id(&id)).await?),
                ContainerCmd::Commit { id, image } => println!("{}", rt.commit(&by_id(&id), &image).await?),
            }
        }
    }
    Ok(())
}
