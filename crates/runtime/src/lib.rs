//! Drover container lifecycle primitive.
//!
//! Drives one container runtime binary (docker-compatible CLI) through
//! create/start/stop/destroy/inspect/commit. The way commands are executed is a
//! [`CommandRunner`] injected at construction; [`ProcessRunner`] spawns real processes.

#![forbid(unsafe_code)]

use std::sync::Arc;

use drover_core::{ConfigSource, Container, ProvisionError, ProvisionResult};
use metrics::counter;
use tracing::{error, info};

/// Combined stdout+stderr of one runtime invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { success: true, output: output.into() }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self { success: false, output: output.into() }
    }
}

/// Runtime access capability.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Spawns the runtime binary as a child process and waits for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let out = tokio::process::Command::new(program).args(args).output().await?;
        let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(CommandOutput { success: out.status.success(), output: text })
    }
}

pub const KEY_BINARY: &str = "docker.binary";
pub const KEY_IMAGE: &str = "docker.image";
pub const KEY_CMD_BIN: &str = "docker.cmd.bin";
pub const KEY_CMD_ARGS: &str = "docker.cmd.args";
pub const KEY_REGISTRY_USER: &str = "docker.registry-user";

pub struct ContainerRuntime {
    config: Arc<dyn ConfigSource>,
    runner: Arc<dyn CommandRunner>,
}

impl ContainerRuntime {
    pub fn new(config: Arc<dyn ConfigSource>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    async fn run_cmd(&self, binary: &str, args: Vec<String>) -> ProvisionResult<String> {
        info!(cmd = %binary, args = ?args, "running the cmd");
        let op = args.first().cloned().unwrap_or_default();
        match self.runner.run(binary, &args).await {
            Ok(out) if out.success => Ok(out.output),
            Ok(out) => {
                counter!("runtime_cmd_err", 1u64, "op" => op.clone());
                Err(ProvisionError::RuntimeInvocation(format!("{} {} failed: {}", binary, op, out.output.trim())))
            }
            Err(e) => {
                counter!("runtime_cmd_err", 1u64, "op" => op.clone());
                Err(ProvisionError::RuntimeInvocation(format!("{} {}: {}", binary, op, e)))
            }
        }
    }

    /// Run a new detached container from the configured template image and command.
    pub async fn create(&self, name: &str) -> ProvisionResult<Container> {
        let binary = self.config.get_string(KEY_BINARY)?;
        let template = self.config.get_string(KEY_IMAGE)?;
        let cmd = self.config.get_string(KEY_CMD_BIN)?;
        let extra = self.config.get_list(KEY_CMD_ARGS)?;
        let mut args = vec!["run".to_string(), "-d".to_string(), template, cmd];
        args.extend(extra);
        let out = self.run_cmd(&binary, args).await?;
        let instance_id = out.replace('\n', "");
        info!(container = %name, instance_id = %instance_id, "container created");
        Ok(Container { name: name.to_string(), instance_id })
    }

    /// `run -d` already started the container.
    pub async fn start(&self, _container: &Container) -> ProvisionResult<()> {
        Ok(())
    }

    pub async fn stop(&self, container: &Container) -> ProvisionResult<()> {
        let binary = self.config.get_string(KEY_BINARY)?;
        info!(instance_id = %container.instance_id, "trying to stop instance");
        let out = self.run_cmd(&binary, vec!["stop".into(), container.instance_id.clone()]).await?;
        info!(output = %out.trim(), "stopped");
        Ok(())
    }

    /// Remove the container. Routes pointing at it are left to their owner.
    pub async fn destroy(&self, container: &Container) -> ProvisionResult<()> {
        let binary = self.config.get_string(KEY_BINARY)?;
        info!(instance_id = %container.instance_id, "trying to destroy instance");
        self.run_cmd(&binary, vec!["rm".into(), container.instance_id.clone()]).await?;
        Ok(())
    }

    pub async fn ip(&self, container: &Container) -> ProvisionResult<String> {
        let binary = self.config.get_string(KEY_BINARY)?;
        info!(instance_id = %container.instance_id, "getting ip address");
        let raw = self
            .run_cmd(&binary, vec!["inspect".into(), container.instance_id.clone()])
            .await
            .map_err(|e| {
                let msg = format!("error({}) trying to inspect instance({}) to get ip address", e, container.instance_id);
                error!("{}", msg);
                ProvisionError::RuntimeInvocation(msg)
            })?;
        let addr = ip_from_inspect(&raw)?;
        info!(instance_id = %container.instance_id, ip = %addr, "instance ip address");
        Ok(addr)
    }

    /// Commit the container as `<registry-user>/<image_name>` and return that tag.
    pub async fn commit(&self, container: &Container, image_name: &str) -> ProvisionResult<String> {
        let binary = self.config.get_string(KEY_BINARY)?;
        let registry_user = self.config.get_string(KEY_REGISTRY_USER)?;
        let tag = format!("{}/{}", registry_user, image_name);
        info!(instance_id = %container.instance_id, image = %tag, "attempting to commit image");
        if let Err(e) = self.run_cmd(&binary, vec!["commit".into(), container.instance_id.clone(), tag.clone()]).await {
            error!(error = %e, "could not commit image");
            return Err(e);
        }
        Ok(tag)
    }
}

/// Extract the network address from `inspect` output (an object, or the array form).
pub fn ip_from_inspect(raw: &str) -> ProvisionResult<String> {
    let parsed: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
        let msg = format!("error({}) parsing json when trying to get ip address", e);
        error!("{}", msg);
        ProvisionError::RuntimeInvocation(msg)
    })?;
    let obj = match parsed {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    let settings = obj.get("NetworkSettings").filter(|v| !v.is_null()).ok_or_else(|| {
        let msg = "error when getting container information: NetworkSettings is missing".to_string();
        error!("{}", msg);
        ProvisionError::RuntimeInvocation(msg)
    })?;
    let addr = ["IPAddress", "IpAddress"]
        .iter()
        .filter_map(|k| settings.get(*k).and_then(|v| v.as_str()))
        .find(|a| !a.is_empty())
        .unwrap_or_default();
    if addr.is_empty() {
        let msg = "error: can't get ip address".to_string();
        error!("{}", msg);
        return Err(ProvisionError::RuntimeInvocation(msg));
    }
    Ok(addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::YamlConfig;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<std::io::Result<CommandOutput>>>,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl Scripted {
        fn reply(self, r: std::io::Result<CommandOutput>) -> Self {
            self.replies.lock().unwrap().push_back(r);
            self
        }
        fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for Scripted {
        async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push((program.to_string(), args.to_vec()));
            self.replies.lock().unwrap().pop_front().unwrap_or_else(|| Ok(CommandOutput::ok("")))
        }
    }

    const CFG: &str = r#"
docker:
  binary: docker
  image: base/ubuntu
  registry-user: acme
  cmd:
    bin: /var/lib/start
    args: ["-p", "8888"]
"#;

    fn runtime(runner: Arc<Scripted>) -> ContainerRuntime {
        let cfg = YamlConfig::from_yaml(CFG).unwrap().with_env_prefix(None);
        ContainerRuntime::new(Arc::new(cfg), runner)
    }

    fn c() -> Container {
        Container { name: "app1".into(), instance_id: "abc123".into() }
    }

    #[tokio::test]
    async fn create_runs_template_and_strips_newline() {
        let r = Arc::new(Scripted::default().reply(Ok(CommandOutput::ok("abc123\n"))));
        let got = runtime(r.clone()).create("app1").await.unwrap();
        assert_eq!(got, c());
        let calls = r.calls();
        assert_eq!(calls[0].0, "docker");
        assert_eq!(calls[0].1, vec!["run", "-d", "base/ubuntu", "/var/lib/start", "-p", "8888"]);
    }

    #[tokio::test]
    async fn create_requires_configuration() {
        let cfg = YamlConfig::from_yaml("docker:\n  binary: docker\n").unwrap().with_env_prefix(None);
        let r = Arc::new(Scripted::default());
        let rt = ContainerRuntime::new(Arc::new(cfg), r.clone());
        assert!(matches!(rt.create("x").await, Err(ProvisionError::Configuration(_))));
        assert!(r.calls().is_empty());
    }

    #[tokio::test]
    async fn start_is_a_no_op() {
        let r = Arc::new(Scripted::default());
        runtime(r.clone()).start(&c()).await.unwrap();
        assert!(r.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_and_destroy_propagate_failures() {
        let r = Arc::new(
            Scripted::default()
                .reply(Ok(CommandOutput::ok("abc123\n")))
                .reply(Ok(CommandOutput::failed("No such container"))),
        );
        let rt = runtime(r.clone());
        rt.stop(&c()).await.unwrap();
        let err = rt.destroy(&c()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::RuntimeInvocation(ref m) if m.contains("No such container")));
        assert_eq!(r.calls()[0].1, vec!["stop", "abc123"]);
        assert_eq!(r.calls()[1].1, vec!["rm", "abc123"]);
    }

    #[tokio::test]
    async fn commit_tags_with_registry_user() {
        let r = Arc::new(Scripted::default());
        let tag = runtime(r.clone()).commit(&c(), "myimg").await.unwrap();
        assert_eq!(tag, "acme/myimg");
        assert_eq!(r.calls()[0].1, vec!["commit", "abc123", "acme/myimg"]);
    }

    #[tokio::test]
    async fn commit_without_registry_user_fails() {
        let cfg = YamlConfig::from_yaml("docker:\n  binary: docker\n").unwrap().with_env_prefix(None);
        let r = Arc::new(Scripted::default());
        let rt = ContainerRuntime::new(Arc::new(cfg), r.clone());
        assert!(matches!(rt.commit(&c(), "img").await, Err(ProvisionError::Configuration(_))));
        assert!(r.calls().is_empty());
    }

    #[tokio::test]
    async fn ip_reads_network_settings() {
        let r = Arc::new(Scripted::default().reply(Ok(CommandOutput::ok(r#"{"NetworkSettings":{"IpAddress":"10.10.10.10"}}"#))));
        assert_eq!(runtime(r).ip(&c()).await.unwrap(), "10.10.10.10");
        let r = Arc::new(Scripted::default().reply(Ok(CommandOutput::ok(r#"[{"NetworkSettings":{"IPAddress":"172.17.0.2"}}]"#))));
        assert_eq!(runtime(r).ip(&c()).await.unwrap(), "172.17.0.2");
    }

    #[test]
    fn empty_ip_address_falls_back_to_alternate_key() {
        let raw = r#"{"NetworkSettings":{"IPAddress":"","IpAddress":"10.0.0.7"}}"#;
        assert_eq!(ip_from_inspect(raw).unwrap(), "10.0.0.7");
        let both_empty = r#"{"NetworkSettings":{"IPAddress":"","IpAddress":""}}"#;
        assert!(ip_from_inspect(both_empty).is_err());
    }

    #[tokio::test]
    async fn ip_errors_for_each_failure_cause() {
        let unreachable = Arc::new(Scripted::default().reply(Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no docker"))));
        let malformed = Arc::new(Scripted::default().reply(Ok(CommandOutput::ok("{not json"))));
        let missing = Arc::new(Scripted::default().reply(Ok(CommandOutput::ok(r#"{"NetworkSettings":null}"#))));
        let empty = Arc::new(Scripted::default().reply(Ok(CommandOutput::ok(r#"{"NetworkSettings":{"IpAddress":""}}"#))));
        let mut messages = Vec::new();
        for r in [unreachable, malformed, missing, empty] {
            match runtime(r).ip(&c()).await {
                Err(ProvisionError::RuntimeInvocation(m)) => messages.push(m),
                other => panic!("expected runtime error, got {:?}", other),
            }
        }
        assert!(messages[0].contains("trying to inspect"));
        assert!(messages[1].contains("parsing json"));
        assert!(messages[2].contains("NetworkSettings is missing"));
        assert!(messages[3].contains("can't get ip address"));
    }
}
