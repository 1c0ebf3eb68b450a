//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts container lifecycle operations:
//! - Querying container state via `docker ps`
//! - Starting, stopping and force-removing containers
//! - Removing images after an upgrade
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

/// One row of `docker ps --format '{{json .}}'`, trimmed to the fields we
/// report. Unknown fields are dropped, absent ones default to empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(rename = "Image", default)]
    pub image: String,

    #[serde(rename = "Names", default)]
    pub names: String,

    #[serde(rename = "State", default)]
    pub state: String,

    #[serde(rename = "Status", default)]
    pub status: String,
}

/// Result of querying one container by name.
#[derive(Debug, Clone, Default)]
pub struct ContainerQuery {
    /// Matched regardless of state (`docker ps -a`).
    pub all: Option<ContainerInfo>,

    /// Matched among running containers only (`docker ps`).
    pub running: Option<ContainerInfo>,
}

impl ContainerQuery {
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Query a container by name, in any state and among running ones.
    async fn query(&self, name: &str) -> Result<ContainerQuery>;

    /// Start a detached container. `args` is the full `docker run` argument
    /// vector; `name` is carried separately for logging.
    async fn start(&self, name: &str, args: &[String]) -> Result<()>;

    /// Force-remove a container, running or not.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Stop a container, giving it `timeout` to exit before the kill.
    async fn stop(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Remove an image by tag.
    async fn remove_image(&self, image: &str) -> Result<()>;
}

/// Runtime backed by the `docker` CLI.
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    async fn run_docker(&self, args: &[String]) -> Result<String> {
        debug!(args = ?args, "exec docker");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawn docker {:?}", args))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "docker {:?} exited with {}: {}",
                args,
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ps(&self, name: &str, all: bool) -> Result<Option<ContainerInfo>> {
        let mut args = vec!["ps".to_string()];
        if all {
            args.push("-a".to_string());
        }
        args.push("-f".to_string());
        args.push(format!("name={name}"));
        args.push("--format".to_string());
        args.push("{{json .}}".to_string());

        let stdout = self.run_docker(&args).await?;
        Ok(parse_ps_output(&stdout))
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

/// Take the first parseable row. Docker on some hosts wraps each line in
/// quotes, so trim those before parsing; rows that still fail to parse are
/// ignored.
fn parse_ps_output(stdout: &str) -> Option<ContainerInfo> {
    for line in stdout.lines() {
        let line = line.trim().trim_matches(|c| c == '\'' || c == '"');
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ContainerInfo>(line) {
            Ok(info) => return Some(info),
            Err(e) => debug!(error = %e, "ignoring unparseable docker ps row"),
        }
    }
    None
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn query(&self, name: &str) -> Result<ContainerQuery> {
        let all = self.ps(name, true).await?;
        let running = self.ps(name, false).await?;
        Ok(ContainerQuery { all, running })
    }

    async fn start(&self, name: &str, args: &[String]) -> Result<()> {
        info!(container = %name, "starting container");
        self.run_docker(args).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        info!(container = %name, "force-removing container");
        self.run_docker(&["rm".to_string(), "-f".to_string(), name.to_string()])
            .await?;
        Ok(())
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        info!(container = %name, timeout_secs = timeout.as_secs(), "stopping container");
        self.run_docker(&[
            "stop".to_string(),
            "-t".to_string(),
            timeout.as_secs().to_string(),
            name.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        info!(image = %image, "removing image");
        self.run_docker(&["rmi".to_string(), image.to_string()])
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MockContainer {
    running: bool,
    image: String,
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    containers: Mutex<HashMap<String, MockContainer>>,

    /// Every operation applied, in order, as "op name".
    ops: Mutex<Vec<String>>,

    /// Whether starts should "fail".
    fail_starts: bool,
}

impl MockRuntime {
    /// Create a new mock runtime with no containers.
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            ops: Mutex::new(Vec::new()),
            fail_starts: false,
        }
    }

    /// Create a mock runtime that fails all starts.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Self::new()
        }
    }

    /// Seed a container in the running state.
    pub fn insert_running(&self, name: &str, image: &str) {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            MockContainer {
                running: true,
                image: image.to_string(),
            },
        );
    }

    /// Seed a container in the exited state.
    pub fn insert_stopped(&self, name: &str, image: &str) {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            MockContainer {
                running: false,
                image: image.to_string(),
            },
        );
    }

    /// All operations applied so far, in order.
    pub fn operations(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    /// How many times an operation ran against a container.
    pub fn count(&self, op: &str, name: &str) -> usize {
        let needle = format!("{op} {name}");
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| **entry == needle)
            .count()
    }

    fn record(&self, op: &str, name: &str) {
        self.ops.lock().unwrap().push(format!("{op} {name}"));
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn query(&self, name: &str) -> Result<ContainerQuery> {
        let containers = self.containers.lock().unwrap();
        let Some(container) = containers.get(name) else {
            return Ok(ContainerQuery::default());
        };

        let info = ContainerInfo {
            id: format!("mock-{name}"),
            image: container.image.clone(),
            names: name.to_string(),
            state: if container.running {
                "running".to_string()
            } else {
                "exited".to_string()
            },
            status: if container.running {
                "Up 5 seconds".to_string()
            } else {
                "Exited (0) 5 seconds ago".to_string()
            },
        };

        Ok(ContainerQuery {
            all: Some(info.clone()),
            running: container.running.then_some(info),
        })
    }

    async fn start(&self, name: &str, args: &[String]) -> Result<()> {
        self.record("start", name);
        if self.fail_starts {
            anyhow::bail!("mock runtime configured to fail");
        }

        debug!(container = %name, args = ?args, "[MOCK] starting container");
        let image = args.last().cloned().unwrap_or_default();
        self.insert_running(name, &image);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.record("remove", name);
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.record("stop", name);
        if let Some(container) = self.containers.lock().unwrap().get_mut(name) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.record("rmi", image);
        Ok(())
    }
}
