//! Container supervision.
//!
//! The daemon keeps two containers alive:
//! - `redis`, the shared state store, started before anything else;
//! - `platform`, the application service, healed in the background.
//!
//! Healing is a poll loop per container: if the container is not running and
//! not disabled by the operator, remove the remains and start it fresh. The
//! platform pass also retires the image of the previous version.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{Config, NodeConfig, NodeState};
use crate::runtime::ContainerRuntime;
use crate::store::StateStore;

pub const REDIS_CONTAINER: &str = "redis";
pub const PLATFORM_CONTAINER: &str = "platform";
pub const SRS_CONTAINER: &str = "srs-server";
pub const SRS_DEV_CONTAINER: &str = "srs-dev";

/// Image GC label for this daemon itself, which runs outside docker.
pub const MGMT_LABEL: &str = "mgmt";

const HEAL_INTERVAL: Duration = Duration::from_secs(10);
const HEAL_BACKOFF: Duration = Duration::from_secs(30);
const READY_POLL: Duration = Duration::from_millis(300);

/// Containers the healing loops manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Managed {
    Redis,
    Platform,
}

impl Managed {
    pub fn name(&self) -> &'static str {
        match self {
            Managed::Redis => REDIS_CONTAINER,
            Managed::Platform => PLATFORM_CONTAINER,
        }
    }
}

/// `docker run` argument vector for the redis container.
///
/// The container joins the `srs-cloud` network except on darwin, where
/// docker networks cannot reach the host and ports are published instead.
pub fn redis_run_args(node: &NodeConfig, work_dir: &Path, port: u16, password: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "run",
        "-d",
        "--restart=always",
        "--privileged",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push(format!("--name={REDIS_CONTAINER}"));
    args.push("--env".to_string());
    args.push(format!("SRS_REGION={}", node.region));
    args.push("--env".to_string());
    args.push(format!("SRS_SOURCE={}", node.source));
    args.push("--log-driver=json-file".to_string());
    args.push("--log-opt=max-size=1g".to_string());
    args.push("--log-opt=max-file=3".to_string());
    args.push("-v".to_string());
    args.push(format!("{}/containers/data/redis:/data", work_dir.display()));
    args.push("-v".to_string());
    args.push(format!(
        "{}/containers/conf/redis.conf:/etc/redis/redis.conf",
        work_dir.display()
    ));
    args.push("-p".to_string());
    args.push(format!("{port}:{port}/tcp"));

    if !node.is_darwin {
        args.push("--network=srs-cloud".to_string());
    }

    args.push(format!("{}/ossrs/redis", node.registry));
    args.push("redis-server".to_string());
    args.push("/etc/redis/redis.conf".to_string());
    if !password.is_empty() {
        args.push("--requirepass".to_string());
        args.push(password.to_string());
    }
    args.push("--port".to_string());
    args.push(port.to_string());

    args
}

/// `docker run` argument vector for the platform container.
///
/// The env file and the containers tree are mounted at the paths the platform
/// expects, and `mgmt.srs.local` resolves to this node so the platform can
/// call back into the exec endpoint.
pub fn platform_run_args(node: &NodeConfig, work_dir: &Path, version: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "run",
        "-d",
        "--restart=always",
        "--privileged",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push(format!("--name={PLATFORM_CONTAINER}"));
    args.push("--env".to_string());
    args.push(format!("SRS_REGION={}", node.region));
    args.push("--env".to_string());
    args.push(format!("SRS_SOURCE={}", node.source));
    args.push("--log-driver=json-file".to_string());
    args.push("--log-opt=max-size=1g".to_string());
    args.push("--log-opt=max-file=3".to_string());
    args.push("-v".to_string());
    args.push(format!(
        "{}/.env:/usr/local/srs-cloud/mgmt/.env",
        work_dir.display()
    ));
    args.push("-v".to_string());
    args.push(format!(
        "{}/containers:/usr/local/srs-cloud/mgmt/containers",
        work_dir.display()
    ));
    args.push("--env".to_string());
    args.push(format!(
        "SRS_DOCKER={}",
        std::env::var("SRS_DOCKER").unwrap_or_default()
    ));
    args.push("--env".to_string());
    args.push(format!(
        "USE_DOCKER={}",
        std::env::var("USE_DOCKER").unwrap_or_default()
    ));
    args.push("--env".to_string());
    args.push(format!(
        "PLATFORM_DOCKER={}",
        std::env::var("PLATFORM_DOCKER").unwrap_or_default()
    ));
    // The platform always reaches redis over the network, never a socket.
    args.push("--env".to_string());
    args.push("NODE_ENV=production".to_string());
    args.push("-p".to_string());
    args.push("2024:2024/tcp".to_string());
    args.push("--add-host".to_string());
    args.push(format!("mgmt.srs.local:{}", node.ipv4));

    if !node.is_darwin {
        args.push("--network=srs-cloud".to_string());
    }
    args.push("--env".to_string());
    if node.is_darwin {
        args.push("REDIS_HOST=host.docker.internal".to_string());
    } else {
        args.push(format!("REDIS_HOST={REDIS_CONTAINER}"));
    }

    args.push(format!(
        "{}/ossrs/srs-cloud:platform-{}",
        node.registry, version
    ));

    args
}

/// Supervises the managed containers through the runtime interface.
///
/// The supervisor itself holds no store handle: redis must be running before
/// the store can connect, and only the healing pass needs state.
pub struct Supervisor {
    runtime: Arc<dyn ContainerRuntime>,
    node: NodeState,
    work_dir: PathBuf,
    redis_port: u16,
    redis_password: String,
    version: String,
}

impl Supervisor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, node: NodeState, config: &Config) -> Self {
        Self {
            runtime,
            node,
            work_dir: config.work_dir.clone(),
            redis_port: config.redis_port,
            redis_password: config.redis_password.clone(),
            version: crate::VERSION.to_string(),
        }
    }

    /// Remove whatever is left of a container, then run it fresh.
    async fn replace(&self, name: &str, args: Vec<String>) -> Result<()> {
        let query = self.runtime.query(name).await?;
        if let Some(all) = query.all {
            if let Err(e) = self.runtime.remove(name).await {
                warn!(container = name, id = %all.id, error = %e, "remove before start failed");
            }
        }
        self.runtime.start(name, &args).await
    }

    pub async fn start_redis(&self) -> Result<()> {
        let node = self.node.snapshot();
        let args = redis_run_args(&node, &self.work_dir, self.redis_port, &self.redis_password);
        self.replace(REDIS_CONTAINER, args).await
    }

    pub async fn start_platform(&self) -> Result<()> {
        let node = self.node.snapshot();
        let args = platform_run_args(&node, &self.work_dir, &self.version);
        self.replace(PLATFORM_CONTAINER, args).await
    }

    pub async fn stop_redis(&self, timeout: Duration) -> Result<()> {
        self.runtime.stop(REDIS_CONTAINER, timeout).await
    }

    pub async fn remove_platform(&self) -> Result<()> {
        self.runtime.remove(PLATFORM_CONTAINER).await
    }

    /// Poll until the container reports running, or the deadline passes.
    pub async fn wait_ready(&self, name: &str, deadline: Duration) -> Result<()> {
        let poll = async {
            loop {
                if let Ok(query) = self.runtime.query(name).await {
                    if query.is_running() {
                        return;
                    }
                }
                tokio::time::sleep(READY_POLL).await;
            }
        };

        tokio::time::timeout(deadline, poll)
            .await
            .map_err(|_| anyhow!("container {name} not ready within {deadline:?}"))?;
        info!(container = name, "container ready");
        Ok(())
    }

    /// One healing pass: running or disabled means nothing to do, otherwise
    /// restart. The platform pass also retires the previous image.
    pub async fn heal_once(&self, store: &dyn StateStore, which: Managed) -> Result<()> {
        let name = which.name();

        let query = self.runtime.query(name).await?;
        if query.is_running() {
            debug!(container = name, "container healthy");
            return Ok(());
        }

        if store.container_disabled(name).await? {
            debug!(container = name, "container disabled, skipping");
            return Ok(());
        }

        info!(container = name, "container not running, restarting");
        match which {
            Managed::Redis => self.start_redis().await?,
            Managed::Platform => {
                self.start_platform().await?;
                self.gc_platform_image(store).await?;
            }
        }

        Ok(())
    }

    /// Records the current platform image and removes the one it replaced.
    pub async fn gc_platform_image(&self, store: &dyn StateStore) -> Result<()> {
        let node = self.node.snapshot();
        let image = format!(
            "{}/ossrs/srs-cloud:platform-{}",
            node.registry, self.version
        );
        if let Some(previous) = store.record_image(PLATFORM_CONTAINER, &image).await? {
            self.runtime
                .remove_image(&previous)
                .await
                .with_context(|| format!("remove previous image {previous}"))?;
            info!(previous = %previous, "dropped previous platform image");
        }
        Ok(())
    }
}

/// Healing loop for one container, running until shutdown.
pub async fn run_healing_loop(
    supervisor: Arc<Supervisor>,
    store: Arc<dyn StateStore>,
    which: Managed,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(container = which.name(), "starting healing loop");

    let mut consecutive_failures: u32 = 0;
    loop {
        let delay = match supervisor.heal_once(store.as_ref(), which).await {
            Ok(()) => {
                consecutive_failures = 0;
                HEAL_INTERVAL
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures >= 3 {
                    error!(
                        container = which.name(),
                        error = %e,
                        consecutive_failures,
                        "healing keeps failing"
                    );
                } else {
                    warn!(container = which.name(), error = %e, "healing pass failed");
                }
                HEAL_BACKOFF
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(container = which.name(), "healing loop shutting down");
                    break;
                }
            }
        }
    }
}
