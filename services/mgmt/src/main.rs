//! SRS mgmt daemon.
//!
//! The daemon boots the node: it resolves the environment, restarts the
//! state store container, bootstraps shared state, starts the platform
//! container, then serves the HTTP API and gateway until SIGINT or SIGTERM.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use srs_mgmt::{
    api,
    config::{Config, NodeConfig, NodeState},
    discovery, envfile,
    gateway::proxy::ProxyClient,
    nginx::NginxReloader,
    release::ReleaseClient,
    runtime::{ContainerRuntime, DockerCli},
    state::{AppState, AppStateInner},
    store::{self, StateStore, Store},
    supervisor::{run_healing_loop, Managed, Supervisor, REDIS_CONTAINER},
    VERSION,
};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Scripts ask for the version without the leading v.
    if std::env::args().skip(1).any(|arg| arg == "-v" || arg == "--version") {
        println!("{}", VERSION.trim_start_matches('v'));
        return Ok(());
    }

    // Load .env, then fill the defaults child containers inherit
    envfile::apply(Path::new(".env")).context("load .env")?;
    set_env_default("REDIS_PORT", "6379");
    set_env_default("MGMT_LISTEN", "2022");

    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MGMT_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = VERSION, "Starting mgmt daemon");
    info!(
        listen_addr = %config.listen_addr,
        redis_port = config.redis_port,
        dev_mode = config.dev_mode,
        platform_secret_len = std::env::var("SRS_PLATFORM_SECRET").map(|v| v.len()).unwrap_or(0),
        redis_password_len = config.redis_password.len(),
        "Configuration loaded"
    );

    // Resolve the environment facts everything downstream depends on
    let probes = discovery::RegionProbes::default();
    let (cloud, region) = match discovery::resolve_region(&probes).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "Failed to discover region");
            return Err(e);
        }
    };
    let source = discovery::resolve_source(&cloud, &region);
    let registry = discovery::resolve_registry(&source);
    let platform = discovery::resolve_platform(&cloud, discovery::TENCENT_INSTANCE_NAME_URL).await;

    let mut initial = NodeConfig::new(cloud, region, source, registry);
    initial.platform = platform;
    info!(
        cloud = %initial.cloud,
        region = %initial.region,
        source = %initial.source,
        registry = %initial.registry,
        platform = %initial.platform,
        "Environment resolved"
    );
    let node = NodeState::new(initial);

    // Media and upload directories the containers mount
    for dir in ["dvr", "record", "vod", "upload", "vlive"] {
        let path = config.work_dir.join("containers/data").join(dir);
        std::fs::create_dir_all(&path).with_context(|| format!("create {}", path.display()))?;
    }

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the IPv4 refresh loop and wait out its first attempt, address
    // found or not, so the run args below carry whatever it learned
    let (first_ipv4_tx, first_ipv4_rx) = oneshot::channel();
    let ipv4_handle = tokio::spawn(discovery::run_ipv4_refresh(
        node.clone(),
        config.dev_mode,
        first_ipv4_tx,
        shutdown_rx.clone(),
    ));
    let _ = first_ipv4_rx.await;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new());
    let supervisor = Arc::new(Supervisor::new(runtime.clone(), node.clone(), &config));

    // Always restart redis so a changed password or port takes effect
    if let Err(e) = supervisor.stop_redis(Duration::from_secs(15)).await {
        info!(error = %e, "No redis container to stop");
    }
    if let Err(e) = supervisor.start_redis().await {
        error!(error = %e, "Failed to start redis");
        return Err(e);
    }
    if let Err(e) = supervisor
        .wait_ready(REDIS_CONTAINER, Duration::from_secs(30))
        .await
    {
        error!(error = %e, "Redis did not become ready");
        return Err(e);
    }

    // Connect to the state store
    let store: Arc<dyn StateStore> =
        match Store::connect(config.redis_port, &config.redis_password).await {
            Ok(store) => {
                info!("State store connected");
                Arc::new(store)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to the state store");
                return Err(e);
            }
        };

    let env_path = config.work_dir.join(".env");
    let snapshot = node.snapshot();
    let outcome =
        store::bootstrap(store.as_ref(), runtime.as_ref(), &snapshot, &env_path, VERSION).await?;

    // An operator-provisioned secret wins; otherwise export the stored one
    // so child processes inherit it
    let secret = match std::env::var("SRS_PLATFORM_SECRET") {
        Ok(value) if !value.is_empty() => value,
        _ => {
            std::env::set_var("SRS_PLATFORM_SECRET", &outcome.secret);
            outcome.secret.clone()
        }
    };
    info!(node_id = %outcome.node_id, secret_len = secret.len(), "Node bootstrapped");

    // Recreate the platform so it picks up this daemon's version
    if let Err(e) = supervisor.remove_platform().await {
        info!(error = %e, "No platform container to remove");
    }
    if let Err(e) = supervisor.start_platform().await {
        error!(error = %e, "Failed to start platform");
        return Err(e);
    }
    if let Err(e) = supervisor.gc_platform_image(store.as_ref()).await {
        warn!(error = %e, "Failed to collect previous platform image");
    }

    // Start healing loops in background
    let redis_heal_handle = tokio::spawn(run_healing_loop(
        supervisor.clone(),
        store.clone(),
        Managed::Redis,
        shutdown_rx.clone(),
    ));
    let platform_heal_handle = tokio::spawn(run_healing_loop(
        supervisor.clone(),
        store.clone(),
        Managed::Platform,
        shutdown_rx.clone(),
    ));

    // Create application state
    let state = AppState::new(AppStateInner {
        work_dir: config.work_dir.clone(),
        secret,
        node: node.clone(),
        store: store.clone(),
        runtime: runtime.clone(),
        release: ReleaseClient::new(config.local_release)?,
        reloader: NginxReloader::new(config.nginx_pid_file.clone()),
        proxy: ProxyClient::new()?,
    });

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for SIGINT or SIGTERM
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all background tasks
    let _ = shutdown_tx.send(true);

    // Wait for background tasks to finish
    info!("Waiting for background tasks to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, ipv4_handle).await {
        warn!(error = %e, "IPv4 refresh loop did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, redis_heal_handle).await {
        warn!(error = %e, "Redis healing loop did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, platform_heal_handle).await {
        warn!(error = %e, "Platform healing loop did not shut down in time");
    }

    info!("mgmt shutdown complete");
    Ok(())
}

fn set_env_default(key: &str, value: &str) {
    if std::env::var(key).unwrap_or_default().is_empty() {
        std::env::set_var(key, value);
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
