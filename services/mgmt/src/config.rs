//! Daemon configuration and the resolved node snapshot.
//!
//! `Config` is the env-driven process configuration, loaded once in `main`.
//! `NodeConfig` holds the facts the environment resolver produces; readers get
//! it as an immutable snapshot through `NodeState`, and only the IPv4 refresh
//! task republishes it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;

/// Process configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address. `MGMT_LISTEN` accepts a bare port, `:port`, or a
    /// full `host:port`.
    pub listen_addr: SocketAddr,

    /// Port of the managed Redis container, also used by our own client.
    pub redis_port: u16,

    /// Password for the managed Redis container; empty means none.
    pub redis_password: String,

    /// Working directory all relative paths (containers/, .env) hang off.
    pub work_dir: PathBuf,

    /// NODE_ENV == "development".
    pub dev_mode: bool,

    /// LOCAL_RELEASE switches the release service to a local endpoint.
    pub local_release: bool,

    /// Path of the nginx PID file, used when no systemd unit exists.
    pub nginx_pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = parse_listen_addr(
            &std::env::var("MGMT_LISTEN").unwrap_or_else(|_| "2022".to_string()),
        )?;

        let redis_port = std::env::var("REDIS_PORT")
            .unwrap_or_else(|_| "6379".to_string())
            .parse::<u16>()
            .context("REDIS_PORT must be a port number")?;

        let redis_password = std::env::var("REDIS_PASSWORD").unwrap_or_default();

        let work_dir = std::env::current_dir().context("resolve working directory")?;

        let dev_mode = std::env::var("NODE_ENV")
            .map(|v| v == "development")
            .unwrap_or(false);

        let local_release = std::env::var("LOCAL_RELEASE")
            .map(|v| v == "on" || v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let nginx_pid_file = std::env::var("NGINX_PID").ok().map(PathBuf::from);

        let log_level = std::env::var("MGMT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            redis_port,
            redis_password,
            work_dir,
            dev_mode,
            local_release,
            nginx_pid_file,
            log_level,
        })
    }
}

/// `MGMT_LISTEN` historically accepts `2022` or `:2022`; normalize both to a
/// wildcard bind.
fn parse_listen_addr(raw: &str) -> Result<SocketAddr> {
    let raw = raw.trim();
    let normalized = if let Some(port) = raw.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else if raw.parse::<u16>().is_ok() {
        format!("0.0.0.0:{raw}")
    } else {
        raw.to_string()
    };

    normalized
        .parse()
        .with_context(|| format!("invalid MGMT_LISTEN {raw}"))
}

/// Facts produced by the environment resolver.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Cloud provider id (TENCENT, DO, BT, AAPANEL, DEV, ...).
    pub cloud: String,

    /// Region id within the cloud.
    pub region: String,

    /// Upstream source repository id (github or gitee).
    pub source: String,

    /// Container image registry host.
    pub registry: String,

    /// Cloud platform label, for reporting only (not the OS family).
    pub platform: String,

    /// Detected network interface carrying the private address.
    pub iface: String,

    /// Private IPv4 address of this node.
    pub ipv4: IpAddr,

    /// OS family flag; several behaviors are skipped on darwin.
    pub is_darwin: bool,
}

impl NodeConfig {
    pub fn new(cloud: String, region: String, source: String, registry: String) -> Self {
        Self {
            cloud,
            region,
            source,
            registry,
            platform: String::new(),
            iface: String::new(),
            ipv4: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            is_darwin: cfg!(target_os = "macos"),
        }
    }
}

/// Shared handle to the current `NodeConfig` snapshot.
///
/// Readers call `snapshot()` and get a consistent immutable view; the IPv4
/// refresh task is the only writer and swaps in a whole new snapshot at once.
#[derive(Clone)]
pub struct NodeState {
    inner: Arc<ArcSwap<NodeConfig>>,
}

impl NodeState {
    pub fn new(initial: NodeConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Current snapshot; cheap, lock-free.
    pub fn snapshot(&self) -> Arc<NodeConfig> {
        self.inner.load_full()
    }

    /// Publish a new interface/address pair, keeping the other fields.
    pub fn set_ipv4(&self, iface: &str, addr: IpAddr) {
        let mut next = (*self.inner.load_full()).clone();
        next.iface = iface.to_string();
        next.ipv4 = addr;
        self.inner.store(Arc::new(next));
    }
}

/// OS family the way collaborators expect it spelled ("darwin", not "macos").
pub fn os_family() -> &'static str {
    if cfg!(target_os = "macos") {
        "darwin"
    } else {
        std::env::consts::OS
    }
}
