//! Shared state store.
//!
//! All durable node state lives in redis hashes so the platform container can
//! read the same facts this daemon writes. The store interface is small on
//! purpose: raw hash/scalar access plus typed helpers, with an in-memory
//! implementation for tests.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::envfile;
use crate::runtime::ContainerRuntime;
use crate::supervisor;

/// Redis keys shared with the platform container.
pub mod keys {
    /// Node identity and resolved environment facts (hash).
    pub const TENCENT_LH: &str = "SRS_TENCENT_LH";

    /// Per-container disabled flags, "true" disables healing (hash).
    pub const CONTAINER_DISABLED: &str = "SRS_CONTAINER_DISABLED";

    /// Last image started per managed container, for image GC (hash).
    pub const DOCKER_IMAGES: &str = "SRS_DOCKER_IMAGES";

    /// Platform API secret and its last update time (hash).
    pub const PLATFORM_SECRET: &str = "SRS_PLATFORM_SECRET";

    /// Upgrade state flag, "1" while an upgrade runs (hash).
    pub const UPGRADING: &str = "SRS_UPGRADING";

    /// Nginx delivery toggles (hash).
    pub const STREAM_NGINX: &str = "SRS_STREAM_NGINX";

    /// HTTPS mode, "ssl" or "lets" when enabled (scalar).
    pub const HTTPS: &str = "SRS_HTTPS";
}

/// State store interface.
///
/// Raw operations mirror the redis data model; the typed helpers encode the
/// conventions both daemons agree on.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Whether healing is disabled for a container. Absent means enabled.
    async fn container_disabled(&self, name: &str) -> Result<bool> {
        let flag = self.hget(keys::CONTAINER_DISABLED, name).await?;
        Ok(flag.as_deref() == Some("true"))
    }

    /// Record the image a container runs now. Returns the previous image when
    /// it differs, so the caller can remove it.
    async fn record_image(&self, name: &str, image: &str) -> Result<Option<String>> {
        let previous = self.hget(keys::DOCKER_IMAGES, name).await?;
        self.hset(keys::DOCKER_IMAGES, name, image).await?;
        Ok(previous.filter(|p| !p.is_empty() && p != image))
    }

    /// HTTPS mode for the generated nginx config, if configured.
    async fn https_mode(&self) -> Result<Option<String>> {
        self.get(keys::HTTPS).await
    }

    async fn hls_delivery(&self) -> Result<bool> {
        let hls = self.hget(keys::STREAM_NGINX, "hls").await?;
        Ok(hls.as_deref() == Some("enable"))
    }

    async fn set_hls_delivery(&self, enabled: bool) -> Result<()> {
        let value = if enabled { "enable" } else { "disable" };
        self.hset(keys::STREAM_NGINX, "hls", value).await
    }
}

/// Redis-backed store. Cheap to clone, all clones share one multiplexed
/// connection that reconnects on failure.
#[derive(Clone)]
pub struct Store {
    conn: redis::aio::ConnectionManager,
}

impl Store {
    /// Connect to the local redis on the given port.
    pub async fn connect(port: u16, password: &str) -> Result<Store> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp("127.0.0.1".to_string(), port),
            redis: redis::RedisConnectionInfo {
                password: (!password.is_empty()).then(|| password.to_string()),
                ..Default::default()
            },
        };

        let client = redis::Client::open(info).context("open redis client")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("connect to redis")?;

        info!(port, "connected to redis");
        Ok(Store { conn })
    }
}

#[async_trait]
impl StateStore for Store {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::AsyncCommands::hget(&mut conn, key, field)
            .await
            .with_context(|| format!("hget {key} {field}"))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::AsyncCommands::hset(&mut conn, key, field, value)
            .await
            .with_context(|| format!("hset {key} {field}"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::AsyncCommands::get(&mut conn, key)
            .await
            .with_context(|| format!("get {key}"))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::AsyncCommands::set(&mut conn, key, value)
            .await
            .with_context(|| format!("set {key}"))?;
        Ok(())
    }
}

/// In-memory store for testing and development.
#[derive(Default)]
pub struct MemoryStore {
    hashes: std::sync::Mutex<std::collections::HashMap<String, std::collections::HashMap<String, String>>>,
    scalars: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let hashes = self.hashes.lock().unwrap();
        Ok(hashes.get(key).and_then(|hash| hash.get(field)).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut hashes = self.hashes.lock().unwrap();
        hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.scalars.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.scalars
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Identity established (or confirmed) by [`bootstrap`].
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    /// Stable node id, created on first boot.
    pub node_id: String,

    /// Shared platform API secret.
    pub secret: String,
}

/// One-time startup pass over the shared state.
///
/// Clears a stale upgrading flag, establishes node identity and the API
/// secret, publishes the resolved environment facts, rewrites the env file
/// with them, migrates off the dev SRS container, and drops the previous
/// image of this daemon if the version changed.
pub async fn bootstrap(
    store: &dyn StateStore,
    runtime: &dyn ContainerRuntime,
    node: &NodeConfig,
    env_path: &Path,
    version: &str,
) -> Result<BootstrapOutcome> {
    // A crash mid-upgrade must not leave the node claiming to upgrade forever.
    if store.hget(keys::UPGRADING, "upgrading").await?.as_deref() == Some("1") {
        store.hset(keys::UPGRADING, "upgrading", "0").await?;
        warn!("cleared stale upgrading flag");
    }

    let node_id = match store.hget(keys::TENCENT_LH, "node").await? {
        Some(nid) if !nid.is_empty() => nid,
        _ => {
            let nid = Uuid::new_v4().to_string();
            store.hset(keys::TENCENT_LH, "node", &nid).await?;
            info!(node_id = %nid, "created node id");
            nid
        }
    };

    let secret = match store.hget(keys::PLATFORM_SECRET, "token").await? {
        Some(token) if !token.is_empty() => token,
        _ => {
            let token = format!("srs-v1-{}", Uuid::new_v4().simple());
            let update = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            store.hset(keys::PLATFORM_SECRET, "token", &token).await?;
            store.hset(keys::PLATFORM_SECRET, "update", &update).await?;
            info!(update = %update, "created platform api secret");
            token
        }
    };

    for (field, value) in [
        ("cloud", node.cloud.as_str()),
        ("region", node.region.as_str()),
        ("source", node.source.as_str()),
        ("registry", node.registry.as_str()),
        ("platform", node.platform.as_str()),
    ] {
        let current = store.hget(keys::TENCENT_LH, field).await?;
        if current.as_deref() != Some(value) {
            store.hset(keys::TENCENT_LH, field, value).await?;
            info!(field, value, "updated node fact");
        }
    }

    let mut updates = vec![
        ("CLOUD", node.cloud.clone()),
        ("REGION", node.region.clone()),
        ("SOURCE", node.source.clone()),
    ];
    if let Ok(password) = std::env::var("MGMT_PASSWORD") {
        if !password.is_empty() {
            updates.push(("MGMT_PASSWORD", password));
        }
    }
    envfile::rewrite(env_path, &updates).context("refresh env file")?;

    // One-way migration: once the stable SRS container is marked enabled,
    // pin the dev one off and drop it.
    let dev_disabled = store
        .hget(keys::CONTAINER_DISABLED, supervisor::SRS_DEV_CONTAINER)
        .await?;
    let srs_disabled = store
        .hget(keys::CONTAINER_DISABLED, supervisor::SRS_CONTAINER)
        .await?;
    if dev_disabled.as_deref() != Some("true") && srs_disabled.as_deref() == Some("true") {
        let r0 = store
            .hset(keys::CONTAINER_DISABLED, supervisor::SRS_DEV_CONTAINER, "true")
            .await;
        let r1 = store
            .hset(keys::CONTAINER_DISABLED, supervisor::SRS_CONTAINER, "false")
            .await;
        let r2 = runtime.remove(supervisor::SRS_DEV_CONTAINER).await;
        warn!(r0 = ?r0, r1 = ?r1, r2 = ?r2, "migrated from srs-dev to srs-server");
    }

    let image = format!("{}/ossrs/srs-cloud:mgmt-{}", node.registry, version);
    if let Some(previous) = store.record_image(supervisor::MGMT_LABEL, &image).await? {
        let removed = runtime.remove_image(&previous).await;
        info!(previous = %previous, removed = ?removed, "dropped previous mgmt image");
    }

    Ok(BootstrapOutcome { node_id, secret })
}
