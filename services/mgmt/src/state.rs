//! Application state shared across request handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::NodeState;
use crate::gateway::proxy::ProxyClient;
use crate::nginx::NginxReloader;
use crate::release::ReleaseClient;
use crate::runtime::ContainerRuntime;
use crate::store::StateStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    /// Working directory of the daemon, the root for `.env`, `containers/`
    /// and the upgrade script.
    pub work_dir: PathBuf,

    /// Shared secret the platform signs command tokens with.
    pub secret: String,

    /// Node facts snapshot handle.
    pub node: NodeState,

    pub store: Arc<dyn StateStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub release: ReleaseClient,
    pub reloader: NginxReloader,
    pub proxy: ProxyClient,
}

impl AppState {
    pub fn new(inner: AppStateInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.inner.work_dir
    }

    /// Root of the static UI tree served by the gateway.
    pub fn www_dir(&self) -> PathBuf {
        self.inner.work_dir.join("containers/www")
    }

    pub fn secret(&self) -> &str {
        &self.inner.secret
    }

    pub fn node(&self) -> &NodeState {
        &self.inner.node
    }

    pub fn store(&self) -> &dyn StateStore {
        self.inner.store.as_ref()
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.inner.runtime.as_ref()
    }

    pub fn release(&self) -> &ReleaseClient {
        &self.inner.release
    }

    pub fn reloader(&self) -> &NginxReloader {
        &self.inner.reloader
    }

    pub fn proxy(&self) -> &ProxyClient {
        &self.inner.proxy
    }
}
