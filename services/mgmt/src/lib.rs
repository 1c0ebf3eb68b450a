//! Bootstrap and control daemon for the SRS streaming platform.
//!
//! The daemon is the first thing running on a node. It figures out where it
//! is (cloud, region, source mirror, registry, private IPv4), supervises the
//! redis and platform containers with self-healing loops, exposes an
//! authenticated command endpoint for the platform, and fronts the whole
//! deployment as an edge HTTP gateway.
//!
//! ## Modules
//!
//! - `discovery`: environment resolution, including the metadata probe race
//! - `supervisor`: managed container lifecycle and healing loops
//! - `store`: redis-backed shared state and the startup bootstrap pass
//! - `api`: the host endpoints (versions, exec dispatch)
//! - `gateway`: static UI serving and path-priority reverse proxying

pub mod api;
pub mod config;
pub mod discovery;
pub mod envfile;
pub mod gateway;
pub mod nginx;
pub mod release;
pub mod runtime;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod upgrade;

// Re-export commonly used types
pub use config::{Config, NodeConfig, NodeState};
pub use runtime::{ContainerRuntime, DockerCli, MockRuntime};
pub use state::{AppState, AppStateInner};
pub use store::{MemoryStore, StateStore, Store};

/// Release version, `v`-prefixed the way image tags and the release server
/// spell it.
pub const VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));
