//! Release server client.
//!
//! The platform periodically reports usage counters and asks for the latest
//! published versions. This daemon relays that request to the release server,
//! appending its own version and a timestamp to the caller's params.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Published versions as the release server reports them. The `version`
/// field always carries the running version, not whatever the server sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versions {
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub stable: String,

    #[serde(default)]
    pub latest: String,
}

pub struct ReleaseClient {
    client: reqwest::Client,
    base_url: String,
}

impl ReleaseClient {
    /// Client against the public release server, or the local one when the
    /// operator runs their own.
    pub fn new(local_release: bool) -> Result<Self> {
        let base_url = if local_release {
            "http://localhost:2023".to_string()
        } else {
            "https://api.ossrs.net".to_string()
        };
        Self::with_base_url(base_url)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("build release client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Query the release server, relaying the caller's report params.
    pub async fn refresh_version(
        &self,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Versions> {
        let mut query: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.clone(), query_value(v)))
            .collect();
        query.push(("version".to_string(), crate::VERSION.to_string()));
        query.push(("ts".to_string(), Utc::now().timestamp_millis().to_string()));

        let url = format!("{}/terraform/v1/releases", self.base_url);
        debug!(url = %url, params = query.len(), "querying release server");

        let mut versions: Versions = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("request {url}"))?
            .error_for_status()
            .with_context(|| format!("request {url}"))?
            .json()
            .await
            .with_context(|| format!("parse response of {url}"))?;

        // The running version is authoritative for display, whatever the
        // server reports back.
        versions.version = crate::VERSION.to_string();
        Ok(versions)
    }
}

/// Query params arrive as JSON values; strings go through bare, everything
/// else in its JSON rendering.
fn query_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
