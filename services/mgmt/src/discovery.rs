//! Environment discovery.
//!
//! On a fresh node nothing tells us where we run, so resolution goes:
//! - deterministic rules first (OS family, operator-set CLOUD/REGION);
//! - otherwise race the cloud metadata endpoints and take the first success.
//!
//! Source and registry derive from the resolved cloud/region through pure
//! lookup tables. The private IPv4 is discovered from the local interfaces and
//! kept current by a background refresh loop.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::NodeState;

/// Metadata probe endpoints, injectable so tests can stand in local servers.
#[derive(Debug, Clone)]
pub struct RegionProbes {
    /// Tencent lighthouse/CVM metadata endpoint.
    pub tencent_url: String,

    /// DigitalOcean droplet metadata endpoint.
    pub digitalocean_url: String,

    /// Overall deadline for the race.
    pub timeout: Duration,
}

impl Default for RegionProbes {
    fn default() -> Self {
        Self {
            tencent_url: "http://metadata.tencentyun.com/latest/meta-data/placement/region"
                .to_string(),
            digitalocean_url: "http://169.254.169.254/metadata/v1/region".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Deterministic region rules, checked before any network I/O.
fn region_from_rules(
    is_darwin: bool,
    cloud: Option<&str>,
    region: Option<&str>,
) -> Option<(String, String)> {
    if is_darwin {
        return Some(("DEV".to_string(), "ap-beijing".to_string()));
    }

    match cloud {
        Some("BT") => return Some(("BT".to_string(), "ap-beijing".to_string())),
        Some("AAPANEL") => return Some(("AAPANEL".to_string(), "ap-singapore".to_string())),
        _ => {}
    }

    if let (Some(cloud), Some(region)) = (cloud, region) {
        if !cloud.is_empty() && !region.is_empty() {
            return Some((cloud.to_string(), region.to_string()));
        }
    }

    None
}

/// Resolve the cloud and region for this node.
///
/// Falls back to racing the metadata probes; the first non-empty success wins
/// and the loser is cancelled. Failure here is fatal to startup, there is no
/// sensible default without knowing the environment.
pub async fn resolve_region(probes: &RegionProbes) -> Result<(String, String)> {
    let cloud = std::env::var("CLOUD").ok();
    let region = std::env::var("REGION").ok();
    if let Some(resolved) = region_from_rules(
        cfg!(target_os = "macos"),
        cloud.as_deref().filter(|s| !s.is_empty()),
        region.as_deref().filter(|s| !s.is_empty()),
    ) {
        return Ok(resolved);
    }

    info!("discovering region from cloud metadata");
    race_metadata_probes(probes).await
}

async fn race_metadata_probes(probes: &RegionProbes) -> Result<(String, String)> {
    let client = reqwest::Client::builder()
        .timeout(probes.timeout)
        .build()
        .context("build metadata client")?;

    let (tx, mut rx) = mpsc::channel::<(String, String)>(2);
    let mut tasks = Vec::with_capacity(2);

    for (cloud, url) in [
        ("TENCENT", probes.tencent_url.clone()),
        ("DO", probes.digitalocean_url.clone()),
    ] {
        let client = client.clone();
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            match fetch_metadata(&client, &url).await {
                Ok(region) if !region.is_empty() => {
                    let _ = tx.send((cloud.to_string(), region)).await;
                }
                Ok(_) => debug!(cloud, "metadata probe returned an empty region"),
                Err(e) => debug!(cloud, error = %e, "metadata probe failed"),
            }
        }));
    }
    drop(tx);

    // recv() yields None once both probes failed and dropped their senders.
    let winner = tokio::time::timeout(probes.timeout, rx.recv()).await;
    for task in &tasks {
        task.abort();
    }

    match winner {
        Ok(Some((cloud, region))) => {
            info!(cloud = %cloud, region = %region, "region discovered");
            Ok((cloud, region))
        }
        Ok(None) => Err(anyhow!("all metadata probes failed")),
        Err(_) => Err(anyhow!(
            "no metadata probe answered within {:?}",
            probes.timeout
        )),
    }
}

async fn fetch_metadata(client: &reqwest::Client, url: &str) -> Result<String> {
    let body = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(body.trim().to_string())
}

/// On-shore regions served faster from the gitee mirror.
const GITEE_REGION_PREFIXES: [&str; 6] = [
    "ap-guangzhou",
    "ap-shanghai",
    "ap-nanjing",
    "ap-beijing",
    "ap-chengdu",
    "ap-chongqing",
];

/// Pure cloud/region to source mapping.
pub fn source_for(cloud: &str, region: &str) -> &'static str {
    match cloud {
        "DEV" | "BT" => return "gitee",
        "DO" | "AAPANEL" => return "github",
        _ => {}
    }

    if GITEE_REGION_PREFIXES
        .iter()
        .any(|prefix| region.starts_with(prefix))
    {
        "gitee"
    } else {
        "github"
    }
}

/// Pure source to registry mapping.
pub fn registry_for(source: &str) -> &'static str {
    if source == "github" {
        "docker.io"
    } else {
        "registry.cn-hangzhou.aliyuncs.com"
    }
}

/// Source with the operator override applied.
pub fn resolve_source(cloud: &str, region: &str) -> String {
    match std::env::var("SOURCE") {
        Ok(source) if !source.is_empty() => source,
        _ => source_for(cloud, region).to_string(),
    }
}

/// Registry with the operator override applied.
pub fn resolve_registry(source: &str) -> String {
    match std::env::var("REGISTRY") {
        Ok(registry) if !registry.is_empty() => registry,
        _ => registry_for(source).to_string(),
    }
}

/// Tencent metadata endpoint carrying the instance name.
pub const TENCENT_INSTANCE_NAME_URL: &str =
    "http://metadata.tencentyun.com/latest/meta-data/instance-name";

/// Cloud platform label, for reporting only. Lighthouse instances carry a
/// `-lhins-` marker in the instance name; everything else on a metadata-backed
/// cloud is a plain VM.
pub fn platform_label(cloud: &str, instance_name: &str) -> String {
    match cloud {
        "DEV" => "dev".to_string(),
        "DO" => "droplet".to_string(),
        "BT" => "bt".to_string(),
        "AAPANEL" => "aapanel".to_string(),
        _ if instance_name.contains("-lhins-") => "lighthouse".to_string(),
        _ => "cvm".to_string(),
    }
}

/// Resolve the platform label, asking cloud metadata for the instance name
/// when the pure rules cannot decide. The label is statistics only, so a
/// metadata failure degrades to the dev label instead of failing startup.
pub async fn resolve_platform(cloud: &str, instance_name_url: &str) -> String {
    if matches!(cloud, "DEV" | "DO" | "BT" | "AAPANEL") {
        return platform_label(cloud, "");
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "metadata client build failed, assuming dev");
            return "dev".to_string();
        }
    };

    match fetch_metadata(&client, instance_name_url).await {
        Ok(name) => platform_label(cloud, &name),
        Err(e) => {
            info!(error = %e, "no instance metadata, assuming dev");
            "dev".to_string()
        }
    }
}

/// Pick the private IPv4 of this node: non-loopback IPv4 candidates, preferring
/// an `en`/`eth` interface name, else any candidate.
pub fn discover_private_ipv4() -> Result<(String, IpAddr)> {
    let candidates: Vec<(String, IpAddr)> = local_ip_address::list_afinet_netifas()
        .context("enumerate network interfaces")?
        .into_iter()
        .filter(|(_, addr)| addr.is_ipv4() && !addr.is_loopback())
        .collect();

    let preferred = candidates
        .iter()
        .find(|(name, _)| name.starts_with("en") || name.starts_with("eth"))
        .or_else(|| candidates.first());

    match preferred {
        Some((name, addr)) => Ok((name.clone(), *addr)),
        None => Err(anyhow!("no non-loopback IPv4 interface found")),
    }
}

/// Keep the node's private IPv4 current in the shared snapshot.
///
/// The first attempt (success or not) signals `first_attempt_tx` so startup
/// never blocks on the refresh cadence. Production refreshes daily; dev mode
/// every 30s since addresses move around on laptops.
pub async fn run_ipv4_refresh(
    state: NodeState,
    dev_mode: bool,
    first_attempt_tx: oneshot::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = if dev_mode {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(24 * 3600)
    };

    info!(interval_secs = interval.as_secs(), "starting IPv4 refresh loop");

    let mut first_attempt_tx = Some(first_attempt_tx);
    loop {
        match discover_private_ipv4() {
            Ok((iface, addr)) => {
                state.set_ipv4(&iface, addr);
                debug!(iface = %iface, ipv4 = %addr, "refreshed private IPv4");
            }
            Err(e) => {
                warn!(error = %e, "IPv4 discovery failed, will retry");
            }
        }

        if let Some(tx) = first_attempt_tx.take() {
            let _ = tx.send(());
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("IPv4 refresh loop shutting down");
                    break;
                }
            }
        }
    }
}
