//! Nginx config generation and reload.
//!
//! The edge nginx includes two generated fragments, one at http scope and one
//! at server scope. Both are assembled from fixed text blocks driven by the
//! feature flags in the state store, written atomically, then nginx is asked
//! to reload: via systemd when the unit file exists, else by signalling the
//! pid from the operator-provided pid file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::store::StateStore;

const HEADER: &str =
    "# !!! Important: This file is produced and maintained by the SRS Stack, please never modify it.";

const SYSTEMD_UNIT: &str = "/usr/lib/systemd/system/nginx.service";

/// The http-scope fragment carries nothing today, but the include must exist.
fn build_http_conf() -> String {
    let lines = vec![HEADER, "", ""];
    lines.join("\n")
}

/// The server-scope fragment: upload limit always, TLS and HLS blocks when
/// the corresponding flags are on.
fn build_server_conf(https: Option<&str>, hls: bool) -> String {
    let mut lines: Vec<String> = vec![HEADER.to_string()];

    lines.push(String::new());
    lines.push("# Limit for upload file size".to_string());
    lines.push("client_max_body_size 100g;".to_string());

    if matches!(https, Some("ssl") | Some("lets")) {
        for line in [
            "",
            "# For SSL/TLS config.",
            "listen       443 ssl;",
            "listen       [::]:443 ssl;",
            "ssl_certificate /data/config/nginx.crt;",
            "ssl_certificate_key /data/config/nginx.key;",
            "ssl_protocols TLSv1.1 TLSv1.2 TLSv1.3;",
            "add_header Strict-Transport-Security \"max-age=0\";",
            "ssl_session_cache shared:SSL:10m;",
            "ssl_session_timeout 10m;",
            "",
        ] {
            lines.push(line.to_string());
        }
    }

    if hls {
        for line in [
            "",
            "# For HLS delivery by the edge server.",
            "location ~ ^/.+/.*\\.(m3u8)$ {",
            "  proxy_pass http://127.0.0.1:8080$request_uri;",
            "  add_header Cache-Control no-cache;",
            "}",
            "location ~ ^/.+/.*\\.(ts)$ {",
            "  proxy_pass http://127.0.0.1:8080$request_uri;",
            "  add_header Cache-Control max-age=10;",
            "}",
            "",
        ] {
            lines.push(line.to_string());
        }
    }

    lines.push(String::new());
    lines.push(String::new());
    lines.join("\n")
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Write both fragments under `containers/data/config/`.
pub fn write_config(work_dir: &Path, https: Option<&str>, hls: bool) -> Result<()> {
    let config_dir = work_dir.join("containers/data/config");
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("create {}", config_dir.display()))?;

    write_atomic(&config_dir.join("nginx.http.conf"), &build_http_conf())?;
    write_atomic(
        &config_dir.join("nginx.server.conf"),
        &build_server_conf(https, hls),
    )?;

    info!(hls, https = ?https, "nginx config written");
    Ok(())
}

/// Read the feature flags, regenerate both fragments and reload nginx.
pub async fn generate_config(
    store: &dyn StateStore,
    work_dir: &Path,
    reloader: &NginxReloader,
) -> Result<()> {
    let https = store.https_mode().await?;
    let hls = store.hls_delivery().await?;

    write_config(work_dir, https.as_deref(), hls)?;
    reloader.reload().await.context("reload nginx")?;
    Ok(())
}

/// Knows how to nudge the host nginx into rereading its config.
pub struct NginxReloader {
    is_darwin: bool,
    service_unit: PathBuf,
    pid_file: Option<PathBuf>,
}

impl NginxReloader {
    pub fn new(pid_file: Option<PathBuf>) -> Self {
        Self {
            is_darwin: cfg!(target_os = "macos"),
            service_unit: PathBuf::from(SYSTEMD_UNIT),
            pid_file,
        }
    }

    /// Fully parameterized constructor, used by tests to point at fake paths.
    pub fn with_paths(is_darwin: bool, service_unit: PathBuf, pid_file: Option<PathBuf>) -> Self {
        Self {
            is_darwin,
            service_unit,
            pid_file,
        }
    }

    /// systemd reload first, pid signal as fallback, error when neither
    /// mechanism is present.
    pub async fn reload(&self) -> Result<()> {
        if self.is_darwin {
            debug!("skipping nginx reload on darwin");
            return Ok(());
        }

        let service_exists = self.service_unit.exists();
        let pid_exists = self
            .pid_file
            .as_deref()
            .is_some_and(|path| path.exists());

        if !service_exists && !pid_exists {
            bail!(
                "cannot reload nginx, neither {} nor a pid file exists",
                self.service_unit.display()
            );
        }

        if service_exists {
            match run_command("systemctl", &["reload", "nginx.service"]).await {
                Ok(()) => {
                    info!("nginx reloaded via systemctl");
                    return Ok(());
                }
                Err(e) if !pid_exists => return Err(e).context("reload nginx via systemctl"),
                Err(e) => warn!(error = %e, "systemctl reload failed, trying pid signal"),
            }
        }

        let Some(pid_path) = self.pid_file.as_deref().filter(|path| path.exists()) else {
            bail!("nginx pid file not available");
        };
        let pid = std::fs::read_to_string(pid_path)
            .with_context(|| format!("read {}", pid_path.display()))?;
        let pid = pid.trim();
        if pid.is_empty() {
            bail!("empty nginx pid at {}", pid_path.display());
        }

        run_command("kill", &["-s", "SIGHUP", pid])
            .await
            .with_context(|| format!("signal nginx pid {pid}"))?;
        info!(pid, "nginx reloaded via SIGHUP");
        Ok(())
    }
}

async fn run_command(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("spawn {program}"))?;
    if !status.success() {
        bail!("{program} {args:?} exited with {status}");
    }
    Ok(())
}
