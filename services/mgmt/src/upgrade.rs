//! Upgrade script runner.
//!
//! Upgrades are delegated to the `upgrade` bash script shipped next to the
//! daemon. Its combined output is streamed into the log while it runs. The
//! exit code is logged but not surfaced to the caller, an upgrade that gets
//! far enough replaces this process anyway.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Run `bash upgrade <target>` from the work dir and wait for it.
pub async fn exec_upgrade(work_dir: &Path, target: &str) -> Result<()> {
    info!(target, "starting upgrade");

    let mut child = Command::new("bash")
        .arg("upgrade")
        .arg(target)
        .current_dir(work_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("start upgrade script")?;

    let stdout = child.stdout.take().context("capture upgrade stdout")?;
    let stderr = child.stderr.take().context("capture upgrade stderr")?;

    let out_task = tokio::spawn(stream_lines(stdout, "stdout"));
    let err_task = tokio::spawn(stream_lines(stderr, "stderr"));

    let status = child.wait().await.context("wait for upgrade script")?;
    let _ = out_task.await;
    let _ = err_task.await;

    if status.success() {
        info!(target, "upgrade script finished");
    } else {
        warn!(target, status = %status, "upgrade script exited with failure");
    }
    Ok(())
}

async fn stream_lines<R: AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(stream, "upgrade: {line}");
    }
}
