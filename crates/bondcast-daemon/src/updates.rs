//! OS package upgrade orchestration.
//!
//! Gated on the setup flag: appliance builds without a restarting
//! supervisor ship with upgrades disabled. The catalog refreshes at
//! most daily, a simulated upgrade prices the pending set, and the
//! single-flight upgrade streams progress counters to clients. A
//! successful upgrade ends the process so the supervisor restarts the
//! daemon against the new image.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use crate::notify;
use crate::server::{Core, Server};

const CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);
const CATALOG_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Pending upgrade summary from the simulated run.
#[derive(Debug, Clone, Serialize)]
pub struct AvailableUpdates {
    pub package_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_size: Option<String>,
}

/// Progress counters for a running upgrade. Monotone, clamped to
/// `total`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateProgress {
    pub downloading: u32,
    pub unpacking: u32,
    pub setting_up: u32,
    pub total: u32,
    /// 0 on success, the captured stderr text on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Downloading,
    Unpacking,
    SettingUp,
}

impl UpdateProgress {
    pub fn bump(&mut self, phase: Phase) {
        let counter = match phase {
            Phase::Downloading => &mut self.downloading,
            Phase::Unpacking => &mut self.unpacking,
            Phase::SettingUp => &mut self.setting_up,
        };
        *counter += 1;
        if self.total > 0 && *counter > self.total {
            *counter = self.total;
        }
    }
}

/// Classify one line of apt-get output.
pub fn classify_line(line: &str) -> Option<Phase> {
    if line.starts_with("Get:") {
        Some(Phase::Downloading)
    } else if line.starts_with("Unpacking ") {
        Some(Phase::Unpacking)
    } else if line.starts_with("Setting up ") {
        Some(Phase::SettingUp)
    } else {
        None
    }
}

/// Extract the package count and download size from a simulated
/// upgrade, e.g. `12 upgraded, 3 newly installed, 0 to remove and 0
/// not upgraded.` / `Need to get 34.5 MB of archives.`
pub fn parse_upgrade_summary(stdout: &str) -> AvailableUpdates {
    let mut package_count = 0;
    let mut download_size = None;

    for line in stdout.lines() {
        if line.contains(" upgraded, ") && line.contains(" newly installed") {
            let upgraded: u32 = line
                .split_whitespace()
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            let newly: u32 = line
                .split(" upgraded, ")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            package_count = upgraded + newly;
        } else if let Some(rest) = line.strip_prefix("Need to get ") {
            let mut parts = rest.split_whitespace();
            if let (Some(amount), Some(unit)) = (parts.next(), parts.next()) {
                download_size = Some(format!("{amount} {unit}"));
            }
        }
    }

    AvailableUpdates {
        package_count,
        download_size,
    }
}

fn broadcast_updating(core: &Core) {
    let value = core
        .updating
        .as_ref()
        .map(|u| serde_json::to_value(u).expect("update progress"))
        .unwrap_or(Value::Bool(false));
    core.broadcast("status", &json!({ "updating": value }));
}

async fn apt_get(args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::process::Command::new("apt-get")
        .args(args)
        .env("DEBIAN_FRONTEND", "noninteractive")
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Hourly catalog check: refresh at most daily, price the pending
/// upgrade, and tell clients what is waiting.
pub async fn run_checker(server: Arc<Server>) {
    if !server.setup.apt_upgrades {
        return;
    }

    let mut last_refresh: Option<Instant> = None;
    let mut tick = tokio::time::interval(CHECK_INTERVAL);
    loop {
        tick.tick().await;

        {
            let core = server.core.lock().await;
            if core.is_streaming || core.updating.is_some() {
                continue;
            }
        }
        if last_refresh.is_some_and(|t| t.elapsed() < CATALOG_MAX_AGE) {
            continue;
        }

        if let Err(e) = apt_get(&["update"]).await {
            tracing::warn!(error = %e, "package catalog refresh failed, retrying next hour");
            continue;
        }
        last_refresh = Some(Instant::now());

        match apt_get(&["dist-upgrade", "-s"]).await {
            Ok(stdout) => {
                let available = parse_upgrade_summary(&stdout);
                tracing::info!(
                    packages = available.package_count,
                    size = ?available.download_size,
                    "upgrade check complete"
                );
                let mut core = server.core.lock().await;
                let value = serde_json::to_value(&available).expect("available updates");
                core.available_updates = Some(available);
                core.broadcast("status", &json!({ "available_updates": value }));
            }
            Err(e) => {
                tracing::warn!(error = %e, "upgrade simulation failed");
            }
        }
    }
}

/// Run the upgrade. Rejected while streaming or while one is already
/// in flight; on success the daemon exits so its supervisor restarts
/// it.
pub async fn do_update(server: &Arc<Server>, conn_id: u64) {
    if !server.setup.apt_upgrades {
        return;
    }
    {
        let mut core = server.core.lock().await;
        if core.is_streaming {
            notify::error_to(
                &mut core,
                conn_id,
                "update",
                "cannot update while streaming",
                10,
            );
            return;
        }
        if core.updating.is_some() {
            return;
        }
        let total = core
            .available_updates
            .as_ref()
            .map(|a| a.package_count)
            .unwrap_or(0);
        core.updating = Some(UpdateProgress {
            total,
            ..Default::default()
        });
        broadcast_updating(&core);
    }
    tracing::info!("starting system upgrade");

    let (success, stderr_text) = match run_upgrade(server).await {
        Ok(result) => result,
        Err(e) => (false, e.to_string()),
    };

    let mut core = server.core.lock().await;
    if let Some(progress) = core.updating.as_mut() {
        progress.result = Some(if success {
            json!(0)
        } else {
            json!(stderr_text)
        });
    }
    broadcast_updating(&core);

    if success {
        tracing::info!("upgrade complete, exiting for supervisor restart");
        std::process::exit(0);
    }

    tracing::error!(error = %stderr_text, "upgrade failed");
    core.updating = None;
}

async fn run_upgrade(server: &Arc<Server>) -> anyhow::Result<(bool, String)> {
    let mut child = tokio::process::Command::new("apt-get")
        .args([
            "dist-upgrade",
            "-y",
            "-o",
            "Dpkg::Options::=--force-confdef",
            "-o",
            "Dpkg::Options::=--force-confold",
        ])
        .env("DEBIAN_FRONTEND", "noninteractive")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(phase) = classify_line(&line) {
            let mut core = server.core.lock().await;
            if let Some(progress) = core.updating.as_mut() {
                progress.bump(phase);
            }
            broadcast_updating(&core);
        }
    }

    let mut stderr_text = String::new();
    let _ = stderr.read_to_string(&mut stderr_text).await;
    let status = child.wait().await?;
    Ok((status.success(), stderr_text.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simulated_upgrade_transcript() {
        let transcript = "\
Reading package lists...
Building dependency tree...
Calculating upgrade...
The following packages will be upgraded:
  libc6 openssl bondcast-encoder
12 upgraded, 3 newly installed, 0 to remove and 0 not upgraded.
Need to get 34.5 MB of archives.
After this operation, 1024 kB of additional disk space will be used.";
        let available = parse_upgrade_summary(transcript);
        assert_eq!(available.package_count, 15);
        assert_eq!(available.download_size.as_deref(), Some("34.5 MB"));
    }

    #[test]
    fn summary_without_downloads_has_no_size() {
        let available = parse_upgrade_summary(
            "0 upgraded, 0 newly installed, 0 to remove and 0 not upgraded.\n",
        );
        assert_eq!(available.package_count, 0);
        assert!(available.download_size.is_none());
    }

    #[test]
    fn classifies_apt_progress_lines() {
        assert_eq!(
            classify_line("Get:1 http://deb.example.org focal/main arm64 libc6 [1234 kB]"),
            Some(Phase::Downloading)
        );
        assert_eq!(
            classify_line("Unpacking libc6 (2.35-0ubuntu3) over (2.35-0ubuntu1) ..."),
            Some(Phase::Unpacking)
        );
        assert_eq!(
            classify_line("Setting up bondcast-encoder (1.4.2) ..."),
            Some(Phase::SettingUp)
        );
        assert_eq!(classify_line("Preparing to unpack .../libc6.deb ..."), None);
    }

    #[test]
    fn counters_are_monotone_and_clamped() {
        let mut progress = UpdateProgress {
            total: 2,
            ..Default::default()
        };
        progress.bump(Phase::Downloading);
        progress.bump(Phase::Downloading);
        progress.bump(Phase::Downloading);
        assert_eq!(progress.downloading, 2);

        // Unknown total: counters free-run.
        let mut progress = UpdateProgress::default();
        progress.bump(Phase::SettingUp);
        progress.bump(Phase::SettingUp);
        assert_eq!(progress.setting_up, 2);
    }
}
