//! SSH access control.
//!
//! The appliance ships a single SSH account. The daemon can start and
//! stop the service, and can randomize the account password on the
//! operator's behalf — recording both the plaintext (for display) and
//! the resulting shadow hash, so a password changed behind its back is
//! detectable by comparison.

use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use serde_json::json;

use crate::notify;
use crate::server::Server;

const PASSWORD_LEN: usize = 20;
const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshStatus {
    pub user: String,
    pub active: bool,
    /// True when the account's shadow hash differs from the one the
    /// daemon last set — the password was changed out-of-band.
    pub user_pass: bool,
}

/// Random 20-character URL-safe password.
pub fn generate_password() -> String {
    let mut rng = rand::rng();
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_CHARSET[rng.random_range(0..PASSWORD_CHARSET.len())] as char)
        .collect()
}

/// Find a user's password hash in shadow-file content.
pub fn parse_shadow_hash(shadow: &str, user: &str) -> Option<String> {
    shadow.lines().find_map(|line| {
        let mut parts = line.split(':');
        if parts.next()? != user {
            return None;
        }
        parts.next().map(str::to_string)
    })
}

fn read_shadow_hash(user: &str) -> Option<String> {
    let shadow = std::fs::read_to_string("/etc/shadow").ok()?;
    parse_shadow_hash(&shadow, user)
}

async fn systemctl(args: &[&str]) -> bool {
    match tokio::process::Command::new("systemctl")
        .args(args)
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(e) => {
            tracing::warn!(error = %e, args = ?args, "systemctl failed");
            false
        }
    }
}

async fn current_status(server: &Arc<Server>) -> Option<SshStatus> {
    let user = server.setup.ssh_user.clone()?;
    let active = systemctl(&["is-active", "ssh"]).await;
    let shadow_hash = read_shadow_hash(&user);
    let recorded = {
        let core = server.core.lock().await;
        core.config.ssh_pass_hash.clone()
    };
    Some(SshStatus {
        user,
        active,
        user_pass: shadow_hash != recorded,
    })
}

/// Recompute the status and broadcast only when it changed.
pub async fn refresh(server: &Arc<Server>) {
    let Some(status) = current_status(server).await else {
        return;
    };
    let mut core = server.core.lock().await;
    if core.ssh.as_ref() == Some(&status) {
        return;
    }
    core.ssh = Some(status.clone());
    core.broadcast("status", &json!({ "ssh": status }));
}

pub async fn run_monitor(server: Arc<Server>) {
    if server.setup.ssh_user.is_none() {
        return;
    }
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tick.tick().await;
        refresh(&server).await;
    }
}

pub async fn start(server: &Arc<Server>, conn_id: u64) {
    let has_pass = {
        let core = server.core.lock().await;
        core.config.ssh_pass.is_some()
    };
    if !has_pass {
        reset_pass(server, conn_id).await;
    }
    if !systemctl(&["enable", "--now", "ssh"]).await {
        let mut core = server.core.lock().await;
        notify::error_to(&mut core, conn_id, "ssh", "failed to start the SSH service", 10);
    }
    refresh(server).await;
}

pub async fn stop(server: &Arc<Server>, conn_id: u64) {
    if !systemctl(&["disable", "--now", "ssh"]).await {
        let mut core = server.core.lock().await;
        notify::error_to(&mut core, conn_id, "ssh", "failed to stop the SSH service", 10);
    }
    refresh(server).await;
}

/// Randomize the account password and record plaintext + shadow hash.
pub async fn reset_pass(server: &Arc<Server>, conn_id: u64) {
    let Some(user) = server.setup.ssh_user.clone() else {
        let mut core = server.core.lock().await;
        notify::error_to(&mut core, conn_id, "ssh", "no SSH account on this build", 10);
        return;
    };

    let password = generate_password();
    match apply_password(&user, &password).await {
        Ok(()) => {
            let shadow_hash = read_shadow_hash(&user);
            let mut core = server.core.lock().await;
            core.config.ssh_pass = Some(password);
            core.config.ssh_pass_hash = shadow_hash;
            if let Err(e) = server.store.save_config(&core.config) {
                tracing::error!(error = %e, "failed to persist config");
            }
            tracing::info!(user = %user, "SSH password reset");
            let sanitized = core.config.sanitized();
            core.broadcast("config", &sanitized);
        }
        Err(e) => {
            tracing::error!(error = %e, "passwd failed");
            let mut core = server.core.lock().await;
            notify::error_to(
                &mut core,
                conn_id,
                "ssh",
                &format!("failed to set the SSH password: {e}"),
                10,
            );
        }
    }
    refresh(server).await;
}

async fn apply_password(user: &str, password: &str) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut child = tokio::process::Command::new("passwd")
        .arg(user)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(format!("{password}\n{password}\n").as_bytes())
            .await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        anyhow::bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_passwords_are_url_safe() {
        let password = generate_password();
        assert_eq!(password.chars().count(), PASSWORD_LEN);
        assert!(password
            .bytes()
            .all(|b| PASSWORD_CHARSET.contains(&b)));
        assert_ne!(generate_password(), generate_password());
    }

    #[test]
    fn shadow_hash_lookup_matches_the_user_only() {
        let shadow = "\
root:$6$rootsalt$roothash:19000:0:99999:7:::
field:$6$fieldsalt$fieldhash:19500:0:99999:7:::
daemon:*:18000:0:99999:7:::";
        assert_eq!(
            parse_shadow_hash(shadow, "field").as_deref(),
            Some("$6$fieldsalt$fieldhash")
        );
        assert_eq!(parse_shadow_hash(shadow, "daemon").as_deref(), Some("*"));
        assert!(parse_shadow_hash(shadow, "nobody").is_none());
    }
}
