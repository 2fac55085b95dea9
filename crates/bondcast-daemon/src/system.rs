//! Power commands and component revisions.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::server::Server;
use crate::streaming;

/// OS release string shipped by the image build, if present.
const RELEASE_FILE: &str = "/etc/bondcast_release";

/// Component revision strings sent with initial state.
pub fn revisions() -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert("bondcastd".to_string(), env!("CARGO_PKG_VERSION").to_string());
    if let Ok(release) = std::fs::read_to_string(RELEASE_FILE) {
        let release = release.trim();
        if !release.is_empty() {
            map.insert("image".to_string(), release.to_string());
        }
    }
    map
}

/// Shut down or reboot the appliance. Streaming is stopped first so
/// the children exit cleanly before the OS goes away.
pub async fn power_command(server: &Arc<Server>, action: &str) {
    streaming::stop(server).await;
    tracing::info!(action, "power command");
    let status = tokio::process::Command::new("systemctl")
        .arg(action)
        .status()
        .await;
    if let Err(e) = status {
        tracing::error!(action, error = %e, "systemctl failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revisions_always_carry_the_daemon_version() {
        let map = revisions();
        assert_eq!(map.get("bondcastd").unwrap(), env!("CARGO_PKG_VERSION"));
    }
}
