//! Data models for the bondcast appliance.
//!
//! These types represent the persisted on-disk documents and the live
//! state the daemon broadcasts to connected operators.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Setup ───────────────────────────────────────────────────────────

/// Read-only appliance description, loaded once at startup from
/// `setup.json`. Written by the image build, never by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setup {
    /// Platform tag, e.g. `"rk3588"`. Selects the platform-specific
    /// pipeline directory and sensor paths.
    pub platform: String,
    /// Path to the encoder executable.
    pub encoder_bin: String,
    /// Path to the link-bonding sender executable.
    pub bonder_bin: String,
    /// Root of the pipeline description tree.
    pub pipelines_dir: String,
    /// File the encoder re-reads on SIGHUP: min and max bitrate in
    /// bits/s, one per line.
    pub bitrate_file: String,
    /// File the bonder re-reads on SIGHUP: one source IPv4 per line.
    pub ips_file: String,
    /// Account used for SSH access, when the image ships one.
    #[serde(default)]
    pub ssh_user: Option<String>,
    /// Whether OS package upgrades may be orchestrated on this build.
    #[serde(default)]
    pub apt_upgrades: bool,
}

// ── Config ──────────────────────────────────────────────────────────

/// Persisted operator configuration (`config.json`).
///
/// `ssh_pass_hash` lives on disk next to the rest but is conceptually
/// separate: it is the daemon's own record of the hash it last wrote to
/// `/etc/shadow` and never leaves the appliance. [`Config::sanitized`]
/// is the only form that may be broadcast.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<i64>,
    /// Pipeline id (hex digest of its relative path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    /// Maximum encoder bitrate in kbps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_br: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srt_latency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srt_streamid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srtla_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srtla_port: Option<u16>,
    /// Plaintext SSH password, shown to the authenticated operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_pass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_pass_hash: Option<String>,
}

impl Config {
    /// The broadcastable view of the config: everything except the
    /// password hash and the shadow-hash record.
    pub fn sanitized(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).expect("config serialization");
        if let Some(map) = value.as_object_mut() {
            map.remove("password_hash");
            map.remove("ssh_pass_hash");
        }
        value
    }
}

// ── Network interfaces ──────────────────────────────────────────────

/// One monitored network interface, keyed by name in the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetifEntry {
    /// IPv4 address. Interfaces without one are not tracked.
    pub ip: String,
    /// Cumulative transmitted bytes, from sysfs.
    pub txb: u64,
    /// Throughput delta over the last poll tick, in bytes.
    pub tp: u64,
    /// Whether the operator allows this interface as an uplink.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

// ── Wi-Fi ───────────────────────────────────────────────────────────

/// A visible wireless network, deduped by SSID per device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub active: bool,
    pub ssid: String,
    /// Signal strength 0–100.
    pub signal: u8,
    /// Security string as reported by the network manager, e.g. "WPA2".
    pub security: String,
    /// Frequency in MHz.
    pub freq: u32,
}

/// A wireless device tracked by the Wi-Fi manager.
///
/// Keyed by MAC in the device index; the numeric id handed to clients
/// is stable only for the lifetime of the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WifiDevice {
    pub ifname: String,
    /// UUID of the active connection, if associated.
    pub conn: Option<String>,
    /// Hardware (MAC) address.
    pub hw: String,
    /// Visible networks from the last scan.
    pub available: Vec<WifiNetwork>,
    /// Saved network profiles bound to this device: SSID → UUID.
    pub saved: HashMap<String, String>,
}

// ── Notifications ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Success,
    Warning,
    Error,
}

/// Wire form of a notification, as carried in `notification.show`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationView {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub msg: String,
    pub is_dismissable: bool,
    pub is_persistent: bool,
    /// Remaining display time in seconds; 0 means permanent.
    pub duration: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_config_has_no_secrets() {
        let config = Config {
            password_hash: Some("$argon2id$x".into()),
            remote_key: Some("key".into()),
            max_br: Some(4000),
            ssh_pass: Some("display-me".into()),
            ssh_pass_hash: Some("$6$shadow".into()),
            ..Default::default()
        };
        let value = config.sanitized();
        let map = value.as_object().unwrap();
        assert!(!map.contains_key("password_hash"));
        assert!(!map.contains_key("ssh_pass_hash"));
        assert_eq!(map["remote_key"], "key");
        assert_eq!(map["max_br"], 4000);
        assert_eq!(map["ssh_pass"], "display-me");
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config {
            delay: Some(-500),
            pipeline: Some("abc123".into()),
            max_br: Some(6000),
            srt_latency: Some(2000),
            srt_streamid: Some("".into()),
            srtla_addr: Some("relay.example.com".into()),
            srtla_port: Some(5000),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.delay, Some(-500));
        assert_eq!(back.srt_streamid.as_deref(), Some(""));
        assert_eq!(back.srtla_port, Some(5000));
        assert!(back.password_hash.is_none());
    }

    #[test]
    fn netif_entry_enabled_defaults_true() {
        let entry: NetifEntry =
            serde_json::from_str(r#"{"ip":"10.0.0.2","txb":100,"tp":0}"#).unwrap();
        assert!(entry.enabled);
    }
}
