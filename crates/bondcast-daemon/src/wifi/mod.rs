//! Wi-Fi management through NetworkManager.
//!
//! The daemon keeps a device index keyed by hardware address; numeric
//! ids handed to clients are stable only for the process lifetime. A
//! refresh rebuilds the index in three phases — saved profiles, scan
//! results, devices — and device membership changes trigger a rescan
//! with follow-up scan-result refreshes, because NetworkManager
//! populates results asynchronously.

pub mod nmcli;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use bondcast_common::models::{WifiDevice, WifiNetwork};
use bondcast_common::protocol::{WifiMsg, WifiNewMsg};

use crate::server::Server;

/// Timeout handed to `nmcli --wait` when associating with a new
/// network.
const CONNECT_TIMEOUT_SECS: u32 = 15;

/// Scan results trickle in after a rescan; refresh at these offsets.
const SCAN_POLL_SECS: &[u64] = &[1, 3, 5, 10];

// ── Device index ────────────────────────────────────────────────────

/// The wireless device index: MAC → device, plus the id ↔ MAC maps.
/// The id → MAC map is rebuilt on every device-list refresh.
#[derive(Default)]
pub struct WifiIndex {
    devices: HashMap<String, WifiDevice>,
    ids: HashMap<u32, String>,
    mac_ids: HashMap<String, u32>,
    next_id: u32,
}

impl WifiIndex {
    /// Record a MAC + interface observation from the interface
    /// monitor. Returns true when the device was previously unknown.
    pub fn observe(&mut self, mac: &str, ifname: &str) -> bool {
        if let Some(device) = self.devices.get_mut(mac) {
            device.ifname = ifname.to_string();
            return false;
        }
        let id = self.fresh_id();
        self.devices.insert(
            mac.to_string(),
            WifiDevice {
                ifname: ifname.to_string(),
                hw: mac.to_string(),
                ..Default::default()
            },
        );
        self.mac_ids.insert(mac.to_string(), id);
        self.ids.insert(id, mac.to_string());
        true
    }

    /// Apply a device-list refresh: `(mac, ifname, active connection)`
    /// triples. Returns true when membership changed.
    pub fn apply_devices(&mut self, rows: Vec<(String, String, Option<String>)>) -> bool {
        let mut changed = false;
        let seen: HashSet<String> = rows.iter().map(|(mac, _, _)| mac.clone()).collect();

        for (mac, ifname, conn) in rows {
            match self.devices.get_mut(&mac) {
                Some(device) => {
                    device.ifname = ifname;
                    device.conn = conn;
                }
                None => {
                    let id = self.fresh_id();
                    self.devices.insert(
                        mac.clone(),
                        WifiDevice {
                            ifname,
                            conn,
                            hw: mac.clone(),
                            ..Default::default()
                        },
                    );
                    self.mac_ids.insert(mac, id);
                    changed = true;
                }
            }
        }

        let gone: Vec<String> = self
            .devices
            .keys()
            .filter(|mac| !seen.contains(*mac))
            .cloned()
            .collect();
        for mac in gone {
            self.devices.remove(&mac);
            self.mac_ids.remove(&mac);
            changed = true;
        }

        self.ids = self
            .mac_ids
            .iter()
            .map(|(mac, id)| (*id, mac.clone()))
            .collect();
        changed
    }

    fn fresh_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn mac_for_id(&self, id: u32) -> Option<&String> {
        self.ids.get(&id)
    }

    pub fn device(&self, mac: &str) -> Option<&WifiDevice> {
        self.devices.get(mac)
    }

    pub fn device_mut(&mut self, mac: &str) -> Option<&mut WifiDevice> {
        self.devices.get_mut(mac)
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut WifiDevice> {
        self.devices.values_mut()
    }

    /// The wire form: numeric id → device.
    pub fn status_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (id, mac) in &self.ids {
            if let Some(device) = self.devices.get(mac) {
                map.insert(
                    id.to_string(),
                    serde_json::to_value(device).expect("wifi device"),
                );
            }
        }
        Value::Object(map)
    }
}

/// Dedupe scan rows by SSID, preferring the entry marked active, then
/// the stronger signal.
pub fn dedupe_networks(rows: Vec<WifiNetwork>) -> Vec<WifiNetwork> {
    let mut by_ssid: HashMap<String, WifiNetwork> = HashMap::new();
    for row in rows {
        match by_ssid.get(&row.ssid) {
            Some(existing) if existing.active => {}
            Some(existing) if !row.active && existing.signal >= row.signal => {}
            _ => {
                by_ssid.insert(row.ssid.clone(), row);
            }
        }
    }
    let mut networks: Vec<WifiNetwork> = by_ssid.into_values().collect();
    networks.sort_by(|a, b| b.signal.cmp(&a.signal));
    networks
}

// ── Refresh phases ──────────────────────────────────────────────────

async fn broadcast_status(server: &Arc<Server>) {
    let core = server.core.lock().await;
    let wifi = core.wifi.status_value();
    core.broadcast("status", &json!({ "wifi": wifi }));
}

/// Phase 1: read saved wireless profiles and attach SSID → UUID maps
/// to the devices they are bound to.
pub async fn refresh_saved(server: &Arc<Server>) {
    let output = match nmcli::run(&["-t", "-f", "NAME,UUID,TYPE,TIMESTAMP", "connection", "show"])
        .await
    {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(error = %e, "nmcli connection show failed");
            return;
        }
    };

    let mut bindings: Vec<(String, String, String)> = Vec::new();
    for row in nmcli::parse_connections(&output) {
        if !row.ctype.contains("wireless") {
            continue;
        }
        let detail = match nmcli::run(&[
            "-t",
            "-f",
            "802-11-wireless.mac-address,802-11-wireless.ssid",
            "connection",
            "show",
            "uuid",
            &row.uuid,
        ])
        .await
        {
            Ok(detail) => detail,
            Err(_) => continue,
        };
        let fields = nmcli::parse_show_fields(&detail);
        let mac = fields
            .get("802-11-wireless.mac-address")
            .map(|m| m.to_uppercase());
        let ssid = fields.get("802-11-wireless.ssid");
        if let (Some(mac), Some(ssid)) = (mac, ssid) {
            if !ssid.is_empty() {
                bindings.push((mac, ssid.clone(), row.uuid.clone()));
            }
        }
    }

    let mut core = server.core.lock().await;
    for device in core.wifi.devices_mut() {
        device.saved.clear();
    }
    for (mac, ssid, uuid) in bindings {
        if let Some(device) = core.wifi.device_mut(&mac) {
            device.saved.insert(ssid, uuid);
        }
    }
}

/// Phase 2: visible networks per device.
pub async fn refresh_scan(server: &Arc<Server>) {
    let output = match nmcli::run(&[
        "-t",
        "-f",
        "ACTIVE,SSID,SIGNAL,SECURITY,FREQ,DEVICE",
        "device",
        "wifi",
        "list",
    ])
    .await
    {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(error = %e, "nmcli wifi list failed");
            return;
        }
    };

    let mut by_ifname: HashMap<String, Vec<WifiNetwork>> = HashMap::new();
    for row in nmcli::parse_wifi_list(&output) {
        by_ifname.entry(row.device).or_default().push(row.network);
    }

    {
        let mut core = server.core.lock().await;
        for device in core.wifi.devices_mut() {
            let rows = by_ifname.remove(&device.ifname).unwrap_or_default();
            device.available = dedupe_networks(rows);
        }
    }
    broadcast_status(server).await;
}

/// Phase 3: the device list itself. New MACs get fresh ids; a
/// membership change refreshes profiles and kicks off a rescan.
pub async fn refresh_devices(server: Arc<Server>) {
    let output = match nmcli::run(&["-t", "-f", "DEVICE,TYPE,STATE,CON-UUID", "device", "status"])
        .await
    {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(error = %e, "nmcli device status failed");
            return;
        }
    };

    let mut rows: Vec<(String, String, Option<String>)> = Vec::new();
    for row in nmcli::parse_device_status(&output) {
        if row.dtype != "wifi" {
            continue;
        }
        let detail = match nmcli::run(&["-t", "-f", "GENERAL.HWADDR", "device", "show", &row.device])
            .await
        {
            Ok(detail) => detail,
            Err(_) => continue,
        };
        let fields = nmcli::parse_show_fields(&detail);
        if let Some(mac) = fields.get("GENERAL.HWADDR") {
            rows.push((mac.to_uppercase(), row.device.clone(), row.con_uuid.clone()));
        }
    }

    let changed = {
        let mut core = server.core.lock().await;
        core.wifi.apply_devices(rows)
    };

    if changed {
        refresh_saved(&server).await;
        let _ = nmcli::run(&["device", "wifi", "rescan"]).await;
        schedule_scan_polls(&server);
    }
    broadcast_status(&server).await;
}

fn schedule_scan_polls(server: &Arc<Server>) {
    for &secs in SCAN_POLL_SECS {
        let server = server.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            refresh_scan(&server).await;
        });
    }
}

// ── Client operations ───────────────────────────────────────────────

pub async fn handle(server: &Arc<Server>, conn_id: u64, msg: WifiMsg) {
    if let Some(uuid) = msg.connect {
        op_connect(server, conn_id, &uuid).await;
    }
    if let Some(uuid) = msg.disconnect {
        op_disconnect(server, &uuid).await;
    }
    if msg.scan.is_some() {
        op_scan(server).await;
    }
    if let Some(new) = msg.new {
        op_new(server, conn_id, new).await;
    }
    if let Some(uuid) = msg.forget {
        op_forget(server, &uuid).await;
    }
}

async fn op_scan(server: &Arc<Server>) {
    if let Err(e) = nmcli::run(&["device", "wifi", "rescan"]).await {
        tracing::warn!(error = %e, "wifi rescan failed");
    }
    schedule_scan_polls(server);
}

async fn op_connect(server: &Arc<Server>, conn_id: u64, uuid: &str) {
    let success = match nmcli::run(&["connection", "up", "uuid", uuid]).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(uuid, error = %e, "wifi connect failed");
            false
        }
    };
    {
        let core = server.core.lock().await;
        core.send_to(conn_id, "wifi", &json!({ "connect": { "uuid": uuid, "success": success } }));
    }
    refresh_devices(server.clone()).await;
}

async fn op_disconnect(server: &Arc<Server>, uuid: &str) {
    if let Err(e) = nmcli::run(&["connection", "down", "uuid", uuid]).await {
        tracing::warn!(uuid, error = %e, "wifi disconnect failed");
    }
    refresh_devices(server.clone()).await;
}

async fn op_forget(server: &Arc<Server>, uuid: &str) {
    if let Err(e) = nmcli::run(&["connection", "delete", "uuid", uuid]).await {
        tracing::warn!(uuid, error = %e, "wifi forget failed");
    }
    refresh_saved(server).await;
    refresh_devices(server.clone()).await;
}

async fn op_new(server: &Arc<Server>, conn_id: u64, msg: WifiNewMsg) {
    let ifname = {
        let core = server.core.lock().await;
        core.wifi
            .mac_for_id(msg.device)
            .and_then(|mac| core.wifi.device(mac))
            .map(|device| device.ifname.clone())
    };
    let Some(ifname) = ifname else {
        let core = server.core.lock().await;
        core.send_to(
            conn_id,
            "wifi",
            &json!({ "new": { "device": msg.device, "error": "generic" } }),
        );
        return;
    };

    let timeout = CONNECT_TIMEOUT_SECS.to_string();
    let mut args: Vec<&str> = vec![
        "-w",
        &timeout,
        "device",
        "wifi",
        "connect",
        &msg.ssid,
        "ifname",
        &ifname,
    ];
    if let Some(password) = &msg.password {
        args.push("password");
        args.push(password);
    }

    match nmcli::run(&args).await {
        Ok(_) => {
            {
                let core = server.core.lock().await;
                core.send_to(
                    conn_id,
                    "wifi",
                    &json!({ "new": { "device": msg.device, "success": true } }),
                );
            }
            refresh_saved(server).await;
            refresh_devices(server.clone()).await;
        }
        Err(e) => {
            let kind = classify_connect_error(&e.to_string());
            tracing::warn!(ssid = %msg.ssid, error = %e, "wifi association failed");
            gc_failed_profiles().await;
            let core = server.core.lock().await;
            core.send_to(
                conn_id,
                "wifi",
                &json!({ "new": { "device": msg.device, "error": kind } }),
            );
        }
    }
}

/// Classify an association failure from the nmcli error stream.
pub fn classify_connect_error(stderr: &str) -> &'static str {
    if stderr.contains("Secrets were required") {
        "auth"
    } else {
        "generic"
    }
}

/// Delete wireless profiles that never activated (timestamp 0) —
/// leftovers from failed association attempts.
async fn gc_failed_profiles() {
    let Ok(output) =
        nmcli::run(&["-t", "-f", "NAME,UUID,TYPE,TIMESTAMP", "connection", "show"]).await
    else {
        return;
    };
    for row in nmcli::parse_connections(&output) {
        if row.ctype.contains("wireless") && row.timestamp == 0 {
            tracing::info!(name = %row.name, "removing never-activated wifi profile");
            let _ = nmcli::run(&["connection", "delete", "uuid", &row.uuid]).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(ssid: &str, active: bool, signal: u8) -> WifiNetwork {
        WifiNetwork {
            active,
            ssid: ssid.into(),
            signal,
            security: "WPA2".into(),
            freq: 2412,
        }
    }

    #[test]
    fn observe_assigns_ids_once() {
        let mut index = WifiIndex::default();
        assert!(index.observe("AA:BB:CC:DD:EE:FF", "wlan0"));
        assert!(!index.observe("AA:BB:CC:DD:EE:FF", "wlan0"));
        assert_eq!(index.mac_for_id(1).map(String::as_str), Some("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn apply_devices_tracks_membership_and_rebuilds_ids() {
        let mut index = WifiIndex::default();
        let changed = index.apply_devices(vec![
            ("AA:AA:AA:AA:AA:AA".into(), "wlan0".into(), None),
            ("BB:BB:BB:BB:BB:BB".into(), "wlan1".into(), Some("uuid-1".into())),
        ]);
        assert!(changed);
        assert_eq!(index.status_value().as_object().unwrap().len(), 2);

        // Same membership: no change, conn updated.
        let changed = index.apply_devices(vec![
            ("AA:AA:AA:AA:AA:AA".into(), "wlan0".into(), Some("uuid-2".into())),
            ("BB:BB:BB:BB:BB:BB".into(), "wlan1".into(), None),
        ]);
        assert!(!changed);
        assert_eq!(
            index.device("AA:AA:AA:AA:AA:AA").unwrap().conn.as_deref(),
            Some("uuid-2")
        );

        // Removal.
        let changed = index.apply_devices(vec![(
            "AA:AA:AA:AA:AA:AA".into(),
            "wlan0".into(),
            None,
        )]);
        assert!(changed);
        assert!(index.device("BB:BB:BB:BB:BB:BB").is_none());
        assert!(index.mac_for_id(2).is_none(), "id map not rebuilt");
    }

    #[test]
    fn ids_are_not_reused_within_a_process() {
        let mut index = WifiIndex::default();
        index.apply_devices(vec![("AA:AA:AA:AA:AA:AA".into(), "wlan0".into(), None)]);
        index.apply_devices(vec![]);
        index.apply_devices(vec![("AA:AA:AA:AA:AA:AA".into(), "wlan0".into(), None)]);
        assert!(index.mac_for_id(1).is_none());
        assert_eq!(
            index.mac_for_id(2).map(String::as_str),
            Some("AA:AA:AA:AA:AA:AA")
        );
    }

    #[test]
    fn dedupe_prefers_active_then_signal() {
        let networks = dedupe_networks(vec![
            net("field-ap", false, 80),
            net("field-ap", true, 40),
            net("cafe", false, 30),
            net("cafe", false, 60),
        ]);
        assert_eq!(networks.len(), 2);
        let field = networks.iter().find(|n| n.ssid == "field-ap").unwrap();
        assert!(field.active);
        assert_eq!(field.signal, 40);
        let cafe = networks.iter().find(|n| n.ssid == "cafe").unwrap();
        assert_eq!(cafe.signal, 60);
    }

    #[test]
    fn connect_errors_classify_auth_vs_generic() {
        assert_eq!(
            classify_connect_error("Error: Connection activation failed: Secrets were required, but not provided."),
            "auth"
        );
        assert_eq!(classify_connect_error("Error: timeout expired."), "generic");
    }
}
