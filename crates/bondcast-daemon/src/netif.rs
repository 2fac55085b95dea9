//! Network-interface monitor.
//!
//! Polls the local IPv4 interfaces once a second, computes per-tick
//! transmit deltas, and maintains the operator's enable flags. Address
//! changes while streaming trigger an uplink-file rewrite so the bonder
//! follows hotplugged links. Wireless interfaces feed the Wi-Fi device
//! index.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use bondcast_common::models::NetifEntry;
use bondcast_common::protocol::NetifMsg;

use crate::notify;
use crate::server::{now_ms, Server, ACTIVE_TO};

/// Interfaces that are never usable as uplinks: loopback, the docker
/// bridge, and the platform-internal bridge.
const EXCLUDED_PREFIXES: &[&str] = &["docker", "l4tbr"];

fn excluded(name: &str) -> bool {
    name == "lo" || EXCLUDED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// One observation from the OS: interface name, IPv4, cumulative
/// tx bytes.
pub struct Observation {
    pub name: String,
    pub ip: String,
    pub txb: u64,
}

/// Enumerate local IPv4 interfaces. First address per name wins.
pub fn list_ipv4() -> Vec<(String, Ipv4Addr)> {
    let mut out: Vec<(String, Ipv4Addr)> = Vec::new();
    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return out;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_addr.is_null() && (*ifa.ifa_addr).sa_family == libc::AF_INET as u16 {
                let name = std::ffi::CStr::from_ptr(ifa.ifa_name)
                    .to_string_lossy()
                    .into_owned();
                let addr = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
                if !out.iter().any(|(existing, _)| existing == &name) {
                    out.push((name, ip));
                }
            }
            current = ifa.ifa_next;
        }
        libc::freeifaddrs(ifaddrs);
    }
    out
}

fn read_txb(name: &str) -> u64 {
    std::fs::read_to_string(format!("/sys/class/net/{name}/statistics/tx_bytes"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn read_mac(name: &str) -> Option<String> {
    std::fs::read_to_string(format!("/sys/class/net/{name}/address"))
        .ok()
        .map(|s| s.trim().to_uppercase())
}

/// Fold a scan into the previous table. Enable flags persist for
/// surviving names, vanished names are dropped, and the returned flag
/// reports whether any interface appeared or changed address.
pub fn apply_scan(
    prev: &BTreeMap<String, NetifEntry>,
    scan: &[Observation],
) -> (BTreeMap<String, NetifEntry>, bool) {
    let mut table = BTreeMap::new();
    let mut uplink_changed = false;

    for obs in scan {
        let (tp, enabled) = match prev.get(&obs.name) {
            Some(entry) => {
                if entry.ip != obs.ip {
                    uplink_changed = true;
                }
                (obs.txb.saturating_sub(entry.txb), entry.enabled)
            }
            None => {
                uplink_changed = true;
                (0, true)
            }
        };
        table.insert(
            obs.name.clone(),
            NetifEntry {
                ip: obs.ip.clone(),
                txb: obs.txb,
                tp,
                enabled,
            },
        );
    }

    (table, uplink_changed)
}

pub async fn run_monitor(server: Arc<Server>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        poll_once(&server).await;
    }
}

pub async fn poll_once(server: &Arc<Server>) {
    let mut scan = Vec::new();
    let mut wireless = Vec::new();
    for (name, ip) in list_ipv4() {
        if excluded(&name) {
            continue;
        }
        if name.starts_with("wl") {
            if let Some(mac) = read_mac(&name) {
                wireless.push((mac, name.clone()));
            }
        }
        scan.push(Observation {
            txb: read_txb(&name),
            ip: ip.to_string(),
            name,
        });
    }

    let mut new_wifi_device = false;
    {
        let mut core = server.core.lock().await;
        let (table, uplink_changed) = apply_scan(&core.netif, &scan);
        core.netif = table;

        for (mac, ifname) in wireless {
            if core.wifi.observe(&mac, &ifname) {
                new_wifi_device = true;
            }
        }

        let value = core.netif_value();
        core.broadcast_active("netif", &value, now_ms() - ACTIVE_TO);

        if uplink_changed && core.is_streaming {
            crate::streaming::update_uplinks(&server.setup, &mut core);
        }
    }

    if new_wifi_device {
        tokio::spawn(crate::wifi::refresh_devices(server.clone()));
    }
}

/// Apply an operator enable/disable request. A no-op unless both the
/// name and IP still match the current entry; a disable that would
/// leave no enabled interface is rejected.
pub async fn set_enabled(server: &Arc<Server>, conn_id: u64, msg: &NetifMsg) {
    let mut core = server.core.lock().await;
    let Some(entry) = core.netif.get(&msg.name) else {
        return;
    };
    if entry.ip != msg.ip {
        return;
    }

    if entry.enabled && !msg.enabled {
        let enabled_count = core.netif.values().filter(|e| e.enabled).count();
        if enabled_count <= 1 {
            notify::error_to(
                &mut core,
                conn_id,
                "netif_disable_all",
                "at least one network interface must remain enabled",
                10,
            );
            let value = core.netif_value();
            core.send_to(conn_id, "netif", &value);
            return;
        }
    }

    if let Some(entry) = core.netif.get_mut(&msg.name) {
        entry.enabled = msg.enabled;
    }
    let value = core.netif_value();
    core.broadcast("netif", &value);

    if core.is_streaming {
        crate::streaming::update_uplinks(&server.setup, &mut core);
    }
}
