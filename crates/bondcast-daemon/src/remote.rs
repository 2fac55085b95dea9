//! Remote tunnel client.
//!
//! Maintains one outbound WebSocket to the cloud relay so an operator
//! can reach the appliance from anywhere. Each attempt binds the
//! socket to the next uplink address in round-robin order, exercising a
//! different link every time. A key rejected by the relay blocks
//! reconnection until the operator sets a new one; network failures
//! retry after a second.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use bondcast_common::protocol::{RemoteAuth, REMOTE_PROTOCOL_VERSION};

use crate::router;
use crate::server::{now_ms, Server};
use crate::session;

/// Well-known relay endpoint.
pub const REMOTE_ENDPOINT: &str = "wss://relay.bondcast.net/ws/encoder";

/// Keepalive bound once authenticated, and the extra grace a fresh
/// connection gets to cover slow DNS and the TLS handshake.
const REMOTE_TIMEOUT_MS: i64 = 5_000;
const REMOTE_CONNECT_TIMEOUT_MS: i64 = 10_000;

pub async fn run(server: Arc<Server>) {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let Some((key, bind_ip)) = next_attempt(&server).await else {
            continue;
        };
        let Some(bind_ip) = bind_ip else {
            continue; // no uplink addresses yet
        };

        if let Err(e) = connect_and_run(&server, &key, &bind_ip).await {
            tracing::debug!(error = %e, bind_ip = %bind_ip, "tunnel connect failed");
            let core = server.core.lock().await;
            core.broadcast("status", &json!({ "remote": { "error": "network" } }));
        }
    }
}

/// Decide whether to dial, and from which source address. Inactive
/// without a configured key or while the current key stands rejected.
async fn next_attempt(server: &Arc<Server>) -> Option<(String, Option<String>)> {
    let mut core = server.core.lock().await;
    let key = core.config.remote_key.clone().filter(|k| !k.is_empty())?;
    if core.remote.failed_key.as_deref() == Some(key.as_str()) {
        return None;
    }
    let ips: Vec<String> = core
        .netif
        .values()
        .filter(|e| e.enabled)
        .map(|e| e.ip.clone())
        .collect();
    if ips.is_empty() {
        return Some((key, None));
    }
    let ip = ips[core.remote.rr % ips.len()].clone();
    core.remote.rr = core.remote.rr.wrapping_add(1);
    Some((key, Some(ip)))
}

enum Flow {
    Continue,
    Terminate,
}

async fn connect_and_run(server: &Arc<Server>, key: &str, bind_ip: &str) -> anyhow::Result<()> {
    let (host, port) = endpoint_host_port(REMOTE_ENDPOINT)?;
    let relay_addr = tokio::net::lookup_host((host, port))
        .await?
        .find(SocketAddr::is_ipv4)
        .context("relay has no IPv4 address")?;

    let socket = tokio::net::TcpSocket::new_v4()?;
    socket.bind(SocketAddr::new(bind_ip.parse()?, 0))?;
    let stream = socket.connect(relay_addr).await?;
    let (ws, _response) = tokio_tungstenite::client_async_tls(REMOTE_ENDPOINT, stream).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // From here on the tunnel is a registered connection; failures are
    // handled through the close path, not the connect path.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (conn_id, generation) = {
        let mut core = server.core.lock().await;
        let conn_id = core.register_conn(tx, true);
        core.remote.conn_id = Some(conn_id);
        core.remote.suppress_close_error = false;
        (conn_id, core.remote.generation)
    };
    tracing::info!(bind_ip = %bind_ip, "tunnel connected, authenticating");

    let auth = json!({
        "remote": {
            "auth/encoder": RemoteAuth {
                key: key.to_string(),
                version: REMOTE_PROTOCOL_VERSION,
            }
        }
    });
    let _ = ws_tx.send(Message::Text(auth.to_string().into())).await;

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Flow::Terminate =
                            handle_inbound(server, conn_id, text.as_str()).await
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("relay closed the tunnel");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "tunnel read error");
                        break;
                    }
                    _ => {}
                }
            }

            _ = tick.tick() => {
                let mut core = server.core.lock().await;
                if core.remote.generation != generation {
                    // Rekeyed: tear down quietly and redial.
                    core.remote.suppress_close_error = true;
                    break;
                }
                let Some(conn) = core.conns.get(&conn_id) else { break };
                let timeout = if conn.authenticated {
                    REMOTE_TIMEOUT_MS
                } else {
                    REMOTE_CONNECT_TIMEOUT_MS
                };
                if now_ms() - conn.last_active > timeout {
                    tracing::warn!("tunnel stale, reconnecting");
                    break;
                }
            }
        }
    }

    let mut core = server.core.lock().await;
    core.remove_conn(conn_id);
    if core.remote.suppress_close_error {
        core.remote.suppress_close_error = false;
    } else {
        core.broadcast("status", &json!({ "remote": { "error": "network" } }));
    }
    Ok(())
}

/// Handle one frame from the relay: relay control under the `remote`
/// key is consumed here, everything else bridges into the router as a
/// remote client frame.
async fn handle_inbound(server: &Arc<Server>, conn_id: u64, raw: &str) -> Flow {
    {
        let mut core = server.core.lock().await;
        if let Some(conn) = core.conns.get_mut(&conn_id) {
            conn.last_active = now_ms();
        }
    }

    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed tunnel frame");
            return Flow::Continue;
        }
    };

    if let Some(result) = value.get("remote").and_then(|r| r.get("auth/encoder")) {
        match result.as_bool() {
            Some(true) => {
                let mut core = server.core.lock().await;
                if let Some(conn) = core.conns.get_mut(&conn_id) {
                    conn.authenticated = true;
                }
                tracing::info!("relay accepted the tunnel key");
                core.broadcast("status", &json!({ "remote": true }));
                session::send_initial_state(server, &mut core, conn_id);
            }
            Some(false) => {
                let mut core = server.core.lock().await;
                core.remote.failed_key = core.config.remote_key.clone();
                core.remote.suppress_close_error = true;
                tracing::error!("relay rejected the tunnel key");
                core.broadcast("status", &json!({ "remote": { "error": "key" } }));
                return Flow::Terminate;
            }
            None => {}
        }
        return Flow::Continue;
    }

    router::handle_raw(server, conn_id, raw, true).await;
    Flow::Continue
}

/// Host and port of the relay endpoint URL.
fn endpoint_host_port(url: &str) -> anyhow::Result<(&str, u16)> {
    let rest = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .context("unsupported relay URL scheme")?;
    let default_port = if url.starts_with("wss://") { 443 } else { 80 };
    let authority = rest.split('/').next().unwrap_or(rest);
    match authority.split_once(':') {
        Some((host, port)) => Ok((host, port.parse()?)),
        None => Ok((authority, default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_server;
    use bondcast_common::models::NetifEntry;

    #[test]
    fn endpoint_host_port_handles_defaults_and_overrides() {
        assert_eq!(
            endpoint_host_port("wss://relay.bondcast.net/ws/encoder").unwrap(),
            ("relay.bondcast.net", 443)
        );
        assert_eq!(
            endpoint_host_port("ws://localhost:8080/ws").unwrap(),
            ("localhost", 8080)
        );
        assert!(endpoint_host_port("https://nope").is_err());
    }

    #[tokio::test]
    async fn attempts_require_a_key_and_rotate_uplinks() {
        let (server, _dir) = test_server();
        let server = Arc::new(server);

        // No key: inactive.
        assert!(next_attempt(&server).await.is_none());

        {
            let mut core = server.core.lock().await;
            core.config.remote_key = Some("k".into());
            for (name, ip) in [("eth0", "10.0.0.2"), ("wlan0", "10.0.1.2")] {
                core.netif.insert(
                    name.into(),
                    NetifEntry {
                        ip: ip.into(),
                        txb: 0,
                        tp: 0,
                        enabled: true,
                    },
                );
            }
        }

        let first = next_attempt(&server).await.unwrap().1.unwrap();
        let second = next_attempt(&server).await.unwrap().1.unwrap();
        let third = next_attempt(&server).await.unwrap().1.unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn rejected_key_blocks_reconnection_until_rekey() {
        let (server, _dir) = test_server();
        let server = Arc::new(server);
        {
            let mut core = server.core.lock().await;
            core.config.remote_key = Some("bad".into());
            core.remote.failed_key = Some("bad".into());
        }
        assert!(next_attempt(&server).await.is_none());

        {
            let mut core = server.core.lock().await;
            core.config.remote_key = Some("fresh".into());
        }
        assert!(next_attempt(&server).await.is_some());
    }
}
