//! Top-level message dispatch.
//!
//! A frame may carry several messages; each is routed to its
//! component. Only `auth` and `config` (for the first-run password
//! case) are admitted on unauthenticated connections — everything else
//! from an unauthenticated client is dropped. Authentication is
//! re-read per message so an `auth` earlier in the same frame takes
//! effect immediately.

use std::sync::Arc;

use bondcast_common::protocol::{parse_frame, ClientMessage};

use crate::netif;
use crate::server::{now_ms, Server};
use crate::session;
use crate::ssh;
use crate::streaming;
use crate::system;
use crate::updates;
use crate::wifi;

pub async fn handle_raw(server: &Arc<Server>, conn_id: u64, raw: &str, is_remote: bool) {
    let frame = match parse_frame(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed frame");
            return;
        }
    };

    {
        let mut core = server.core.lock().await;
        let Some(conn) = core.conns.get_mut(&conn_id) else {
            return;
        };
        conn.last_active = now_ms();
        if is_remote {
            conn.sender_id = frame.sender_id.clone();
        }
    }

    for message in frame.messages {
        let authenticated = {
            let core = server.core.lock().await;
            core.conns
                .get(&conn_id)
                .map(|c| c.authenticated)
                .unwrap_or(false)
        };

        match message {
            ClientMessage::Auth(msg) => session::handle_auth(server, conn_id, msg).await,
            ClientMessage::Config(msg) => {
                session::handle_config(server, conn_id, msg, is_remote).await
            }
            ClientMessage::Keepalive => {}
            ClientMessage::Start(msg) if authenticated => {
                streaming::start(server, conn_id, msg).await
            }
            ClientMessage::Stop if authenticated => streaming::stop(server).await,
            ClientMessage::Bitrate(msg) if authenticated => {
                streaming::set_bitrate(server, conn_id, msg).await
            }
            ClientMessage::Command(command) if authenticated => {
                handle_command(server, conn_id, &command).await
            }
            ClientMessage::Netif(msg) if authenticated => {
                netif::set_enabled(server, conn_id, &msg).await
            }
            ClientMessage::Wifi(msg) if authenticated => wifi::handle(server, conn_id, msg).await,
            ClientMessage::Logout if authenticated => session::handle_logout(server, conn_id).await,
            _ => {
                tracing::debug!(conn_id, "dropping message from unauthenticated connection");
            }
        }
    }
}

async fn handle_command(server: &Arc<Server>, conn_id: u64, command: &str) {
    match command {
        "poweroff" | "reboot" => system::power_command(server, command).await,
        "update" => updates::do_update(server, conn_id).await,
        "start_ssh" => ssh::start(server, conn_id).await,
        "stop_ssh" => ssh::stop(server, conn_id).await,
        "reset_ssh_pass" => ssh::reset_pass(server, conn_id).await,
        other => tracing::warn!(command = %other, "unknown command"),
    }
}
