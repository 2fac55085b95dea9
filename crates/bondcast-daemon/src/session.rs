//! Session and authentication layer.
//!
//! One shared operator password; successful verification issues an
//! opaque 256-bit token into the transient set, or the persistent
//! (on-disk) set when the client asked to stay logged in. Membership in
//! either set authenticates; logout removes from both.

use std::sync::Arc;

use serde_json::json;

use bondcast_common::auth;
use bondcast_common::models::NotificationKind;
use bondcast_common::protocol::{AuthMsg, ConfigMsg};

use crate::notify;
use crate::server::{Core, Server};
use crate::streaming;

pub const MIN_PASSWORD_LEN: usize = 8;

/// Everything a newly authenticated client needs to render the UI.
pub fn send_initial_state(server: &Server, core: &mut Core, conn_id: u64) {
    let config = core.config.sanitized();
    core.send_to(conn_id, "config", &config);
    core.send_to(conn_id, "pipelines", &streaming::pipelines_value(server));
    let status = core.status_value();
    core.send_to(conn_id, "status", &status);
    let netif = core.netif_value();
    core.send_to(conn_id, "netif", &netif);
    let sensors = serde_json::to_value(&core.sensors).unwrap_or_default();
    core.send_to(conn_id, "sensors", &sensors);
    let revisions = serde_json::to_value(&core.revisions).unwrap_or_default();
    core.send_to(conn_id, "revisions", &revisions);
    notify::replay(core, conn_id);
}

pub async fn handle_auth(server: &Arc<Server>, conn_id: u64, msg: AuthMsg) {
    if let Some(token) = msg.token {
        let mut core = server.core.lock().await;
        let known =
            core.persistent_tokens.contains(&token) || core.transient_tokens.contains(&token);
        if known {
            if let Some(conn) = core.conns.get_mut(&conn_id) {
                conn.authenticated = true;
                conn.auth_token = Some(token);
            }
            core.send_to(conn_id, "auth", &json!({ "success": true }));
            send_initial_state(server, &mut core, conn_id);
        } else {
            core.send_to(conn_id, "auth", &json!({ "success": false }));
        }
        return;
    }

    let Some(password) = msg.password else {
        return;
    };

    let hash = { server.core.lock().await.config.password_hash.clone() };
    let Some(hash) = hash else {
        let core = server.core.lock().await;
        core.send_to(conn_id, "auth", &json!({ "success": false }));
        return;
    };

    // Verification is CPU-bound; run it off the executor.
    let verified = tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or(false);

    let mut core = server.core.lock().await;
    if !core.conns.contains_key(&conn_id) {
        return; // client left during verification
    }
    if !verified {
        core.send_to(conn_id, "auth", &json!({ "success": false }));
        return;
    }

    let token = auth::generate_token();
    if msg.persistent_token {
        core.persistent_tokens.insert(token.clone());
        if let Err(e) = server.store.save_tokens(&core.persistent_tokens) {
            tracing::error!(error = %e, "failed to persist token file");
        }
    } else {
        core.transient_tokens.insert(token.clone());
    }
    if let Some(conn) = core.conns.get_mut(&conn_id) {
        conn.authenticated = true;
        conn.auth_token = Some(token.clone());
    }
    core.send_to(conn_id, "auth", &json!({ "success": true, "auth_token": token }));
    send_initial_state(server, &mut core, conn_id);
}

pub async fn handle_config(server: &Arc<Server>, conn_id: u64, msg: ConfigMsg, is_remote: bool) {
    if let Some(password) = msg.password {
        set_password(server, conn_id, password, is_remote).await;
    }
    if let Some(key) = msg.remote_key {
        set_remote_key(server, conn_id, key).await;
    }
}

/// Set the shared operator password. Allowed for authenticated
/// connections, and for unauthenticated *local* connections while no
/// password is configured (first-run setup).
async fn set_password(server: &Arc<Server>, conn_id: u64, password: String, is_remote: bool) {
    {
        let mut core = server.core.lock().await;
        let authenticated = core
            .conns
            .get(&conn_id)
            .map(|c| c.authenticated)
            .unwrap_or(false);
        let allowed = authenticated || (core.config.password_hash.is_none() && !is_remote);
        if !allowed {
            tracing::warn!(conn_id, "password change rejected");
            return;
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            notify::error_to(
                &mut core,
                conn_id,
                "config_password",
                "Minimum password length: 8 characters",
                10,
            );
            return;
        }
    }

    let hashed = tokio::task::spawn_blocking(move || auth::hash_password(&password)).await;
    let hash = match hashed {
        Ok(Ok(hash)) => hash,
        other => {
            tracing::error!(result = ?other.err(), "password hashing failed");
            return;
        }
    };

    let mut core = server.core.lock().await;
    core.config.password_hash = Some(hash);
    if let Err(e) = server.store.save_config(&core.config) {
        tracing::error!(error = %e, "failed to persist config");
    }
    tracing::info!("operator password updated");
    notify::send(
        &mut core,
        Some(conn_id),
        "config_password",
        NotificationKind::Success,
        "Password set",
        5,
        false,
        true,
    );
    let status = core.status_value();
    core.send_to(conn_id, "status", &status);
}

/// Store a new relay key and cycle the tunnel onto it. The live tunnel
/// (if any) is torn down quietly; a previously rejected key no longer
/// blocks reconnection.
async fn set_remote_key(server: &Arc<Server>, conn_id: u64, key: String) {
    let mut core = server.core.lock().await;
    let authenticated = core
        .conns
        .get(&conn_id)
        .map(|c| c.authenticated)
        .unwrap_or(false);
    if !authenticated {
        return;
    }

    core.config.remote_key = (!key.is_empty()).then_some(key);
    if let Err(e) = server.store.save_config(&core.config) {
        tracing::error!(error = %e, "failed to persist config");
    }
    core.remote.failed_key = None;
    core.remote.generation += 1;
    tracing::info!("remote key updated, cycling tunnel");

    let sanitized = core.config.sanitized();
    core.broadcast_except(conn_id, "config", &sanitized);
}

pub async fn handle_logout(server: &Arc<Server>, conn_id: u64) {
    let mut core = server.core.lock().await;
    let Some(conn) = core.conns.get_mut(&conn_id) else {
        return;
    };
    let token = conn.auth_token.take();
    conn.authenticated = false;

    if let Some(token) = token {
        core.transient_tokens.remove(&token);
        if core.persistent_tokens.remove(&token) {
            if let Err(e) = server.store.save_tokens(&core.persistent_tokens) {
                tracing::error!(error = %e, "failed to persist token file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_server;
    use tokio::sync::mpsc;

    async fn attach(server: &Server) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut core = server.core.lock().await;
        let id = core.register_conn(tx, false);
        (id, rx)
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn token_auth_succeeds_from_either_set() {
        let (server, _dir) = test_server();
        let server = Arc::new(server);
        server
            .core
            .lock()
            .await
            .transient_tokens
            .insert("session-token".into());

        let (id, mut rx) = attach(&server).await;
        handle_auth(
            &server,
            id,
            AuthMsg {
                token: Some("session-token".into()),
                ..Default::default()
            },
        )
        .await;

        let frames = frames(&mut rx);
        assert_eq!(frames[0]["auth"]["success"], true);
        // Initial state follows: config, pipelines, status, netif,
        // sensors, revisions.
        assert!(frames.iter().any(|f| f.get("config").is_some()));
        assert!(frames.iter().any(|f| f.get("status").is_some()));
        assert!(server.core.lock().await.conns[&id].authenticated);
    }

    #[tokio::test]
    async fn unknown_token_fails() {
        let (server, _dir) = test_server();
        let server = Arc::new(server);
        let (id, mut rx) = attach(&server).await;
        handle_auth(
            &server,
            id,
            AuthMsg {
                token: Some("bogus".into()),
                ..Default::default()
            },
        )
        .await;
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["auth"]["success"], false);
    }

    #[tokio::test]
    async fn first_run_password_set_then_login() {
        let (server, _dir) = test_server();
        let server = Arc::new(server);

        // Unauthenticated local connection, no password configured.
        let (id, mut rx) = attach(&server).await;
        handle_config(
            &server,
            id,
            ConfigMsg {
                password: Some("hunter2x".into()),
                remote_key: None,
            },
            false,
        )
        .await;
        assert!(server.core.lock().await.config.password_hash.is_some());
        let _ = frames(&mut rx);

        handle_auth(
            &server,
            id,
            AuthMsg {
                password: Some("hunter2x".into()),
                persistent_token: true,
                token: None,
            },
        )
        .await;
        let frames = frames(&mut rx);
        let auth = frames
            .iter()
            .find_map(|f| f.get("auth"))
            .expect("auth reply");
        assert_eq!(auth["success"], true);
        let token = auth["auth_token"].as_str().unwrap().to_string();

        // Persistent token survives a restart of the token store.
        let core = server.core.lock().await;
        assert!(core.persistent_tokens.contains(&token));
        assert!(server.store.load_tokens().contains(&token));
    }

    #[tokio::test]
    async fn short_password_is_rejected_with_notification() {
        let (server, _dir) = test_server();
        let server = Arc::new(server);
        let (id, mut rx) = attach(&server).await;
        handle_config(
            &server,
            id,
            ConfigMsg {
                password: Some("short".into()),
                remote_key: None,
            },
            false,
        )
        .await;
        assert!(server.core.lock().await.config.password_hash.is_none());
        let frames = frames(&mut rx);
        let show = &frames[0]["notification"]["show"][0];
        assert_eq!(show["type"], "error");
        assert_eq!(show["msg"], "Minimum password length: 8 characters");
    }

    #[tokio::test]
    async fn first_password_set_is_refused_over_the_tunnel() {
        let (server, _dir) = test_server();
        let server = Arc::new(server);
        let (id, _rx) = attach(&server).await;
        handle_config(
            &server,
            id,
            ConfigMsg {
                password: Some("longenough".into()),
                remote_key: None,
            },
            true,
        )
        .await;
        assert!(server.core.lock().await.config.password_hash.is_none());
    }

    #[tokio::test]
    async fn logout_invalidates_both_sets() {
        let (server, _dir) = test_server();
        let server = Arc::new(server);
        {
            let mut core = server.core.lock().await;
            core.persistent_tokens.insert("keep-me".into());
            server.store.save_tokens(&core.persistent_tokens).unwrap();
        }

        let (id, mut rx) = attach(&server).await;
        handle_auth(
            &server,
            id,
            AuthMsg {
                token: Some("keep-me".into()),
                ..Default::default()
            },
        )
        .await;
        let _ = frames(&mut rx);

        handle_logout(&server, id).await;
        let core = server.core.lock().await;
        assert!(!core.conns[&id].authenticated);
        assert!(!core.persistent_tokens.contains("keep-me"));
        assert!(!server.store.load_tokens().contains("keep-me"));
    }
}
