//! In-memory notification bus.
//!
//! Transient notifications are emitted once, to one connection or to
//! all authenticated clients. Persistent notifications are stored under
//! a name, rate-limited to one outbound frame per second, replayed to
//! newly attached clients with their remaining display time, and
//! dropped once that time runs out.

use serde_json::json;

use bondcast_common::models::{NotificationKind, NotificationView};

use crate::server::{now_ms, Core};

/// Repeated sends of the same persistent name inside this window
/// update the stored entry but suppress the outbound frame.
const RATE_LIMIT_MS: i64 = 1_000;

/// A stored persistent notification.
pub struct Stored {
    pub kind: NotificationKind,
    pub msg: String,
    /// Display time in seconds; 0 means permanent.
    pub duration: u64,
    pub dismissable: bool,
    /// Last content update, epoch ms. The expiry clock runs from here.
    pub updated: i64,
    /// Last actual emission, epoch ms.
    pub last_sent: i64,
}

impl Stored {
    fn remaining_secs(&self, now: i64) -> Option<u64> {
        if self.duration == 0 {
            return Some(0);
        }
        let elapsed = (now - self.updated) / 1000;
        let remaining = self.duration as i64 - elapsed;
        (remaining > 0).then_some(remaining as u64)
    }
}

/// Send a notification. `conn == None` broadcasts; persistent
/// notifications must broadcast.
pub fn send(
    core: &mut Core,
    conn: Option<u64>,
    name: &str,
    kind: NotificationKind,
    msg: &str,
    duration: u64,
    persistent: bool,
    dismissable: bool,
) {
    prune(core);

    if persistent {
        if conn.is_some() {
            tracing::warn!(name, "unicast persistent notification rejected");
            return;
        }
        let now = now_ms();
        let emit = match core.notifications.get_mut(name) {
            Some(stored) => {
                stored.kind = kind;
                stored.msg = msg.to_string();
                stored.duration = duration;
                stored.dismissable = dismissable;
                stored.updated = now;
                if now - stored.last_sent < RATE_LIMIT_MS {
                    false
                } else {
                    stored.last_sent = now;
                    true
                }
            }
            None => {
                core.notifications.insert(
                    name.to_string(),
                    Stored {
                        kind,
                        msg: msg.to_string(),
                        duration,
                        dismissable,
                        updated: now,
                        last_sent: now,
                    },
                );
                true
            }
        };
        if emit {
            let view = NotificationView {
                name: name.to_string(),
                kind,
                msg: msg.to_string(),
                is_dismissable: dismissable,
                is_persistent: true,
                duration,
            };
            core.broadcast("notification", &json!({ "show": [view] }));
        }
    } else {
        let view = NotificationView {
            name: name.to_string(),
            kind,
            msg: msg.to_string(),
            is_dismissable: dismissable,
            is_persistent: false,
            duration,
        };
        let data = json!({ "show": [view] });
        match conn {
            Some(conn_id) => core.send_to(conn_id, "notification", &data),
            None => core.broadcast("notification", &data),
        }
    }
}

/// Transient error to one connection; the common validation-failure
/// shape (10 s, dismissable).
pub fn error_to(core: &mut Core, conn_id: u64, name: &str, msg: &str, duration: u64) {
    send(
        core,
        Some(conn_id),
        name,
        NotificationKind::Error,
        msg,
        duration,
        false,
        true,
    );
}

/// Delete a persistent notification and tell clients to drop it.
pub fn remove(core: &mut Core, name: &str) {
    if core.notifications.remove(name).is_some() {
        core.broadcast("notification", &json!({ "remove": [name] }));
    }
}

/// Replay persistent notifications to a newly attached client, with
/// durations rewritten to the time left.
pub fn replay(core: &mut Core, conn_id: u64) {
    prune(core);
    let now = now_ms();
    let views: Vec<NotificationView> = core
        .notifications
        .iter()
        .map(|(name, stored)| NotificationView {
            name: name.clone(),
            kind: stored.kind,
            msg: stored.msg.clone(),
            is_dismissable: stored.dismissable,
            is_persistent: true,
            duration: stored.remaining_secs(now).unwrap_or(0),
        })
        .collect();
    if !views.is_empty() {
        core.send_to(conn_id, "notification", &json!({ "show": views }));
    }
}

/// Drop persistent notifications whose display time has run out.
fn prune(core: &mut Core) {
    let now = now_ms();
    core.notifications
        .retain(|_, stored| stored.remaining_secs(now).is_some());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_server;
    use tokio::sync::mpsc;

    async fn attach_client(core: &mut Core) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = core.register_conn(tx, false);
        core.conns.get_mut(&id).unwrap().authenticated = true;
        (id, rx)
    }

    #[tokio::test]
    async fn repeated_persistent_send_is_rate_limited() {
        let (server, _dir) = test_server();
        let mut core = server.core.lock().await;
        let (_id, mut rx) = attach_client(&mut core).await;

        send(
            &mut core,
            None,
            "low_voltage",
            NotificationKind::Warning,
            "input voltage low",
            0,
            true,
            true,
        );
        send(
            &mut core,
            None,
            "low_voltage",
            NotificationKind::Warning,
            "input voltage low",
            0,
            true,
            true,
        );
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "second send inside 1 s leaked out");

        // Updated bookkeeping still happened; a send after the window
        // goes out again.
        core.notifications.get_mut("low_voltage").unwrap().last_sent -= 1_500;
        send(
            &mut core,
            None,
            "low_voltage",
            NotificationKind::Warning,
            "input voltage low",
            0,
            true,
            true,
        );
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unicast_persistent_is_rejected() {
        let (server, _dir) = test_server();
        let mut core = server.core.lock().await;
        let (id, mut rx) = attach_client(&mut core).await;

        send(
            &mut core,
            Some(id),
            "nope",
            NotificationKind::Error,
            "x",
            0,
            true,
            true,
        );
        assert!(core.notifications.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_notifications_are_pruned_before_replay() {
        let (server, _dir) = test_server();
        let mut core = server.core.lock().await;

        send(
            &mut core,
            None,
            "transient_fault",
            NotificationKind::Error,
            "gone soon",
            5,
            true,
            true,
        );
        core.notifications.get_mut("transient_fault").unwrap().updated -= 6_000;

        let (id, mut rx) = attach_client(&mut core).await;
        replay(&mut core, id);
        assert!(core.notifications.is_empty());
        assert!(rx.try_recv().is_err(), "expired notification was replayed");
    }

    #[tokio::test]
    async fn replay_rewrites_remaining_duration() {
        let (server, _dir) = test_server();
        let mut core = server.core.lock().await;

        send(
            &mut core,
            None,
            "update_done",
            NotificationKind::Success,
            "updated",
            30,
            true,
            true,
        );
        core.notifications.get_mut("update_done").unwrap().updated -= 10_000;

        let (id, mut rx) = attach_client(&mut core).await;
        replay(&mut core, id);
        let frame = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let duration = value["notification"]["show"][0]["duration"].as_u64().unwrap();
        assert!(duration <= 20, "remaining duration not rewritten: {duration}");
    }

    #[tokio::test]
    async fn remove_broadcasts_the_name() {
        let (server, _dir) = test_server();
        let mut core = server.core.lock().await;
        let (_id, mut rx) = attach_client(&mut core).await;

        send(
            &mut core,
            None,
            "stale",
            NotificationKind::Warning,
            "x",
            0,
            true,
            true,
        );
        let _ = rx.try_recv();
        remove(&mut core, "stale");
        let frame = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["notification"]["remove"][0], "stale");
    }
}
