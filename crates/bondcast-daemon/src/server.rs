//! Shared daemon state and broadcast plumbing.
//!
//! All shared mutable state lives in one [`Core`] behind a single
//! `tokio::sync::Mutex`, so every mutation is serialized: subprocess
//! waits, DNS lookups, and password hashing happen with the lock
//! released and re-acquire it to apply their results. Connections are
//! fanned out through per-connection unbounded channels, which gives
//! each client an ordered outbound stream.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};

use bondcast_common::models::{Config, NetifEntry, Setup};
use bondcast_common::protocol::build_frame;

use crate::ssh::SshStatus;
use crate::store::Store;
use crate::streaming::Pipeline;
use crate::updates::{AvailableUpdates, UpdateProgress};
use crate::wifi::WifiIndex;

/// Clients inactive for longer than this are skipped by
/// high-frequency broadcasts (interface tables, sensors).
pub const ACTIVE_TO: i64 = 15_000;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One live connection: a local WebSocket client or the remote tunnel.
pub struct Conn {
    pub tx: mpsc::UnboundedSender<String>,
    pub authenticated: bool,
    pub auth_token: Option<String>,
    /// Last inbound activity, epoch milliseconds.
    pub last_active: i64,
    pub remote: bool,
    /// Relay-side client id of the message currently being handled;
    /// set only on the tunnel connection.
    pub sender_id: Option<String>,
}

/// State of the remote tunnel, tracked inside the core so broadcast
/// mirroring and rekey can reach it under the same lock.
#[derive(Default)]
pub struct RemoteState {
    /// Connection id of the live tunnel, if any.
    pub conn_id: Option<u64>,
    /// Round-robin cursor over the interface table for source binding.
    pub rr: usize,
    /// Bumped on rekey; a live tunnel with a stale generation
    /// terminates itself without a network-error broadcast.
    pub generation: u64,
    /// Key that was rejected by the relay; no reconnect until it changes.
    pub failed_key: Option<String>,
    /// Suppress the network-error broadcast for the next close.
    pub suppress_close_error: bool,
}

/// All shared mutable state, guarded by `Server::core`.
pub struct Core {
    pub config: Config,
    pub is_streaming: bool,
    pub updating: Option<UpdateProgress>,
    pub available_updates: Option<AvailableUpdates>,
    pub netif: BTreeMap<String, NetifEntry>,
    pub wifi: WifiIndex,
    pub notifications: HashMap<String, crate::notify::Stored>,
    pub persistent_tokens: HashSet<String>,
    pub transient_tokens: HashSet<String>,
    pub conns: HashMap<u64, Conn>,
    pub next_conn_id: u64,
    pub remote: RemoteState,
    pub ssh: Option<SshStatus>,
    pub sensors: BTreeMap<String, String>,
    pub revisions: BTreeMap<String, String>,
}

pub struct Server {
    pub setup: Setup,
    pub store: Store,
    /// Discovered pipeline descriptions, immutable after startup.
    pub pipelines: HashMap<String, Pipeline>,
    pub core: Mutex<Core>,
    /// Streaming flag handle for the supervision loops.
    pub stream_flag: watch::Sender<bool>,
}

impl Server {
    pub fn new(setup: Setup, store: Store, pipelines: HashMap<String, Pipeline>) -> Self {
        let config = store.load_config();
        let persistent_tokens = store.load_tokens();
        let (stream_flag, _) = watch::channel(false);
        Server {
            setup,
            store,
            pipelines,
            core: Mutex::new(Core {
                config,
                is_streaming: false,
                updating: None,
                available_updates: None,
                netif: BTreeMap::new(),
                wifi: WifiIndex::default(),
                notifications: HashMap::new(),
                persistent_tokens,
                transient_tokens: HashSet::new(),
                conns: HashMap::new(),
                next_conn_id: 0,
                remote: RemoteState::default(),
                ssh: None,
                sensors: BTreeMap::new(),
                revisions: BTreeMap::new(),
            }),
            stream_flag,
        }
    }

    /// Cooldowns for the supervised children: the bonder recovers
    /// fast, the encoder gets breathing room.
    pub const BONDER_COOLDOWN: Duration = Duration::from_millis(100);
    pub const ENCODER_COOLDOWN: Duration = Duration::from_millis(2000);
}

impl Core {
    pub fn register_conn(&mut self, tx: mpsc::UnboundedSender<String>, remote: bool) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        self.conns.insert(
            id,
            Conn {
                tx,
                authenticated: false,
                auth_token: None,
                last_active: now_ms(),
                remote,
                sender_id: None,
            },
        );
        id
    }

    pub fn remove_conn(&mut self, conn_id: u64) {
        self.conns.remove(&conn_id);
        if self.remote.conn_id == Some(conn_id) {
            self.remote.conn_id = None;
        }
    }

    /// Send one message to one connection, tagging it with the relay
    /// sender id when the target is the tunnel. Dead connections are
    /// silently dropped.
    pub fn send_to(&self, conn_id: u64, kind: &str, data: &Value) {
        if let Some(conn) = self.conns.get(&conn_id) {
            let frame = build_frame(kind, data, conn.sender_id.as_deref());
            let _ = conn.tx.send(frame);
        }
    }

    /// Deliver to every authenticated local client active since
    /// `active_min`, skipping `except`.
    pub fn broadcast_local(&self, kind: &str, data: &Value, active_min: i64, except: Option<u64>) {
        let frame = build_frame(kind, data, None);
        for (id, conn) in &self.conns {
            if conn.remote || !conn.authenticated || conn.last_active < active_min {
                continue;
            }
            if Some(*id) == except {
                continue;
            }
            let _ = conn.tx.send(frame.clone());
        }
    }

    /// Broadcast to local clients and mirror through the tunnel.
    pub fn broadcast_active(&self, kind: &str, data: &Value, active_min: i64) {
        self.broadcast_local(kind, data, active_min, None);
        self.mirror_remote(kind, data, None);
    }

    /// Broadcast to all authenticated clients and the tunnel.
    pub fn broadcast(&self, kind: &str, data: &Value) {
        self.broadcast_active(kind, data, 0);
    }

    /// Broadcast to everyone except `conn_id`; the tunnel mirror is
    /// tagged with that connection's sender id so the relay can route
    /// around the original remote sender.
    pub fn broadcast_except(&self, conn_id: u64, kind: &str, data: &Value) {
        self.broadcast_local(kind, data, 0, Some(conn_id));
        let sender_id = self
            .conns
            .get(&conn_id)
            .and_then(|c| c.sender_id.clone());
        self.mirror_remote(kind, data, sender_id.as_deref());
    }

    fn mirror_remote(&self, kind: &str, data: &Value, sender_id: Option<&str>) {
        let Some(remote_id) = self.remote.conn_id else {
            return;
        };
        if let Some(conn) = self.conns.get(&remote_id) {
            if conn.authenticated {
                let _ = conn.tx.send(build_frame(kind, data, sender_id));
            }
        }
    }

    /// The full `status` document sent with initial state.
    pub fn status_value(&self) -> Value {
        let mut status = json!({
            "is_streaming": self.is_streaming,
            "available_updates": self
                .available_updates
                .as_ref()
                .map(|u| serde_json::to_value(u).expect("available_updates"))
                .unwrap_or(Value::Bool(false)),
            "updating": self
                .updating
                .as_ref()
                .map(|u| serde_json::to_value(u).expect("updating"))
                .unwrap_or(Value::Bool(false)),
            "ssh": &self.ssh,
            "wifi": self.wifi.status_value(),
        });
        if self.config.password_hash.is_none() {
            status["set_password"] = Value::Bool(true);
        }
        status
    }

    /// The interface table in wire form: name → entry.
    pub fn netif_value(&self) -> Value {
        serde_json::to_value(&self.netif).expect("netif table")
    }
}
