//! Wire protocol between the daemon, the browser UI, and the cloud relay.
//!
//! A frame is a JSON object whose keys are message types; a single frame
//! may carry several messages. An optional top-level `id` identifies the
//! relay-side client a remote frame originated from, and is echoed on
//! replies so the relay can route them back.
//!
//! Unknown message types are ignored, not errors — older UIs keep
//! working against newer daemons.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Client → daemon ─────────────────────────────────────────────────

/// One message extracted from a client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Auth(AuthMsg),
    Config(ConfigMsg),
    Keepalive,
    Start(StartMsg),
    Stop,
    Bitrate(BitrateMsg),
    Command(String),
    Netif(NetifMsg),
    Wifi(WifiMsg),
    Logout,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuthMsg {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub persistent_token: bool,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigMsg {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub remote_key: Option<String>,
}

/// Streaming parameters as submitted by the client. All fields are
/// optional at the wire level; validation happens in the streaming
/// supervisor so a missing field produces an operator-visible error
/// rather than a dropped frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StartMsg {
    #[serde(default)]
    pub delay: Option<i64>,
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub max_br: Option<i64>,
    #[serde(default)]
    pub srt_latency: Option<i64>,
    #[serde(default)]
    pub srt_streamid: Option<String>,
    #[serde(default)]
    pub srtla_addr: Option<String>,
    #[serde(default)]
    pub srtla_port: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BitrateMsg {
    #[serde(default)]
    pub max_br: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NetifMsg {
    pub name: String,
    pub ip: String,
    pub enabled: bool,
}

/// Wi-Fi operations. Exactly one field is normally set per message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WifiMsg {
    /// Connect to a saved profile by UUID.
    #[serde(default)]
    pub connect: Option<String>,
    /// Disconnect the connection with this UUID.
    #[serde(default)]
    pub disconnect: Option<String>,
    /// Trigger a rescan; the value is ignored.
    #[serde(default)]
    pub scan: Option<Value>,
    /// Associate with a new network.
    #[serde(default)]
    pub new: Option<WifiNewMsg>,
    /// Delete a saved profile by UUID.
    #[serde(default)]
    pub forget: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WifiNewMsg {
    /// Numeric device id from the wifi status broadcast.
    pub device: u32,
    pub ssid: String,
    #[serde(default)]
    pub password: Option<String>,
}

// ── Frame parsing ───────────────────────────────────────────────────

/// A parsed client frame: the recognized messages plus the relay sender
/// id, if present.
#[derive(Debug, Default)]
pub struct ParsedFrame {
    pub sender_id: Option<String>,
    pub messages: Vec<ClientMessage>,
}

/// Parse a raw text frame. Unknown keys are skipped; a recognized key
/// with a malformed payload fails the whole frame.
pub fn parse_frame(raw: &str) -> Result<ParsedFrame, serde_json::Error> {
    let object: serde_json::Map<String, Value> = serde_json::from_str(raw)?;
    let mut frame = ParsedFrame::default();

    for (key, value) in object {
        match key.as_str() {
            "id" => {
                frame.sender_id = value.as_str().map(|s| s.to_string());
            }
            "auth" => frame
                .messages
                .push(ClientMessage::Auth(serde_json::from_value(value)?)),
            "config" => frame
                .messages
                .push(ClientMessage::Config(serde_json::from_value(value)?)),
            "keepalive" => frame.messages.push(ClientMessage::Keepalive),
            "start" => frame
                .messages
                .push(ClientMessage::Start(serde_json::from_value(value)?)),
            "stop" => frame.messages.push(ClientMessage::Stop),
            "bitrate" => frame
                .messages
                .push(ClientMessage::Bitrate(serde_json::from_value(value)?)),
            "command" => frame
                .messages
                .push(ClientMessage::Command(serde_json::from_value(value)?)),
            "netif" => frame
                .messages
                .push(ClientMessage::Netif(serde_json::from_value(value)?)),
            "wifi" => frame
                .messages
                .push(ClientMessage::Wifi(serde_json::from_value(value)?)),
            "logout" => frame.messages.push(ClientMessage::Logout),
            _ => {}
        }
    }

    Ok(frame)
}

// ── Daemon → client ─────────────────────────────────────────────────

/// Build an outbound frame `{"<kind>": data}`, tagging it with the
/// relay sender id when replying through the tunnel.
pub fn build_frame(kind: &str, data: &Value, sender_id: Option<&str>) -> String {
    let mut object = serde_json::Map::new();
    object.insert(kind.to_string(), data.clone());
    if let Some(id) = sender_id {
        object.insert("id".to_string(), Value::String(id.to_string()));
    }
    serde_json::to_string(&Value::Object(object)).expect("frame serialization")
}

/// Relay protocol version sent during tunnel authentication.
pub const REMOTE_PROTOCOL_VERSION: u32 = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAuth {
    pub key: String,
    pub version: u32,
}
