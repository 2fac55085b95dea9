//! Streaming supervisor.
//!
//! Validates operator parameters, resolves the SRTLA address, writes
//! the runtime files the children re-read on SIGHUP, and drives the
//! bonder and encoder through their supervision loops.
//!
//! State machine: Idle → Starting → Streaming → Stopping → Idle.
//! `Starting` spans validation and the DNS lookup; any failure there
//! returns to Idle with no side effects.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use sha1::{Digest, Sha1};

use bondcast_common::models::Setup;
use bondcast_common::protocol::{BitrateMsg, StartMsg};

use crate::notify;
use crate::runner;
use crate::server::{Core, Server};

/// Encoder bitrate bounds in kbps. The lower bound is also the fixed
/// minimum written to the bitrate file.
pub const MIN_BITRATE: u32 = 300;
pub const MAX_BITRATE: u32 = 12_000;

/// Local UDP port the encoder feeds and the bonder reads.
const MEDIA_PORT: &str = "9000";

// ── Pipelines ───────────────────────────────────────────────────────

/// A discovered pipeline description file.
pub struct Pipeline {
    /// Relative path, e.g. `generic/h264_1080p30`.
    pub name: String,
    pub path: PathBuf,
}

/// Protocol id of a pipeline: hex SHA-1 of its relative path.
pub fn pipeline_id(rel: &str) -> String {
    hex::encode(Sha1::digest(rel.as_bytes()))
}

/// Scan the pipeline tree: `generic/` always, the platform directory
/// when present.
pub fn discover_pipelines(setup: &Setup) -> HashMap<String, Pipeline> {
    let mut pipelines = HashMap::new();
    let root = std::path::Path::new(&setup.pipelines_dir);
    for dir in ["generic", setup.platform.as_str()] {
        let Ok(entries) = std::fs::read_dir(root.join(dir)) else {
            continue;
        };
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let name = format!("{dir}/{file_name}");
            pipelines.insert(
                pipeline_id(&name),
                Pipeline {
                    name,
                    path: entry.path(),
                },
            );
        }
    }
    pipelines
}

/// The `pipelines` document sent with initial state: id → name.
pub fn pipelines_value(server: &Server) -> serde_json::Value {
    let map: std::collections::BTreeMap<&str, &str> = server
        .pipelines
        .iter()
        .map(|(id, p)| (id.as_str(), p.name.as_str()))
        .collect();
    serde_json::to_value(map).expect("pipelines")
}

// ── Validation ──────────────────────────────────────────────────────

/// Fully validated start parameters.
#[derive(Debug)]
pub struct StartParams {
    pub delay: i64,
    pub pipeline: String,
    pub max_br: u32,
    pub srt_latency: u32,
    pub srt_streamid: String,
    pub srtla_addr: String,
    pub srtla_port: u16,
}

/// Validate a start request against the parameter table. Returns the
/// operator-facing error message on the first failure.
pub fn validate_start(
    msg: &StartMsg,
    pipelines: &HashMap<String, Pipeline>,
) -> Result<StartParams, String> {
    let delay = match msg.delay {
        Some(d) if (-2000..=2000).contains(&d) => d,
        other => return Err(format!("invalid delay: {other:?}")),
    };

    let pipeline = match &msg.pipeline {
        Some(id) if pipelines.contains_key(id) => id.clone(),
        _ => return Err("unknown pipeline".to_string()),
    };

    let max_br = match msg.max_br {
        Some(br) if (MIN_BITRATE as i64..=MAX_BITRATE as i64).contains(&br) => br as u32,
        _ => return Err("invalid bitrate range: ".to_string()),
    };

    let srt_latency = match msg.srt_latency {
        Some(l) if (100..=10_000).contains(&l) => l as u32,
        other => return Err(format!("invalid SRT latency: {other:?}")),
    };

    let srt_streamid = match &msg.srt_streamid {
        Some(id) => id.clone(),
        None => return Err("missing SRT stream id".to_string()),
    };

    let srtla_addr = match &msg.srtla_addr {
        Some(addr) if !addr.is_empty() => addr.clone(),
        _ => return Err("missing SRTLA address".to_string()),
    };

    let srtla_port = match msg.srtla_port {
        Some(p) if (1..=65_535).contains(&p) => p as u16,
        other => return Err(format!("invalid SRTLA port: {other:?}")),
    };

    Ok(StartParams {
        delay,
        pipeline,
        max_br,
        srt_latency,
        srt_streamid,
        srtla_addr,
        srtla_port,
    })
}

// ── Runtime files ───────────────────────────────────────────────────

/// Write the bitrate file the encoder re-reads on SIGHUP: min and max
/// in bits/s, one per line.
pub fn write_bitrate_file(setup: &Setup, max_br: u32) -> std::io::Result<()> {
    let content = format!("{}\n{}\n", MIN_BITRATE * 1000, max_br * 1000);
    std::fs::write(&setup.bitrate_file, content)
}

/// Rewrite the uplink-IP file from the currently enabled interfaces.
/// Returns the number of addresses written.
pub fn write_uplinks_file(setup: &Setup, core: &Core) -> usize {
    let ips: Vec<&str> = core
        .netif
        .values()
        .filter(|e| e.enabled)
        .map(|e| e.ip.as_str())
        .collect();
    let mut content = ips.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    if let Err(e) = std::fs::write(&setup.ips_file, content) {
        tracing::error!(error = %e, "failed to write uplink file");
        return 0;
    }
    ips.len()
}

/// Rewrite the uplink file and prompt a running bonder to re-read it.
pub fn update_uplinks(setup: &Setup, core: &mut Core) -> usize {
    let count = write_uplinks_file(setup, core);
    runner::signal_by_name(runner::basename(&setup.bonder_bin), libc::SIGHUP);
    count
}

// ── Start / stop / bitrate ──────────────────────────────────────────

fn start_fail(core: &mut Core, conn_id: u64, msg: &str) {
    tracing::warn!(reason = %msg, "start rejected");
    notify::error_to(core, conn_id, "start_error", msg, 10);
    core.send_to(conn_id, "status", &json!({ "is_streaming": false }));
}

pub async fn start(server: &Arc<Server>, conn_id: u64, msg: StartMsg) {
    // Admission and validation.
    let params = {
        let mut core = server.core.lock().await;
        if core.is_streaming {
            start_fail(&mut core, conn_id, "already streaming");
            return;
        }
        if core.updating.is_some() {
            start_fail(&mut core, conn_id, "a system update is in progress");
            return;
        }
        match validate_start(&msg, &server.pipelines) {
            Ok(params) => params,
            Err(e) => {
                start_fail(&mut core, conn_id, &e);
                return;
            }
        }
    };

    // DNS without the lock held.
    let resolves =
        match tokio::net::lookup_host((params.srtla_addr.as_str(), params.srtla_port)).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(_) => false,
        };

    let mut core = server.core.lock().await;
    if !resolves {
        start_fail(
            &mut core,
            conn_id,
            &format!("failed to resolve SRTLA address: {}", params.srtla_addr),
        );
        return;
    }
    // State may have moved during the lookup.
    if core.is_streaming || core.updating.is_some() {
        start_fail(&mut core, conn_id, "already streaming");
        return;
    }

    // Persist the accepted parameters; everyone but the requester
    // learns the new config.
    core.config.delay = Some(params.delay);
    core.config.pipeline = Some(params.pipeline.clone());
    core.config.max_br = Some(params.max_br);
    core.config.srt_latency = Some(params.srt_latency);
    core.config.srt_streamid = Some(params.srt_streamid.clone());
    core.config.srtla_addr = Some(params.srtla_addr.clone());
    core.config.srtla_port = Some(params.srtla_port);
    if let Err(e) = server.store.save_config(&core.config) {
        tracing::error!(error = %e, "failed to persist config");
    }
    let sanitized = core.config.sanitized();
    core.broadcast_except(conn_id, "config", &sanitized);

    // Runtime files for the children.
    if write_uplinks_file(&server.setup, &core) == 0 {
        start_fail(&mut core, conn_id, "no enabled network interfaces");
        return;
    }
    if let Err(e) = write_bitrate_file(&server.setup, params.max_br) {
        start_fail(&mut core, conn_id, &format!("failed to write bitrate file: {e}"));
        return;
    }

    core.is_streaming = true;
    // send_replace: the value must stick even before the supervision
    // loops subscribe.
    server.stream_flag.send_replace(true);
    core.broadcast("status", &json!({ "is_streaming": true }));
    tracing::info!(
        pipeline = %params.pipeline,
        max_br = params.max_br,
        srtla_addr = %params.srtla_addr,
        "streaming started"
    );
    drop(core);

    let pipeline_path = server.pipelines[&params.pipeline]
        .path
        .to_string_lossy()
        .into_owned();

    let bonder_args = vec![
        MEDIA_PORT.to_string(),
        params.srtla_addr.clone(),
        params.srtla_port.to_string(),
        server.setup.ips_file.clone(),
    ];
    tokio::spawn(runner::supervise(
        server.stream_flag.subscribe(),
        server.setup.bonder_bin.clone(),
        bonder_args,
        Server::BONDER_COOLDOWN,
    ));

    let mut encoder_args = vec![
        pipeline_path,
        "127.0.0.1".to_string(),
        MEDIA_PORT.to_string(),
        "-d".to_string(),
        params.delay.to_string(),
        "-b".to_string(),
        server.setup.bitrate_file.clone(),
        "-l".to_string(),
        params.srt_latency.to_string(),
    ];
    if !params.srt_streamid.is_empty() {
        encoder_args.push("-s".to_string());
        encoder_args.push(params.srt_streamid.clone());
    }
    tokio::spawn(runner::supervise(
        server.stream_flag.subscribe(),
        server.setup.encoder_bin.clone(),
        encoder_args,
        Server::ENCODER_COOLDOWN,
    ));
}

/// Stop streaming. Safe in any state; also used at startup to reap
/// children orphaned by a previous daemon run.
pub async fn stop(server: &Arc<Server>) {
    let mut core = server.core.lock().await;
    let was_streaming = core.is_streaming;
    core.is_streaming = false;
    server.stream_flag.send_replace(false);

    runner::signal_by_name(runner::basename(&server.setup.bonder_bin), libc::SIGTERM);
    runner::signal_by_name(runner::basename(&server.setup.encoder_bin), libc::SIGTERM);

    if was_streaming {
        core.broadcast("status", &json!({ "is_streaming": false }));
        tracing::info!("streaming stopped");
    }
}

/// Kill leftover children by name, without touching daemon state.
pub fn reap_orphans(setup: &Setup) {
    let bonder = runner::signal_by_name(runner::basename(&setup.bonder_bin), libc::SIGTERM);
    let encoder = runner::signal_by_name(runner::basename(&setup.encoder_bin), libc::SIGTERM);
    if bonder + encoder > 0 {
        tracing::warn!(bonder, encoder, "reaped orphaned children from a previous run");
    }
}

/// Hot bitrate change while streaming. Persists first, then rewrites
/// the bitrate file, then prompts the encoder; out-of-range or idle
/// requests are ignored.
pub async fn set_bitrate(server: &Arc<Server>, conn_id: u64, msg: BitrateMsg) {
    let Some(max_br) = msg.max_br else {
        return;
    };
    if !(MIN_BITRATE as i64..=MAX_BITRATE as i64).contains(&max_br) {
        return;
    }
    let max_br = max_br as u32;

    let mut core = server.core.lock().await;
    if !core.is_streaming {
        return;
    }

    core.config.max_br = Some(max_br);
    if let Err(e) = server.store.save_config(&core.config) {
        tracing::error!(error = %e, "failed to persist config");
    }
    if let Err(e) = write_bitrate_file(&server.setup, max_br) {
        tracing::error!(error = %e, "failed to write bitrate file");
        return;
    }
    runner::signal_by_name(runner::basename(&server.setup.encoder_bin), libc::SIGHUP);

    core.broadcast_except(conn_id, "bitrate", &json!({ "max_br": max_br }));
    tracing::info!(max_br, "bitrate updated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_server, test_setup};
    use bondcast_common::models::NetifEntry;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn valid_msg(pipeline: &str) -> StartMsg {
        StartMsg {
            delay: Some(0),
            pipeline: Some(pipeline.to_string()),
            max_br: Some(4000),
            srt_latency: Some(2000),
            srt_streamid: Some(String::new()),
            srtla_addr: Some("relay.example.com".to_string()),
            srtla_port: Some(5000),
        }
    }

    fn one_pipeline() -> (String, HashMap<String, Pipeline>) {
        let id = pipeline_id("generic/h264_1080p30");
        let mut pipelines = HashMap::new();
        pipelines.insert(
            id.clone(),
            Pipeline {
                name: "generic/h264_1080p30".into(),
                path: PathBuf::from("/tmp/p"),
            },
        );
        (id, pipelines)
    }

    #[test]
    fn pipeline_id_is_160_bit_hex() {
        let id = pipeline_id("generic/h264_1080p30");
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, pipeline_id("rk3588/h264_1080p30"));
        assert_eq!(id, pipeline_id("generic/h264_1080p30"));
    }

    #[test]
    fn discovery_scans_generic_and_platform_only() {
        let dir = tempdir().unwrap();
        let setup = test_setup(dir.path());
        let root = std::path::Path::new(&setup.pipelines_dir);
        for (sub, file) in [
            ("generic", "h264_1080p30"),
            ("rk3588", "h265_hw"),
            ("jetson", "h265_nvenc"),
        ] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
            std::fs::write(root.join(sub).join(file), "pipeline").unwrap();
        }

        let pipelines = discover_pipelines(&setup);
        let names: Vec<&str> = pipelines.values().map(|p| p.name.as_str()).collect();
        assert_eq!(pipelines.len(), 2);
        assert!(names.contains(&"generic/h264_1080p30"));
        assert!(names.contains(&"rk3588/h265_hw"));
        assert!(pipelines.contains_key(&pipeline_id("generic/h264_1080p30")));
    }

    #[test]
    fn validation_enforces_the_parameter_table() {
        let (id, pipelines) = one_pipeline();

        assert!(validate_start(&valid_msg(&id), &pipelines).is_ok());

        let mut msg = valid_msg(&id);
        msg.delay = Some(2001);
        assert!(validate_start(&msg, &pipelines).is_err());

        let mut msg = valid_msg(&id);
        msg.pipeline = Some("bogus".into());
        assert_eq!(validate_start(&msg, &pipelines).unwrap_err(), "unknown pipeline");

        let mut msg = valid_msg(&id);
        msg.max_br = Some(50);
        let err = validate_start(&msg, &pipelines).unwrap_err();
        assert_eq!(err, "invalid bitrate range: ");

        let mut msg = valid_msg(&id);
        msg.srt_latency = Some(50);
        assert!(validate_start(&msg, &pipelines).is_err());

        let mut msg = valid_msg(&id);
        msg.srt_streamid = None;
        assert!(validate_start(&msg, &pipelines).is_err());

        let mut msg = valid_msg(&id);
        msg.srtla_addr = Some(String::new());
        assert!(validate_start(&msg, &pipelines).is_err());

        let mut msg = valid_msg(&id);
        msg.srtla_port = Some(0);
        assert!(validate_start(&msg, &pipelines).is_err());
        msg.srtla_port = Some(70_000);
        assert!(validate_start(&msg, &pipelines).is_err());

        // Empty stream id is explicitly allowed.
        let mut msg = valid_msg(&id);
        msg.srt_streamid = Some(String::new());
        assert!(validate_start(&msg, &pipelines).is_ok());
    }

    #[tokio::test]
    async fn bitrate_file_carries_min_and_max_in_bits() {
        let (server, _dir) = test_server();
        write_bitrate_file(&server.setup, 6000).unwrap();
        let content = std::fs::read_to_string(&server.setup.bitrate_file).unwrap();
        assert_eq!(content, "300000\n6000000\n");
    }

    #[tokio::test]
    async fn uplink_file_lists_enabled_interfaces_only() {
        let (server, _dir) = test_server();
        let mut core = server.core.lock().await;
        core.netif.insert(
            "eth0".into(),
            NetifEntry {
                ip: "10.0.0.2".into(),
                txb: 0,
                tp: 0,
                enabled: true,
            },
        );
        core.netif.insert(
            "wlan0".into(),
            NetifEntry {
                ip: "10.0.1.2".into(),
                txb: 0,
                tp: 0,
                enabled: false,
            },
        );

        assert_eq!(write_uplinks_file(&server.setup, &core), 1);
        let content = std::fs::read_to_string(&server.setup.ips_file).unwrap();
        assert_eq!(content, "10.0.0.2\n");
    }

    #[tokio::test]
    async fn hot_bitrate_change_writes_file_and_skips_the_sender() {
        let (mut server, _dir) = test_server();
        let (id, pipelines) = one_pipeline();
        let _ = id;
        server.pipelines = pipelines;
        let server = Arc::new(server);

        let (tx_sender, mut rx_sender) = mpsc::unbounded_channel();
        let (tx_other, mut rx_other) = mpsc::unbounded_channel();
        let (sender_id, _other_id) = {
            let mut core = server.core.lock().await;
            core.is_streaming = true;
            core.config.max_br = Some(4000);

            let sender_id = core.register_conn(tx_sender, false);
            core.conns.get_mut(&sender_id).unwrap().authenticated = true;
            let other_id = core.register_conn(tx_other, false);
            core.conns.get_mut(&other_id).unwrap().authenticated = true;
            (sender_id, other_id)
        };

        set_bitrate(
            &server,
            sender_id,
            BitrateMsg {
                max_br: Some(6000),
            },
        )
        .await;

        let content = std::fs::read_to_string(&server.setup.bitrate_file).unwrap();
        assert_eq!(content.lines().nth(1), Some("6000000"));

        let frame = rx_other.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["bitrate"]["max_br"], 6000);
        assert!(rx_sender.try_recv().is_err(), "sender got its own echo");

        let core = server.core.lock().await;
        assert_eq!(core.config.max_br, Some(6000));
        // Persisted to disk as well.
        let on_disk = server.store.load_config();
        assert_eq!(on_disk.max_br, Some(6000));
    }

    #[tokio::test]
    async fn out_of_range_bitrate_is_ignored() {
        let (server, _dir) = test_server();
        let server = Arc::new(server);
        {
            let mut core = server.core.lock().await;
            core.is_streaming = true;
            core.config.max_br = Some(4000);
        }
        set_bitrate(&server, 0, BitrateMsg { max_br: Some(50) }).await;
        let core = server.core.lock().await;
        assert_eq!(core.config.max_br, Some(4000));
    }
}
