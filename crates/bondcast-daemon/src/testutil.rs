//! Shared fixtures for the daemon's unit tests.

use std::collections::HashMap;
use std::path::Path;

use tempfile::{tempdir, TempDir};

use bondcast_common::models::Setup;

use crate::server::Server;
use crate::store::Store;

pub fn test_setup(dir: &Path) -> Setup {
    Setup {
        platform: "rk3588".into(),
        encoder_bin: "/opt/bondcast/bc-encoder".into(),
        bonder_bin: "/opt/bondcast/bc-bonder".into(),
        pipelines_dir: dir.join("pipelines").to_string_lossy().into_owned(),
        bitrate_file: dir.join("bitrate").to_string_lossy().into_owned(),
        ips_file: dir.join("ips").to_string_lossy().into_owned(),
        ssh_user: Some("field".into()),
        apt_upgrades: false,
    }
}

/// A server over a temp directory, with no pipelines discovered.
pub fn test_server() -> (Server, TempDir) {
    let dir = tempdir().unwrap();
    let setup = test_setup(dir.path());
    let store = Store::new(dir.path());
    (Server::new(setup, store, HashMap::new()), dir)
}
