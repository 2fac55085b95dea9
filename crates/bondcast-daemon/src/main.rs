//! bondcastd — control-plane daemon of the bondcast bonding encoder
//! appliance.
//!
//! - Supervises the encoder and bonder child processes
//! - Serves the browser UI over local HTTP/WebSocket
//! - Bridges a cloud relay tunnel for remote operation
//! - Monitors network interfaces and drives uplink reconfiguration
//! - Manages Wi-Fi through NetworkManager, SSH, and OS upgrades

mod netif;
mod notify;
mod remote;
mod router;
mod runner;
mod sensors;
mod server;
mod session;
mod ssh;
mod store;
mod streaming;
mod system;
#[cfg(test)]
mod testutil;
mod updates;
mod wifi;
mod ws;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::server::Server;
use crate::store::Store;

/// bondcast appliance control daemon.
#[derive(Parser, Debug)]
#[command(name = "bondcastd", about = "bondcast appliance control daemon")]
struct Cli {
    /// HTTP/WebSocket listen port. Falls back to $PORT, then 80.
    #[arg(long)]
    port: Option<u16>,

    /// Path to the read-only setup document.
    #[arg(long, default_value = "setup.json")]
    setup: PathBuf,

    /// Directory holding config.json and auth_tokens.json.
    /// Defaults to the setup file's directory.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Directory of static web UI assets.
    #[arg(long, default_value = "public")]
    public_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let setup = Store::load_setup(&cli.setup)?;

    // Nothing works without the children; bail out loudly.
    for bin in [&setup.encoder_bin, &setup.bonder_bin] {
        if !Path::new(bin).exists() {
            tracing::error!(bin = %bin, "executable not found");
            std::process::exit(1);
        }
    }

    let config_dir = cli.config_dir.unwrap_or_else(|| {
        cli.setup
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    });
    let store = Store::new(&config_dir);
    let pipelines = streaming::discover_pipelines(&setup);

    tracing::info!(
        platform = %setup.platform,
        pipelines = pipelines.len(),
        "bondcastd starting"
    );

    let server = Arc::new(Server::new(setup, store, pipelines));

    // A previous daemon may have left children behind.
    streaming::reap_orphans(&server.setup);
    {
        let mut core = server.core.lock().await;
        core.revisions = system::revisions();
    }

    let port = cli
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(80);

    tokio::spawn(netif::run_monitor(server.clone()));
    tokio::spawn(sensors::run_monitor(server.clone()));
    tokio::spawn(ssh::run_monitor(server.clone()));
    tokio::spawn(wifi::refresh_devices(server.clone()));
    tokio::spawn(remote::run(server.clone()));
    tokio::spawn(updates::run_checker(server.clone()));

    let http = tokio::spawn(ws::run_http(server.clone(), port, cli.public_dir));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            streaming::stop(&server).await;
        }
        result = http => {
            if let Err(e) = result? {
                tracing::error!(error = %e, "http server failed");
            }
        }
    }

    tracing::info!("bondcastd stopped");
    Ok(())
}
