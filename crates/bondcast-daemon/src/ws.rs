//! Local HTTP + WebSocket endpoint.
//!
//! Serves the web UI assets from `public/` and upgrades `/ws` for the
//! control protocol. Each socket owns an unbounded outbound channel;
//! the select loop below drains it into the sink and feeds inbound
//! text frames to the router.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;

use crate::router;
use crate::server::Server;

pub async fn run_http(server: Arc<Server>, port: u16, public_dir: PathBuf) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .fallback_service(ServeDir::new(public_dir))
        .with_state(server);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("control interface on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(
    State(server): State<Arc<Server>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(server, socket))
}

async fn handle_socket(server: Arc<Server>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let conn_id = {
        let mut core = server.core.lock().await;
        let conn_id = core.register_conn(tx, false);
        // A fresh appliance has no password yet; tell the UI to show
        // the first-run setup screen before any auth happens.
        if core.config.password_hash.is_none() {
            core.send_to(conn_id, "status", &json!({ "set_password": true }));
        }
        conn_id
    };
    tracing::debug!(conn_id, "client connected");

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
                        router::handle_raw(&server, conn_id, text.as_str(), false).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(conn_id, error = %e, "socket error");
                        break;
                    }
                    _ => {} // ping/pong handled by axum
                }
            }
        }
    }

    server.core.lock().await.remove_conn(conn_id);
    tracing::debug!(conn_id, "client disconnected");
}
