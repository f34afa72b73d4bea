//! HTTP surface shared by both listeners.
//!
//! One router serves the websocket sync endpoint, a status document, and
//! the bundled web client. When no web client is present on disk the
//! router falls back to a generated landing page naming the listener's
//! port. Each listener gets its own router instance bound to its own
//! engine; the shape is identical, the state differs.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::handler::Handler;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::connector::PeerConnector;
use crate::engine::{GraphSnapshot, SyncEngine};
use crate::peers::PeerSet;

/// Everything one listener's handlers need.
#[derive(Clone)]
pub struct AppState {
    pub label: &'static str,
    pub engine: Arc<SyncEngine>,
    pub config: Arc<Config>,
    pub connector: PeerConnector,
    pub peers: watch::Receiver<PeerSet>,
    pub started_at: Instant,
    pub port: u16,
    pub endpoint: String,
}

pub fn router(state: AppState) -> Router {
    let view_dir = state.config.web.view_dir.clone();
    let index = state.config.index_path();
    let app = Router::new()
        .route("/sync", get(sync_socket))
        .route("/status", get(status));

    let app = if view_dir.is_dir() {
        // Unknown paths serve the web client's entry page, status 200, so
        // client-side routes keep working; with no entry page installed
        // they get the generated landing page instead.
        if index.is_file() {
            app.fallback_service(ServeDir::new(&view_dir).fallback(ServeFile::new(&index)))
        } else {
            let landing = fallback_page.with_state(state.clone());
            app.fallback_service(ServeDir::new(&view_dir).fallback(landing))
        }
    } else {
        app.fallback(fallback_page)
    };

    app.layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn sync_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_bridge(socket, state))
}

/// Pump one attached client connection. Same protocol as the outbound
/// bridge: state request on attach, then frames both ways until the socket
/// drops.
async fn client_bridge(socket: WebSocket, state: AppState) {
    let engine = state.engine;
    let (mut sink, mut source) = socket.split();
    let (conn, mut bus) = engine.attach();
    tracing::debug!(listener = state.label, conn, "client attached");

    if sink
        .send(Message::Binary(engine.state_request()))
        .await
        .is_err()
    {
        engine.detach(conn);
        return;
    }

    loop {
        tokio::select! {
            frame = bus.recv() => match frame {
                Ok(frame) if frame.origin != conn => {
                    let msg = Message::Binary(SyncEngine::encode_update_frame(&frame.payload));
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                    tracing::debug!(
                        listener = state.label,
                        conn,
                        bytes = frame.payload.len(),
                        "update forwarded"
                    );
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(listener = state.label, conn, skipped, "client fanout lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = source.next() => match msg {
                Some(Ok(Message::Binary(data))) => match engine.handle_frame(conn, &data) {
                    Ok(Some(reply)) => {
                        if sink.send(Message::Binary(reply)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(
                            listener = state.label,
                            conn,
                            error = %e,
                            "dropping bad frame from client"
                        );
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(listener = state.label, conn, error = %e, "client socket error");
                    break;
                }
            },
        }
    }
    engine.detach(conn);
    tracing::debug!(listener = state.label, conn, "client detached");
}

#[derive(Serialize)]
struct PeerEntry {
    endpoint: String,
    state: String,
}

#[derive(Serialize)]
struct ListenerStatus {
    version: &'static str,
    listener: &'static str,
    port: u16,
    endpoint: String,
    uptime_secs: u64,
    attached_connections: u64,
    applied_peers: Vec<String>,
    peer_connections: Vec<PeerEntry>,
    graph: GraphSnapshot,
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let applied_peers = state.peers.borrow().endpoints().to_vec();
    let peer_connections = state
        .connector
        .statuses()
        .into_iter()
        .map(|(endpoint, status)| PeerEntry {
            endpoint,
            state: status.describe(),
        })
        .collect();

    let data = ListenerStatus {
        version: env!("CARGO_PKG_VERSION"),
        listener: state.label,
        port: state.port,
        endpoint: state.endpoint.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        attached_connections: state.engine.attached(),
        applied_peers,
        peer_connections,
        graph: state.engine.snapshot(),
    };
    Json(serde_json::json!({ "success": true, "data": data }))
}

/// Landing page served when no web client is installed.
async fn fallback_page(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<!doctype html>\n<html>\n<head><title>torii relay</title></head>\n<body>\n\
         <h1>torii relay</h1>\n\
         <p>Relay node is up and listening on port {}.</p>\n\
         <p>Point your client at <code>{}</code>.</p>\n\
         </body>\n</html>\n",
        state.port, state.endpoint
    ))
}
