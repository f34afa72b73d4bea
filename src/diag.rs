//! Periodic diagnostics.
//!
//! Two slow loops snapshot each listener for the log, and an optional
//! verbose loop prints every relayed update. All of it is read-only and
//! best effort; diagnostics never touch the data path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::connector::PeerConnector;
use crate::engine::SyncEngine;
use crate::peers::PeerSet;

/// Read-only view over one listener, shared by the diagnostic loops.
#[derive(Clone)]
pub struct DiagTarget {
    pub label: &'static str,
    pub engine: Arc<SyncEngine>,
    pub connector: PeerConnector,
    pub peers: watch::Receiver<PeerSet>,
}

/// Log peer connection state for every listener. An interval of zero
/// disables the loop.
pub async fn peer_log_loop(targets: Vec<DiagTarget>, interval_ms: u64) {
    if interval_ms == 0 {
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for target in &targets {
            let statuses = target.connector.statuses();
            let summary: Vec<String> = statuses
                .iter()
                .map(|(endpoint, status)| format!("{endpoint} [{}]", status.describe()))
                .collect();
            tracing::info!(
                listener = target.label,
                applied = target.peers.borrow().len(),
                connected = target.connector.connected_count(),
                attached = target.engine.attached(),
                peers = %summary.join(", "),
                "peer diagnostics"
            );
        }
    }
}

/// Log a graph size snapshot for every listener. An interval of zero
/// disables the loop.
pub async fn graph_log_loop(targets: Vec<DiagTarget>, interval_ms: u64) {
    if interval_ms == 0 {
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for target in &targets {
            let snapshot = target.engine.snapshot();
            match snapshot.stored_updates {
                Some(stored) => tracing::info!(
                    listener = target.label,
                    bytes = snapshot.in_memory_bytes,
                    stored,
                    "graph diagnostics"
                ),
                None => tracing::info!(
                    listener = target.label,
                    bytes = snapshot.in_memory_bytes,
                    "graph diagnostics"
                ),
            }
        }
    }
}

/// Print every update the engine applies. Runs only with verbose logging
/// on; lag here just skips entries.
pub async fn message_log_loop(label: &'static str, engine: Arc<SyncEngine>) {
    let mut events = engine.events();
    loop {
        match events.recv().await {
            Ok(frame) => {
                tracing::debug!(
                    listener = label,
                    origin = frame.origin,
                    bytes = frame.payload.len(),
                    "update relayed"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(listener = label, skipped, "verbose stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
