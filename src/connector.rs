//! Outbound peering.
//!
//! A manager task watches the listener's applied peer set and keeps exactly
//! one dial task per endpoint, skipping the listener's own endpoint. Dial
//! tasks reconnect forever with jittered exponential backoff; a dead or
//! unreachable peer costs log noise, never an error path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::engine::SyncEngine;
use crate::peers::{self, PeerSet};

const BACKOFF_INITIAL: Duration = Duration::from_secs(3);
const BACKOFF_MAX: Duration = Duration::from_secs(120);

type PeerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of one outbound peer, as shown in diagnostics.
#[derive(Debug, Clone)]
pub enum PeerStatus {
    Connecting,
    Connected { since: Instant },
    Backoff { attempt: u32 },
}

impl PeerStatus {
    pub fn describe(&self) -> String {
        match self {
            PeerStatus::Connecting => "connecting".to_string(),
            PeerStatus::Connected { since } => {
                format!("connected {}s", since.elapsed().as_secs())
            }
            PeerStatus::Backoff { attempt } => format!("backoff #{attempt}"),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, PeerStatus::Connected { .. })
    }
}

/// Shared view over one listener's outbound connections.
#[derive(Clone)]
pub struct PeerConnector {
    label: &'static str,
    statuses: Arc<DashMap<String, PeerStatus>>,
}

impl PeerConnector {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            statuses: Arc::new(DashMap::new()),
        }
    }

    /// Start the manager task for one listener. `self_endpoint` is this
    /// listener's own normalized endpoint; an applied set containing it
    /// never dials it.
    pub fn spawn(
        label: &'static str,
        engine: Arc<SyncEngine>,
        peers_rx: watch::Receiver<PeerSet>,
        self_endpoint: String,
    ) -> (PeerConnector, JoinHandle<()>) {
        let connector = Self::new(label);
        let task = tokio::spawn(run(connector.clone(), engine, peers_rx, self_endpoint));
        (connector, task)
    }

    /// Endpoint and status pairs, sorted for stable log output.
    pub fn statuses(&self) -> Vec<(String, PeerStatus)> {
        let mut all: Vec<(String, PeerStatus)> = self
            .statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn connected_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|entry| entry.value().is_connected())
            .count()
    }
}

/// Dial tasks keyed by endpoint. Dropping the set aborts every task in it,
/// so cancelling the manager also cancels its dialers.
#[derive(Default)]
struct DialerSet {
    tasks: HashMap<String, JoinHandle<()>>,
}

impl Drop for DialerSet {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }
}

async fn run(
    connector: PeerConnector,
    engine: Arc<SyncEngine>,
    mut peers_rx: watch::Receiver<PeerSet>,
    self_endpoint: String,
) {
    let mut dialers = DialerSet::default();
    loop {
        let target: HashSet<String> = peers_rx
            .borrow_and_update()
            .iter()
            .filter(|endpoint| *endpoint != self_endpoint)
            .map(str::to_string)
            .collect();

        dialers.tasks.retain(|endpoint, task| {
            if target.contains(endpoint) {
                return true;
            }
            tracing::info!(
                listener = connector.label,
                peer = %endpoint,
                "peer left the applied set"
            );
            task.abort();
            connector.statuses.remove(endpoint);
            false
        });

        for endpoint in target {
            if dialers.tasks.contains_key(&endpoint) {
                continue;
            }
            let task = tokio::spawn(dial_loop(
                connector.label,
                engine.clone(),
                connector.statuses.clone(),
                endpoint.clone(),
            ));
            dialers.tasks.insert(endpoint, task);
        }

        if peers_rx.changed().await.is_err() {
            break;
        }
    }
}

async fn dial_loop(
    label: &'static str,
    engine: Arc<SyncEngine>,
    statuses: Arc<DashMap<String, PeerStatus>>,
    endpoint: String,
) {
    let ws_url = peers::dial_url(&endpoint);
    let mut backoff = Backoff::new(BACKOFF_INITIAL, BACKOFF_MAX);
    loop {
        statuses.insert(endpoint.clone(), PeerStatus::Connecting);
        match connect_async(ws_url.as_str()).await {
            Ok((socket, _response)) => {
                tracing::info!(listener = label, peer = %endpoint, "peer connected");
                statuses.insert(
                    endpoint.clone(),
                    PeerStatus::Connected {
                        since: Instant::now(),
                    },
                );
                backoff.reset();
                bridge(label, &engine, socket, &endpoint).await;
                tracing::info!(listener = label, peer = %endpoint, "peer disconnected");
            }
            Err(e) => {
                tracing::debug!(listener = label, peer = %endpoint, error = %e, "peer dial failed");
            }
        }
        let delay = backoff.next_delay();
        statuses.insert(
            endpoint.clone(),
            PeerStatus::Backoff {
                attempt: backoff.attempt(),
            },
        );
        tokio::time::sleep(delay).await;
    }
}

/// Pump one established peer connection: handshake with a state request,
/// then relay frames both ways until either side drops.
async fn bridge(label: &'static str, engine: &Arc<SyncEngine>, socket: PeerSocket, endpoint: &str) {
    let (mut sink, mut source) = socket.split();
    let (conn, mut bus) = engine.attach();

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
                        listener = label,
                        peer = %endpoint,
                        bytes = frame.payload.len(),
                        "update forwarded"
                    );
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        listener = label,
                        peer = %endpoint,
                        skipped,
                        "outbound fanout lagged"
                    );
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
                            listener = label,
                            peer = %endpoint,
                            error = %e,
                            "dropping bad frame from peer"
                        );
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(listener = label, peer = %endpoint, error = %e, "peer socket error");
                    break;
                }
            },
        }
    }
    engine.detach(conn);
}

/// Jittered exponential backoff. Delays double per attempt up to the cap;
/// the actual sleep is drawn from the upper half of the window so repeated
/// failures across many relays do not line up.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let window = self
            .max
            .as_millis()
            .min(self.initial.as_millis().saturating_mul(1u128 << shift)) as u64;
        if window == 0 {
            return Duration::ZERO;
        }
        let floor = window / 2;
        let jitter = rand::thread_rng().gen_range(0..=window - floor);
        Duration::from_millis(floor + jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_first_delay_within_initial_window() {
        let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(120));
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(1_500));
        assert!(delay <= Duration::from_secs(3));
        assert_eq!(backoff.attempt(), 1);
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(120));
        let mut last = Duration::ZERO;
        for _ in 0..40 {
            last = backoff.next_delay();
            assert!(last <= Duration::from_secs(120));
        }
        // Far past the doubling range the window is pinned to the cap.
        assert!(last >= Duration::from_secs(60));
    }

    #[test]
    fn backoff_reset_returns_to_initial_window() {
        let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(120));
        for _ in 0..10 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_secs(3));
    }

    #[test]
    fn backoff_zero_initial_never_panics() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn dialer_set_drop_aborts_outstanding_tasks() {
        let task = tokio::spawn(std::future::pending::<()>());
        let monitor = task.abort_handle();

        let mut dialers = DialerSet::default();
        dialers.tasks.insert("wss://a.example/sync".to_string(), task);
        drop(dialers);

        for _ in 0..50 {
            if monitor.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dial task kept running after its set was dropped");
    }

    #[test]
    fn statuses_sorted_and_counted() {
        let connector = PeerConnector::new("http");
        connector
            .statuses
            .insert("wss://b.example/sync".to_string(), PeerStatus::Connecting);
        connector.statuses.insert(
            "wss://a.example/sync".to_string(),
            PeerStatus::Connected {
                since: Instant::now(),
            },
        );

        let all = connector.statuses();
        assert_eq!(all[0].0, "wss://a.example/sync");
        assert_eq!(connector.connected_count(), 1);
    }
}
