use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Map, ReadTxn, StateVector, Transact};

use torii_relay::bootstrap;
use torii_relay::config::Config;
use torii_relay::engine::{SyncEngine, TAG_STATE_REQUEST, TAG_UPDATE};
use torii_relay::peers::{self, PeerSet};

fn quiet_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.server.port = 0;
    config.server.persistence = false;
    config.storage.data_dir = dir.join("data");
    config.web.view_dir = dir.join("view");
    config.discovery.enabled = false;
    config.logging.peers_interval_ms = 0;
    config.logging.graph_interval_ms = 0;
    config.logging.verbose = false;
    config
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Update frame carrying the full state of a fresh one-entry document.
fn sample_update_frame(key: &str, value: &str) -> Vec<u8> {
    let doc = Doc::new();
    let map = doc.get_or_insert_map("graph");
    {
        let mut txn = doc.transact_mut();
        map.insert(&mut txn, key.to_string(), value.to_string());
    }
    let update = doc
        .transact()
        .encode_state_as_update_v1(&StateVector::default());
    SyncEngine::encode_update_frame(&update)
}

#[tokio::test]
async fn sync_endpoint_speaks_the_frame_protocol() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("torii_relay=debug")
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let relay = bootstrap::start(quiet_config(dir.path())).await.unwrap();
    let handle = relay.http.as_ref().unwrap();

    let (mut ws, _) = connect_async(peers::dial_url(&handle.endpoint))
        .await
        .unwrap();

    // The listener greets every attached connection with a state request.
    let greeting = ws.next().await.unwrap().unwrap();
    let data = greeting.into_data();
    assert!(!data.is_empty());
    assert_eq!(data[0], TAG_STATE_REQUEST);

    // An empty state vector asks for everything; the reply is an update.
    let mut request = vec![TAG_STATE_REQUEST];
    request.extend_from_slice(&StateVector::default().encode_v1());
    ws.send(Message::Binary(request)).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let data = reply.into_data();
    assert_eq!(data[0], TAG_UPDATE);

    relay.shutdown();
}

/// Two relays, A pointed at B. An update fed to B through its public sync
/// endpoint must land in A's engine through the outbound bridge.
#[tokio::test]
async fn update_propagates_between_relays() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("torii_relay=debug")
        .try_init();

    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let relay_a = bootstrap::start(quiet_config(dir_a.path())).await.unwrap();
    let relay_b = bootstrap::start(quiet_config(dir_b.path())).await.unwrap();
    let a = relay_a.http.as_ref().unwrap();
    let b = relay_b.http.as_ref().unwrap();

    // Let startup discovery apply its set first, then point A at B alone.
    wait_for("startup peer set on A", || !a.peers.borrow().is_empty()).await;
    a.apply_peers(PeerSet::from_urls([b.endpoint.as_str()]));

    // A's connector dials B; B sees the bridge as an attached connection.
    wait_for("A's bridge to reach B", || b.engine.attached() >= 1).await;
    let baseline = a.engine.snapshot().in_memory_bytes;

    let (mut ws, _) = connect_async(peers::dial_url(&b.endpoint)).await.unwrap();
    ws.send(Message::Binary(sample_update_frame("greeting", "hello mesh")))
        .await
        .unwrap();

    wait_for("update to reach A", || {
        a.engine.snapshot().in_memory_bytes > baseline
    })
    .await;

    relay_a.shutdown();
    relay_b.shutdown();
}

#[tokio::test]
async fn discovery_applies_registry_list() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("torii_relay=debug")
        .try_init();

    // Local registry answering with a list containing one duplicate.
    let registry = axum::Router::new().route(
        "/relays.json",
        axum::routing::get(|| async {
            axum::Json(serde_json::json!({
                "relays": [
                    "wss://alpha.example/sync",
                    "wss://beta.example/sync",
                    "wss://alpha.example/sync/"
                ]
            }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let registry_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, registry).await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let mut config = quiet_config(dir.path());
    config.discovery.enabled = true;
    config.discovery.registry_url = format!("http://{registry_addr}/relays.json");
    config.discovery.timeout_ms = 2_000;

    let relay = bootstrap::start(config).await.unwrap();
    let handle = relay.http.as_ref().unwrap();

    wait_for("registry peers applied", || !handle.peers.borrow().is_empty()).await;
    let applied = handle.peers.borrow().endpoints().to_vec();
    assert_eq!(
        applied,
        vec![
            "wss://alpha.example/sync".to_string(),
            "wss://beta.example/sync".to_string(),
            handle.endpoint.clone(),
        ]
    );

    relay.shutdown();
}

#[tokio::test]
async fn discovery_failure_falls_back_to_defaults() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("torii_relay=debug")
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let mut config = quiet_config(dir.path());
    config.discovery.enabled = true;
    // Discard port; nothing answers here.
    config.discovery.registry_url = "http://127.0.0.1:9/relays.json".to_string();
    config.discovery.timeout_ms = 2_000;

    let relay = bootstrap::start(config).await.unwrap();
    let handle = relay.http.as_ref().unwrap();

    wait_for("fallback peers applied", || !handle.peers.borrow().is_empty()).await;
    let applied = handle.peers.borrow().endpoints().to_vec();
    let mut expected = peers::default_peers();
    expected.push(handle.endpoint.clone());
    assert_eq!(applied, expected);

    relay.shutdown();
}

#[tokio::test]
async fn peerify_off_keeps_own_endpoint_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quiet_config(dir.path());
    config.server.peerify = false;

    let relay = bootstrap::start(config).await.unwrap();
    let handle = relay.http.as_ref().unwrap();

    wait_for("peer set applied", || !handle.peers.borrow().is_empty()).await;
    let applied = handle.peers.borrow().endpoints().to_vec();
    assert_eq!(applied, peers::default_peers());
    assert!(!applied.contains(&handle.endpoint));

    relay.shutdown();
}
