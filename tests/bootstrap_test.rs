use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tokio::sync::watch;
use tower::ServiceExt;

use torii_relay::bootstrap;
use torii_relay::config::Config;
use torii_relay::connector::PeerConnector;
use torii_relay::engine::SyncEngine;
use torii_relay::peers::PeerSet;
use torii_relay::server::{self, AppState};

/// Config pointing every path at a temp dir, with ephemeral ports and all
/// background chatter off.
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

fn test_state(config: Config, port: u16) -> AppState {
    AppState {
        label: "http",
        engine: Arc::new(SyncEngine::open("http", None).unwrap()),
        config: Arc::new(config),
        connector: PeerConnector::new("http"),
        peers: watch::channel(PeerSet::empty()).1,
        started_at: Instant::now(),
        port,
        endpoint: format!("http://localhost:{port}/sync"),
    }
}

#[tokio::test]
async fn fallback_page_contains_port() {
    let dir = tempfile::tempdir().unwrap();
    // No view directory on disk, so unknown paths get the generated page.
    let app = server::router(test_state(quiet_config(dir.path()), 4747));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/definitely/not/a/file")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("4747"), "page should name the port: {text}");
    assert!(text.contains("/sync"), "page should name the sync endpoint");
}

#[tokio::test]
async fn status_reports_listener_shape() {
    let dir = tempfile::tempdir().unwrap();
    let app = server::router(test_state(quiet_config(dir.path()), 4747));

    let response = app
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["listener"], "http");
    assert_eq!(json["data"]["port"], 4747);
    assert_eq!(json["data"]["attached_connections"], 0);
    assert!(json["data"]["graph"]["in_memory_bytes"].is_u64());
}

#[tokio::test]
async fn view_dir_serves_assets_with_index_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let view = dir.path().join("view");
    std::fs::create_dir_all(&view).unwrap();
    std::fs::write(view.join("main.html"), "<html>torii client</html>").unwrap();
    std::fs::write(view.join("app.js"), "console.log('torii');").unwrap();

    let app = server::router(test_state(quiet_config(dir.path()), 4747));

    let asset = app
        .clone()
        .oneshot(Request::builder().uri("/app.js").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(asset.status(), StatusCode::OK);
    let body = asset.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("console.log"));

    // Unknown paths fall back to the entry page, not a 404.
    let deep = app
        .oneshot(
            Request::builder()
                .uri("/some/client/route")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(deep.status(), StatusCode::OK);
    let body = deep.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("torii client"));
}

#[tokio::test]
async fn view_dir_without_index_still_serves_assets() {
    let dir = tempfile::tempdir().unwrap();
    let view = dir.path().join("view");
    std::fs::create_dir_all(&view).unwrap();
    std::fs::write(view.join("app.js"), "console.log('torii');").unwrap();

    let app = server::router(test_state(quiet_config(dir.path()), 4747));

    let asset = app
        .clone()
        .oneshot(Request::builder().uri("/app.js").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(asset.status(), StatusCode::OK);

    // No entry page installed, so unknown paths get the generated one.
    let page = app
        .oneshot(
            Request::builder()
                .uri("/anything")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(page.status(), StatusCode::OK);
    let body = page.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("4747"));
}

#[tokio::test]
async fn missing_certificates_fail_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quiet_config(dir.path());
    config.server.use_http = false;
    config.server.use_tls = true;
    config.server.tls_port = 0;
    config.server.cert_dir = dir.path().join("cert");

    let err = match bootstrap::start(config).await {
        Ok(_) => panic!("startup must fail without certificates"),
        Err(e) => e,
    };
    assert!(
        err.to_string().contains("certificate"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn certificates_checked_before_any_bind() {
    let dir = tempfile::tempdir().unwrap();
    // Hold the plain port open; a premature bind would surface as a bind
    // error instead of the certificate one.
    let occupied = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let mut config = quiet_config(dir.path());
    config.server.port = port;
    config.server.use_tls = true;
    config.server.tls_port = 0;
    config.server.cert_dir = dir.path().join("cert");

    let err = match bootstrap::start(config).await {
        Ok(_) => panic!("startup must fail without certificates"),
        Err(e) => e,
    };
    assert!(
        err.to_string().contains("certificate"),
        "expected the certificate failure first: {err}"
    );
}

#[tokio::test]
async fn started_relay_serves_status_over_socket() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("torii_relay=debug")
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let relay = bootstrap::start(quiet_config(dir.path())).await.unwrap();
    let handle = relay.http.as_ref().unwrap();
    let port = handle.local_addr.port();
    assert_ne!(port, 0, "ephemeral port should be resolved after bind");

    let json: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{port}/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["port"], u64::from(port));
    assert_eq!(
        json["data"]["endpoint"],
        format!("http://localhost:{port}/sync")
    );

    let page = reqwest::get(format!("http://127.0.0.1:{port}/nothing/here"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(page.contains(&port.to_string()));

    relay.shutdown();
}

#[tokio::test]
async fn relay_with_no_listeners_still_starts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quiet_config(dir.path());
    config.server.use_http = false;
    config.server.use_tls = false;

    let relay = bootstrap::start(config).await.unwrap();
    assert_eq!(relay.listeners().count(), 0);
    relay.shutdown();
}
