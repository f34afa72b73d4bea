//! Process bootstrap.
//!
//! `start` turns a resolved config into a running relay: one engine and
//! router per enabled listener, the outbound connector for each, then the
//! discovery and diagnostic tasks. Listeners come up immediately with an
//! empty peer set; discovery applies the real set later in a single
//! replace per listener, so there is no window where a half-built list is
//! visible.
//!
//! Certificate problems surface here, before any socket is bound.
//! Everything returned in `Relay` is fixed at startup; nothing is mutated
//! or rebound afterwards.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connector::PeerConnector;
use crate::diag::{self, DiagTarget};
use crate::discovery::{self, ApplyTarget};
use crate::engine::SyncEngine;
use crate::error::{RelayError, Result};
use crate::peers::{self, PeerSet};
use crate::server::{self, AppState};

/// One bound listener and the pieces attached to it.
pub struct ListenerHandle {
    pub label: &'static str,
    pub local_addr: SocketAddr,
    /// Normalized local endpoint, as appended to the peer set when peerify
    /// is on.
    pub endpoint: String,
    pub engine: Arc<SyncEngine>,
    pub peers: watch::Receiver<PeerSet>,
    pub connector: PeerConnector,
    peers_tx: Arc<watch::Sender<PeerSet>>,
}

impl ListenerHandle {
    /// Replace this listener's applied peer set in one assignment.
    pub fn apply_peers(&self, set: PeerSet) {
        self.peers_tx.send_replace(set);
    }
}

/// A started relay. Dropping it does not stop the spawned tasks; the
/// production teardown is process exit, and tests run each relay on its
/// own runtime.
pub struct Relay {
    pub http: Option<ListenerHandle>,
    pub tls: Option<ListenerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Relay {
    pub fn listeners(&self) -> impl Iterator<Item = &ListenerHandle> {
        self.http.iter().chain(self.tls.iter())
    }

    /// Abort all background tasks. For embedders and tests; the daemon
    /// never calls this.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Bring the relay up. Fails fast on config, certificate, or bind
/// problems; after a successful return the relay only degrades, never
/// exits.
pub async fn start(config: Config) -> Result<Relay> {
    config.validate()?;
    let config = Arc::new(config);

    // Certificate failures are startup-fatal; surface them before any
    // socket is bound, the plain listener's included.
    let tls_acceptor = if config.server.use_tls {
        let cert_path = config.server.cert_dir.join("cert.pem");
        let key_path = config.server.cert_dir.join("privkey.pem");
        let tls_config = load_tls_config(&cert_path, &key_path)?;
        Some(tokio_rustls::TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    let mut tasks = Vec::new();

    let http = if config.server.use_http {
        let (handle, listener_tasks) = start_plain(config.clone()).await?;
        tasks.extend(listener_tasks);
        Some(handle)
    } else {
        None
    };

    let tls = match tls_acceptor {
        Some(acceptor) => {
            let (handle, listener_tasks) = start_tls(config.clone(), acceptor).await?;
            tasks.extend(listener_tasks);
            Some(handle)
        }
        None => None,
    };

    if http.is_none() && tls.is_none() {
        tracing::warn!("both listeners disabled, relay is idle");
    }

    let handles: Vec<&ListenerHandle> = http.iter().chain(tls.iter()).collect();

    if !handles.is_empty() {
        let own: Vec<String> = if config.server.peerify {
            handles.iter().map(|h| h.endpoint.clone()).collect()
        } else {
            Vec::new()
        };
        let targets: Vec<ApplyTarget> = handles
            .iter()
            .map(|h| ApplyTarget {
                label: h.label,
                tx: h.peers_tx.clone(),
            })
            .collect();
        tasks.push(tokio::spawn(discovery::load_and_apply(
            config.clone(),
            own,
            targets,
        )));

        let diag_targets: Vec<DiagTarget> = handles
            .iter()
            .map(|h| DiagTarget {
                label: h.label,
                engine: h.engine.clone(),
                connector: h.connector.clone(),
                peers: h.peers.clone(),
            })
            .collect();
        tasks.push(tokio::spawn(diag::peer_log_loop(
            diag_targets.clone(),
            config.logging.peers_interval_ms,
        )));
        tasks.push(tokio::spawn(diag::graph_log_loop(
            diag_targets.clone(),
            config.logging.graph_interval_ms,
        )));
        if config.logging.verbose {
            for target in &diag_targets {
                tasks.push(tokio::spawn(diag::message_log_loop(
                    target.label,
                    target.engine.clone(),
                )));
            }
        }
    }

    Ok(Relay { http, tls, tasks })
}

/// Common listener assembly once a socket is bound: engine, peer channel,
/// connector, router state.
fn assemble(
    label: &'static str,
    scheme: &str,
    local_addr: SocketAddr,
    config: &Arc<Config>,
) -> Result<(ListenerHandle, AppState, JoinHandle<()>)> {
    let persist = config
        .server
        .persistence
        .then(|| config.update_log_path(label));
    let engine = Arc::new(SyncEngine::open(label, persist.as_deref())?);

    let raw_endpoint = peers::local_endpoint(scheme, local_addr.port());
    let endpoint = peers::normalize(&raw_endpoint).unwrap_or(raw_endpoint);

    let (peers_tx, peers_rx) = watch::channel(PeerSet::empty());
    let peers_tx = Arc::new(peers_tx);

    let (connector, connector_task) =
        PeerConnector::spawn(label, engine.clone(), peers_rx.clone(), endpoint.clone());

    let state = AppState {
        label,
        engine: engine.clone(),
        config: config.clone(),
        connector: connector.clone(),
        peers: peers_rx.clone(),
        started_at: Instant::now(),
        port: local_addr.port(),
        endpoint: endpoint.clone(),
    };

    let handle = ListenerHandle {
        label,
        local_addr,
        endpoint,
        engine,
        peers: peers_rx,
        connector,
        peers_tx,
    };
    Ok((handle, state, connector_task))
}

async fn start_plain(config: Arc<Config>) -> Result<(ListenerHandle, Vec<JoinHandle<()>>)> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr).await.map_err(|e| RelayError::Bind {
        addr: addr.to_string(),
        source: e,
    })?;
    let local_addr = listener.local_addr()?;

    let (handle, state, connector_task) = assemble("http", "http", local_addr, &config)?;
    let app = server::router(state);

    tracing::info!(addr = %local_addr, endpoint = %handle.endpoint, "http listener bound");
    let serve_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(listener = "http", error = %e, "listener failed");
        }
    });

    Ok((handle, vec![connector_task, serve_task]))
}

async fn start_tls(
    config: Arc<Config>,
    acceptor: tokio_rustls::TlsAcceptor,
) -> Result<(ListenerHandle, Vec<JoinHandle<()>>)> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.tls_port));
    let listener = TcpListener::bind(addr).await.map_err(|e| RelayError::Bind {
        addr: addr.to_string(),
        source: e,
    })?;
    let local_addr = listener.local_addr()?;

    let (handle, state, connector_task) = assemble("tls", "https", local_addr, &config)?;
    let app = server::router(state);

    tracing::info!(
        addr = %local_addr,
        host = %config.server.tls_host,
        endpoint = %handle.endpoint,
        "tls listener bound"
    );
    let serve_task = tokio::spawn(serve_tls(listener, acceptor, app));

    Ok((handle, vec![connector_task, serve_task]))
}

/// Accept loop for the TLS listener. Handshake and connection errors cost
/// one debug line; the loop itself never exits.
async fn serve_tls(listener: TcpListener, acceptor: tokio_rustls::TlsAcceptor, app: axum::Router) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(listener = "tls", error = %e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    tracing::debug!(peer = %peer_addr, error = %e, "tls handshake failed");
                    return;
                }
            };
            let service = hyper_util::service::TowerToHyperService::new(app);
            if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                hyper_util::rt::TokioExecutor::new(),
            )
            .serve_connection_with_upgrades(hyper_util::rt::TokioIo::new(tls_stream), service)
            .await
            {
                tracing::debug!(peer = %peer_addr, error = %e, "tls connection closed with error");
            }
        });
    }
}

fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::Config {
            reason: format!("certificate and key do not form a usable pair: {e}"),
        })?;
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(tls_config)
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| RelayError::Certificate {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut reader = std::io::BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<_>>()
        .map_err(|e| RelayError::Certificate {
            path: path.display().to_string(),
            source: e,
        })?;
    if certs.is_empty() {
        return Err(RelayError::Certificate {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "no certificates in file"),
        });
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| RelayError::Certificate {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut reader = std::io::BufReader::new(file);
    let key = rustls_pemfile::private_key(&mut reader).map_err(|e| RelayError::Certificate {
        path: path.display().to_string(),
        source: e,
    })?;
    key.ok_or_else(|| RelayError::Certificate {
        path: path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key in file"),
    })
}
