//! torii-relay daemon: super-peer node for the Torii graph mesh.
//!
//! Startup resolves config (compiled defaults, then JSON file, then
//! environment), binds the enabled listeners with their own sync engine
//! each, spawns peer discovery and the diagnostic loops, and reports
//! started. Discovery runs after the listeners are up; a slow or dead
//! registry never delays serving.

use std::path::PathBuf;

use clap::Parser;

use torii_relay::bootstrap;
use torii_relay::config::{Config, EnvOverrides};

#[derive(Parser)]
#[command(name = "torii-relay", version, about = "Super-peer relay node for the Torii graph mesh")]
struct Cli {
    /// Path to JSON config file (default: ./config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for durable update logs (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Write a default config.json and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "torii_relay=info".into()),
        )
        .init();

    // Both the TLS listener and the registry client link rustls; pin one
    // process-wide crypto provider before either touches it.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider was already installed");
    }

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("./config.json"));

    if cli.init_config {
        Config::write_default(&config_path)?;
        println!("Config written to {}", config_path.display());
        return Ok(());
    }

    let mut config = Config::load_or_default(&config_path);
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    EnvOverrides::capture().apply(&mut config);

    tracing::info!(
        http = config.server.use_http,
        port = config.server.port,
        tls = config.server.use_tls,
        tls_port = config.server.tls_port,
        tls_host = %config.server.tls_host,
        persistence = config.server.persistence,
        peerify = config.server.peerify,
        "configuration resolved"
    );

    let relay = bootstrap::start(config).await?;
    for listener in relay.listeners() {
        tracing::info!(
            listener = listener.label,
            addr = %listener.local_addr,
            endpoint = %listener.endpoint,
            "listener serving"
        );
    }
    tracing::info!("relay node started");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutting down");
    Ok(())
}
