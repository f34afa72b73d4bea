use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Compiled-in registry queried once at startup for a fresh relay list.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry.toriimesh.net/relays.json";

/// Listener setup: which sockets to open and how they identify themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Plain HTTP listener port.
    pub port: u16,
    /// TLS listener port.
    pub tls_port: u16,
    /// Public hostname the TLS certificate was issued for. Informational;
    /// never substituted into peer URLs.
    pub tls_host: String,
    /// Serve the plain listener.
    pub use_http: bool,
    /// Serve the TLS listener. Requires a certificate under `cert_dir`.
    pub use_tls: bool,
    /// Append this node's own listener endpoints to the applied peer set so
    /// local listeners mesh with each other and advertise themselves.
    pub peerify: bool,
    /// Keep a durable update log per listener under `storage.data_dir`.
    pub persistence: bool,
    /// Directory holding `cert.pem` and `privkey.pem` for the TLS listener.
    pub cert_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            tls_port: 8443,
            tls_host: "example.com".to_string(),
            use_http: true,
            use_tls: false,
            peerify: true,
            persistence: true,
            cert_dir: PathBuf::from("./cert"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Periodic diagnostics. An interval of zero disables that loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// How often to log peer connection state.
    pub peers_interval_ms: u64,
    /// How often to log a graph size snapshot.
    pub graph_interval_ms: u64,
    /// Log every relayed update at debug level.
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            peers_interval_ms: 5_000,
            graph_interval_ms: 20_000,
            verbose: true,
        }
    }
}

/// Statically configured peers, merged after whatever list discovery yields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    pub additional: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub registry_url: String,
    pub timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            timeout_ms: 10_000,
        }
    }
}

/// Static asset serving for the bundled web client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub view_dir: PathBuf,
    pub index_page: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            view_dir: PathBuf::from("./view"),
            index_page: "main.html".to_string(),
        }
    }
}

/// Full relay configuration.
///
/// Every field carries a serde default, so a config file only has to name
/// the fields it wants to change. A file containing `{"server":{"port":9090}}`
/// moves the HTTP port and leaves everything else at compiled defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub peers: PeersConfig,
    pub discovery: DiscoveryConfig,
    pub web: WebConfig,
}

impl Config {
    /// Durable update log for one listener.
    pub fn update_log_path(&self, label: &str) -> PathBuf {
        self.storage.data_dir.join(format!("relay-{label}.db"))
    }

    pub fn index_path(&self) -> PathBuf {
        self.web.view_dir.join(&self.web.index_page)
    }

    /// Load config from a JSON file. Returns None if the file does not exist.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Option<Config>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(Some(config))
    }

    /// Resolve the effective file-level config: compiled defaults when the
    /// file is absent or unreadable, otherwise the file merged over defaults.
    /// A broken config file downgrades to defaults with a warning rather than
    /// refusing to start.
    pub fn load_or_default(path: &Path) -> Config {
        match Self::load_from_file(path) {
            Ok(Some(config)) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Ok(None) => {
                tracing::info!(path = %path.display(), "no config file, using compiled defaults");
                Config::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "config file unusable, using compiled defaults");
                Config::default()
            }
        }
    }

    /// Write a default config file.
    /// Returns an error if the file already exists (to prevent accidental overwrite).
    pub fn write_default(path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            anyhow::bail!(
                "config file already exists: {}. Remove it first to regenerate.",
                path.display()
            );
        }
        let body = serde_json::to_string_pretty(&Config::default())?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the config for obvious errors before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.server.use_http
            && self.server.use_tls
            && self.server.port == self.server.tls_port
            && self.server.port != 0
        {
            return Err(RelayError::Config {
                reason: format!("port and tls_port must differ (both {})", self.server.port),
            });
        }
        if self.discovery.enabled && self.discovery.registry_url.is_empty() {
            return Err(RelayError::Config {
                reason: "discovery.registry_url must not be empty while discovery is enabled"
                    .to_string(),
            });
        }
        if self.server.use_tls && self.server.cert_dir.as_os_str().is_empty() {
            return Err(RelayError::Config {
                reason: "server.cert_dir must not be empty while use_tls is set".to_string(),
            });
        }
        Ok(())
    }
}

/// Environment overrides, captured once at startup. The variable names are
/// fixed by long-standing deployment scripts and keep their legacy SSL
/// spelling.
///
/// A variable that is present always wins over the file value, even when it
/// disables something. `USE_SSL` enables TLS only for the exact string
/// `"true"`; `USE_HTTP` disables HTTP only for the exact string `"false"`.
/// Unparsable port values are logged and skipped, leaving the file value in
/// place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub port: Option<u16>,
    pub tls_port: Option<u16>,
    pub tls_host: Option<String>,
    pub use_tls: Option<bool>,
    pub use_http: Option<bool>,
}

impl EnvOverrides {
    /// Capture overrides from the process environment.
    pub fn capture() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Capture overrides from an arbitrary lookup. Tests pass closures here
    /// instead of mutating process-wide environment state.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            port: lookup("PORT").and_then(|v| parse_port("PORT", &v)),
            tls_port: lookup("SSL_PORT").and_then(|v| parse_port("SSL_PORT", &v)),
            tls_host: lookup("SSL_HOST").filter(|v| !v.is_empty()),
            use_tls: lookup("USE_SSL").map(|v| v == "true"),
            use_http: lookup("USE_HTTP").map(|v| v != "false"),
        }
    }

    /// Fold the captured overrides into a resolved config.
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(tls_port) = self.tls_port {
            config.server.tls_port = tls_port;
        }
        if let Some(ref tls_host) = self.tls_host {
            config.server.tls_host = tls_host.clone();
        }
        if let Some(use_tls) = self.use_tls {
            config.server.use_tls = use_tls;
        }
        if let Some(use_http) = self.use_http {
            config.server.use_http = use_http;
        }
    }
}

fn parse_port(var: &'static str, value: &str) -> Option<u16> {
    match value.trim().parse::<u16>() {
        Ok(port) => Some(port),
        Err(_) => {
            tracing::warn!(var, value, "ignoring unparsable port override");
            None
        }
    }
}
