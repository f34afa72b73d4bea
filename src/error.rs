//! Error types for the relay: configuration, certificates, binds, engine
//! glue, and peer transport.
//!
//! Startup errors (config, certificates, listener binds) are fatal and
//! surface out of `bootstrap::start`. Anything that happens after startup,
//! like peer dials, registry fetches, or per-frame decode failures, is
//! logged and retried or dropped by the owning task instead of tearing the
//! process down.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("config error: {reason}")]
    Config { reason: String },

    #[error("certificate unavailable at {path}: {source}")]
    Certificate {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sync engine error: {reason}")]
    Engine { reason: String },

    #[error("bad sync frame: {reason}")]
    Protocol { reason: String },

    #[error("registry error: {reason}")]
    Registry { reason: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
