//! Startup peer discovery.
//!
//! One fetch against the configured registry, then a single atomic peer-set
//! replace per listener. Listeners are already serving while this runs;
//! they start with an empty set and never wait on the network. Every
//! failure path degrades to the compiled-in default list.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::peers::{self, PeerSet};

/// Where one listener's applied peer set gets written.
pub struct ApplyTarget {
    pub label: &'static str,
    pub tx: Arc<watch::Sender<PeerSet>>,
}

/// Extract relay URLs from a registry document. Accepts either a bare JSON
/// array of strings or an object with a `relays` array; entries that are
/// not strings are dropped.
pub fn parse_registry(body: &serde_json::Value) -> Option<Vec<String>> {
    let entries = match body {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => map.get("relays")?.as_array()?,
        _ => return None,
    };
    Some(
        entries
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
    )
}

/// Fetch the fresh relay list from the registry. Malformed entries are
/// dropped; a document with no usable shape is an error.
pub async fn fetch_registry(client: &reqwest::Client, url: &str) -> Result<Vec<String>> {
    let body: serde_json::Value = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let raw = parse_registry(&body).ok_or_else(|| RelayError::Registry {
        reason: format!("unrecognized registry document from {url}"),
    })?;
    let mut dropped = 0usize;
    let fresh: Vec<String> = raw
        .iter()
        .filter_map(|entry| {
            let normalized = peers::normalize(entry);
            if normalized.is_none() {
                dropped += 1;
            }
            normalized
        })
        .collect();
    if dropped > 0 {
        tracing::warn!(dropped, url, "registry entries were not usable URLs");
    }
    Ok(fresh)
}

async fn fresh_list(config: &Config) -> Result<Vec<String>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.discovery.timeout_ms))
        .build()?;
    fetch_registry(&client, &config.discovery.registry_url).await
}

/// Resolve the final peer set and apply it to every listener in one
/// replace each. `own` carries this node's listener endpoints (empty when
/// peerify is off); they always land at the tail of the set.
pub async fn load_and_apply(config: Arc<Config>, own: Vec<String>, targets: Vec<ApplyTarget>) {
    let fresh = if config.discovery.enabled {
        match fresh_list(&config).await {
            Ok(list) => {
                tracing::info!(
                    count = list.len(),
                    url = %config.discovery.registry_url,
                    "fresh peer list loaded"
                );
                Some(list)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    url = %config.discovery.registry_url,
                    "peer discovery failed, falling back to default peers"
                );
                None
            }
        }
    } else {
        tracing::info!("peer discovery disabled, using default peers");
        None
    };

    let base = fresh.unwrap_or_else(peers::default_peers);
    let set = PeerSet::reconcile(&base, &config.peers.additional, &own);

    for target in &targets {
        target.tx.send_replace(set.clone());
        tracing::info!(
            listener = target.label,
            peers = set.len(),
            "peer set applied"
        );
    }
}
