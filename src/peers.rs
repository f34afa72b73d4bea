//! Peer endpoint handling: URL normalization, the ordered deduplicated
//! peer set, and the dial-scheme mapping for outbound websocket connections.

use std::collections::HashSet;

use url::Url;

/// Compiled-in fallback relays, used when registry discovery is disabled or
/// fails.
pub const DEFAULT_PEERS: &[&str] = &[
    "wss://relay.toriimesh.net/sync",
    "wss://gate.toriimesh.net/sync",
    "wss://torii-us.fly.dev/sync",
    "wss://torii-eu.fly.dev/sync",
];

pub fn default_peers() -> Vec<String> {
    DEFAULT_PEERS.iter().map(|s| s.to_string()).collect()
}

/// Canonical form of a peer endpoint, or None if the string is not a usable
/// http(s)/ws(s) URL. Normalization lowercases scheme and host, drops
/// default ports, and strips the trailing slash so the same relay written
/// two ways dedups to one entry.
pub fn normalize(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => {}
        _ => return None,
    }
    url.host_str()?;
    let mut text = url.to_string();
    while text.ends_with('/') {
        text.pop();
    }
    Some(text)
}

/// Websocket dial form of an endpoint. Registry entries and config may name
/// relays by their http(s) origin; outbound connections always speak ws(s).
pub fn dial_url(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        endpoint.to_string()
    }
}

/// Endpoint one of this node's own listeners is reachable at locally.
pub fn local_endpoint(scheme: &str, port: u16) -> String {
    format!("{scheme}://localhost:{port}/sync")
}

/// Ordered peer set. First occurrence wins; later duplicates are dropped.
/// The whole set is always replaced in one assignment, never edited in
/// place, so every reader observes either the old list or the new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSet {
    endpoints: Vec<String>,
}

impl PeerSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a set from raw URLs: normalize each, drop the unusable ones,
    /// dedup by first occurrence.
    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut endpoints = Vec::new();
        for raw in urls {
            if let Some(endpoint) = normalize(raw.as_ref()) {
                if seen.insert(endpoint.clone()) {
                    endpoints.push(endpoint);
                }
            }
        }
        Self { endpoints }
    }

    /// Combine a fresh discovery result (or the fallback list), statically
    /// configured extras, and this node's own endpoints into one applied
    /// set. Order is fresh, then extras, then own.
    pub fn reconcile(fresh: &[String], additional: &[String], own: &[String]) -> Self {
        Self::from_urls(fresh.iter().chain(additional).chain(own))
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.endpoints.iter().map(String::as_str)
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.endpoints.iter().any(|e| e == endpoint)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
