//! Glue around the graph sync engine.
//!
//! Each listener owns one `SyncEngine`: an in-memory CRDT document plus an
//! optional durable update log. The relay never interprets graph contents;
//! merge semantics, idempotence, and conflict resolution belong to the
//! engine. What the relay adds is the wire frame around engine payloads,
//! persistence, and fanout of applied updates to every other attached
//! connection.
//!
//! Wire frames are one tag byte followed by an engine-encoded payload:
//!
//! * `0x00` state request, payload is the sender's state vector. The peer
//!   answers with an update frame containing everything the sender is
//!   missing.
//! * `0x01` update, payload is an encoded document update.
//!
//! Both sides of a connection send a state request on attach, so a new
//! connection converges in one round trip in each direction.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::{RelayError, Result};
use crate::store::UpdateStore;

pub const TAG_STATE_REQUEST: u8 = 0x00;
pub const TAG_UPDATE: u8 = 0x01;

/// Identifies one attached connection for fanout filtering.
pub type ConnId = u64;

/// An applied update on its way to every attached connection except the one
/// it arrived on.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: ConnId,
    pub payload: Arc<Vec<u8>>,
}

/// Point-in-time graph size figures for diagnostics and the status endpoint.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct GraphSnapshot {
    /// Size of the full encoded document state.
    pub in_memory_bytes: usize,
    /// Rows in the durable update log, when persistence is on.
    pub stored_updates: Option<u64>,
}

pub struct SyncEngine {
    label: &'static str,
    doc: Mutex<Doc>,
    store: Option<UpdateStore>,
    bus: broadcast::Sender<Frame>,
    next_conn: AtomicU64,
    attached: AtomicU64,
}

impl SyncEngine {
    /// Build an engine, replaying and compacting the durable log when a
    /// path is given. Undecodable rows are skipped with a warning; a
    /// partially readable log is better than refusing to start.
    pub fn open(label: &'static str, persist: Option<&Path>) -> Result<Self> {
        let doc = Doc::new();
        let store = match persist {
            Some(path) => Some(UpdateStore::open(path)?),
            None => None,
        };

        if let Some(store) = &store {
            let rows = store.load_all()?;
            let total = rows.len();
            let mut skipped = 0usize;
            for payload in rows {
                match Update::decode_v1(&payload) {
                    Ok(update) => {
                        doc.transact_mut().apply_update(update);
                    }
                    Err(e) => {
                        skipped += 1;
                        tracing::warn!(
                            listener = label,
                            error = %e,
                            "skipping undecodable row in update log"
                        );
                    }
                }
            }
            if total > 1 {
                let merged = doc
                    .transact()
                    .encode_state_as_update_v1(&StateVector::default());
                store.compact(&merged)?;
            }
            if total > 0 {
                tracing::info!(
                    listener = label,
                    replayed = total - skipped,
                    skipped,
                    "update log loaded"
                );
            }
        }

        let (bus, _) = broadcast::channel(1024);
        Ok(Self {
            label,
            doc: Mutex::new(doc),
            store,
            bus,
            next_conn: AtomicU64::new(1),
            attached: AtomicU64::new(0),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Register a connection: a fanout receiver plus the id used to filter
    /// out its own frames.
    pub fn attach(&self) -> (ConnId, broadcast::Receiver<Frame>) {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.attached.fetch_add(1, Ordering::Relaxed);
        (conn, self.bus.subscribe())
    }

    pub fn detach(&self, _conn: ConnId) {
        self.attached.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn attached(&self) -> u64 {
        self.attached.load(Ordering::Relaxed)
    }

    /// Observe applied updates without registering as a connection.
    pub fn events(&self) -> broadcast::Receiver<Frame> {
        self.bus.subscribe()
    }

    /// Encoded state request frame carrying this document's state vector.
    pub fn state_request(&self) -> Vec<u8> {
        let state_vector = {
            let doc = self.doc.lock();
            let txn = doc.transact();
            txn.state_vector()
        };
        let encoded = state_vector.encode_v1();
        let mut frame = Vec::with_capacity(encoded.len() + 1);
        frame.push(TAG_STATE_REQUEST);
        frame.extend_from_slice(&encoded);
        frame
    }

    /// Wrap an already-applied update payload for sending to a peer.
    pub fn encode_update_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(TAG_UPDATE);
        frame.extend_from_slice(payload);
        frame
    }

    /// Handle one inbound wire frame. A state request produces a reply frame
    /// to send back; an update is ingested and produces none.
    pub fn handle_frame(&self, origin: ConnId, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let (&tag, body) = data.split_first().ok_or_else(|| RelayError::Protocol {
            reason: "empty frame".to_string(),
        })?;
        match tag {
            TAG_STATE_REQUEST => {
                let remote = StateVector::decode_v1(body).map_err(|e| RelayError::Protocol {
                    reason: format!("bad state vector: {e}"),
                })?;
                let diff = {
                    let doc = self.doc.lock();
                    let txn = doc.transact();
                    txn.encode_state_as_update_v1(&remote)
                };
                Ok(Some(Self::encode_update_frame(&diff)))
            }
            TAG_UPDATE => {
                self.ingest(origin, body.to_vec())?;
                Ok(None)
            }
            other => Err(RelayError::Protocol {
                reason: format!("unknown tag {other:#04x}"),
            }),
        }
    }

    /// Apply one update: merge into the document, append to the durable log,
    /// fan out to every other attached connection. A log write failure is
    /// not fatal; the in-memory state already advanced and peers still get
    /// the update.
    pub fn ingest(&self, origin: ConnId, payload: Vec<u8>) -> Result<()> {
        let update = Update::decode_v1(&payload).map_err(|e| RelayError::Engine {
            reason: format!("undecodable update: {e}"),
        })?;
        {
            let doc = self.doc.lock();
            let mut txn = doc.transact_mut();
            txn.apply_update(update);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.append(&payload) {
                tracing::warn!(
                    listener = self.label,
                    error = %e,
                    "failed to persist update"
                );
            }
        }
        let _ = self.bus.send(Frame {
            origin,
            payload: Arc::new(payload),
        });
        Ok(())
    }

    /// Current graph size figures. Log access is best effort.
    pub fn snapshot(&self) -> GraphSnapshot {
        let in_memory_bytes = {
            let doc = self.doc.lock();
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default()).len()
        };
        let stored_updates = match &self.store {
            Some(store) => match store.update_count() {
                Ok(count) => Some(count),
                Err(e) => {
                    tracing::warn!(listener = self.label, error = %e, "update log count failed");
                    None
                }
            },
            None => None,
        };
        GraphSnapshot {
            in_memory_bytes,
            stored_updates,
        }
    }
}
