//! TransferManager: sends and receives chunked conversation exports.
//!
//! The manager exclusively owns three tables behind one mutex:
//!
//! - the peer registry (`peer_id → connection + listener task`),
//! - outgoing transfers (`export_id → peer + cancelled flag`),
//! - incoming reassemblies (`export_id → meta + chunk map + sweep task`).
//!
//! No lock is ever held across an `.await`. Background work (per-peer
//! listener tasks, per-transfer stall sweeps) holds only a `Weak` handle to
//! the manager and is aborted on [`TransferManager::dispose`], so nothing
//! outlives the state it refers to.
//!
//! Send path: `export_start → chunk* → export_end`, every frame gated on
//! backpressure and re-validated (cancelled? peer still there?) right before
//! it is queued. See `sender.rs`.
//!
//! Receive path: frames are sniffed, decoded, stored by chunk index and
//! verified on `export_end`. Integrity failures are dropped silently for the
//! application; no partial data is ever delivered. See `receiver.rs`.

mod error;
mod receiver;
mod registry;
mod sender;

pub use error::TransferError;

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::config::{
    BACKPRESSURE_POLL_INTERVAL, BUFFERED_AMOUNT_HIGH, CHUNK_SIZE, INCOMING_STALL_TIMEOUT,
    INCOMING_SWEEP_INTERVAL, MAX_INCOMING_CHUNKS,
};
use crate::core::connection::PeerConnection;
use crate::core::conversation::{ConversationMessage, ExportMeta};
use crate::utils::sos::SignalOfStop;

/// Tunables for one manager instance. `Default` uses `core::config`.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub buffered_amount_high: usize,
    pub backpressure_poll: Duration,
    pub sweep_interval: Duration,
    pub stall_timeout: Duration,
    pub max_incoming_chunks: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            buffered_amount_high: BUFFERED_AMOUNT_HIGH,
            backpressure_poll: BACKPRESSURE_POLL_INTERVAL,
            sweep_interval: INCOMING_SWEEP_INTERVAL,
            stall_timeout: INCOMING_STALL_TIMEOUT,
            max_incoming_chunks: MAX_INCOMING_CHUNKS,
        }
    }
}

/// Callback invoked once per fully verified incoming export.
pub type ReceiveCallback = Arc<dyn Fn(&[ConversationMessage], &ExportMeta) + Send + Sync>;

/// Per-call hooks for [`TransferManager::send_conversation`].
///
/// `on_progress(sent, total)` fires after every chunk is queued,
/// `on_complete` once after `export_end` is queued, `on_error` exactly once
/// on any failure after the transfer has started (cancellation included).
#[derive(Default)]
pub struct SendOptions {
    export_id: Option<Uuid>,
    on_progress: Option<Box<dyn FnMut(u32, u32) + Send>>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
    on_error: Option<Box<dyn FnOnce(&TransferError) + Send>>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a caller-chosen export id (so it can be cancelled mid-flight).
    pub fn with_export_id(mut self, export_id: Uuid) -> Self {
        self.export_id = Some(export_id);
        self
    }

    pub fn on_progress(mut self, f: impl FnMut(u32, u32) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&TransferError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// Snapshot of an incoming reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingProgress {
    pub received_chunks: u32,
    pub total_chunks: u32,
}

// ── Owned state ───────────────────────────────────────────────────────────────

pub(crate) struct PeerEntry {
    pub peer: Arc<dyn PeerConnection>,
    /// Bumped on every `add_peer`; stale listeners and sends compare against it.
    pub generation: u64,
    pub listener: JoinHandle<()>,
}

pub(crate) struct OutgoingTransfer {
    pub peer_id: String,
    pub generation: u64,
    pub cancelled: bool,
}

pub(crate) struct IncomingTransfer {
    pub meta: ExportMeta,
    pub chunks: HashMap<u32, Bytes>,
    /// Sum of stored chunk lengths; never exceeds `meta.compressed_bytes`.
    pub buffered_bytes: u64,
    pub last_progress_at: Instant,
    pub sweep: JoinHandle<()>,
}

impl IncomingTransfer {
    pub fn received_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received_chunks() == self.meta.total_chunks
    }
}

#[derive(Default)]
pub(crate) struct State {
    pub peers: HashMap<String, PeerEntry>,
    pub outgoing: HashMap<Uuid, OutgoingTransfer>,
    pub incoming: HashMap<Uuid, IncomingTransfer>,
    pub subscribers: Vec<(u64, ReceiveCallback)>,
}

pub(crate) struct Inner {
    pub config: TransferConfig,
    state: Mutex<State>,
    next_generation: AtomicU64,
    next_subscriber: AtomicU64,
    disposed: AtomicBool,
    pub shutdown: SignalOfStop,
    pub this: Weak<Inner>,
}

impl Inner {
    /// Lock the tables. A panic in a previous holder does not leave the maps
    /// in a torn state (all mutations are single inserts/removes), so the
    /// poison flag is ignored.
    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn cancel(&self, export_id: Uuid) {
        let mut st = self.state();
        if let Some(t) = st.outgoing.get_mut(&export_id) {
            t.cancelled = true;
            info!(event = "transfer_cancel_requested", %export_id, peer_id = %t.peer_id);
        }
        if let Some(t) = st.incoming.remove(&export_id) {
            t.sweep.abort();
            debug!(event = "incoming_discarded_on_cancel", %export_id);
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let mut st = self.state();
        for (_, entry) in st.peers.drain() {
            entry.listener.abort();
        }
        for t in st.outgoing.values_mut() {
            t.cancelled = true;
        }
        st.outgoing.clear();
        for (_, t) in st.incoming.drain() {
            t.sweep.abort();
        }
        st.subscribers.clear();
        info!(event = "transfer_manager_disposed");
    }
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// Owner of all transfer state for one collaboration session.
///
/// Must be created and used inside a Tokio runtime. Dropping the manager
/// disposes it.
pub struct TransferManager {
    inner: Arc<Inner>,
}

impl TransferManager {
    pub fn new(config: TransferConfig) -> Self {
        let inner = Arc::new_cyclic(|this| Inner {
            config,
            state: Mutex::new(State::default()),
            next_generation: AtomicU64::new(0),
            next_subscriber: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            shutdown: SignalOfStop::new(),
            this: this.clone(),
        });
        Self { inner }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Subscribe to verified incoming exports. Every subscriber sees every
    /// completed transfer.
    pub fn on_receive_conversation(
        &self,
        callback: impl Fn(&[ConversationMessage], &ExportMeta) + Send + Sync + 'static,
    ) -> ReceiveSubscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        if !self.inner.is_disposed() {
            self.inner.state().subscribers.push((id, Arc::new(callback)));
        }
        ReceiveSubscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Ask an in-flight send to stop at its next checkpoint, and drop any
    /// incoming state under the same id. Unknown ids are ignored.
    pub fn cancel_transfer(&self, export_id: Uuid) {
        self.inner.cancel(export_id);
    }

    /// Export ids currently being sent.
    pub fn outgoing_transfers(&self) -> Vec<Uuid> {
        self.inner.state().outgoing.keys().copied().collect()
    }

    /// Progress of an incoming reassembly, if it is still live.
    pub fn incoming_progress(&self, export_id: Uuid) -> Option<IncomingProgress> {
        self.inner
            .state()
            .incoming
            .get(&export_id)
            .map(|t| IncomingProgress {
                received_chunks: t.received_chunks(),
                total_chunks: t.meta.total_chunks,
            })
    }

    /// Tear everything down. Idempotent; the manager ignores all traffic
    /// afterwards and in-flight sends fail with [`TransferError::Disposed`].
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

/// Handle returned by [`TransferManager::on_receive_conversation`].
pub struct ReceiveSubscription {
    id: u64,
    inner: Weak<Inner>,
}

impl ReceiveSubscription {
    /// Remove the callback. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.state().subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::core::connection::MemoryPeer;
    use crate::core::conversation::ExportDescriptor;
    use serde_json::json;

    pub fn fast_config() -> TransferConfig {
        TransferConfig {
            chunk_size: 64,
            backpressure_poll: Duration::from_millis(10),
            ..TransferConfig::default()
        }
    }

    pub fn messages(n: usize) -> Vec<ConversationMessage> {
        (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { "user" } else { "assistant" };
                ConversationMessage::new(role, json!(format!("message number {i} {}", Uuid::new_v4())))
            })
            .collect()
    }

    pub fn descriptor() -> ExportDescriptor {
        ExportDescriptor::now("desktop", "session-1")
    }

    /// Two managers wired to each other over a memory pair: `a` knows the
    /// other side as "b" and vice versa.
    pub fn linked(config: TransferConfig) -> (TransferManager, TransferManager, Arc<MemoryPeer>, Arc<MemoryPeer>) {
        let (pa, pb) = MemoryPeer::pair();
        let a = TransferManager::new(config.clone());
        let b = TransferManager::new(config);
        a.add_peer("b", pa.clone());
        b.add_peer("a", pb.clone());
        (a, b, pa, pb)
    }

    /// Yield until `cond` holds (bounded).
    pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..1000 {
            if cond() {
                return true;
            }
            tokio::task::yield_now().await;
        }
        cond()
    }
}
