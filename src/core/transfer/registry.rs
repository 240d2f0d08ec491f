//! Peer registry: live connections and their inbound listener tasks.

use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Inner, PeerEntry, TransferManager};
use crate::core::connection::{PeerConnection, PeerEvent};

impl TransferManager {
    /// Register `peer` under `peer_id` and start listening to it.
    ///
    /// Re-adding an id (a peer that reconnected with a fresh connection
    /// object) replaces the old entry and stops its listener. Ignored after
    /// [`dispose`](Self::dispose).
    pub fn add_peer(&self, peer_id: impl Into<String>, peer: Arc<dyn PeerConnection>) {
        let peer_id = peer_id.into();
        if self.inner.is_disposed() {
            warn!(event = "add_peer_after_dispose", %peer_id);
            return;
        }

        let generation = self.inner.next_generation();
        let listener = spawn_listener(
            self.inner.this.clone(),
            peer_id.clone(),
            generation,
            peer.subscribe(),
        );

        let previous = self.inner.state().peers.insert(
            peer_id.clone(),
            PeerEntry {
                peer,
                generation,
                listener,
            },
        );
        if let Some(old) = previous {
            old.listener.abort();
            info!(event = "peer_replaced", %peer_id, generation, "Peer re-registered with a new connection");
        } else {
            info!(event = "peer_added", %peer_id, generation);
        }
    }

    /// Unregister a peer and abort every outgoing transfer addressed to it.
    /// Returns whether the peer was known.
    pub fn remove_peer(&self, peer_id: &str) -> bool {
        let mut st = self.inner.state();
        let Some(entry) = st.peers.remove(peer_id) else {
            return false;
        };
        entry.listener.abort();
        let aborted = mark_outgoing_cancelled(&mut st.outgoing, peer_id);
        info!(event = "peer_removed", %peer_id, aborted_transfers = aborted);
        true
    }

    /// Ids of registered peers whose link is currently open.
    pub fn get_connected_peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .state()
            .peers
            .iter()
            .filter(|(_, entry)| entry.peer.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl Inner {
    /// The listener for `generation` saw its connection close.
    fn peer_closed(&self, peer_id: &str, generation: u64) {
        let mut st = self.state();
        let current = st
            .peers
            .get(peer_id)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            debug!(event = "stale_peer_close_ignored", %peer_id, generation);
            return;
        }
        // Dropping (not aborting) our own handle: we are running inside it.
        st.peers.remove(peer_id);
        let aborted = mark_outgoing_cancelled(&mut st.outgoing, peer_id);
        warn!(event = "peer_disconnected", %peer_id, aborted_transfers = aborted);
    }
}

fn mark_outgoing_cancelled(
    outgoing: &mut std::collections::HashMap<uuid::Uuid, super::OutgoingTransfer>,
    peer_id: &str,
) -> usize {
    let mut n = 0;
    for t in outgoing.values_mut().filter(|t| t.peer_id == peer_id) {
        t.cancelled = true;
        n += 1;
    }
    n
}

fn spawn_listener(
    inner: Weak<Inner>,
    peer_id: String,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<PeerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.is_disposed() {
                break;
            }
            match event {
                PeerEvent::Data(frame) => inner.handle_frame(&peer_id, frame),
                PeerEvent::Error(err) => {
                    warn!(event = "peer_transport_error", %peer_id, %err);
                }
                PeerEvent::Close => {
                    inner.peer_closed(&peer_id, generation);
                    break;
                }
            }
        }
    })
}
