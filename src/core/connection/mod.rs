//! Peer connection capability consumed by the transfer layer.
//!
//! The transfer manager does not care how a connection was established;
//! it needs connectivity, the outstanding send-buffer size, an ordered
//! reliable `send`, and a stream of inbound events.

pub mod data_channel;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;
use tokio::sync::mpsc;

pub use data_channel::DataChannelPeer;
pub use memory::MemoryPeer;

/// Inbound event from a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A binary frame arrived.
    Data(Bytes),
    /// The connection closed; no more events will follow.
    Close,
    /// The transport reported an error. The connection may still be usable.
    Error(String),
}

/// An ordered, reliable byte-frame link to one remote peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Whether the link is currently open for sending.
    fn is_connected(&self) -> bool;

    /// Bytes queued locally but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// Queue one frame for transmission.
    async fn send(&self, frame: Bytes) -> anyhow::Result<()>;

    /// Register an inbound listener. Dropping the receiver unregisters it.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent>;
}

/// Fan-out list of inbound listeners shared by the connection adapters.
///
/// Listeners whose receiver has been dropped are pruned on the next emit.
#[derive(Debug, Default)]
pub struct ListenerSet {
    senders: Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: PeerEvent) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Live listener count (after pruning closed receivers).
    pub fn len(&self) -> usize {
        match self.senders.lock() {
            Ok(mut senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_set_fans_out() {
        let set = ListenerSet::new();
        let mut a = set.subscribe();
        let mut b = set.subscribe();
        set.emit(PeerEvent::Data(Bytes::from_static(b"x")));
        assert_eq!(a.recv().await, Some(PeerEvent::Data(Bytes::from_static(b"x"))));
        assert_eq!(b.recv().await, Some(PeerEvent::Data(Bytes::from_static(b"x"))));
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let set = ListenerSet::new();
        let keep = set.subscribe();
        let gone = set.subscribe();
        assert_eq!(set.len(), 2);
        drop(gone);
        set.emit(PeerEvent::Close);
        assert_eq!(set.len(), 1);
        drop(keep);
        assert!(set.is_empty());
    }
}
