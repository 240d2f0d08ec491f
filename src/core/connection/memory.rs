//! In-process peer pair.
//!
//! Two [`MemoryPeer`]s linked back to back: a frame sent on one side is
//! delivered as [`PeerEvent::Data`] to the other side's listeners, in order.
//! Connectivity and the reported buffered amount are controllable, which
//! makes the pair useful for the `loopback` command and for exercising
//! backpressure and disconnect paths.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

use super::{ListenerSet, PeerConnection, PeerEvent};

#[derive(Debug)]
pub struct MemoryPeer {
    label: String,
    connected: AtomicBool,
    buffered: AtomicUsize,
    listeners: ListenerSet,
    remote: Mutex<Weak<MemoryPeer>>,
    sent: Mutex<Vec<Bytes>>,
}

impl MemoryPeer {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            connected: AtomicBool::new(true),
            buffered: AtomicUsize::new(0),
            listeners: ListenerSet::new(),
            remote: Mutex::new(Weak::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Create a connected pair `(a, b)`.
    pub fn pair() -> (Arc<MemoryPeer>, Arc<MemoryPeer>) {
        let a = Arc::new(Self::new("a"));
        let b = Arc::new(Self::new("b"));
        if let Ok(mut r) = a.remote.lock() {
            *r = Arc::downgrade(&b);
        }
        if let Ok(mut r) = b.remote.lock() {
            *r = Arc::downgrade(&a);
        }
        (a, b)
    }

    /// A peer with no remote side; frames are only recorded.
    pub fn detached(label: &str) -> Arc<MemoryPeer> {
        Arc::new(Self::new(label))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Pin the reported buffered amount (backpressure simulation).
    pub fn set_buffered_amount(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    /// Drop the link on both sides and notify listeners with `Close`.
    pub fn disconnect(&self) {
        self.close_local();
        if let Some(remote) = self.remote() {
            remote.close_local();
        }
    }

    /// Deliver an arbitrary frame to this side's listeners, as if the remote
    /// had sent it.
    pub fn inject(&self, frame: Bytes) {
        self.listeners.emit(PeerEvent::Data(frame));
    }

    /// Raise a transport error on this side.
    pub fn inject_error(&self, message: &str) {
        self.listeners.emit(PeerEvent::Error(message.to_string()));
    }

    /// Every frame this side has sent, in order.
    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn close_local(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.listeners.emit(PeerEvent::Close);
        }
    }

    fn remote(&self) -> Option<Arc<MemoryPeer>> {
        self.remote.lock().ok().and_then(|r| r.upgrade())
    }
}

#[async_trait]
impl PeerConnection for MemoryPeer {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("memory peer '{}' is closed", self.label));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(frame.clone());
        }
        if let Some(remote) = self.remote() {
            remote.listeners.emit(PeerEvent::Data(frame));
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        self.listeners.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = MemoryPeer::pair();
        let mut rx = b.subscribe();
        a.send(Bytes::from_static(b"1")).await.unwrap();
        a.send(Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(rx.recv().await, Some(PeerEvent::Data(Bytes::from_static(b"1"))));
        assert_eq!(rx.recv().await, Some(PeerEvent::Data(Bytes::from_static(b"2"))));
        assert_eq!(a.sent_frames().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_closes_both_sides() {
        let (a, b) = MemoryPeer::pair();
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();
        b.disconnect();
        assert!(!a.is_connected());
        assert!(!b.is_connected());
        assert_eq!(rx_a.recv().await, Some(PeerEvent::Close));
        assert_eq!(rx_b.recv().await, Some(PeerEvent::Close));
        assert!(a.send(Bytes::from_static(b"x")).await.is_err());
    }
}
