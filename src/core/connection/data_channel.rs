//! WebRTC data channel adapter.
//!
//! Wraps an open `RTCDataChannel` so the transfer manager can drive it
//! through [`PeerConnection`]. The channel's single `on_message` /
//! `on_close` / `on_error` slots are claimed once at construction and fanned
//! out to any number of subscribers, so the export protocol can share the
//! channel with other traffic (CRDT sync) without fighting over handlers.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use super::{ListenerSet, PeerConnection, PeerEvent};

pub struct DataChannelPeer {
    dc: Arc<RTCDataChannel>,
    listeners: Arc<ListenerSet>,
}

impl DataChannelPeer {
    /// Take over `dc`'s event handlers and expose it as a peer connection.
    pub fn attach(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let listeners = Arc::new(ListenerSet::new());

        let label = dc.label().to_string();
        let on_close = listeners.clone();
        dc.on_close(Box::new(move || {
            let label = label.clone();
            let listeners = on_close.clone();
            Box::pin(async move {
                warn!(event = "dc_closed", channel = %label, "DataChannel closed by transport");
                listeners.emit(PeerEvent::Close);
            })
        }));

        let label = dc.label().to_string();
        let on_error = listeners.clone();
        dc.on_error(Box::new(move |err| {
            let label = label.clone();
            let listeners = on_error.clone();
            Box::pin(async move {
                error!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
                listeners.emit(PeerEvent::Error(err.to_string()));
            })
        }));

        let on_message = listeners.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let listeners = on_message.clone();
            Box::pin(async move {
                if !msg.is_string {
                    listeners.emit(PeerEvent::Data(msg.data));
                }
            })
        }));

        Arc::new(Self { dc, listeners })
    }

    pub fn label(&self) -> &str {
        self.dc.label()
    }
}

#[async_trait]
impl PeerConnection for DataChannelPeer {
    fn is_connected(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        let state = self.dc.ready_state();
        if state != RTCDataChannelState::Open {
            warn!(
                event = "send_channel_not_open",
                channel = %self.dc.label(),
                ?state,
                "Attempted send on non-open data channel"
            );
            return Err(anyhow!("Data channel not open: {:?}", state));
        }
        self.dc.send(&frame).await?;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        self.listeners.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transfer::test_support::{descriptor, messages};
    use crate::core::transfer::{SendOptions, TransferConfig, TransferManager};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::setting_engine::SettingEngine;
    use webrtc::api::APIBuilder;
    use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
    use webrtc::interceptor::registry::Registry;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::peer_connection::RTCPeerConnection;

    struct Linked {
        _offerer: Arc<RTCPeerConnection>,
        _answerer: Arc<RTCPeerConnection>,
        local_dc: Arc<RTCDataChannel>,
        local: Arc<DataChannelPeer>,
        remote: Arc<DataChannelPeer>,
    }

    async fn gather(pc: &RTCPeerConnection, sdp: webrtc::peer_connection::sdp::session_description::RTCSessionDescription) {
        let mut done = pc.gathering_complete_promise().await;
        pc.set_local_description(sdp).await.unwrap();
        let _ = done.recv().await;
    }

    /// Two peer connections in one process, joined over loopback host
    /// candidates, with one ordered data channel open between them.
    async fn linked() -> Linked {
        let mut me = MediaEngine::default();
        let reg = register_default_interceptors(Registry::new(), &mut me).unwrap();
        let mut se = SettingEngine::default();
        se.set_include_loopback_candidate(true);
        let api = APIBuilder::new()
            .with_setting_engine(se)
            .with_media_engine(me)
            .with_interceptor_registry(reg)
            .build();

        let offerer = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await.unwrap());
        let answerer = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await.unwrap());

        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
        answerer.on_data_channel(Box::new(move |dc| {
            let tx = remote_tx.clone();
            Box::pin(async move {
                let _ = tx.send(dc);
            })
        }));

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let local_dc = offerer.create_data_channel("export", Some(init)).await.unwrap();

        let offer = offerer.create_offer(None).await.unwrap();
        gather(&offerer, offer).await;
        answerer
            .set_remote_description(offerer.local_description().await.unwrap())
            .await
            .unwrap();
        let answer = answerer.create_answer(None).await.unwrap();
        gather(&answerer, answer).await;
        offerer
            .set_remote_description(answerer.local_description().await.unwrap())
            .await
            .unwrap();

        let remote_dc = tokio::time::timeout(Duration::from_secs(20), remote_rx.recv())
            .await
            .expect("remote data channel never announced")
            .unwrap();
        let local = DataChannelPeer::attach(local_dc.clone());
        let remote = DataChannelPeer::attach(remote_dc);

        tokio::time::timeout(Duration::from_secs(20), async {
            while !(local.is_connected() && remote.is_connected()) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("data channel never opened");

        Linked {
            _offerer: offerer,
            _answerer: answerer,
            local_dc,
            local,
            remote,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_binary_frames_reach_subscribers() {
        let link = linked().await;
        assert_eq!(link.local.label(), "export");
        let mut first = link.remote.subscribe();
        let mut second = link.remote.subscribe();

        link.local.send(Bytes::from_static(b"\xE1frame")).await.unwrap();
        for rx in [&mut first, &mut second] {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
            assert_eq!(event, Some(PeerEvent::Data(Bytes::from_static(b"\xE1frame"))));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_after_close_fails() {
        let link = linked().await;
        link.local_dc.close().await.unwrap();
        assert!(!link.local.is_connected());
        assert!(link.local.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_export_over_data_channel() {
        let link = linked().await;
        let sender = TransferManager::new(TransferConfig::default());
        let receiver = TransferManager::new(TransferConfig::default());
        sender.add_peer("remote", link.local.clone());
        receiver.add_peer("local", link.remote.clone());

        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let _sub = receiver.on_receive_conversation(move |msgs, meta| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send((msgs.to_vec(), meta.total_chunks));
            }
        });

        let sent = messages(400);
        sender
            .send_conversation("remote", &sent, descriptor(), SendOptions::new())
            .await
            .unwrap();
        let (received, chunks) = tokio::time::timeout(Duration::from_secs(20), rx).await.unwrap().unwrap();
        assert_eq!(received, sent);
        assert!(chunks >= 1);
    }
}
