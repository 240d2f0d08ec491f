//! Outgoing exports: serialize, compress, chunk, and stream to one peer.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Inner, OutgoingTransfer, SendOptions, TransferError, TransferManager};
use crate::core::codec::compress::{compress, digest};
use crate::core::codec::frame::{encode_chunk, encode_export_end, encode_export_start, FrameError};
use crate::core::connection::PeerConnection;
use crate::core::conversation::{ConversationMessage, ExportDescriptor, ExportMeta};

/// A conversation ready to go on the wire.
pub(crate) struct PreparedExport {
    pub meta: ExportMeta,
    /// Compressed body; chunked and digested as-is.
    pub payload: Bytes,
    pub checksum: String,
    chunk_size: usize,
}

impl PreparedExport {
    pub fn new(
        export_id: Uuid,
        messages: &[ConversationMessage],
        descriptor: ExportDescriptor,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        let json = serde_json::to_vec(messages)?;
        let payload = compress(&json).map_err(|e| TransferError::Compression(e.to_string()))?;
        let chunk_size = chunk_size.max(1);
        let chunks = payload.len().div_ceil(chunk_size);
        let total_chunks = u32::try_from(chunks).map_err(|_| TransferError::TooLarge {
            chunks,
            limit: u32::MAX,
        })?;
        let checksum = digest(&payload);
        let meta = ExportMeta::new(
            export_id,
            descriptor,
            total_chunks,
            json.len() as u64,
            payload.len() as u64,
        );
        Ok(Self {
            meta,
            payload: Bytes::from(payload),
            checksum,
            chunk_size,
        })
    }

    pub fn start_frame(&self) -> Result<Bytes, FrameError> {
        encode_export_start(&self.meta)
    }

    pub fn chunk_frames(&self) -> impl Iterator<Item = Bytes> + '_ {
        self.payload
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(i, data)| encode_chunk(self.meta.export_id, i as u32, data))
    }

    pub fn end_frame(&self) -> Result<Bytes, FrameError> {
        encode_export_end(self.meta.export_id, &self.checksum)
    }
}

/// Identity of one in-flight send, checked before every frame.
struct SendTarget<'a> {
    export_id: Uuid,
    peer_id: &'a str,
}

impl TransferManager {
    /// Stream `messages` to `peer_id` as one chunked, compressed export.
    ///
    /// Caller errors (unknown peer, closed peer, an id already in flight) are
    /// returned without touching `options`' callbacks. Once the transfer has
    /// started, exactly one of `on_complete` / `on_error` fires.
    pub async fn send_conversation(
        &self,
        peer_id: &str,
        messages: &[ConversationMessage],
        descriptor: ExportDescriptor,
        options: SendOptions,
    ) -> Result<Uuid, TransferError> {
        let SendOptions {
            export_id,
            mut on_progress,
            on_complete,
            on_error,
        } = options;
        let export_id = export_id.unwrap_or_else(Uuid::new_v4);

        self.inner.begin_outgoing(peer_id, export_id)?;
        let target = SendTarget { export_id, peer_id };

        let result = self
            .inner
            .stream_export(&target, messages, descriptor, &mut on_progress)
            .await;
        self.inner.state().outgoing.remove(&export_id);

        match result {
            Ok(total_chunks) => {
                info!(event = "export_send_complete", %export_id, %peer_id, total_chunks);
                if let Some(f) = on_complete {
                    f();
                }
                Ok(export_id)
            }
            Err(e) => {
                if e.is_cancelled() {
                    info!(event = "export_send_cancelled", %export_id, %peer_id);
                } else {
                    warn!(event = "export_send_failed", %export_id, %peer_id, error = %e);
                }
                if let Some(f) = on_error {
                    f(&e);
                }
                Err(e)
            }
        }
    }
}

impl Inner {
    /// Validate the request and register the transfer, bound to the peer's
    /// current generation.
    fn begin_outgoing(&self, peer_id: &str, export_id: Uuid) -> Result<(), TransferError> {
        if self.is_disposed() {
            return Err(TransferError::Disposed);
        }
        let mut st = self.state();
        let entry = st
            .peers
            .get(peer_id)
            .ok_or_else(|| TransferError::PeerNotFound(peer_id.to_string()))?;
        if !entry.peer.is_connected() {
            return Err(TransferError::PeerNotConnected(peer_id.to_string()));
        }
        let generation = entry.generation;
        if st.outgoing.contains_key(&export_id) {
            return Err(TransferError::DuplicateExport(export_id));
        }
        st.outgoing.insert(
            export_id,
            OutgoingTransfer {
                peer_id: peer_id.to_string(),
                generation,
                cancelled: false,
            },
        );
        Ok(())
    }

    async fn stream_export(
        &self,
        target: &SendTarget<'_>,
        messages: &[ConversationMessage],
        descriptor: ExportDescriptor,
        on_progress: &mut Option<Box<dyn FnMut(u32, u32) + Send>>,
    ) -> Result<u32, TransferError> {
        let export = PreparedExport::new(
            target.export_id,
            messages,
            descriptor,
            self.config.chunk_size,
        )?;
        let total = export.meta.total_chunks;
        if total > self.config.max_incoming_chunks {
            return Err(TransferError::TooLarge {
                chunks: total as usize,
                limit: self.config.max_incoming_chunks,
            });
        }

        info!(
            event = "export_send_start",
            export_id = %target.export_id,
            peer_id = %target.peer_id,
            messages = messages.len(),
            total_bytes = export.meta.total_bytes,
            compressed_bytes = export.meta.compressed_bytes,
            total_chunks = total,
        );

        self.send_frame(target, export.start_frame()?).await?;
        for (i, frame) in export.chunk_frames().enumerate() {
            self.send_frame(target, frame).await?;
            if let Some(f) = on_progress.as_mut() {
                f(i as u32 + 1, total);
            }
        }
        self.send_frame(target, export.end_frame()?).await?;
        Ok(total)
    }

    /// Gate on backpressure, re-validate, then queue one frame.
    async fn send_frame(&self, target: &SendTarget<'_>, frame: Bytes) -> Result<(), TransferError> {
        self.wait_for_buffer_space(target).await?;
        let peer = self.check_sendable(target)?;
        peer.send(frame).await.map_err(|e| {
            if peer.is_connected() {
                TransferError::Transport(e.to_string())
            } else {
                TransferError::PeerDisconnected(target.peer_id.to_string())
            }
        })
    }

    /// Park while the peer's send buffer is above the high water mark.
    async fn wait_for_buffer_space(&self, target: &SendTarget<'_>) -> Result<(), TransferError> {
        let mut parked = false;
        loop {
            let peer = self.check_sendable(target)?;
            let buffered = peer.buffered_amount().await;
            if buffered <= self.config.buffered_amount_high {
                if parked {
                    debug!(event = "backpressure_released", export_id = %target.export_id, buffered);
                }
                return Ok(());
            }
            if !parked {
                info!(
                    event = "backpressure_wait",
                    export_id = %target.export_id,
                    peer_id = %target.peer_id,
                    buffered,
                    high = self.config.buffered_amount_high,
                    "Waiting for send buffer to drain"
                );
                parked = true;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.backpressure_poll) => {}
                _ = self.shutdown.wait() => {}
            }
        }
    }

    /// The peer connection this send may still use, or why it may not.
    fn check_sendable(&self, target: &SendTarget<'_>) -> Result<Arc<dyn PeerConnection>, TransferError> {
        if self.is_disposed() {
            return Err(TransferError::Disposed);
        }
        let st = self.state();
        let transfer = st
            .outgoing
            .get(&target.export_id)
            .ok_or(TransferError::Disposed)?;
        let peer = st
            .peers
            .get(target.peer_id)
            .filter(|entry| entry.generation == transfer.generation && entry.peer.is_connected())
            .map(|entry| entry.peer.clone())
            .ok_or_else(|| TransferError::PeerDisconnected(target.peer_id.to_string()))?;
        if transfer.cancelled {
            return Err(TransferError::Cancelled(target.export_id));
        }
        Ok(peer)
    }
}
