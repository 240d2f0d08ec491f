//! Incoming exports: reassembly, stall sweep, and verification.

use bytes::Bytes;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{IncomingTransfer, Inner, ReceiveCallback};
use crate::core::codec::frame::{ChunkFrame, ExportEndFrame};
use crate::core::codec::{decode, decompress, digest, looks_like_own_message, ProtocolMessage};
use crate::core::conversation::{parse_messages, ConversationMessage, ExportMeta};

impl Inner {
    /// Entry point for every binary frame a peer delivers.
    ///
    /// Frames that are not export protocol traffic are ignored without a
    /// log line; the same channel carries other protocols.
    pub(crate) fn handle_frame(&self, peer_id: &str, frame: Bytes) {
        if self.is_disposed() || !looks_like_own_message(&frame) {
            return;
        }
        let message = match decode(&frame) {
            Ok(m) => m,
            Err(e) => {
                debug!(event = "frame_decode_failure", %peer_id, bytes = frame.len(), %e);
                return;
            }
        };
        match message {
            ProtocolMessage::ExportStart(meta) => self.on_export_start(peer_id, meta),
            ProtocolMessage::Chunk(chunk) => self.on_chunk(peer_id, chunk),
            ProtocolMessage::ExportEnd(end) => self.on_export_end(peer_id, end),
        }
    }

    fn on_export_start(&self, peer_id: &str, meta: ExportMeta) {
        let export_id = meta.export_id;
        if meta.total_chunks > self.config.max_incoming_chunks {
            warn!(
                event = "export_start_rejected",
                %peer_id,
                %export_id,
                total_chunks = meta.total_chunks,
                limit = self.config.max_incoming_chunks,
                "Announced export exceeds chunk limit"
            );
            return;
        }
        let byte_limit = u64::from(self.config.max_incoming_chunks) * self.config.chunk_size as u64;
        if meta.compressed_bytes > byte_limit {
            warn!(
                event = "export_start_rejected",
                %peer_id,
                %export_id,
                compressed_bytes = meta.compressed_bytes,
                limit = byte_limit,
                "Announced export exceeds byte limit"
            );
            return;
        }

        info!(
            event = "export_receive_start",
            %peer_id,
            %export_id,
            total_chunks = meta.total_chunks,
            compressed_bytes = meta.compressed_bytes,
        );
        let sweep = self.spawn_sweep(export_id);
        let previous = self.state().incoming.insert(
            export_id,
            IncomingTransfer {
                meta,
                chunks: Default::default(),
                buffered_bytes: 0,
                last_progress_at: Instant::now(),
                sweep,
            },
        );
        if let Some(old) = previous {
            old.sweep.abort();
            debug!(event = "export_restarted", %export_id);
        }
    }

    fn on_chunk(&self, peer_id: &str, chunk: ChunkFrame) {
        let mut st = self.state();
        let Some(transfer) = st.incoming.get_mut(&chunk.export_id) else {
            debug!(event = "chunk_for_unknown_export", %peer_id, export_id = %chunk.export_id);
            return;
        };
        if chunk.chunk_index >= transfer.meta.total_chunks {
            warn!(
                event = "chunk_index_out_of_range",
                %peer_id,
                export_id = %chunk.export_id,
                index = chunk.chunk_index,
                total = transfer.meta.total_chunks,
            );
            return;
        }
        if !transfer.chunks.contains_key(&chunk.chunk_index) {
            let len = chunk.data.len() as u64;
            if transfer.buffered_bytes + len > transfer.meta.compressed_bytes {
                warn!(
                    event = "chunk_exceeds_announced_size",
                    %peer_id,
                    export_id = %chunk.export_id,
                    index = chunk.chunk_index,
                    bytes = len,
                    announced = transfer.meta.compressed_bytes,
                );
                return;
            }
            transfer.buffered_bytes += len;
            transfer.chunks.insert(chunk.chunk_index, chunk.data);
        }
        transfer.last_progress_at = Instant::now();
    }

    fn on_export_end(&self, peer_id: &str, end: ExportEndFrame) {
        let export_id = end.export_id;
        let Some(transfer) = self.state().incoming.remove(&export_id) else {
            debug!(event = "export_end_for_unknown_export", %peer_id, %export_id);
            return;
        };
        transfer.sweep.abort();

        let Some(messages) = verify(&transfer, &end.checksum) else {
            return;
        };
        info!(
            event = "export_received",
            %peer_id,
            %export_id,
            messages = messages.len(),
            total_bytes = transfer.meta.total_bytes,
        );

        let subscribers: Vec<ReceiveCallback> = self
            .state()
            .subscribers
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in subscribers {
            let delivered = catch_unwind(AssertUnwindSafe(|| callback(&messages, &transfer.meta)));
            if delivered.is_err() {
                error!(event = "receive_callback_panic", %export_id);
            }
        }
    }

    /// Periodic stall check for one incoming transfer. Ends on its own once
    /// the transfer is gone, and on shutdown.
    fn spawn_sweep(&self, export_id: Uuid) -> JoinHandle<()> {
        let inner = self.this.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.wait() => return,
                }
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if !inner.sweep_incoming(export_id) {
                    return;
                }
            }
        })
    }

    /// Drop the transfer if it has stalled. Returns whether it is still live.
    fn sweep_incoming(&self, export_id: Uuid) -> bool {
        let mut st = self.state();
        let Some(transfer) = st.incoming.get(&export_id) else {
            return false;
        };
        let idle = transfer.last_progress_at.elapsed();
        if idle < self.config.stall_timeout {
            return true;
        }
        let received = transfer.received_chunks();
        let total = transfer.meta.total_chunks;
        // Runs inside the sweep task itself; dropping the handle detaches it.
        st.incoming.remove(&export_id);
        warn!(
            event = "incoming_transfer_stalled",
            %export_id,
            received,
            total,
            idle_secs = idle.as_secs(),
            "Dropping stalled incoming export"
        );
        false
    }
}

/// Reassemble, check the digest, decompress, and parse. Any failure drops
/// the export.
fn verify(transfer: &IncomingTransfer, checksum: &str) -> Option<Vec<ConversationMessage>> {
    let export_id = transfer.meta.export_id;
    if !transfer.is_complete() {
        warn!(
            event = "export_incomplete",
            %export_id,
            received = transfer.received_chunks(),
            total = transfer.meta.total_chunks,
        );
        return None;
    }

    let size: usize = transfer.chunks.values().map(Bytes::len).sum();
    let mut payload = Vec::with_capacity(size);
    for index in 0..transfer.meta.total_chunks {
        payload.extend_from_slice(transfer.chunks.get(&index)?);
    }

    if digest(&payload) != checksum.to_ascii_lowercase() {
        warn!(event = "export_checksum_mismatch", %export_id, bytes = payload.len());
        return None;
    }
    let Some(json) = decompress(&payload) else {
        warn!(event = "export_decompress_failure", %export_id);
        return None;
    };
    let messages = parse_messages(&json);
    if messages.is_none() {
        warn!(event = "export_invalid_messages", %export_id);
    }
    messages
}
