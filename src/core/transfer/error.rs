use thiserror::Error;
use uuid::Uuid;

use crate::core::codec::FrameError;

/// Errors surfaced by the transfer manager.
///
/// `PeerNotFound`, `PeerNotConnected` and `DuplicateExport` are caller
/// errors returned before any transfer state exists. Every other variant
/// ends an in-flight send and is also delivered through `on_error`.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    #[error("peer disconnected during transfer: {0}")]
    PeerDisconnected(String),

    #[error("transfer cancelled: {0}")]
    Cancelled(Uuid),

    #[error("transfer manager disposed")]
    Disposed,

    #[error("export already in flight: {0}")]
    DuplicateExport(Uuid),

    #[error("failed to serialize conversation: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("export too large: {chunks} chunks (limit {limit})")]
    TooLarge { chunks: usize, limit: u32 },

    #[error("frame encoding failed: {0}")]
    Frame(#[from] FrameError),

    #[error("transport send failed: {0}")]
    Transport(String),
}

impl TransferError {
    /// True when the transfer ended because someone asked it to.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled(_))
    }

    /// True for misuse errors reported before the transfer started.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            TransferError::PeerNotFound(_)
                | TransferError::PeerNotConnected(_)
                | TransferError::DuplicateExport(_)
        )
    }
}
