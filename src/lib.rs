//! collabshare: peer-to-peer collaboration sessions with chunked,
//! integrity-checked conversation export over data channels.
//!
//! - [`crate::core::transfer::TransferManager`] moves conversation exports between
//!   peers over any [`crate::core::connection::PeerConnection`].
//! - [`crate::core::session::SessionManager`] runs the signaling session: connect,
//!   authenticate, derive the caller's role, persist and restore intent.
//! - [`crate::core::collab::CollabGate`] keeps a transfer manager alive exactly
//!   while the session is in collaboration mode.

pub mod core;
pub mod utils;

pub use crate::core::collab::CollabGate;
pub use crate::core::connection::{DataChannelPeer, MemoryPeer, PeerConnection, PeerEvent};
pub use crate::core::conversation::{ConversationMessage, ExportDescriptor, ExportMeta};
pub use crate::core::session::{
    ConnectionState, Participant, Role, SessionConfig, SessionError, SessionManager, SessionSnapshot,
};
pub use crate::core::transfer::{SendOptions, TransferConfig, TransferError, TransferManager};
