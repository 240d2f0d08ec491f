//! Wire codecs for conversation exports: compression/digest and framing.

pub mod compress;
pub mod frame;

pub use compress::{compress, decompress, digest};
pub use frame::{decode, looks_like_own_message, FrameError, ProtocolMessage};
