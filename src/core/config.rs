//! Centralized configuration constants for collabshare.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame kind bytes) stay in
//! `core::codec::frame`.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Chunk size in bytes (16 KiB).
///
/// The largest message size every data-channel implementation we talk to
/// accepts without fragmenting or rejecting the frame. Frame overhead
/// (1 kind byte + 16 byte export id + 4 byte index) rides on top.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// High water mark for the peer's outstanding send buffer (bytes).
/// While `buffered_amount` exceeds this value the sender stops queueing
/// frames and polls until the buffer drains.
pub const BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

/// Poll interval while the sender is parked on backpressure.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often an incoming transfer checks itself for stalls.
pub const INCOMING_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// An incoming transfer with no chunk progress for this long is dropped.
pub const INCOMING_STALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// ── Safety / Abuse Prevention ────────────────────────────────────────────────

/// Maximum chunk count an `export_start` may declare (256 MiB at 16 KiB).
/// Larger announcements are ignored rather than allocated for.
pub const MAX_INCOMING_CHUNKS: u32 = 16 * 1024;

// ── Session / Signaling ──────────────────────────────────────────────────────

/// Key under which the join address is persisted in session storage.
pub const SESSION_STORAGE_KEY: &str = "collabshare.session.address";

/// Timeout for establishing the signaling connection.
pub const SIGNALING_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum reconnect attempts after a signaling drop before giving up
/// until the next visibility/online trigger.
pub const RECONNECT_MAX_RETRIES: u32 = 5;

/// Delays (in seconds) between reconnect attempts after a drop.
pub const RECONNECT_RETRY_DELAYS: [u64; 5] = [1, 3, 5, 10, 30];

// ── Logging ──────────────────────────────────────────────────────────────────

/// File name of the persistent log inside `<data_dir>/logs/`.
pub const LOG_FILE_NAME: &str = "collabshare.log";
