//! Export protocol: binary frame encoding/decoding.
//!
//! Every frame on the data channel uses this envelope:
//!
//!   [1 byte: kind] [N bytes: payload]
//!
//! Frame kinds:
//!   0xE0 = ExportStart (JSON-encoded `ExportMeta`)
//!   0xE1 = Chunk       (16 bytes export_id + 4 bytes index BE + raw data)
//!   0xE2 = ExportEnd   (16 bytes export_id + 64 bytes hex SHA3-256 digest)
//!
//! The kind bytes sit far away from the low tags a CRDT sync protocol uses
//! on the same channel, so [`looks_like_own_message`] can reject foreign
//! traffic with a single byte comparison.

use bytes::{BufMut, Bytes};
use thiserror::Error;
use uuid::Uuid;

use crate::core::conversation::ExportMeta;

pub const KIND_EXPORT_START: u8 = 0xE0;
pub const KIND_CHUNK: u8 = 0xE1;
pub const KIND_EXPORT_END: u8 = 0xE2;

const ID_LEN: usize = 16;
const INDEX_LEN: usize = 4;
const CHECKSUM_LEN: usize = 64;
const CHUNK_HEADER_LEN: usize = 1 + ID_LEN + INDEX_LEN;
const END_FRAME_LEN: usize = 1 + ID_LEN + CHECKSUM_LEN;

/// Decode failures. Callers treat every variant as "not ours".
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("frame too short: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("invalid export metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("invalid checksum encoding")]
    Checksum,
}

/// One chunk of a compressed export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub export_id: Uuid,
    pub chunk_index: u32,
    pub data: Bytes,
}

/// Trailer carrying the digest of the whole compressed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEndFrame {
    pub export_id: Uuid,
    pub checksum: String,
}

/// Every message kind the export protocol puts on the wire.
///
/// Consumers match on this without a wildcard arm so that adding a kind
/// fails to compile until every dispatcher handles it.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    ExportStart(ExportMeta),
    Chunk(ChunkFrame),
    ExportEnd(ExportEndFrame),
}

impl ProtocolMessage {
    pub fn export_id(&self) -> Uuid {
        match self {
            ProtocolMessage::ExportStart(meta) => meta.export_id,
            ProtocolMessage::Chunk(chunk) => chunk.export_id,
            ProtocolMessage::ExportEnd(end) => end.export_id,
        }
    }

    pub fn kind(&self) -> u8 {
        match self {
            ProtocolMessage::ExportStart(_) => KIND_EXPORT_START,
            ProtocolMessage::Chunk(_) => KIND_CHUNK,
            ProtocolMessage::ExportEnd(_) => KIND_EXPORT_END,
        }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        match self {
            ProtocolMessage::ExportStart(meta) => encode_export_start(meta),
            ProtocolMessage::Chunk(chunk) => Ok(encode_chunk(chunk.export_id, chunk.chunk_index, &chunk.data)),
            ProtocolMessage::ExportEnd(end) => encode_export_end(end.export_id, &end.checksum),
        }
    }
}

/// Encode `[0xE0][json meta]`.
pub fn encode_export_start(meta: &ExportMeta) -> Result<Bytes, FrameError> {
    let json = serde_json::to_vec(meta)?;
    let mut buf = Vec::with_capacity(1 + json.len());
    buf.put_u8(KIND_EXPORT_START);
    buf.extend_from_slice(&json);
    Ok(Bytes::from(buf))
}

/// Encode `[0xE1][16 bytes id][4 bytes index BE][data]`.
pub fn encode_chunk(export_id: Uuid, chunk_index: u32, data: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN + data.len());
    buf.put_u8(KIND_CHUNK);
    buf.extend_from_slice(export_id.as_bytes());
    buf.put_u32(chunk_index);
    buf.extend_from_slice(data);
    Bytes::from(buf)
}

/// Encode `[0xE2][16 bytes id][64 hex chars]`.
pub fn encode_export_end(export_id: Uuid, checksum: &str) -> Result<Bytes, FrameError> {
    if !is_hex_digest(checksum) {
        return Err(FrameError::Checksum);
    }
    let mut buf = Vec::with_capacity(END_FRAME_LEN);
    buf.put_u8(KIND_EXPORT_END);
    buf.extend_from_slice(export_id.as_bytes());
    buf.extend_from_slice(checksum.as_bytes());
    Ok(Bytes::from(buf))
}

/// Cheap ownership sniff: does this frame carry one of our kind bytes?
#[inline]
pub fn looks_like_own_message(frame: &[u8]) -> bool {
    matches!(
        frame.first(),
        Some(&(KIND_EXPORT_START | KIND_CHUNK | KIND_EXPORT_END))
    )
}

/// Fully decode a frame. Chunk payloads are zero-copy slices of `frame`.
pub fn decode(frame: &Bytes) -> Result<ProtocolMessage, FrameError> {
    let (&kind, _) = frame.split_first().ok_or(FrameError::Empty)?;
    match kind {
        KIND_EXPORT_START => {
            let meta: ExportMeta = serde_json::from_slice(&frame[1..])?;
            Ok(ProtocolMessage::ExportStart(meta))
        }
        KIND_CHUNK => {
            ensure_len(frame, CHUNK_HEADER_LEN)?;
            let export_id = read_id(frame)?;
            let mut index = [0u8; INDEX_LEN];
            index.copy_from_slice(&frame[1 + ID_LEN..CHUNK_HEADER_LEN]);
            Ok(ProtocolMessage::Chunk(ChunkFrame {
                export_id,
                chunk_index: u32::from_be_bytes(index),
                data: frame.slice(CHUNK_HEADER_LEN..),
            }))
        }
        KIND_EXPORT_END => {
            ensure_len(frame, END_FRAME_LEN)?;
            if frame.len() != END_FRAME_LEN {
                return Err(FrameError::Checksum);
            }
            let export_id = read_id(frame)?;
            let checksum = std::str::from_utf8(&frame[1 + ID_LEN..])
                .map_err(|_| FrameError::Checksum)?;
            if !is_hex_digest(checksum) {
                return Err(FrameError::Checksum);
            }
            Ok(ProtocolMessage::ExportEnd(ExportEndFrame {
                export_id,
                checksum: checksum.to_string(),
            }))
        }
        other => Err(FrameError::UnknownKind(other)),
    }
}

fn ensure_len(frame: &[u8], need: usize) -> Result<(), FrameError> {
    if frame.len() < need {
        return Err(FrameError::Truncated {
            need,
            got: frame.len(),
        });
    }
    Ok(())
}

fn read_id(frame: &[u8]) -> Result<Uuid, FrameError> {
    Uuid::from_slice(&frame[1..1 + ID_LEN]).map_err(|_| FrameError::Truncated {
        need: 1 + ID_LEN,
        got: frame.len(),
    })
}

fn is_hex_digest(s: &str) -> bool {
    s.len() == CHECKSUM_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::compress::digest;
    use crate::core::conversation::ExportDescriptor;
    use proptest::prelude::*;

    fn sample_meta() -> ExportMeta {
        ExportMeta::new(
            Uuid::new_v4(),
            ExportDescriptor::now("desktop", "session-42"),
            4,
            120_000,
            51_200,
        )
    }

    #[test]
    fn test_export_start_frame() {
        let meta = sample_meta();
        let frame = encode_export_start(&meta).unwrap();
        assert_eq!(frame[0], KIND_EXPORT_START);
        assert!(looks_like_own_message(&frame));
        assert_eq!(decode(&frame).unwrap(), ProtocolMessage::ExportStart(meta));
    }

    #[test]
    fn test_chunk_frame_layout() {
        let id = Uuid::new_v4();
        let frame = encode_chunk(id, 0x0102_0304, b"payload");
        assert_eq!(frame.len(), CHUNK_HEADER_LEN + 7);
        assert_eq!(frame[0], KIND_CHUNK);
        assert_eq!(&frame[1..17], id.as_bytes());
        assert_eq!(&frame[17..21], &[1, 2, 3, 4]);
        assert_eq!(&frame[21..], b"payload");
    }

    #[test]
    fn test_chunk_with_empty_payload() {
        let id = Uuid::new_v4();
        let frame = encode_chunk(id, 9, b"");
        match decode(&frame).unwrap() {
            ProtocolMessage::Chunk(c) => {
                assert_eq!(c.chunk_index, 9);
                assert!(c.data.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_export_end_frame() {
        let id = Uuid::new_v4();
        let sum = digest(b"compressed");
        let frame = encode_export_end(id, &sum).unwrap();
        assert_eq!(frame.len(), END_FRAME_LEN);
        assert_eq!(
            decode(&frame).unwrap(),
            ProtocolMessage::ExportEnd(ExportEndFrame {
                export_id: id,
                checksum: sum
            })
        );
    }

    #[test]
    fn test_export_end_rejects_bad_checksum() {
        assert!(matches!(
            encode_export_end(Uuid::nil(), "nothex"),
            Err(FrameError::Checksum)
        ));
        let mut frame = encode_export_end(Uuid::nil(), &digest(b"x")).unwrap().to_vec();
        frame[20] = b'z';
        assert!(matches!(decode(&Bytes::from(frame)), Err(FrameError::Checksum)));
    }

    #[test]
    fn test_foreign_traffic_is_not_ours() {
        // CRDT sync style frames: small varint tags.
        for frame in [vec![0u8, 0, 5, 1], vec![1u8, 3], vec![2u8]] {
            assert!(!looks_like_own_message(&frame));
            assert!(matches!(
                decode(&Bytes::from(frame)),
                Err(FrameError::UnknownKind(_))
            ));
        }
        assert!(!looks_like_own_message(&[]));
        assert!(matches!(decode(&Bytes::new()), Err(FrameError::Empty)));
    }

    #[test]
    fn test_truncated_frames() {
        let frame = Bytes::from_static(&[KIND_CHUNK, 1, 2, 3]);
        assert!(looks_like_own_message(&frame));
        assert!(matches!(
            decode(&frame),
            Err(FrameError::Truncated { need: 21, got: 4 })
        ));
        let frame = Bytes::from_static(&[KIND_EXPORT_START, b'{']);
        assert!(matches!(decode(&frame), Err(FrameError::Metadata(_))));
    }

    #[test]
    fn test_encode_via_message_matches_helpers() {
        let id = Uuid::new_v4();
        let msg = ProtocolMessage::Chunk(ChunkFrame {
            export_id: id,
            chunk_index: 3,
            data: Bytes::from_static(b"abc"),
        });
        assert_eq!(msg.kind(), KIND_CHUNK);
        assert_eq!(msg.export_id(), id);
        assert_eq!(msg.encode().unwrap(), encode_chunk(id, 3, b"abc"));
    }

    proptest! {
        #[test]
        fn prop_chunk_roundtrip(index: u32, data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let id = Uuid::new_v4();
            let frame = encode_chunk(id, index, &data);
            prop_assert!(looks_like_own_message(&frame));
            match decode(&frame) {
                Ok(ProtocolMessage::Chunk(c)) => {
                    prop_assert_eq!(c.export_id, id);
                    prop_assert_eq!(c.chunk_index, index);
                    prop_assert_eq!(&c.data[..], &data[..]);
                }
                other => prop_assert!(false, "unexpected decode result: {:?}", other),
            }
        }

        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&Bytes::from(data));
        }
    }
}
