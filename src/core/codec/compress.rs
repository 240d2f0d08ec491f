//! Compression and content digest helpers for conversation exports.
//!
//! Both peers run the same Brotli parameters, so whatever one side
//! compresses the other can expand. The digest is SHA3-256 over the
//! *compressed* buffer, rendered as lowercase hex. It guards against
//! reassembly bugs and corruption, not against a malicious peer.

use anyhow::Result;
use brotli::{CompressorWriter, Decompressor};
use sha3::{Digest, Sha3_256};
use std::io::{Read, Write};
use tracing::debug;

/// Brotli quality: exports are produced once per transfer, so we can afford
/// a bit more effort than the interactive default.
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;
const BROTLI_BUFFER: usize = 4096;

/// Compress `data` with Brotli.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2);
    {
        let mut w = CompressorWriter::new(&mut out, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_WINDOW);
        w.write_all(data)?;
    }
    Ok(out)
}

/// Expand a Brotli buffer back into a UTF-8 string.
///
/// Returns `None` on any corruption (bad stream, truncated input, invalid
/// UTF-8). Never panics on adversarial input.
pub fn decompress(data: &[u8]) -> Option<String> {
    let mut dec = Decompressor::new(data, BROTLI_BUFFER);
    let mut out = String::new();
    match dec.read_to_string(&mut out) {
        Ok(_) => Some(out),
        Err(e) => {
            debug!(event = "decompress_failure", bytes = data.len(), %e);
            None
        }
    }
}

/// SHA3-256 of `data` as a 64-char lowercase hex string.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_roundtrip() {
        let text = r#"[{"role":"user","content":"hello"}]"#.repeat(200);
        let packed = compress(text.as_bytes()).unwrap();
        assert!(packed.len() < text.len());
        assert_eq!(decompress(&packed).as_deref(), Some(text.as_str()));
    }

    #[test]
    fn test_compress_empty_input() {
        let packed = compress(b"").unwrap();
        assert!(!packed.is_empty());
        assert_eq!(decompress(&packed).as_deref(), Some(""));
    }

    #[test]
    fn test_decompress_garbage_is_none() {
        assert_eq!(decompress(&[0xFF, 0x00, 0x13, 0x37, 0x42]), None);
    }

    #[test]
    fn test_decompress_truncated_is_none() {
        let text = "some conversation text ".repeat(500);
        let packed = compress(text.as_bytes()).unwrap();
        assert_eq!(decompress(&packed[..packed.len() / 2]), None);
    }

    #[test]
    fn test_digest_shape_and_stability() {
        let d1 = digest(b"abc");
        let d2 = digest(b"abc");
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 64);
        assert!(d1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(d1, digest(b"abd"));
    }

    #[test]
    fn test_digest_known_vector() {
        // SHA3-256("")
        assert_eq!(
            digest(b""),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }
}
