//! Wire codec for the bridge byte streams.
//!
//! Length-prefixed frames carrying UTF-8 JSON:
//!
//! ```text
//! [u32 LE length] [payload: length bytes of JSON]
//! ```
//!
//! The same codec is used on the browser's native-messaging stdio pipe and
//! on the worker's Unix socket. The decoder never interprets the JSON: chunk
//! envelopes and plain messages look the same at this layer.

use anyhow::{bail, Context, Result};
use bytes::{Buf, BytesMut};
use serde_json::Value;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Encode a raw payload into a wire frame.
///
/// Fails if the payload does not fit in a `u32` length prefix.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let Ok(length) = u32::try_from(payload.len()) else {
        bail!("Frame payload too large: {} bytes", payload.len());
    };
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Serialize a JSON value and encode it as one frame.
pub fn encode_json(value: &Value) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value).context("serialize frame payload")?;
    encode_frame(&payload)
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and get back every complete frame's
/// parsed JSON. Malformed frames are logged and dropped without losing frame
/// alignment:
///
/// - zero-length frames are skipped;
/// - frames larger than `max_frame_size` are discarded byte-for-byte as they
///   arrive, never buffered;
/// - payloads that are not valid JSON are dropped after their bytes are consumed.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
    /// Bytes of an oversized frame still to be discarded.
    skip_remaining: usize,
    dropped: u64,
}

impl FrameDecoder {
    /// Create a decoder that rejects frames larger than `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
            skip_remaining: 0,
            dropped: 0,
        }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete data is buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        loop {
            if self.skip_remaining > 0 {
                let n = self.skip_remaining.min(self.buf.len());
                self.buf.advance(n);
                self.skip_remaining -= n;
                if self.skip_remaining > 0 {
                    break;
                }
            }

            if self.buf.len() < HEADER_LEN {
                break;
            }

            let length =
                u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;

            if length == 0 {
                log::warn!("[Transport] Dropping zero-length frame");
                self.buf.advance(HEADER_LEN);
                self.dropped += 1;
                continue;
            }
            if length > self.max_frame_size {
                log::error!(
                    "[Transport] Dropping oversized frame: {length} bytes (max {})",
                    self.max_frame_size
                );
                self.buf.advance(HEADER_LEN);
                self.skip_remaining = length;
                self.dropped += 1;
                continue;
            }

            let total = HEADER_LEN + length;
            if self.buf.len() < total {
                break; // Incomplete frame, wait for more data
            }

            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(length);
            match serde_json::from_slice::<Value>(&payload) {
                Ok(value) => messages.push(value),
                Err(e) => {
                    log::error!("[Transport] Dropping frame with invalid JSON ({length} bytes): {e}");
                    self.dropped += 1;
                }
            }
        }

        messages
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty() || self.skip_remaining > 0
    }

    /// Number of frames dropped as malformed so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MAX: usize = 1024 * 1024;

    #[test]
    fn test_json_round_trip_is_byte_identical() {
        let value = json!({"method": "getAccounts", "args": [], "id": "abc"});
        let encoded = encode_json(&value).unwrap();
        let payload_len = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(payload_len as usize, encoded.len() - HEADER_LEN);
        assert_eq!(&encoded[HEADER_LEN..], serde_json::to_vec(&value).unwrap().as_slice());

        let mut decoder = FrameDecoder::new(MAX);
        let messages = decoder.feed(&encoded);
        assert_eq!(messages, vec![value]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let values = [json!({"msg": 1}), json!("two"), json!([3])];
        let mut buf = Vec::new();
        for v in &values {
            buf.extend_from_slice(&encode_json(v).unwrap());
        }

        let mut decoder = FrameDecoder::new(MAX);
        assert_eq!(decoder.feed(&buf), values.to_vec());
    }

    #[test]
    fn test_partial_frame_reassembly() {
        let value = json!({"key": "value"});
        let encoded = encode_json(&value).unwrap();
        let mut decoder = FrameDecoder::new(MAX);

        let mid = encoded.len() / 2;
        assert!(decoder.feed(&encoded[..mid]).is_empty());
        assert!(decoder.has_partial());

        assert_eq!(decoder.feed(&encoded[mid..]), vec![value]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_byte_at_a_time() {
        let value = json!({"x": "y"});
        let encoded = encode_json(&value).unwrap();
        let mut decoder = FrameDecoder::new(MAX);

        for (i, byte) in encoded.iter().enumerate() {
            let messages = decoder.feed(&[*byte]);
            if i < encoded.len() - 1 {
                assert!(messages.is_empty());
            } else {
                assert_eq!(messages, vec![value.clone()]);
            }
        }
    }

    #[test]
    fn test_header_split_across_feeds() {
        let value = json!({"split": true});
        let encoded = encode_json(&value).unwrap();
        let mut decoder = FrameDecoder::new(MAX);

        assert!(decoder.feed(&encoded[..2]).is_empty());
        assert_eq!(decoder.feed(&encoded[2..]), vec![value]);
    }

    #[test]
    fn test_invalid_json_dropped_stream_continues() {
        let mut buf = encode_frame(b"{not json").unwrap();
        buf.extend_from_slice(&encode_json(&json!({"ok": true})).unwrap());

        let mut decoder = FrameDecoder::new(MAX);
        assert_eq!(decoder.feed(&buf), vec![json!({"ok": true})]);
        assert_eq!(decoder.dropped(), 1);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_zero_length_frame_skipped() {
        let mut buf = vec![0u8; 4];
        buf.extend_from_slice(&encode_json(&json!(1)).unwrap());

        let mut decoder = FrameDecoder::new(MAX);
        assert_eq!(decoder.feed(&buf), vec![json!(1)]);
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn test_oversized_frame_skipped_without_desync() {
        let oversized = encode_frame(&vec![b'x'; 64]).unwrap();
        let follow_up = encode_json(&json!({"after": "oversized"})).unwrap();

        let mut decoder = FrameDecoder::new(32);
        // Deliver the oversized frame in pieces to exercise the skip state.
        assert!(decoder.feed(&oversized[..10]).is_empty());
        assert!(decoder.has_partial());
        assert!(decoder.feed(&oversized[10..40]).is_empty());

        let mut rest = oversized[40..].to_vec();
        rest.extend_from_slice(&follow_up);
        assert_eq!(decoder.feed(&rest), vec![json!({"after": "oversized"})]);
        assert_eq!(decoder.dropped(), 1);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_large_payload() {
        let value = json!({"blob": "z".repeat(256 * 1024)});
        let encoded = encode_json(&value).unwrap();
        let mut decoder = FrameDecoder::new(MAX);
        let messages = decoder.feed(&encoded);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], value);
    }
}
