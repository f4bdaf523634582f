//! Splitting of oversized messages into chunk envelopes.
//!
//! A message whose JSON exceeds the transport threshold is cut into ordered
//! substrings, each wrapped in a [`ChunkEnvelope`] sharing one chunk id:
//!
//! ```text
//! {"__chunked":true,"chunkId":"3f9c2a1be04d-17","chunkIndex":0,"totalChunks":3,"data":"{\"a\":\"xx..."}
//! ```
//!
//! Concatenating `data` in `chunkIndex` order yields the original JSON text.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field that marks a message as a chunk envelope.
pub const CHUNK_MARKER: &str = "__chunked";

/// Smallest usable chunk data budget (one `\u00XX` escape).
const MIN_CHUNK_DATA: usize = 6;

/// One piece of an oversized logical message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEnvelope {
    /// Always `true` on the wire.
    #[serde(rename = "__chunked")]
    pub chunked: bool,
    /// Identifier shared by every chunk of one logical message.
    pub chunk_id: String,
    /// Position of this chunk, `0..total_chunks`.
    pub chunk_index: u32,
    /// Number of chunks making up the message.
    pub total_chunks: u32,
    /// Substring of the original JSON text.
    pub data: String,
}

impl ChunkEnvelope {
    /// Returns true if `value` carries the chunk marker.
    ///
    /// Marked values that fail to parse as an envelope are still "chunk-like";
    /// the reassembler drops them instead of passing them through.
    pub fn is_marked(value: &Value) -> bool {
        value.get(CHUNK_MARKER).and_then(Value::as_bool) == Some(true)
    }
}

/// Generates chunk ids unique within the process and across processes.
///
/// Ids are `<random process nonce>-<monotonic counter>`, so two concurrently
/// in-flight oversized messages never share an id.
#[derive(Debug)]
pub struct ChunkIdGenerator {
    nonce: String,
    counter: AtomicU64,
}

impl ChunkIdGenerator {
    /// Create a generator with a fresh random nonce.
    pub fn new() -> Self {
        let mut nonce = uuid::Uuid::new_v4().simple().to_string();
        nonce.truncate(12);
        Self {
            nonce,
            counter: AtomicU64::new(0),
        }
    }

    /// Next unique chunk id.
    pub fn next_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq}", self.nonce)
    }
}

impl Default for ChunkIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes `c` occupies once embedded in a JSON string literal.
fn escaped_len(c: char) -> usize {
    match c {
        '"' | '\\' | '\n' | '\r' | '\t' | '\u{08}' | '\u{0c}' => 2,
        c if (c as u32) < 0x20 => 6,
        c => c.len_utf8(),
    }
}

/// Split serialized JSON into chunk envelopes.
///
/// Each chunk's `data`, once escaped inside the envelope, takes at most
/// `max_data` bytes. Cuts land on UTF-8 character boundaries.
pub fn split_message(json: &str, max_data: usize, chunk_id: &str) -> Vec<ChunkEnvelope> {
    let max_data = max_data.max(MIN_CHUNK_DATA);
    let mut pieces: Vec<&str> = Vec::new();
    let mut start = 0;
    let mut size = 0;

    for (idx, c) in json.char_indices() {
        let len = escaped_len(c);
        if size + len > max_data {
            pieces.push(&json[start..idx]);
            start = idx;
            size = 0;
        }
        size += len;
    }
    if start < json.len() || pieces.is_empty() {
        pieces.push(&json[start..]);
    }

    let total = pieces.len() as u32;
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, data)| ChunkEnvelope {
            chunked: true,
            chunk_id: chunk_id.to_string(),
            chunk_index: index as u32,
            total_chunks: total,
            data: data.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_concatenates_back() {
        let json = serde_json::to_string(&json!({"a": "x".repeat(1000)})).unwrap();
        let chunks = split_message(&json, 100, "c-1");
        assert_eq!(chunks.len(), json.len().div_ceil(100));

        let rebuilt: String = chunks.iter().map(|c| c.data.as_str()).collect();
        assert_eq!(rebuilt, json);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index as usize, i);
            assert_eq!(c.total_chunks as usize, chunks.len());
            assert_eq!(c.chunk_id, "c-1");
            assert!(c.chunked);
        }
    }

    #[test]
    fn test_escaped_size_respects_budget() {
        // Quotes and backslashes double in size once embedded in the envelope.
        let json = serde_json::to_string(&json!({"q": "\"\\".repeat(500)})).unwrap();
        let chunks = split_message(&json, 64, "c-2");
        for c in &chunks {
            let embedded = serde_json::to_string(&c.data).unwrap();
            assert!(embedded.len() - 2 <= 64, "chunk data escaped to {} bytes", embedded.len() - 2);
        }
        let rebuilt: String = chunks.iter().map(|c| c.data.as_str()).collect();
        assert_eq!(rebuilt, json);
    }

    #[test]
    fn test_never_splits_multibyte_characters() {
        let json = serde_json::to_string(&json!({"s": "é€😀".repeat(200)})).unwrap();
        let chunks = split_message(&json, 7, "c-3");
        let rebuilt: String = chunks.iter().map(|c| c.data.as_str()).collect();
        assert_eq!(rebuilt, json);
        assert!(chunks.iter().all(|c| c.data.len() <= 7));
    }

    #[test]
    fn test_small_input_is_single_chunk() {
        let chunks = split_message("{}", 100, "c-4");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, "{}");
        assert_eq!(chunks[0].total_chunks, 1);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = ChunkEnvelope {
            chunked: true,
            chunk_id: "id".into(),
            chunk_index: 1,
            total_chunks: 2,
            data: "{}".into(),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({"__chunked": true, "chunkId": "id", "chunkIndex": 1, "totalChunks": 2, "data": "{}"})
        );
        assert!(ChunkEnvelope::is_marked(&value));
        assert!(!ChunkEnvelope::is_marked(&json!({"chunkId": "id"})));
        assert!(!ChunkEnvelope::is_marked(&json!({"__chunked": false})));
    }

    #[test]
    fn test_chunk_ids_are_unique() {
        let ids = ChunkIdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);

        let other = ChunkIdGenerator::new();
        assert_ne!(other.next_id(), a);
    }
}
