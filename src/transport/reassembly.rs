//! Receiver-side reassembly of chunked messages.
//!
//! Chunk envelopes are accumulated per chunk id until every index has
//! arrived, in any order. Ordinary messages pass straight through.
//!
//! # Lifecycle of a pending set
//!
//! ```text
//! first chunk for id ──► Pending { slots, total, last_activity }
//!                              │
//!            all slots filled  │  no activity for stale_timeout
//!                 ▼            ▼
//!        delivered once      evicted by cleanup() (logged with received/total)
//! ```
//!
//! Completed ids are remembered for one staleness window so a late
//! re-delivered chunk cannot start a second copy of the same message.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::chunking::ChunkEnvelope;
use crate::constants::MAX_CHUNKS_PER_MESSAGE;

/// Chunks received so far for one chunk id.
///
/// Slots are filled lazily; memory follows what actually arrived, not what
/// the envelope declares.
#[derive(Debug)]
struct PendingChunkSet {
    slots: BTreeMap<u32, String>,
    total: u32,
    created_at: Instant,
    last_activity: Instant,
}

impl PendingChunkSet {
    fn new(total: u32, now: Instant) -> Self {
        Self {
            slots: BTreeMap::new(),
            total,
            created_at: now,
            last_activity: now,
        }
    }

    fn received(&self) -> usize {
        self.slots.len()
    }

    fn is_complete(&self) -> bool {
        self.slots.len() == self.total as usize
    }
}

/// Accumulates chunk envelopes and emits reassembled messages.
#[derive(Debug)]
pub struct ChunkReassembler {
    pending: HashMap<String, PendingChunkSet>,
    completed: HashMap<String, Instant>,
    stale_timeout: Duration,
    max_chunks: u32,
}

impl ChunkReassembler {
    /// Create a reassembler evicting sets idle for longer than `stale_timeout`.
    pub fn new(stale_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            completed: HashMap::new(),
            stale_timeout,
            max_chunks: MAX_CHUNKS_PER_MESSAGE,
        }
    }

    /// Reject envelopes declaring more than `max_chunks` chunks.
    #[must_use]
    pub fn with_max_chunks(mut self, max_chunks: u32) -> Self {
        self.max_chunks = max_chunks.max(1);
        self
    }

    /// Process one inbound message.
    ///
    /// Returns the message unchanged if it is not a chunk envelope, the
    /// reassembled message once the last missing chunk arrives, and `None`
    /// otherwise (incomplete set, duplicate, malformed chunk).
    pub fn process(&mut self, message: Value) -> Option<Value> {
        self.process_at(message, Instant::now())
    }

    /// [`process`](Self::process) with an explicit clock.
    pub fn process_at(&mut self, message: Value, now: Instant) -> Option<Value> {
        if !ChunkEnvelope::is_marked(&message) {
            return Some(message);
        }

        let chunk: ChunkEnvelope = match serde_json::from_value(message) {
            Ok(chunk) => chunk,
            Err(e) => {
                log::error!("[Reassembly] Dropping malformed chunk envelope: {e}");
                return None;
            }
        };

        if chunk.total_chunks == 0 || chunk.chunk_index >= chunk.total_chunks {
            log::error!(
                "[Reassembly] Dropping chunk {} with index {} of {}",
                chunk.chunk_id,
                chunk.chunk_index,
                chunk.total_chunks
            );
            return None;
        }

        if chunk.total_chunks > self.max_chunks {
            log::error!(
                "[Reassembly] Dropping chunk {} of {}: declares {} chunks, limit is {}",
                chunk.chunk_index,
                chunk.chunk_id,
                chunk.total_chunks,
                self.max_chunks
            );
            return None;
        }

        if self.completed.contains_key(&chunk.chunk_id) {
            log::debug!(
                "[Reassembly] Ignoring late chunk {} for completed message {}",
                chunk.chunk_index,
                chunk.chunk_id
            );
            return None;
        }

        let total = chunk.total_chunks;
        let set = self
            .pending
            .entry(chunk.chunk_id.clone())
            .or_insert_with(|| PendingChunkSet::new(total, now));

        if set.total != total {
            log::error!(
                "[Reassembly] Chunk {} of {} declares {} total chunks, expected {}",
                chunk.chunk_index,
                chunk.chunk_id,
                total,
                set.total
            );
            return None;
        }

        set.last_activity = now;
        set.slots.entry(chunk.chunk_index).or_insert(chunk.data);

        if !set.is_complete() {
            return None;
        }

        let set = self.pending.remove(&chunk.chunk_id)?;
        self.completed.insert(chunk.chunk_id.clone(), now);

        let json: String = set.slots.into_values().collect();
        match serde_json::from_str(&json) {
            Ok(value) => {
                log::debug!(
                    "[Reassembly] Reassembled {} ({} chunks, {} bytes, {:?})",
                    chunk.chunk_id,
                    total,
                    json.len(),
                    now.saturating_duration_since(set.created_at)
                );
                Some(value)
            }
            Err(e) => {
                log::error!(
                    "[Reassembly] Reassembled message {} is not valid JSON: {e}",
                    chunk.chunk_id
                );
                None
            }
        }
    }

    /// Evict stale chunk sets. Returns how many incomplete sets were removed.
    pub fn cleanup(&mut self) -> usize {
        self.cleanup_at(Instant::now())
    }

    /// [`cleanup`](Self::cleanup) with an explicit clock.
    pub fn cleanup_at(&mut self, now: Instant) -> usize {
        let timeout = self.stale_timeout;
        let mut evicted = 0;

        self.pending.retain(|chunk_id, set| {
            let idle = now.saturating_duration_since(set.last_activity);
            if idle > timeout {
                log::warn!(
                    "[Reassembly] Evicting stale chunk set {chunk_id}: received {}/{} chunks",
                    set.received(),
                    set.total
                );
                evicted += 1;
                false
            } else {
                true
            }
        });

        self.completed
            .retain(|_, completed_at| now.saturating_duration_since(*completed_at) <= timeout);

        evicted
    }

    /// Number of incomplete chunk sets held.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Received count of a pending set, if one exists for `chunk_id`.
    pub fn received_count(&self, chunk_id: &str) -> Option<usize> {
        self.pending.get(chunk_id).map(PendingChunkSet::received)
    }
}

/// Run [`ChunkReassembler::cleanup`] every `interval` until `cancel` fires.
pub fn spawn_cleanup(
    reassembler: Arc<Mutex<ChunkReassembler>>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Ok(mut reassembler) = reassembler.lock() {
                        reassembler.cleanup();
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::chunking::split_message;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn chunk_values(message: &Value, max_data: usize, id: &str) -> Vec<Value> {
        let json = serde_json::to_string(message).unwrap();
        split_message(&json, max_data, id)
            .into_iter()
            .map(|c| serde_json::to_value(c).unwrap())
            .collect()
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![vec![]];
        }
        let mut out = Vec::new();
        for perm in permutations(n - 1) {
            for pos in 0..=perm.len() {
                let mut p = perm.clone();
                p.insert(pos, n - 1);
                out.push(p);
            }
        }
        out
    }

    #[test]
    fn test_plain_message_passes_through() {
        let mut reassembler = ChunkReassembler::new(TIMEOUT);
        let msg = json!({"id": "1", "result": 42});
        assert_eq!(reassembler.process(msg.clone()), Some(msg));
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_any_delivery_order_reassembles() {
        let message = json!({"payload": "abcdefghij".repeat(12)});
        let chunks = chunk_values(&message, 30, "perm");
        assert_eq!(chunks.len(), 5);

        for order in permutations(chunks.len()) {
            let mut reassembler = ChunkReassembler::new(TIMEOUT);
            let mut results = Vec::new();
            for (step, idx) in order.iter().enumerate() {
                let out = reassembler.process(chunks[*idx].clone());
                if step < order.len() - 1 {
                    assert!(out.is_none(), "order {order:?} produced output early");
                }
                results.push(out);
            }
            assert_eq!(results.last().cloned().flatten(), Some(message.clone()));
            assert_eq!(reassembler.pending_count(), 0);
        }
    }

    #[test]
    fn test_missing_chunk_never_completes() {
        let message = json!({"payload": "q".repeat(100)});
        let chunks = chunk_values(&message, 20, "short");
        let mut reassembler = ChunkReassembler::new(TIMEOUT);
        for chunk in chunks.iter().skip(1) {
            assert!(reassembler.process(chunk.clone()).is_none());
        }
        assert_eq!(reassembler.received_count("short"), Some(chunks.len() - 1));
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let message = json!({"payload": "r".repeat(60)});
        let chunks = chunk_values(&message, 25, "dup");
        let total = chunks.len();
        assert!(total >= 3);

        let mut reassembler = ChunkReassembler::new(TIMEOUT);
        for _ in 0..3 {
            assert!(reassembler.process(chunks[0].clone()).is_none());
        }
        assert_eq!(reassembler.received_count("dup"), Some(1));

        for chunk in &chunks[1..total - 1] {
            assert!(reassembler.process(chunk.clone()).is_none());
            assert!(reassembler.process(chunk.clone()).is_none());
        }
        assert_eq!(reassembler.received_count("dup"), Some(total - 1));
        assert_eq!(reassembler.process(chunks[total - 1].clone()), Some(message));
    }

    #[test]
    fn test_completed_message_not_delivered_twice() {
        let message = json!({"n": 1});
        let chunks = chunk_values(&message, 1000, "once");
        assert_eq!(chunks.len(), 1);

        let mut reassembler = ChunkReassembler::new(TIMEOUT);
        assert_eq!(reassembler.process(chunks[0].clone()), Some(message));
        assert!(reassembler.process(chunks[0].clone()).is_none());
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_interleaved_chunk_ids() {
        let first = json!({"first": "a".repeat(50)});
        let second = json!({"second": "b".repeat(50)});
        let a = chunk_values(&first, 20, "a");
        let b = chunk_values(&second, 20, "b");

        let mut reassembler = ChunkReassembler::new(TIMEOUT);
        let mut delivered = Vec::new();
        for (x, y) in a.iter().zip(b.iter()) {
            delivered.extend(reassembler.process(x.clone()));
            delivered.extend(reassembler.process(y.clone()));
        }
        for rest in a.iter().skip(b.len()).chain(b.iter().skip(a.len())) {
            delivered.extend(reassembler.process(rest.clone()));
        }
        assert_eq!(delivered.len(), 2);
        assert!(delivered.contains(&first));
        assert!(delivered.contains(&second));
    }

    #[test]
    fn test_stale_sets_are_evicted() {
        let message = json!({"payload": "s".repeat(80)});
        let chunks = chunk_values(&message, 20, "stale");
        let start = Instant::now();

        let mut reassembler = ChunkReassembler::new(TIMEOUT);
        assert!(reassembler.process_at(chunks[0].clone(), start).is_none());

        assert_eq!(reassembler.cleanup_at(start + Duration::from_secs(10)), 0);
        assert_eq!(reassembler.pending_count(), 1);

        assert_eq!(reassembler.cleanup_at(start + Duration::from_secs(31)), 1);
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_activity_keeps_set_alive() {
        let message = json!({"payload": "t".repeat(80)});
        let chunks = chunk_values(&message, 20, "alive");
        let start = Instant::now();

        let mut reassembler = ChunkReassembler::new(TIMEOUT);
        reassembler.process_at(chunks[0].clone(), start);
        reassembler.process_at(chunks[1].clone(), start + Duration::from_secs(25));
        assert_eq!(reassembler.cleanup_at(start + Duration::from_secs(40)), 0);
        assert_eq!(reassembler.received_count("alive"), Some(2));
    }

    #[test]
    fn test_malformed_chunks_are_dropped() {
        let mut reassembler = ChunkReassembler::new(TIMEOUT);
        let out_of_range = json!({
            "__chunked": true, "chunkId": "bad", "chunkIndex": 2, "totalChunks": 2, "data": "{}"
        });
        assert!(reassembler.process(out_of_range).is_none());

        let missing_fields = json!({"__chunked": true, "chunkId": "bad"});
        assert!(reassembler.process(missing_fields).is_none());
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_huge_declared_total_is_dropped() {
        let mut reassembler = ChunkReassembler::new(TIMEOUT);
        let oversized = json!({
            "__chunked": true, "chunkId": "huge", "chunkIndex": 0,
            "totalChunks": u32::MAX, "data": "{"
        });
        assert!(reassembler.process(oversized).is_none());
        assert_eq!(reassembler.pending_count(), 0);

        // At the limit the set is held, and only the received chunk takes memory.
        let at_limit = json!({
            "__chunked": true, "chunkId": "wide", "chunkIndex": MAX_CHUNKS_PER_MESSAGE - 1,
            "totalChunks": MAX_CHUNKS_PER_MESSAGE, "data": "}"
        });
        assert!(reassembler.process(at_limit).is_none());
        assert_eq!(reassembler.received_count("wide"), Some(1));
    }

    #[test]
    fn test_custom_chunk_limit() {
        let mut reassembler = ChunkReassembler::new(TIMEOUT).with_max_chunks(2);
        let message = json!({"payload": "x".repeat(40)});
        let chunks = chunk_values(&message, 10, "capped");
        assert!(chunks.len() > 2);
        for chunk in chunks {
            assert!(reassembler.process(chunk).is_none());
        }
        assert_eq!(reassembler.pending_count(), 0);

        let fits = chunk_values(&json!({"a": 1}), 6, "fits");
        assert_eq!(fits.len(), 2);
        let mut out = None;
        for chunk in fits {
            out = reassembler.process(chunk);
        }
        assert_eq!(out, Some(json!({"a": 1})));
    }

    #[test]
    fn test_mismatched_total_is_dropped() {
        let mut reassembler = ChunkReassembler::new(TIMEOUT);
        let first = json!({
            "__chunked": true, "chunkId": "mix", "chunkIndex": 0, "totalChunks": 3, "data": "{\"a\""
        });
        let liar = json!({
            "__chunked": true, "chunkId": "mix", "chunkIndex": 1, "totalChunks": 2, "data": ":1}"
        });
        assert!(reassembler.process(first).is_none());
        assert!(reassembler.process(liar).is_none());
        assert_eq!(reassembler.received_count("mix"), Some(1));
    }

    #[test]
    fn test_unparseable_reassembly_returns_none() {
        let mut reassembler = ChunkReassembler::new(TIMEOUT);
        for (i, data) in ["{\"a\":", "oops"].iter().enumerate() {
            let chunk = json!({
                "__chunked": true, "chunkId": "junk", "chunkIndex": i, "totalChunks": 2, "data": data
            });
            assert!(reassembler.process(chunk).is_none());
        }
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_task_evicts_and_stops() {
        let reassembler = Arc::new(Mutex::new(ChunkReassembler::new(Duration::from_millis(50))));
        let chunk = json!({
            "__chunked": true, "chunkId": "timer", "chunkIndex": 0, "totalChunks": 2, "data": "{"
        });
        reassembler.lock().unwrap().process(chunk);

        let cancel = CancellationToken::new();
        let task = spawn_cleanup(Arc::clone(&reassembler), Duration::from_millis(20), cancel.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(reassembler.lock().unwrap().pending_count(), 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
