//! Batch accumulation and flush policy.
//!
//! Events that survive filtering land in per-partition pending batches. A
//! batch is flushed when it reaches the event limit, when it ages past the
//! flush timeout, when total buffered bytes would exceed the memory cap
//! (largest batch evicted first), when its partition is released, or when
//! the session transitions away from streaming.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use strom_core::{ConsumedEvent, Cursor, PartitionKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    BatchFull,
    Aged,
    MemoryPressure,
    PartitionReleased,
    Drained,
}

/// A batch ready to be written to the client.
#[derive(Debug)]
pub struct ReadyBatch {
    pub key: PartitionKey,
    pub cursor: Cursor,
    pub events: Vec<ConsumedEvent>,
    pub reason: FlushReason,
}

#[derive(Debug)]
struct PendingBatch {
    events: Vec<ConsumedEvent>,
    bytes: usize,
    opened_at: Instant,
}

impl PendingBatch {
    fn into_ready(self, key: PartitionKey, reason: FlushReason) -> Option<ReadyBatch> {
        let cursor = self.events.last()?.position.clone();
        Some(ReadyBatch {
            key,
            cursor,
            events: self.events,
            reason,
        })
    }
}

/// Accumulates pending batches under the session's memory bound and decides
/// when each of them must go out.
#[derive(Debug)]
pub struct StreamPipeline {
    batch_limit_events: usize,
    batch_flush_timeout: Duration,
    memory_limit_bytes: usize,
    keep_alive_limit: Duration,
    batches: HashMap<PartitionKey, PendingBatch>,
    /// Last flush (data or keep-alive) per registered partition.
    last_activity: HashMap<PartitionKey, Instant>,
    total_bytes: usize,
}

impl StreamPipeline {
    pub fn new(
        batch_limit_events: usize,
        batch_flush_timeout: Duration,
        memory_limit_bytes: usize,
        keep_alive_limit: Duration,
    ) -> Self {
        Self {
            batch_limit_events,
            batch_flush_timeout,
            memory_limit_bytes,
            keep_alive_limit,
            batches: HashMap::new(),
            last_activity: HashMap::new(),
            total_bytes: 0,
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Start keep-alive tracking for a newly assigned partition.
    pub fn register_partition(&mut self, key: PartitionKey, now: Instant) {
        self.last_activity.insert(key, now);
    }

    /// Add one event. Returns memory-pressure evictions that must be written
    /// immediately to keep buffered bytes under the cap; full batches are
    /// left pending and pulled via [`take_full_chunk`](Self::take_full_chunk)
    /// when the uncommitted window allows sending.
    pub fn accumulate(&mut self, event: ConsumedEvent, now: Instant) -> Vec<ReadyBatch> {
        let mut ready = Vec::new();
        let size = event.size_bytes();
        let key = event.position.key.clone();

        // Memory bound: evict the largest pending batches until the new
        // event fits. The invariant is checked before insertion so buffered
        // bytes never exceed the cap.
        while self.total_bytes + size > self.memory_limit_bytes && !self.batches.is_empty() {
            if let Some(batch) = self.take_largest() {
                ready.push(batch);
            }
        }

        let batch = self.batches.entry(key.clone()).or_insert_with(|| PendingBatch {
            events: Vec::new(),
            bytes: 0,
            opened_at: now,
        });
        batch.events.push(event);
        batch.bytes += size;
        self.total_bytes += size;

        if self.total_bytes > self.memory_limit_bytes {
            // A single event bigger than the cap cannot wait for company.
            if let Some(oversized) = self.take_batch(&key, FlushReason::MemoryPressure) {
                ready.push(oversized);
            }
        }
        ready
    }

    /// Split one batch-limit-sized chunk off a partition whose pending batch
    /// is full. Callers pull chunks only while the uncommitted window has
    /// room, which is how commit backpressure defers sending.
    pub fn take_full_chunk(&mut self) -> Option<ReadyBatch> {
        let key = self
            .batches
            .iter()
            .find(|(_, batch)| batch.events.len() >= self.batch_limit_events)
            .map(|(key, _)| key.clone())?;
        let batch = self.batches.get_mut(&key)?;

        let chunk: Vec<ConsumedEvent> = batch.events.drain(..self.batch_limit_events).collect();
        let bytes: usize = chunk.iter().map(|e| e.size_bytes()).sum();
        batch.bytes -= bytes;
        batch.opened_at = Instant::now();
        self.total_bytes -= bytes;
        if batch.events.is_empty() {
            self.batches.remove(&key);
        }

        let cursor = chunk.last()?.position.clone();
        Some(ReadyBatch {
            key,
            cursor,
            events: chunk,
            reason: FlushReason::BatchFull,
        })
    }

    /// Age-based flushes: batches older than the flush timeout.
    pub fn tick(&mut self, now: Instant) -> Vec<ReadyBatch> {
        let aged: Vec<PartitionKey> = self
            .batches
            .iter()
            .filter(|(_, batch)| now.duration_since(batch.opened_at) >= self.batch_flush_timeout)
            .map(|(key, _)| key.clone())
            .collect();
        aged.into_iter()
            .filter_map(|key| self.take_batch(&key, FlushReason::Aged))
            .collect()
    }

    /// Partitions that need a keep-alive: registered, idle past the
    /// keep-alive limit, and with nothing pending (a pending batch will be
    /// flushed by age instead).
    pub fn keep_alive_due(&self, now: Instant) -> Vec<PartitionKey> {
        self.last_activity
            .iter()
            .filter(|(key, last)| {
                now.duration_since(**last) >= self.keep_alive_limit
                    && !self.batches.contains_key(*key)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Record that a flush (data or keep-alive) went out for a partition.
    pub fn note_flushed(&mut self, key: &PartitionKey, now: Instant) {
        if let Some(last) = self.last_activity.get_mut(key) {
            *last = now;
        }
    }

    /// Pull out whatever is pending for a released partition.
    pub fn release_partition(&mut self, key: &PartitionKey) -> Option<ReadyBatch> {
        self.last_activity.remove(key);
        let batch = self.batches.remove(key)?;
        self.total_bytes -= batch.bytes;
        batch.into_ready(key.clone(), FlushReason::PartitionReleased)
    }

    /// Flush everything; used right before leaving the streaming state.
    pub fn drain(&mut self) -> Vec<ReadyBatch> {
        let keys: Vec<PartitionKey> = self.batches.keys().cloned().collect();
        keys.into_iter()
            .filter_map(|key| self.take_batch(&key, FlushReason::Drained))
            .collect()
    }

    fn take_batch(&mut self, key: &PartitionKey, reason: FlushReason) -> Option<ReadyBatch> {
        let batch = self.batches.remove(key)?;
        self.total_bytes -= batch.bytes;
        batch.into_ready(key.clone(), reason)
    }

    fn take_largest(&mut self) -> Option<ReadyBatch> {
        let key = self
            .batches
            .iter()
            .max_by_key(|(_, batch)| batch.bytes)
            .map(|(key, _)| key.clone())?;
        self.take_batch(&key, FlushReason::MemoryPressure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn key(p: &str) -> PartitionKey {
        PartitionKey::new("orders", p)
    }

    fn event(partition: &str, offset: u64, size: usize) -> ConsumedEvent {
        ConsumedEvent::new(
            Cursor::new(key(partition), 1, offset),
            Bytes::from(vec![b'x'; size]),
        )
    }

    fn pipeline(batch_limit: usize, memory_limit: usize) -> StreamPipeline {
        StreamPipeline::new(
            batch_limit,
            Duration::from_secs(30),
            memory_limit,
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_full_chunk_extraction() {
        let mut p = pipeline(3, 1024);
        let now = Instant::now();

        assert!(p.accumulate(event("0", 1, 10), now).is_empty());
        assert!(p.accumulate(event("0", 2, 10), now).is_empty());
        assert!(p.accumulate(event("0", 3, 10), now).is_empty());

        let ready = p.take_full_chunk().expect("batch is full");
        assert_eq!(ready.reason, FlushReason::BatchFull);
        assert_eq!(ready.cursor.offset, 3);
        assert_eq!(ready.events.len(), 3);
        assert_eq!(p.buffered_bytes(), 0);
        assert!(p.take_full_chunk().is_none());
    }

    #[test]
    fn test_full_chunk_leaves_remainder() {
        let mut p = pipeline(2, 1024);
        let now = Instant::now();
        for offset in 1..=5 {
            p.accumulate(event("0", offset, 10), now);
        }

        let first = p.take_full_chunk().unwrap();
        assert_eq!(first.cursor.offset, 2);
        let second = p.take_full_chunk().unwrap();
        assert_eq!(second.cursor.offset, 4);
        // One event remains, below the batch limit.
        assert!(p.take_full_chunk().is_none());
        assert_eq!(p.buffered_bytes(), 10);
    }

    #[test]
    fn test_aged_flush() {
        let mut p = StreamPipeline::new(
            100,
            Duration::from_millis(50),
            1024,
            Duration::from_secs(30),
        );
        let opened = Instant::now();
        p.accumulate(event("0", 1, 10), opened);

        assert!(p.tick(opened + Duration::from_millis(10)).is_empty());
        let ready = p.tick(opened + Duration::from_millis(60));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].reason, FlushReason::Aged);
    }

    #[test]
    fn test_memory_pressure_evicts_largest_first() {
        let mut p = pipeline(100, 100);
        let now = Instant::now();

        p.accumulate(event("0", 1, 30), now);
        p.accumulate(event("1", 1, 60), now);
        assert_eq!(p.buffered_bytes(), 90);

        // 90 + 20 > 100: the 60-byte batch on partition 1 must go first.
        let ready = p.accumulate(event("0", 2, 20), now);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].reason, FlushReason::MemoryPressure);
        assert_eq!(ready[0].key, key("1"));
        assert!(p.buffered_bytes() <= 100);
    }

    #[test]
    fn test_memory_bound_holds_under_random_sizes() {
        let limit = 500;
        let mut p = pipeline(1000, limit);
        let now = Instant::now();

        // Cheap deterministic pseudo-random sizes.
        let mut seed: u64 = 0x9e37_79b9;
        for offset in 1..400u64 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let size = (seed >> 33) as usize % 120 + 1;
            let partition = format!("{}", seed % 7);
            p.accumulate(event(&partition, offset, size), now);
            assert!(
                p.buffered_bytes() <= limit,
                "buffered {} exceeded limit {}",
                p.buffered_bytes(),
                limit
            );
        }
    }

    #[test]
    fn test_keep_alive_due_only_when_idle_and_empty() {
        let mut p = StreamPipeline::new(
            100,
            Duration::from_secs(30),
            1024,
            Duration::from_millis(50),
        );
        let start = Instant::now();
        p.register_partition(key("0"), start);
        p.register_partition(key("1"), start);

        // Partition 1 has a pending batch: no keep-alive for it.
        p.accumulate(event("1", 1, 10), start);

        let due = p.keep_alive_due(start + Duration::from_millis(60));
        assert_eq!(due, vec![key("0")]);

        // Flushing resets the idle clock.
        p.note_flushed(&key("0"), start + Duration::from_millis(60));
        assert!(p
            .keep_alive_due(start + Duration::from_millis(80))
            .is_empty());
    }

    #[test]
    fn test_release_partition_returns_pending() {
        let mut p = pipeline(100, 1024);
        let now = Instant::now();
        p.register_partition(key("0"), now);
        p.accumulate(event("0", 7, 10), now);

        let released = p.release_partition(&key("0")).unwrap();
        assert_eq!(released.reason, FlushReason::PartitionReleased);
        assert_eq!(released.cursor.offset, 7);
        assert_eq!(p.buffered_bytes(), 0);
        assert!(p.release_partition(&key("0")).is_none());
    }

    #[test]
    fn test_drain_flushes_everything() {
        let mut p = pipeline(100, 1024);
        let now = Instant::now();
        p.accumulate(event("0", 1, 10), now);
        p.accumulate(event("1", 2, 10), now);

        let drained = p.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|b| b.reason == FlushReason::Drained));
        assert_eq!(p.buffered_bytes(), 0);
    }
}
