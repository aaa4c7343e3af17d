//! Event storage client interface.
//!
//! The raw storage client (Kafka or otherwise) is an external collaborator;
//! the engine only needs positioned batch reads. An in-memory implementation
//! backs embedded deployments and the test suite.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strom_core::{ConsumedEvent, Cursor, CursorComparator, PartitionKey, TimelineCursorComparator};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("event storage unavailable: {0}")]
    Unavailable(String),

    #[error("invalid read position: {0}")]
    InvalidPosition(String),
}

/// Positioned reader over partitioned event storage.
#[async_trait]
pub trait EventStorage: Send + Sync {
    /// Read events strictly after `from`, bounded by count and bytes.
    ///
    /// Blocks up to `poll_timeout` waiting for data; an empty result is a
    /// no-op poll, not an error.
    async fn read_events(
        &self,
        from: &Cursor,
        max_events: usize,
        max_bytes: usize,
        poll_timeout: Duration,
    ) -> Result<Vec<ConsumedEvent>, StorageError>;

    /// Read the single event sitting exactly at `position`, if present.
    /// Used to materialize an event again for dead-lettering.
    async fn read_event_at(&self, position: &Cursor)
        -> Result<Option<ConsumedEvent>, StorageError>;
}

struct MemoryInner {
    events: parking_lot::Mutex<HashMap<PartitionKey, Vec<ConsumedEvent>>>,
    notify: Notify,
    unavailable: std::sync::atomic::AtomicBool,
}

/// In-memory [`EventStorage`] with long-poll semantics.
#[derive(Clone)]
pub struct InMemoryEventStorage {
    inner: Arc<MemoryInner>,
}

impl InMemoryEventStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                events: parking_lot::Mutex::new(HashMap::new()),
                notify: Notify::new(),
                unavailable: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Append an event to its partition and wake pending long polls.
    pub fn append(&self, event: ConsumedEvent) {
        {
            let mut events = self.inner.events.lock();
            events
                .entry(event.position.key.clone())
                .or_default()
                .push(event);
        }
        self.inner.notify.notify_waiters();
    }

    pub fn append_all(&self, events: impl IntoIterator<Item = ConsumedEvent>) {
        for event in events {
            self.append(event);
        }
    }

    /// Simulate a storage outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner
            .unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    fn collect_after(&self, from: &Cursor, max_events: usize, max_bytes: usize) -> Vec<ConsumedEvent> {
        let comparator = TimelineCursorComparator;
        let events = self.inner.events.lock();
        let Some(partition) = events.get(&from.key) else {
            return Vec::new();
        };
        let mut batch = Vec::new();
        let mut bytes = 0usize;
        for event in partition {
            if comparator.compare(&event.position, from) != Some(Ordering::Greater) {
                continue;
            }
            if batch.len() >= max_events {
                break;
            }
            if !batch.is_empty() && bytes + event.size_bytes() > max_bytes {
                break;
            }
            bytes += event.size_bytes();
            batch.push(event.clone());
        }
        batch
    }

    fn is_unavailable(&self) -> bool {
        self.inner
            .unavailable
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for InMemoryEventStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStorage for InMemoryEventStorage {
    async fn read_events(
        &self,
        from: &Cursor,
        max_events: usize,
        max_bytes: usize,
        poll_timeout: Duration,
    ) -> Result<Vec<ConsumedEvent>, StorageError> {
        let deadline = tokio::time::Instant::now() + poll_timeout;
        loop {
            if self.is_unavailable() {
                return Err(StorageError::Unavailable("storage marked unavailable".into()));
            }
            // Arm the notification before checking so an append between the
            // check and the await is not lost.
            let notified = self.inner.notify.notified();
            let batch = self.collect_after(from, max_events, max_bytes);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_event_at(
        &self,
        position: &Cursor,
    ) -> Result<Option<ConsumedEvent>, StorageError> {
        if self.is_unavailable() {
            return Err(StorageError::Unavailable("storage marked unavailable".into()));
        }
        let events = self.inner.events.lock();
        Ok(events
            .get(&position.key)
            .and_then(|partition| partition.iter().find(|e| &e.position == position))
            .cloned())
    }
}
