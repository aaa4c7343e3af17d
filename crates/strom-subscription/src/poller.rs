//! Per-partition event polling.
//!
//! Each owned partition gets one spawned poll task that keeps an outstanding
//! read against storage and hands completed batches to the session loop. The
//! poller never decides whether events are emitted; it only produces raw
//! batches in storage order.

use crate::storage::{EventStorage, StorageError};
use crate::tasks::{SessionTask, TaskSender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strom_core::Cursor;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Transient storage failures tolerated before the poll is declared dead.
const MAX_POLL_RETRIES: u32 = 3;

/// Shared pause gate for backpressure.
///
/// When the uncommitted-events ceiling is reached the session pauses the
/// gate; pollers park on it and resume after the next successful commit.
#[derive(Debug)]
pub struct PollGate {
    paused: AtomicBool,
    notify: Notify,
}

impl PollGate {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn wait_ready(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.paused.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

impl Default for PollGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running partition poll task; aborts the task on drop.
#[derive(Debug)]
pub struct PartitionPoller {
    handle: JoinHandle<()>,
}

impl PartitionPoller {
    /// Spawn a poll loop reading strictly after `start`.
    pub fn spawn(
        storage: Arc<dyn EventStorage>,
        start: Cursor,
        max_events: usize,
        max_bytes: usize,
        poll_timeout: Duration,
        gate: Arc<PollGate>,
        tasks: TaskSender,
    ) -> Self {
        let handle = tokio::spawn(async move {
            poll_loop(storage, start, max_events, max_bytes, poll_timeout, gate, tasks).await;
        });
        Self { handle }
    }
}

impl Drop for PartitionPoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn poll_loop(
    storage: Arc<dyn EventStorage>,
    start: Cursor,
    max_events: usize,
    max_bytes: usize,
    poll_timeout: Duration,
    gate: Arc<PollGate>,
    tasks: TaskSender,
) {
    let key = start.key.clone();
    let mut position = start;
    let mut failures = 0u32;
    loop {
        gate.wait_ready().await;
        match storage
            .read_events(&position, max_events, max_bytes, poll_timeout)
            .await
        {
            Ok(events) if events.is_empty() => {
                failures = 0;
            }
            Ok(events) => {
                failures = 0;
                if let Some(last) = events.last() {
                    position = last.position.clone();
                }
                tasks.enqueue(SessionTask::EventsArrived {
                    key: key.clone(),
                    events,
                });
            }
            Err(error) => {
                failures += 1;
                if failures > MAX_POLL_RETRIES {
                    warn!(partition = %key, %error, "partition poll failed, giving up");
                    tasks.enqueue(SessionTask::PollFailed { key, error });
                    return;
                }
                debug!(
                    partition = %key,
                    %error,
                    attempt = failures,
                    "partition poll failed, retrying"
                );
                tokio::time::sleep(poll_timeout).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryEventStorage;
    use crate::tasks::TaskQueue;
    use bytes::Bytes;
    use strom_core::{ConsumedEvent, PartitionKey};

    fn event(offset: u64) -> ConsumedEvent {
        ConsumedEvent::new(
            Cursor::new(PartitionKey::new("orders", "0"), 1, offset),
            Bytes::from_static(b"{}"),
        )
    }

    #[tokio::test]
    async fn test_poller_delivers_batches_in_order() {
        let storage = InMemoryEventStorage::new();
        storage.append_all([event(11), event(12)]);

        let mut queue = TaskQueue::new();
        let _poller = PartitionPoller::spawn(
            Arc::new(storage.clone()),
            Cursor::new(PartitionKey::new("orders", "0"), 1, 10),
            10,
            1024,
            Duration::from_millis(20),
            Arc::new(PollGate::new()),
            queue.sender(),
        );

        let task = tokio::time::timeout(Duration::from_secs(2), queue.recv())
            .await
            .expect("no batch delivered");
        match task {
            Some(SessionTask::EventsArrived { events, .. }) => {
                let offsets: Vec<u64> = events.iter().map(|e| e.position.offset).collect();
                assert_eq!(offsets, vec![11, 12]);
            }
            other => panic!("unexpected task: {other:?}"),
        }

        // The poller advances its own position: appending later events must
        // not redeliver 11..12.
        storage.append(event(13));
        let task = tokio::time::timeout(Duration::from_secs(2), queue.recv())
            .await
            .expect("no second batch");
        match task {
            Some(SessionTask::EventsArrived { events, .. }) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].position.offset, 13);
            }
            other => panic!("unexpected task: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_paused_gate_blocks_polling() {
        let storage = InMemoryEventStorage::new();
        storage.append(event(11));

        let gate = Arc::new(PollGate::new());
        gate.pause();

        let mut queue = TaskQueue::new();
        let _poller = PartitionPoller::spawn(
            Arc::new(storage.clone()),
            Cursor::new(PartitionKey::new("orders", "0"), 1, 10),
            10,
            1024,
            Duration::from_millis(20),
            Arc::clone(&gate),
            queue.sender(),
        );

        // Nothing may arrive while paused.
        let blocked = tokio::time::timeout(Duration::from_millis(100), queue.recv()).await;
        assert!(blocked.is_err());

        gate.resume();
        let task = tokio::time::timeout(Duration::from_secs(2), queue.recv())
            .await
            .expect("resume did not unblock poller");
        assert!(matches!(task, Some(SessionTask::EventsArrived { .. })));
    }

    #[tokio::test]
    async fn test_storage_failure_reported_after_retries() {
        let storage = InMemoryEventStorage::new();
        storage.set_unavailable(true);

        let mut queue = TaskQueue::new();
        let _poller = PartitionPoller::spawn(
            Arc::new(storage),
            Cursor::initial(PartitionKey::new("orders", "0")),
            10,
            1024,
            Duration::from_millis(10),
            Arc::new(PollGate::new()),
            queue.sender(),
        );

        let task = tokio::time::timeout(Duration::from_secs(2), queue.recv())
            .await
            .expect("failure never reported");
        assert!(matches!(task, Some(SessionTask::PollFailed { .. })));
    }
}
