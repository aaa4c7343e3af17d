//! Tracking of sent-but-uncommitted cursors.
//!
//! Every flushed batch leaves a pending entry here until the client (or
//! autocommit) acknowledges it. The tracker also answers the two questions
//! that drive backpressure and the fatal commit timeout: how many events are
//! outstanding, and how old is the oldest unacknowledged batch.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use strom_core::{Cursor, CursorComparator, PartitionKey};

#[derive(Debug)]
struct PendingCommit {
    cursor: Cursor,
    events: usize,
    sent_at: Instant,
}

/// Per-partition deques of pending commits, in flush order.
#[derive(Debug)]
pub struct CommitTracker {
    commit_timeout: Duration,
    pending: HashMap<PartitionKey, VecDeque<PendingCommit>>,
    uncommitted_events: usize,
}

impl CommitTracker {
    pub fn new(commit_timeout: Duration) -> Self {
        Self {
            commit_timeout,
            pending: HashMap::new(),
            uncommitted_events: 0,
        }
    }

    /// Events flushed to the client and not yet acknowledged.
    pub fn uncommitted_events(&self) -> usize {
        self.uncommitted_events
    }

    pub fn has_pending(&self) -> bool {
        self.pending.values().any(|queue| !queue.is_empty())
    }

    /// Record a flushed batch as awaiting commit. Keep-alive batches carry
    /// no events and are not recorded.
    pub fn record_flush(&mut self, cursor: Cursor, events: usize, sent_at: Instant) {
        if events == 0 {
            return;
        }
        self.uncommitted_events += events;
        self.pending
            .entry(cursor.key.clone())
            .or_default()
            .push_back(PendingCommit {
                cursor,
                events,
                sent_at,
            });
    }

    /// Acknowledge a committed cursor: clears all pending entries on its
    /// partition up to and including the cursor. Returns the number of
    /// events released.
    pub fn acknowledge(&mut self, cursor: &Cursor, comparator: &dyn CursorComparator) -> usize {
        let Some(queue) = self.pending.get_mut(&cursor.key) else {
            return 0;
        };
        let mut released = 0;
        while let Some(front) = queue.front() {
            match comparator.compare(&front.cursor, cursor) {
                Some(Ordering::Less) | Some(Ordering::Equal) => {
                    released += front.events;
                    queue.pop_front();
                }
                _ => break,
            }
        }
        if queue.is_empty() {
            self.pending.remove(&cursor.key);
        }
        self.uncommitted_events -= released;
        released
    }

    /// The first partition whose oldest pending batch exceeded the commit
    /// timeout, with the elapsed age.
    pub fn overdue(&self, now: Instant) -> Option<(PartitionKey, Duration)> {
        self.pending
            .iter()
            .filter_map(|(key, queue)| {
                let oldest = queue.front()?;
                let age = now.duration_since(oldest.sent_at);
                (age >= self.commit_timeout).then(|| (key.clone(), age))
            })
            .max_by_key(|(_, age)| *age)
    }

    /// Newest cursor per partition among batches older than the autocommit
    /// timeout. Committing that cursor acknowledges all older batches too.
    pub fn autocommit_due(&self, now: Instant, autocommit_timeout: Duration) -> Vec<Cursor> {
        self.pending
            .values()
            .filter_map(|queue| {
                queue
                    .iter()
                    .filter(|entry| now.duration_since(entry.sent_at) >= autocommit_timeout)
                    .next_back()
                    .map(|entry| entry.cursor.clone())
            })
            .collect()
    }

    /// Forget a partition entirely (it was released by a rebalance).
    /// Returns the number of events whose acknowledgement will never come.
    pub fn drop_partition(&mut self, key: &PartitionKey) -> usize {
        let Some(queue) = self.pending.remove(key) else {
            return 0;
        };
        let released: usize = queue.iter().map(|entry| entry.events).sum();
        self.uncommitted_events -= released;
        released
    }
}
