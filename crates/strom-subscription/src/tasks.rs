//! Single-consumer task queue driving a streaming session.
//!
//! Everything that happens to a session (watcher callbacks, timer fires,
//! poll completions, client commits) is expressed as a [`SessionTask`] and
//! enqueued here. The session loop is the only consumer, which makes the
//! ordering between concurrent inputs explicit and removes any need for
//! locking around session state.

use crate::state::State;
use crate::storage::StorageError;
use strom_core::{ConsumedEvent, Cursor, PartitionKey};
use tokio::sync::mpsc;

/// One unit of work for the session loop.
#[derive(Debug)]
pub enum SessionTask {
    /// Apply a state transition (enqueued by `switch_state`).
    Transition(State),
    /// The session set changed; re-derive the partition assignment.
    Rebalance,
    /// A partition poll completed with events.
    EventsArrived {
        key: PartitionKey,
        events: Vec<ConsumedEvent>,
    },
    /// A partition poll failed after exhausting its retry budget.
    PollFailed {
        key: PartitionKey,
        error: StorageError,
    },
    /// Periodic tick driving all age-based rules: batch flush timeout,
    /// keep-alives, autocommit, commit timeout, stream timeout.
    LivenessTick,
    /// The client acknowledged cursors that were durably committed.
    CommitAcknowledged { cursors: Vec<Cursor> },
    /// Authorization may have changed; re-validate access.
    RecheckAccess,
    /// A downstream consumer reported an event it cannot process.
    Unprocessable { cursor: Cursor, reason: String },
    /// Cooperative shutdown request.
    Terminate,
}

impl SessionTask {
    pub fn name(&self) -> &'static str {
        match self {
            SessionTask::Transition(_) => "transition",
            SessionTask::Rebalance => "rebalance",
            SessionTask::EventsArrived { .. } => "events_arrived",
            SessionTask::PollFailed { .. } => "poll_failed",
            SessionTask::LivenessTick => "liveness_tick",
            SessionTask::CommitAcknowledged { .. } => "commit_acknowledged",
            SessionTask::RecheckAccess => "recheck_access",
            SessionTask::Unprocessable { .. } => "unprocessable",
            SessionTask::Terminate => "terminate",
        }
    }
}

/// Producer half of the queue, cloneable into watchers, timers and pollers.
///
/// Sending never blocks; if the session is already gone the task is dropped,
/// which is exactly what stale work deserves.
#[derive(Debug, Clone)]
pub struct TaskSender {
    tx: mpsc::UnboundedSender<SessionTask>,
}

impl TaskSender {
    pub fn enqueue(&self, task: SessionTask) {
        let _ = self.tx.send(task);
    }
}

/// The queue itself, owned by the session loop.
#[derive(Debug)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<SessionTask>,
    rx: mpsc::UnboundedReceiver<SessionTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> TaskSender {
        TaskSender {
            tx: self.tx.clone(),
        }
    }

    pub async fn recv(&mut self) -> Option<SessionTask> {
        self.rx.recv().await
    }

    /// Discard everything currently queued. Used by fatal transitions so that
    /// work scheduled by a doomed state cannot run.
    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let mut queue = TaskQueue::new();
        let sender = queue.sender();

        sender.enqueue(SessionTask::Rebalance);
        sender.enqueue(SessionTask::LivenessTick);
        sender.enqueue(SessionTask::Terminate);

        assert!(matches!(queue.recv().await, Some(SessionTask::Rebalance)));
        assert!(matches!(queue.recv().await, Some(SessionTask::LivenessTick)));
        assert!(matches!(queue.recv().await, Some(SessionTask::Terminate)));
    }

    #[tokio::test]
    async fn test_clear_discards_pending() {
        let mut queue = TaskQueue::new();
        let sender = queue.sender();

        sender.enqueue(SessionTask::Rebalance);
        sender.enqueue(SessionTask::LivenessTick);
        assert_eq!(queue.clear(), 2);

        sender.enqueue(SessionTask::Terminate);
        assert!(matches!(queue.recv().await, Some(SessionTask::Terminate)));
    }

    #[test]
    fn test_enqueue_after_drop_is_silent() {
        let queue = TaskQueue::new();
        let sender = queue.sender();
        drop(queue);
        sender.enqueue(SessionTask::Terminate);
    }
}
