//! Coordination-store adapter.
//!
//! The engine never knows which store backs a subscription: everything it
//! needs is expressed through [`CoordinationClient`]. The store holds, per
//! subscription, the live session set, the partition assignment table and the
//! committed cursors, and serialises writes under a subscription-level lock.

pub mod memory;

use crate::session::Session;
use async_trait::async_trait;
use std::any::Any;
use std::time::Duration;
use strom_core::{Cursor, CursorComparator, Partition, PartitionKey};
use thiserror::Error;

pub use memory::InMemoryCoordination;

pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

#[derive(Debug, Error, Clone)]
pub enum CoordinationError {
    /// Transient store failure; surfaced to `Closing` after the retry budget.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// The session's node is gone; the session is fenced out. Fatal.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Conflicting write, e.g. a commit against an uninitialized subscription.
    #[error("coordination conflict: {0}")]
    Conflict(String),
}

/// Callback invoked (on an arbitrary thread) whenever the session set of the
/// subscription changes. Implementations must only enqueue work.
pub type SessionListCallback = Box<dyn Fn() + Send + Sync>;

/// Scoped watcher registration; the subscription is cancelled on drop.
pub struct WatchHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel explicitly (drop does the same).
    pub fn close(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Guard of the subscription's distributed critical section; released on
/// drop.
pub struct CoordinationLockGuard {
    _guard: Box<dyn Any + Send>,
}

impl CoordinationLockGuard {
    pub fn new(guard: impl Any + Send) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

/// Client of the coordination store, scoped to one subscription.
///
/// Implementations are thread-safe by contract; any call may fail with
/// [`CoordinationError::Unavailable`].
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Idempotent by session id.
    async fn register_session(&self, session: &Session) -> CoordinationResult<()>;

    /// Idempotent; unregistering an unknown session is a no-op.
    async fn unregister_session(&self, session: &Session) -> CoordinationResult<()>;

    async fn is_active_session(&self, session_id: &str) -> CoordinationResult<bool>;

    /// Snapshot of the current partition assignment table.
    async fn list_partitions(&self) -> CoordinationResult<Vec<Partition>>;

    /// Watch the session set; the callback fires on any membership change.
    fn subscribe_for_session_list_changes(
        &self,
        callback: SessionListCallback,
    ) -> CoordinationResult<WatchHandle>;

    /// Request a server-side reassignment over the current session set. The
    /// resulting table changes are observed through `list_partitions`.
    async fn rebalance_sessions(&self) -> CoordinationResult<()>;

    /// Committed cursor of a partition (initial cursor if nothing committed).
    async fn get_offset(&self, key: &PartitionKey) -> CoordinationResult<Cursor>;

    /// Commit cursors; per cursor, succeeds iff strictly greater than the
    /// currently committed cursor. Equal and lesser cursors return `false`.
    /// `len(cursors) == len(result)` is guaranteed.
    async fn commit_offsets(
        &self,
        cursors: &[Cursor],
        comparator: &dyn CursorComparator,
    ) -> CoordinationResult<Vec<bool>>;

    /// Create committed cursors that do not exist yet; existing ones are left
    /// untouched. Callers run this under the subscription lock.
    async fn initialize_offsets(&self, cursors: &[Cursor]) -> CoordinationResult<()>;

    /// Atomically overwrite committed cursors. Sessions with events in flight
    /// get up to `inflight_drain_timeout` to drain before the reset lands.
    async fn reset_cursors(
        &self,
        cursors: &[Cursor],
        inflight_drain_timeout: Duration,
    ) -> CoordinationResult<()>;

    /// Enter the subscription's distributed critical section.
    async fn acquire_lock(&self) -> CoordinationResult<CoordinationLockGuard>;

    /// Release the client's resources. Idempotent.
    async fn close(&self) -> CoordinationResult<()>;
}
