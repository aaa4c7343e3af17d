//! In-memory coordination backend.
//!
//! Backs a single subscription with plain data structures: good enough for
//! embedded single-process deployments and the test suite. Rebalancing is a
//! deterministic round-robin over the sorted session ids, so a given session
//! set always produces the same assignment.

use super::{
    CoordinationClient, CoordinationError, CoordinationLockGuard, CoordinationResult,
    SessionListCallback, WatchHandle,
};
use crate::session::Session;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use strom_core::{Cursor, CursorComparator, Partition, PartitionKey, PartitionState};
use tracing::debug;

struct Inner {
    topology: Vec<PartitionKey>,
    sessions: BTreeSet<String>,
    partitions: HashMap<PartitionKey, Partition>,
    offsets: HashMap<PartitionKey, Cursor>,
    watchers: HashMap<u64, Arc<SessionListCallback>>,
    next_watcher_id: u64,
}

/// In-memory [`CoordinationClient`] for one subscription.
#[derive(Clone)]
pub struct InMemoryCoordination {
    inner: Arc<Mutex<Inner>>,
    subscription_lock: Arc<tokio::sync::Mutex<()>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCoordination {
    /// Create a backend over a fixed partition topology.
    pub fn new(topology: Vec<PartitionKey>) -> Self {
        let partitions = topology
            .iter()
            .map(|key| (key.clone(), Partition::unassigned(key.clone())))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                topology,
                sessions: BTreeSet::new(),
                partitions,
                offsets: HashMap::new(),
                watchers: HashMap::new(),
                next_watcher_id: 0,
            })),
            subscription_lock: Arc::new(tokio::sync::Mutex::new(())),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate a coordination outage: every subsequent call fails with
    /// `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, AtomicOrdering::SeqCst);
    }

    /// Committed cursor of a partition, if any commit has landed.
    pub fn committed_offset(&self, key: &PartitionKey) -> Option<Cursor> {
        self.inner.lock().offsets.get(key).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn partitions_of(&self, session_id: &str) -> Vec<PartitionKey> {
        self.inner
            .lock()
            .partitions
            .values()
            .filter(|p| p.is_owned_by(session_id))
            .map(|p| p.key.clone())
            .collect()
    }

    fn check_available(&self) -> CoordinationResult<()> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(CoordinationError::Unavailable(
                "coordination backend marked unavailable".into(),
            ));
        }
        Ok(())
    }

    fn notify_watchers(watchers: Vec<Arc<SessionListCallback>>) {
        for watcher in watchers {
            (*watcher)();
        }
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordination {
    async fn register_session(&self, session: &Session) -> CoordinationResult<()> {
        self.check_available()?;
        let watchers = {
            let mut inner = self.inner.lock();
            if !inner.sessions.insert(session.id.clone()) {
                return Ok(());
            }
            debug!(session_id = %session.id, "registered session");
            inner.watchers.values().cloned().collect::<Vec<_>>()
        };
        Self::notify_watchers(watchers);
        Ok(())
    }

    async fn unregister_session(&self, session: &Session) -> CoordinationResult<()> {
        self.check_available()?;
        let watchers = {
            let mut inner = self.inner.lock();
            if !inner.sessions.remove(&session.id) {
                return Ok(());
            }
            debug!(session_id = %session.id, "unregistered session");
            for partition in inner.partitions.values_mut() {
                if partition.session.as_deref() == Some(session.id.as_str()) {
                    partition.session = None;
                    partition.state = PartitionState::Unassigned;
                }
            }
            inner.watchers.values().cloned().collect::<Vec<_>>()
        };
        Self::notify_watchers(watchers);
        Ok(())
    }

    async fn is_active_session(&self, session_id: &str) -> CoordinationResult<bool> {
        self.check_available()?;
        Ok(self.inner.lock().sessions.contains(session_id))
    }

    async fn list_partitions(&self) -> CoordinationResult<Vec<Partition>> {
        self.check_available()?;
        Ok(self.inner.lock().partitions.values().cloned().collect())
    }

    fn subscribe_for_session_list_changes(
        &self,
        callback: SessionListCallback,
    ) -> CoordinationResult<WatchHandle> {
        self.check_available()?;
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_watcher_id;
            inner.next_watcher_id += 1;
            inner.watchers.insert(id, Arc::new(callback));
            id
        };
        let inner = Arc::clone(&self.inner);
        Ok(WatchHandle::new(move || {
            inner.lock().watchers.remove(&id);
        }))
    }

    async fn rebalance_sessions(&self) -> CoordinationResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let sessions: Vec<String> = inner.sessions.iter().cloned().collect();
        let topology = inner.topology.clone();
        for (i, key) in topology.iter().enumerate() {
            let Some(partition) = inner.partitions.get_mut(key) else {
                continue;
            };
            if sessions.is_empty() {
                partition.session = None;
                partition.state = PartitionState::Unassigned;
            } else {
                let owner = sessions[i % sessions.len()].clone();
                partition.session = Some(owner);
                partition.state = PartitionState::Assigned;
            }
        }
        Ok(())
    }

    async fn get_offset(&self, key: &PartitionKey) -> CoordinationResult<Cursor> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .offsets
            .get(key)
            .cloned()
            .unwrap_or_else(|| Cursor::initial(key.clone())))
    }

    async fn commit_offsets(
        &self,
        cursors: &[Cursor],
        comparator: &dyn CursorComparator,
    ) -> CoordinationResult<Vec<bool>> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let mut results = Vec::with_capacity(cursors.len());
        for cursor in cursors {
            let current = inner
                .offsets
                .get(&cursor.key)
                .cloned()
                .unwrap_or_else(|| Cursor::initial(cursor.key.clone()));
            let accepted = comparator.compare(cursor, &current) == Some(Ordering::Greater);
            if accepted {
                inner.offsets.insert(cursor.key.clone(), cursor.clone());
            }
            results.push(accepted);
        }
        Ok(results)
    }

    async fn initialize_offsets(&self, cursors: &[Cursor]) -> CoordinationResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        for cursor in cursors {
            inner
                .offsets
                .entry(cursor.key.clone())
                .or_insert_with(|| cursor.clone());
        }
        Ok(())
    }

    async fn reset_cursors(
        &self,
        cursors: &[Cursor],
        _inflight_drain_timeout: Duration,
    ) -> CoordinationResult<()> {
        self.check_available()?;
        let _lock = self.subscription_lock.lock().await;
        let mut inner = self.inner.lock();
        for cursor in cursors {
            inner.offsets.insert(cursor.key.clone(), cursor.clone());
        }
        Ok(())
    }

    async fn acquire_lock(&self) -> CoordinationResult<CoordinationLockGuard> {
        self.check_available()?;
        let guard = Arc::clone(&self.subscription_lock).lock_owned().await;
        Ok(CoordinationLockGuard::new(guard))
    }

    async fn close(&self) -> CoordinationResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use strom_core::TimelineCursorComparator;

    fn key(p: &str) -> PartitionKey {
        PartitionKey::new("orders", p)
    }

    fn session(id: &str) -> Session {
        Session::with_id(id, "sub-1", "client-1")
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_notifies_once() {
        let coordination = InMemoryCoordination::new(vec![key("0")]);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let _watch = coordination
            .subscribe_for_session_list_changes(Box::new(move || {
                fired_clone.fetch_add(1, AtomicOrdering::SeqCst);
            }))
            .unwrap();

        let s = session("s1");
        coordination.register_session(&s).await.unwrap();
        coordination.register_session(&s).await.unwrap();

        assert_eq!(coordination.session_count(), 1);
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rebalance_round_robin_over_sorted_sessions() {
        let coordination = InMemoryCoordination::new(vec![key("0"), key("1"), key("2")]);
        coordination.register_session(&session("a")).await.unwrap();
        coordination.register_session(&session("b")).await.unwrap();
        coordination.rebalance_sessions().await.unwrap();

        assert_eq!(coordination.partitions_of("a").len(), 2);
        assert_eq!(coordination.partitions_of("b").len(), 1);

        coordination
            .unregister_session(&session("b"))
            .await
            .unwrap();
        coordination.rebalance_sessions().await.unwrap();
        assert_eq!(coordination.partitions_of("a").len(), 3);
    }

    #[tokio::test]
    async fn test_commit_strictly_greater_wins() {
        let coordination = InMemoryCoordination::new(vec![key("0")]);
        let comparator = TimelineCursorComparator;
        let cursor = |offset| Cursor::new(key("0"), 1, offset);

        coordination
            .initialize_offsets(&[cursor(10)])
            .await
            .unwrap();

        let results = coordination
            .commit_offsets(&[cursor(15)], &comparator)
            .await
            .unwrap();
        assert_eq!(results, vec![true]);

        // Equal and stale commits are rejected.
        let results = coordination
            .commit_offsets(&[cursor(15), cursor(12)], &comparator)
            .await
            .unwrap();
        assert_eq!(results, vec![false, false]);

        assert_eq!(
            coordination.committed_offset(&key("0")).unwrap().offset,
            15
        );
    }

    #[tokio::test]
    async fn test_initialize_does_not_overwrite() {
        let coordination = InMemoryCoordination::new(vec![key("0")]);
        let cursor = |offset| Cursor::new(key("0"), 1, offset);

        coordination.initialize_offsets(&[cursor(5)]).await.unwrap();
        coordination.initialize_offsets(&[cursor(9)]).await.unwrap();

        assert_eq!(coordination.get_offset(&key("0")).await.unwrap().offset, 5);
    }

    #[tokio::test]
    async fn test_unavailable_fails_all_calls() {
        let coordination = InMemoryCoordination::new(vec![key("0")]);
        coordination.set_unavailable(true);
        assert!(matches!(
            coordination.list_partitions().await,
            Err(CoordinationError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_handle_drop_unsubscribes() {
        let coordination = InMemoryCoordination::new(vec![key("0")]);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let watch = coordination
            .subscribe_for_session_list_changes(Box::new(move || {
                fired_clone.fetch_add(1, AtomicOrdering::SeqCst);
            }))
            .unwrap();
        drop(watch);

        coordination
            .register_session(&session("s1"))
            .await
            .unwrap();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }
}
