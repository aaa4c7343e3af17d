//! In-memory view of the partitions this session owns.
//!
//! The coordination store is the source of truth; on every rebalance task the
//! streaming state fetches a snapshot and diffs it against this view. Added
//! partitions get a runtime record and a poller; removed ones are flushed and
//! forgotten.

use crate::poller::PartitionPoller;
use std::collections::{HashMap, HashSet};
use strom_core::{Cursor, Partition, PartitionKey};

/// Live per-partition state owned by the streaming loop.
#[derive(Debug)]
pub struct PartitionRuntime {
    /// Cursor of the last event handed to the pipeline (or dropped).
    pub sent: Cursor,
    /// Cursor last known committed for this partition.
    pub committed: Cursor,
    /// Poll task feeding this partition; aborted when the runtime is dropped.
    pub poller: PartitionPoller,
}

#[derive(Debug, Default)]
pub struct AssignmentView {
    partitions: HashMap<PartitionKey, PartitionRuntime>,
}

impl AssignmentView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: PartitionKey, runtime: PartitionRuntime) {
        self.partitions.insert(key, runtime);
    }

    pub fn remove(&mut self, key: &PartitionKey) -> Option<PartitionRuntime> {
        self.partitions.remove(key)
    }

    pub fn get(&self, key: &PartitionKey) -> Option<&PartitionRuntime> {
        self.partitions.get(key)
    }

    pub fn get_mut(&mut self, key: &PartitionKey) -> Option<&mut PartitionRuntime> {
        self.partitions.get_mut(key)
    }

    pub fn contains(&self, key: &PartitionKey) -> bool {
        self.partitions.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &PartitionKey> {
        self.partitions.keys()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn clear(&mut self) {
        self.partitions.clear();
    }
}

/// Difference between the owned view and a coordination-store snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AssignmentDiff {
    pub added: Vec<PartitionKey>,
    pub removed: Vec<PartitionKey>,
}

impl AssignmentDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compute which partitions to pick up and which to let go.
///
/// A `Reassigning` partition counts as owned by nobody: the old owner
/// releases it now and the new owner acquires it on a later snapshot, once
/// the move has settled.
pub fn diff_assignment<'a>(
    current: impl Iterator<Item = &'a PartitionKey>,
    listed: &[Partition],
    session_id: &str,
) -> AssignmentDiff {
    let current: HashSet<&PartitionKey> = current.collect();
    let owned: HashSet<&PartitionKey> = listed
        .iter()
        .filter(|p| p.is_owned_by(session_id))
        .map(|p| &p.key)
        .collect();

    let mut added: Vec<PartitionKey> = owned
        .iter()
        .filter(|key| !current.contains(**key))
        .map(|key| (*key).clone())
        .collect();
    let mut removed: Vec<PartitionKey> = current
        .iter()
        .filter(|key| !owned.contains(**key))
        .map(|key| (*key).clone())
        .collect();
    added.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    removed.sort_by(|a, b| a.to_string().cmp(&b.to_string()));

    AssignmentDiff { added, removed }
}
