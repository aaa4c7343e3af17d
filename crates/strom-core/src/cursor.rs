use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifies one partition of one event type.
///
/// Partition ids are strings: storage backends are free to use numeric ids,
/// hashed ranges or named shards, and the engine never arithmetics on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub event_type: String,
    pub partition: String,
}

impl PartitionKey {
    pub fn new(event_type: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            partition: partition.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.event_type, self.partition)
    }
}

/// Position within a partition, the unit of commit.
///
/// The offset of a cursor is the offset of the last consumed event; reading
/// resumes strictly after it. `timeline` orders storage generations: a cursor
/// on a later timeline is greater than any cursor on an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(flatten)]
    pub key: PartitionKey,
    pub timeline: u32,
    pub offset: u64,
}

impl Cursor {
    pub fn new(key: PartitionKey, timeline: u32, offset: u64) -> Self {
        Self {
            key,
            timeline,
            offset,
        }
    }

    /// Cursor denoting "nothing consumed yet" for a partition.
    pub fn initial(key: PartitionKey) -> Self {
        Self {
            key,
            timeline: 0,
            offset: 0,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.timeline == 0 && self.offset == 0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}-{}", self.key, self.timeline, self.offset)
    }
}

/// Partition-aware cursor ordering.
///
/// Two cursors on the same partition are totally ordered; comparing cursors
/// of different partitions is a caller bug and yields `None`.
pub trait CursorComparator: Send + Sync {
    fn compare(&self, a: &Cursor, b: &Cursor) -> Option<Ordering>;
}

/// Default comparator: timeline first, then offset within a timeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimelineCursorComparator;

impl CursorComparator for TimelineCursorComparator {
    fn compare(&self, a: &Cursor, b: &Cursor) -> Option<Ordering> {
        if a.key != b.key {
            return None;
        }
        Some(
            a.timeline
                .cmp(&b.timeline)
                .then(a.offset.cmp(&b.offset)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(offset: u64) -> Cursor {
        Cursor::new(PartitionKey::new("orders", "0"), 1, offset)
    }

    #[test]
    fn test_same_partition_ordering() {
        let cmp = TimelineCursorComparator;
        assert_eq!(cmp.compare(&cursor(5), &cursor(10)), Some(Ordering::Less));
        assert_eq!(cmp.compare(&cursor(10), &cursor(10)), Some(Ordering::Equal));
        assert_eq!(
            cmp.compare(&cursor(11), &cursor(10)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_timeline_dominates_offset() {
        let cmp = TimelineCursorComparator;
        let early = Cursor::new(PartitionKey::new("orders", "0"), 1, 999);
        let late = Cursor::new(PartitionKey::new("orders", "0"), 2, 1);
        assert_eq!(cmp.compare(&early, &late), Some(Ordering::Less));
    }

    #[test]
    fn test_cross_partition_incomparable() {
        let cmp = TimelineCursorComparator;
        let a = Cursor::new(PartitionKey::new("orders", "0"), 1, 5);
        let b = Cursor::new(PartitionKey::new("orders", "1"), 1, 5);
        assert_eq!(cmp.compare(&a, &b), None);
    }

    #[test]
    fn test_initial_cursor() {
        let c = Cursor::initial(PartitionKey::new("orders", "0"));
        assert!(c.is_initial());
        assert_eq!(
            TimelineCursorComparator.compare(&c, &cursor(1)),
            Some(Ordering::Less)
        );
    }
}
