use crate::cursor::PartitionKey;
use serde::{Deserialize, Serialize};

/// Assignment state of a partition within a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionState {
    Unassigned,
    Assigned,
    Reassigning,
}

/// One row of the coordination store's partition table: which session owns
/// the partition and in which assignment state it currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub key: PartitionKey,
    pub session: Option<String>,
    pub state: PartitionState,
}

impl Partition {
    pub fn unassigned(key: PartitionKey) -> Self {
        Self {
            key,
            session: None,
            state: PartitionState::Unassigned,
        }
    }

    pub fn assigned_to(key: PartitionKey, session: impl Into<String>) -> Self {
        Self {
            key,
            session: Some(session.into()),
            state: PartitionState::Assigned,
        }
    }

    /// True when `session_id` is the stable owner of this partition.
    ///
    /// A `Reassigning` partition is owned by nobody for streaming purposes:
    /// the old owner must stop polling and the new owner picks it up only
    /// once the move settles.
    pub fn is_owned_by(&self, session_id: &str) -> bool {
        self.state == PartitionState::Assigned && self.session.as_deref() == Some(session_id)
    }
}
