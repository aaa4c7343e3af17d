use crate::cursor::{Cursor, PartitionKey};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Category of an event type, as declared in the type registry.
///
/// `Undefined` event types carry free-form payloads without an embedded
/// metadata block, so payload-based checks are skipped for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Undefined,
    Business,
    Data,
}

/// Header tags a producer may attach to route or scope an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderTag {
    ConsumerSubscriptionId,
}

/// A single event pulled from storage, positioned in its partition.
#[derive(Debug, Clone)]
pub struct ConsumedEvent {
    /// Cursor of this event; committing it acknowledges everything up to and
    /// including this position.
    pub position: Cursor,
    /// Raw payload bytes as stored (JSON for non-undefined categories).
    pub payload: Bytes,
    pub consumer_tags: HashMap<HeaderTag, String>,
    pub produced_at: DateTime<Utc>,
}

impl ConsumedEvent {
    pub fn new(position: Cursor, payload: impl Into<Bytes>) -> Self {
        Self {
            position,
            payload: payload.into(),
            consumer_tags: HashMap::new(),
            produced_at: Utc::now(),
        }
    }

    pub fn with_consumer_tag(mut self, tag: HeaderTag, value: impl Into<String>) -> Self {
        self.consumer_tags.insert(tag, value.into());
        self
    }

    pub fn key(&self) -> &PartitionKey {
        &self.position.key
    }

    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let key = PartitionKey::new("orders", "0");
        let event = ConsumedEvent::new(Cursor::new(key.clone(), 1, 12), &b"{\"a\":1}"[..])
            .with_consumer_tag(HeaderTag::ConsumerSubscriptionId, "sub-1");

        assert_eq!(event.key(), &key);
        assert_eq!(event.size_bytes(), 7);
        assert_eq!(
            event.consumer_tags.get(&HeaderTag::ConsumerSubscriptionId),
            Some(&"sub-1".to_string())
        );
    }
}
