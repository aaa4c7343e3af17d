use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do with an event a consumer keeps reporting as unprocessable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnprocessableEventPolicy {
    SkipEvent,
    DeadLetterQueue,
    Abort,
}

/// Subscription annotations that tune delivery behaviour.
///
/// `max_event_send_count = None` means unlimited redelivery; the
/// unprocessable-event policy is only applied once an event has been sent
/// that many times.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionAnnotations {
    pub max_event_send_count: Option<u32>,
    pub unprocessable_event_policy: Option<UnprocessableEventPolicy>,
    pub dead_letter_queue_event_type: Option<String>,
}

/// A durable commitment of a consumer group to a set of event types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub owning_application: String,
    pub consumer_group: String,
    pub event_types: Vec<String>,
    #[serde(default)]
    pub annotations: SubscriptionAnnotations,
    /// When set, batches left unacknowledged for this long are committed by
    /// the engine on the consumer's behalf.
    #[serde(default)]
    pub autocommit_timeout: Option<Duration>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, event_types: Vec<String>) -> Self {
        Self {
            id: id.into(),
            owning_application: "unknown".to_string(),
            consumer_group: "default".to_string(),
            event_types,
            annotations: SubscriptionAnnotations::default(),
            autocommit_timeout: None,
        }
    }

    pub fn with_annotations(mut self, annotations: SubscriptionAnnotations) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn with_autocommit(mut self, timeout: Duration) -> Self {
        self.autocommit_timeout = Some(timeout);
        self
    }

    pub fn contains_event_type(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|et| et == event_type)
    }
}

/// Immutable per-session streaming parameters, fixed at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamParameters {
    /// Maximum events per batch; reaching it flushes the batch.
    pub batch_limit_events: usize,
    /// Maximum age of a non-empty batch before it is flushed.
    pub batch_flush_timeout: Duration,
    /// Hard ceiling on session duration.
    pub stream_timeout: Duration,
    /// Total events to stream before closing gracefully. `None` = unbounded.
    pub stream_limit_events: Option<u64>,
    /// Idle time per partition after which an empty keep-alive batch carrying
    /// the current sent cursor is emitted.
    pub stream_keep_alive_limit: Duration,
    /// Consecutive keep-alive batches with no events in between after which
    /// the stream closes gracefully. `None` = keep the stream open forever.
    pub stream_keep_alive_count_limit: Option<u32>,
    /// A flushed batch left unacknowledged for this long kills the session.
    pub commit_timeout: Duration,
    /// Ceiling on sent-but-uncommitted events across all partitions; at the
    /// ceiling polling pauses until a commit frees room.
    pub max_uncommitted_events: usize,
    /// Ceiling on bytes buffered across all pending batches.
    pub stream_memory_limit_bytes: usize,
}

impl Default for StreamParameters {
    fn default() -> Self {
        Self {
            batch_limit_events: 50,
            batch_flush_timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(0),
            stream_limit_events: None,
            stream_keep_alive_limit: Duration::from_secs(30),
            stream_keep_alive_count_limit: None,
            commit_timeout: Duration::from_secs(60),
            max_uncommitted_events: 10,
            stream_memory_limit_bytes: 50 * 1024 * 1024,
        }
    }
}

impl StreamParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_limit(mut self, events: usize) -> Self {
        self.batch_limit_events = events;
        self
    }

    pub fn with_batch_flush_timeout(mut self, timeout: Duration) -> Self {
        self.batch_flush_timeout = timeout;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_stream_limit(mut self, events: u64) -> Self {
        self.stream_limit_events = Some(events);
        self
    }

    pub fn with_keep_alive_limit(mut self, limit: Duration) -> Self {
        self.stream_keep_alive_limit = limit;
        self
    }

    pub fn with_keep_alive_count_limit(mut self, count: u32) -> Self {
        self.stream_keep_alive_count_limit = Some(count);
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    pub fn with_max_uncommitted_events(mut self, max: usize) -> Self {
        self.max_uncommitted_events = max;
        self
    }

    pub fn with_memory_limit_bytes(mut self, bytes: usize) -> Self {
        self.stream_memory_limit_bytes = bytes;
        self
    }

    /// True when the session has an overall duration ceiling.
    pub fn has_stream_timeout(&self) -> bool {
        !self.stream_timeout.is_zero()
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_limit_events == 0 {
            return Err(Error::InvalidConfig(
                "batch_limit_events must be at least 1".into(),
            ));
        }
        if self.max_uncommitted_events == 0 {
            return Err(Error::InvalidConfig(
                "max_uncommitted_events must be at least 1".into(),
            ));
        }
        if self.stream_memory_limit_bytes == 0 {
            return Err(Error::InvalidConfig(
                "stream_memory_limit_bytes must be at least 1".into(),
            ));
        }
        if self.commit_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "commit_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters_valid() {
        assert!(StreamParameters::default().validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let params = StreamParameters::new()
            .with_batch_limit(10)
            .with_commit_timeout(Duration::from_secs(5))
            .with_max_uncommitted_events(100)
            .with_stream_limit(1000);

        assert_eq!(params.batch_limit_events, 10);
        assert_eq!(params.commit_timeout, Duration::from_secs(5));
        assert_eq!(params.max_uncommitted_events, 100);
        assert_eq!(params.stream_limit_events, Some(1000));
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_limit_rejected() {
        let params = StreamParameters::new().with_batch_limit(0);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_subscription_event_types() {
        let sub = Subscription::new("sub-1", vec!["orders".into(), "payments".into()]);
        assert!(sub.contains_event_type("orders"));
        assert!(!sub.contains_event_type("shipments"));
    }

    #[test]
    fn test_annotations_serde_round_trip() {
        let annotations = SubscriptionAnnotations {
            max_event_send_count: Some(3),
            unprocessable_event_policy: Some(UnprocessableEventPolicy::DeadLetterQueue),
            dead_letter_queue_event_type: Some("orders.dlq".into()),
        };
        let json = serde_json::to_string(&annotations).unwrap();
        assert!(json.contains("DEAD_LETTER_QUEUE"));
        let back: SubscriptionAnnotations = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_event_send_count, Some(3));
    }
}
