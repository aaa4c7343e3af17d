//! Unprocessable-event policy and dead-letter publishing.
//!
//! A downstream consumer that cannot process an event reports it through the
//! session handle. Each report counts as one failed delivery; once the count
//! reaches the subscription's `max_event_send_count` annotation, the
//! configured policy is applied. Without the annotation the policy is never
//! applied and the event keeps being redelivered.

use crate::error::StreamError;
use crate::storage::EventStorage;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use strom_core::metrics::StreamMetrics;
use strom_core::{Cursor, SubscriptionAnnotations, UnprocessableEventPolicy};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish failed: {0}")]
    Failed(String),
}

/// Publisher seam for re-emitting events to the dead-letter event type.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event_type: &str, payload: Bytes) -> Result<(), PublishError>;
}

/// What the policy decided for one report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlqOutcome {
    /// Below the threshold (or no threshold configured): the event stays in
    /// the stream and will be redelivered.
    RetryAllowed { attempts: u32 },
    /// Dropped by `SKIP_EVENT`; the cursor must be advanced past it.
    Skipped,
    /// Republished to the DLQ event type; the cursor must be advanced.
    Published,
}

/// Applies the subscription's unprocessable-event policy.
pub struct DlqHandler {
    policy: Option<UnprocessableEventPolicy>,
    max_send_count: Option<u32>,
    dlq_event_type: Option<String>,
    publisher: Option<Arc<dyn EventPublisher>>,
    attempts: HashMap<Cursor, u32>,
}

impl DlqHandler {
    pub fn new(
        annotations: &SubscriptionAnnotations,
        publisher: Option<Arc<dyn EventPublisher>>,
    ) -> Self {
        Self {
            policy: annotations.unprocessable_event_policy,
            max_send_count: annotations.max_event_send_count,
            dlq_event_type: annotations.dead_letter_queue_event_type.clone(),
            publisher,
            attempts: HashMap::new(),
        }
    }

    /// Handle one unprocessable-event report. `Err` means the session must
    /// die (`ABORT` policy or a broken DLQ pipeline).
    pub async fn on_unprocessable(
        &mut self,
        cursor: &Cursor,
        reason: &str,
        storage: &dyn EventStorage,
    ) -> Result<DlqOutcome, StreamError> {
        let attempts = {
            let entry = self.attempts.entry(cursor.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let (Some(policy), Some(max)) = (self.policy, self.max_send_count) else {
            return Ok(DlqOutcome::RetryAllowed { attempts });
        };
        if attempts < max {
            return Ok(DlqOutcome::RetryAllowed { attempts });
        }

        self.attempts.remove(cursor);
        match policy {
            UnprocessableEventPolicy::SkipEvent => {
                info!(%cursor, attempts, reason, "skipping unprocessable event");
                StreamMetrics::increment_events_dropped("unprocessable");
                Ok(DlqOutcome::Skipped)
            }
            UnprocessableEventPolicy::DeadLetterQueue => {
                self.publish_to_dlq(cursor, attempts, reason, storage).await?;
                StreamMetrics::increment_dlq_published();
                Ok(DlqOutcome::Published)
            }
            UnprocessableEventPolicy::Abort => {
                warn!(%cursor, attempts, reason, "aborting session on unprocessable event");
                Err(StreamError::Unprocessable(cursor.clone()))
            }
        }
    }

    async fn publish_to_dlq(
        &self,
        cursor: &Cursor,
        attempts: u32,
        reason: &str,
        storage: &dyn EventStorage,
    ) -> Result<(), StreamError> {
        let dlq_event_type = self.dlq_event_type.as_deref().ok_or_else(|| {
            StreamError::Internal("dead-letter policy configured without a DLQ event type".into())
        })?;
        let publisher = self.publisher.as_ref().ok_or_else(|| {
            StreamError::Internal("dead-letter policy configured without a publisher".into())
        })?;

        let original = storage
            .read_event_at(cursor)
            .await?
            .ok_or_else(|| {
                StreamError::Internal(format!("event at {cursor} no longer present in storage"))
            })?;

        // Embed the original payload as JSON when it parses, lossy text
        // otherwise, so the DLQ envelope itself is always valid JSON.
        let event_value = serde_json::from_slice::<serde_json::Value>(&original.payload)
            .unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&original.payload).into_owned())
            });
        let envelope = json!({
            "original_cursor": {
                "event_type": cursor.key.event_type,
                "partition": cursor.key.partition,
                "offset": cursor.offset,
            },
            "attempt_count": attempts,
            "reason": reason,
            "event": event_value,
        });
        let payload = Bytes::from(serde_json::to_vec(&envelope)?);

        info!(%cursor, dlq_event_type, attempts, "publishing unprocessable event to DLQ");
        publisher
            .publish(dlq_event_type, payload)
            .await
            .map_err(|err| StreamError::Internal(format!("DLQ publish failed: {err}")))
    }
}
