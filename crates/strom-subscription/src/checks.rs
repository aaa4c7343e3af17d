//! Authorization and consumption checks.
//!
//! The policy engine behind these traits is an external collaborator; the
//! streaming engine only asks yes/no questions and subscribes to change
//! notifications so it can re-ask them.

use crate::coordination::WatchHandle;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use strom_core::{ConsumedEvent, Error, EventCategory, Subscription};

/// Callback fired when authorization rules for a watched event type change.
pub type AuthChangeCallback = Box<dyn Fn() + Send + Sync>;

/// Feature toggles threaded through the session context (never global).
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureToggles {
    /// When on, events whose embedded event-type name contradicts their
    /// partition's event type are dropped instead of delivered.
    pub skip_misplaced_events: bool,
}

/// Authorization and blocking checks applied to a stream.
#[async_trait]
pub trait EventStreamChecks: Send + Sync {
    /// Validate that the subscription may be read at all. Denial is fatal
    /// for the session.
    async fn authorize_subscription_read(
        &self,
        subscription: &Subscription,
    ) -> Result<(), Error>;

    /// Whole-stream kill switch for a (subscription, client) pair.
    fn is_consumption_blocked(&self, subscription: &Subscription, client_id: &str) -> bool;

    /// Per-event authorization; a blocked event is dropped, not fatal.
    fn is_event_blocked(&self, event: &ConsumedEvent) -> bool;

    /// Watch for authorization changes on the given event types.
    fn subscribe_for_authorization_changes(
        &self,
        event_types: &[String],
        callback: AuthChangeCallback,
    ) -> WatchHandle;
}

/// Checks implementation that allows everything. Default for embedded use
/// and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveChecks;

#[async_trait]
impl EventStreamChecks for PermissiveChecks {
    async fn authorize_subscription_read(
        &self,
        _subscription: &Subscription,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn is_consumption_blocked(&self, _subscription: &Subscription, _client_id: &str) -> bool {
        false
    }

    fn is_event_blocked(&self, _event: &ConsumedEvent) -> bool {
        false
    }

    fn subscribe_for_authorization_changes(
        &self,
        _event_types: &[String],
        _callback: AuthChangeCallback,
    ) -> WatchHandle {
        WatchHandle::new(|| {})
    }
}

/// Lookup of event-type categories, backed by the type registry cache.
pub trait EventTypeRegistry: Send + Sync {
    /// `None` means the event type is unknown here; the engine treats that
    /// like `Undefined` and skips payload-based checks.
    fn category(&self, event_type: &str) -> Option<EventCategory>;
}

/// Fixed category map, for embedded setups and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticEventTypeRegistry {
    categories: HashMap<String, EventCategory>,
}

impl StaticEventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, event_type: impl Into<String>, category: EventCategory) -> Self {
        self.categories.insert(event_type.into(), category);
        self
    }
}

impl EventTypeRegistry for StaticEventTypeRegistry {
    fn category(&self, event_type: &str) -> Option<EventCategory> {
        self.categories.get(event_type).copied()
    }
}

#[derive(Deserialize)]
struct PayloadMetadata {
    event_type: Option<String>,
}

#[derive(Deserialize)]
struct PayloadEnvelope {
    metadata: Option<PayloadMetadata>,
}

/// Extract the event-type name embedded in a payload's metadata block.
///
/// Returns `Ok(None)` when the payload has no metadata block; parse failures
/// are errors because categorized event types guarantee the block exists.
pub fn embedded_event_type_name(payload: &[u8]) -> Result<Option<String>, serde_json::Error> {
    let envelope: PayloadEnvelope = serde_json::from_slice(payload)?;
    Ok(envelope.metadata.and_then(|m| m.event_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_event_type_name() {
        let payload = br#"{"metadata":{"event_type":"orders","occurred_at":"x"},"amount":3}"#;
        assert_eq!(
            embedded_event_type_name(payload).unwrap(),
            Some("orders".to_string())
        );

        let no_metadata = br#"{"amount":3}"#;
        assert_eq!(embedded_event_type_name(no_metadata).unwrap(), None);

        assert!(embedded_event_type_name(b"not json").is_err());
    }

    #[test]
    fn test_static_registry() {
        let registry = StaticEventTypeRegistry::new()
            .with_category("orders", EventCategory::Business)
            .with_category("raw", EventCategory::Undefined);

        assert_eq!(registry.category("orders"), Some(EventCategory::Business));
        assert_eq!(registry.category("raw"), Some(EventCategory::Undefined));
        assert_eq!(registry.category("missing"), None);
    }
}
