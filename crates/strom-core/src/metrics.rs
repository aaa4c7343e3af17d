//! Metrics facade for the streaming engine.
//!
//! Uses the `metrics` crate so instrumentation is backend-agnostic; embedding
//! services install whatever exporter they run. Naming scheme:
//! `strom_subscription_{name}_{unit}`.

pub use metrics::{counter, gauge, histogram};

/// Subscription streaming metrics.
pub struct StreamMetrics;

impl StreamMetrics {
    pub fn add_events_streamed(count: u64) {
        metrics::counter!("strom_subscription_events_streamed_total").increment(count);
    }

    pub fn increment_events_dropped(reason: &'static str) {
        metrics::counter!("strom_subscription_events_dropped_total", "reason" => reason)
            .increment(1);
    }

    pub fn increment_batches_flushed() {
        metrics::counter!("strom_subscription_batches_flushed_total").increment(1);
    }

    pub fn increment_keep_alives() {
        metrics::counter!("strom_subscription_keep_alive_batches_total").increment(1);
    }

    pub fn increment_commits() {
        metrics::counter!("strom_subscription_commits_total").increment(1);
    }

    pub fn increment_autocommits() {
        metrics::counter!("strom_subscription_autocommits_total").increment(1);
    }

    pub fn increment_dlq_published() {
        metrics::counter!("strom_subscription_dlq_published_total").increment(1);
    }

    pub fn increment_rebalances() {
        metrics::counter!("strom_subscription_rebalances_total").increment(1);
    }

    pub fn increment_sessions_closed(reason: &'static str) {
        metrics::counter!("strom_subscription_sessions_closed_total", "reason" => reason)
            .increment(1);
    }

    pub fn record_batch_bytes(bytes: usize) {
        metrics::histogram!("strom_subscription_batch_bytes").record(bytes as f64);
    }

    pub fn set_buffered_bytes(bytes: usize) {
        metrics::gauge!("strom_subscription_buffered_bytes").set(bytes as f64);
    }

    pub fn set_assigned_partitions(count: usize) {
        metrics::gauge!("strom_subscription_assigned_partitions").set(count as f64);
    }

    pub fn set_uncommitted_events(count: usize) {
        metrics::gauge!("strom_subscription_uncommitted_events").set(count as f64);
    }
}
