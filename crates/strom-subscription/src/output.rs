//! Client output: the wire batch format and the output seam.
//!
//! Batches go out as JSON lines, one batch per line:
//!
//! ```text
//! {"cursor":{"event_type":"orders","partition":"0","offset":15,"cursor_token":"..."},
//!  "events":[...],"info":{"debug":"..."}}
//! ```
//!
//! Event payloads are stored as JSON and spliced into the line verbatim,
//! preserving the exact bytes the producer published. An empty `events`
//! array with a cursor is a keep-alive.

use crate::error::StreamError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strom_core::Cursor;

/// Cursor as presented to clients, with an opaque token minted per batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCursor {
    pub event_type: String,
    pub partition: String,
    pub offset: u64,
    pub cursor_token: String,
}

impl SubscriptionCursor {
    pub fn wrap(cursor: &Cursor, token: impl Into<String>) -> Self {
        Self {
            event_type: cursor.key.event_type.clone(),
            partition: cursor.key.partition.clone(),
            offset: cursor.offset,
            cursor_token: token.into(),
        }
    }
}

/// Encode one wire batch as a single JSON line.
pub fn encode_batch(
    cursor: &SubscriptionCursor,
    events: &[Bytes],
    debug: Option<&str>,
) -> Result<Bytes, serde_json::Error> {
    let payload_bytes: usize = events.iter().map(|e| e.len()).sum();
    let mut buf = Vec::with_capacity(payload_bytes + events.len() + 128);
    buf.extend_from_slice(b"{\"cursor\":");
    serde_json::to_writer(&mut buf, cursor)?;
    buf.extend_from_slice(b",\"events\":[");
    for (i, event) in events.iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        buf.extend_from_slice(event);
    }
    buf.push(b']');
    if let Some(debug) = debug {
        buf.extend_from_slice(b",\"info\":{\"debug\":");
        serde_json::to_writer(&mut buf, debug)?;
        buf.push(b'}');
    }
    buf.extend_from_slice(b"}\n");
    Ok(Bytes::from(buf))
}

/// Output half of the client connection.
///
/// Writes block; while a write is in flight the session loop is suspended,
/// which is the intended backpressure against slow clients. A write failure
/// is fatal for the session.
#[async_trait]
pub trait SubscriptionOutput: Send {
    /// Called once the session is registered and about to stream.
    async fn on_initialized(&mut self, session_id: &str) -> std::io::Result<()>;

    /// Write one encoded batch line.
    async fn stream_batch(&mut self, batch: Bytes) -> std::io::Result<()>;

    /// Report the terminal error of the session to the client.
    async fn on_exception(&mut self, error: &StreamError);
}

#[cfg(test)]
mod tests {
    use super::*;
    use strom_core::PartitionKey;

    fn wire_cursor(offset: u64) -> SubscriptionCursor {
        SubscriptionCursor::wrap(
            &Cursor::new(PartitionKey::new("orders", "0"), 1, offset),
            "tok-1",
        )
    }

    #[test]
    fn test_encode_batch_with_events() {
        let events = vec![
            Bytes::from_static(br#"{"a":1}"#),
            Bytes::from_static(br#"{"b":2}"#),
        ];
        let line = encode_batch(&wire_cursor(15), &events, None).unwrap();
        let text = std::str::from_utf8(&line).unwrap();

        assert!(text.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(value["cursor"]["offset"], 15);
        assert_eq!(value["cursor"]["event_type"], "orders");
        assert_eq!(value["cursor"]["cursor_token"], "tok-1");
        assert_eq!(value["events"][0]["a"], 1);
        assert_eq!(value["events"][1]["b"], 2);
        assert!(value.get("info").is_none());
    }

    #[test]
    fn test_encode_keep_alive_has_empty_events() {
        let line = encode_batch(&wire_cursor(10), &[], None).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["events"].as_array().unwrap().len(), 0);
        assert_eq!(value["cursor"]["offset"], 10);
    }

    #[test]
    fn test_encode_batch_with_debug_info() {
        let line = encode_batch(&wire_cursor(10), &[], Some("partition released")).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["info"]["debug"], "partition released");
    }
}
