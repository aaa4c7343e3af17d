//! Per-session subscription streaming engine.
//!
//! One [`StreamingSession`] runs one long-lived client streaming connection
//! for a subscription: it coordinates partition assignment through a
//! [`coordination::CoordinationClient`], polls [`storage::EventStorage`] for
//! new events, applies authorization and filtering, batches events to a
//! [`output::SubscriptionOutput`], and enforces commit-based backpressure.
//!
//! All session state lives behind a single-consumer task loop: watcher
//! callbacks, timer fires and poll completions only enqueue
//! [`tasks::SessionTask`]s, and the loop applies them one at a time. See the
//! module docs of [`session`] for the state machine.
//!
//! ```rust,ignore
//! let (session, handle) = StreamingSession::builder()
//!     .subscription(subscription)
//!     .coordination(coordination)
//!     .storage(storage)
//!     .output(Box::new(output))
//!     .initial_cursors(cursors)
//!     .build()?;
//!
//! tokio::spawn(async move { handle_commits(handle).await });
//! session.stream().await?;
//! ```

pub mod assignment;
pub mod checks;
pub mod commits;
pub mod coordination;
pub mod dlq;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod poller;
pub mod session;
pub mod state;
pub mod storage;
pub mod tasks;
pub mod timer;

pub use checks::{EventStreamChecks, EventTypeRegistry, FeatureToggles, PermissiveChecks};
pub use coordination::{CoordinationClient, CoordinationError, WatchHandle};
pub use dlq::{DlqOutcome, EventPublisher, PublishError};
pub use error::{ClientError, StreamError};
pub use output::{SubscriptionCursor, SubscriptionOutput};
pub use session::{Session, SessionHandle, StreamingSession, StreamingSessionBuilder};
pub use storage::{EventStorage, StorageError};
