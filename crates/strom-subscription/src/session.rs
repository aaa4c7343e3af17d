//! The streaming session: context, task loop and client-facing facade.
//!
//! A session moves through `Starting → Streaming → Closing → Dead`. The loop
//! in [`StreamingSession::stream`] is the only place session state is ever
//! mutated; watchers, timers and pollers communicate with it exclusively
//! through the task queue. Transitions are themselves tasks: `switch_state`
//! enqueues one, `switch_state_immediately` additionally discards everything
//! already queued so that work scheduled by a doomed state cannot run.

use crate::checks::{embedded_event_type_name, EventStreamChecks, EventTypeRegistry, FeatureToggles};
use crate::coordination::{CoordinationClient, WatchHandle};
use crate::dlq::EventPublisher;
use crate::error::{ClientError, StreamError};
use crate::output::SubscriptionOutput;
use crate::state::State;
use crate::storage::EventStorage;
use crate::tasks::{SessionTask, TaskQueue, TaskSender};
use crate::timer::Timer;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strom_core::metrics::StreamMetrics;
use strom_core::{
    ConsumedEvent, Cursor, CursorComparator, EventCategory, HeaderTag, StreamParameters,
    Subscription, TimelineCursorComparator, UnprocessableEventPolicy,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sentinel timeout on the task dequeue. Any live session sees a liveness
/// tick far sooner; this only bounds how long a wedged session can sit idle.
const TASK_POLL_SENTINEL: Duration = Duration::from_secs(3600);

/// Identity of one streaming session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub subscription_id: String,
    pub client_id: String,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(subscription_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), subscription_id, client_id)
    }

    pub fn with_id(
        id: impl Into<String>,
        subscription_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            subscription_id: subscription_id.into(),
            client_id: client_id.into(),
            started_at: Utc::now(),
        }
    }
}

/// One long-lived streaming session for a subscription.
pub struct StreamingSession {
    pub(crate) session: Session,
    pub(crate) subscription: Arc<Subscription>,
    pub(crate) params: StreamParameters,
    pub(crate) coordination: Arc<dyn CoordinationClient>,
    pub(crate) storage: Arc<dyn EventStorage>,
    pub(crate) checks: Arc<dyn EventStreamChecks>,
    pub(crate) registry: Arc<dyn EventTypeRegistry>,
    pub(crate) publisher: Option<Arc<dyn EventPublisher>>,
    pub(crate) output: Box<dyn SubscriptionOutput>,
    pub(crate) comparator: Arc<dyn CursorComparator>,
    pub(crate) toggles: FeatureToggles,
    pub(crate) initial_cursors: Vec<Cursor>,
    pub(crate) poll_timeout: Duration,
    pub(crate) queue: TaskQueue,
    pub(crate) timer: Timer,
    pub(crate) state: State,
    pub(crate) session_registered: bool,
    pub(crate) coordination_closed: bool,
    pub(crate) session_list_watch: Option<WatchHandle>,
    pub(crate) auth_watch: Option<WatchHandle>,
    pub(crate) started: Instant,
    pub(crate) close_reason: Option<StreamError>,
}

impl StreamingSession {
    pub fn builder() -> StreamingSessionBuilder {
        StreamingSessionBuilder::new()
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// Run the session to completion. Returns `Ok(())` on a graceful close
    /// and the terminal error otherwise.
    pub async fn stream(mut self) -> Result<(), StreamError> {
        info!(
            session_id = %self.session.id,
            subscription_id = %self.subscription.id,
            client_id = %self.session.client_id,
            "starting streaming session"
        );
        // The session is built with a Dead placeholder; the first task flips
        // it into Starting, so the loop checks for Dead only after a task.
        self.switch_state(State::starting());

        loop {
            let task =
                match tokio::time::timeout(TASK_POLL_SENTINEL, self.queue.recv()).await {
                    Ok(Some(task)) => task,
                    Ok(None) => break,
                    Err(_) => continue,
                };
            self.process(task).await;
            if self.state.is_dead() {
                break;
            }
        }

        match self.close_reason.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn process(&mut self, task: SessionTask) {
        match task {
            SessionTask::Transition(next) => self.apply_transition(next).await,
            SessionTask::Terminate => {
                if matches!(self.state, State::Closing(_) | State::Dead) {
                    return;
                }
                info!(session_id = %self.session.id, "terminate requested");
                self.switch_state(State::closing(None));
            }
            other => {
                let name = other.name();
                if let Err(err) = self.dispatch_to_state(other).await {
                    warn!(
                        session_id = %self.session.id,
                        task = name,
                        error = %err,
                        "task failed, closing session"
                    );
                    self.switch_state_immediately(State::closing(Some(err)));
                }
            }
        }
    }

    async fn dispatch_to_state(&mut self, task: SessionTask) -> Result<(), StreamError> {
        let mut state = std::mem::replace(&mut self.state, State::Dead);
        let result = state.handle(self, task).await;
        self.state = state;
        result
    }

    /// Enqueue a transition; safe to call from inside handlers.
    pub(crate) fn switch_state(&self, next: State) {
        self.queue.sender().enqueue(SessionTask::Transition(next));
    }

    /// Discard all pending work, then enqueue a transition. Used for fatal
    /// transitions only.
    pub(crate) fn switch_state_immediately(&mut self, next: State) {
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!(
                session_id = %self.session.id,
                dropped,
                "discarded queued tasks for immediate transition"
            );
        }
        self.switch_state(next);
    }

    async fn apply_transition(&mut self, next: State) {
        info!(
            session_id = %self.session.id,
            from = self.state.name(),
            to = next.name(),
            "switching state"
        );
        // on_exit must not prevent the switch; it is infallible by contract.
        let mut old = std::mem::replace(&mut self.state, State::Dead);
        old.on_exit(self).await;

        let mut entering = next;
        let entered = entering.on_enter(self).await;
        let is_closing = matches!(entering, State::Closing(_));
        self.state = entering;
        if let Err(err) = entered {
            if is_closing {
                // Closing is best-effort and always reaches Dead on its own.
                warn!(session_id = %self.session.id, error = %err, "error while closing");
            } else {
                self.switch_state_immediately(State::closing(Some(err)));
            }
        }
    }

    // ------------------------------------------------------------------
    // Context operations shared by the states
    // ------------------------------------------------------------------

    pub(crate) async fn register_session(&mut self) -> Result<(), StreamError> {
        info!(session_id = %self.session.id, "registering session");
        // Flag first: unregistering a session whose registration failed is
        // harmless because ids are unique, the reverse leaks the node.
        self.session_registered = true;
        self.coordination.register_session(&self.session).await?;
        Ok(())
    }

    pub(crate) async fn unregister_session(&mut self) {
        if let Some(watch) = self.session_list_watch.take() {
            watch.close();
        }
        if let Some(watch) = self.auth_watch.take() {
            watch.close();
        }
        if self.session_registered {
            info!(session_id = %self.session.id, "unregistering session");
            if let Err(err) = self.coordination.unregister_session(&self.session).await {
                warn!(session_id = %self.session.id, error = %err, "failed to unregister session");
            }
            self.session_registered = false;
        }
    }

    pub(crate) async fn close_coordination(&mut self) {
        if !self.coordination_closed {
            if let Err(err) = self.coordination.close().await {
                warn!(session_id = %self.session.id, error = %err, "failed to close coordination client");
            }
            self.coordination_closed = true;
        }
    }

    pub(crate) async fn check_access_authorized(&mut self) -> Result<(), StreamError> {
        self.checks
            .authorize_subscription_read(&self.subscription)
            .await
            .map_err(StreamError::from)
    }

    pub(crate) fn mint_cursor_token(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Why an event must be dropped instead of delivered, if at all.
    ///
    /// The checks run in a fixed order: stream-level block, misplaced event,
    /// consumer-tag mismatch, per-event authorization.
    pub(crate) fn event_drop_reason(
        &self,
        event: &ConsumedEvent,
    ) -> Result<Option<&'static str>, StreamError> {
        if self
            .checks
            .is_consumption_blocked(&self.subscription, &self.session.client_id)
        {
            return Ok(Some("consumption_blocked"));
        }
        if self.toggles.skip_misplaced_events && self.is_misplaced(event)? {
            return Ok(Some("misplaced"));
        }
        if !self.consumer_tag_matches(event) {
            return Ok(Some("consumer_tag_mismatch"));
        }
        if self.checks.is_event_blocked(event) {
            return Ok(Some("unauthorized"));
        }
        Ok(None)
    }

    fn is_misplaced(&self, event: &ConsumedEvent) -> Result<bool, StreamError> {
        let expected = &event.key().event_type;
        match self.registry.category(expected) {
            None | Some(EventCategory::Undefined) => Ok(false),
            Some(_) => match embedded_event_type_name(&event.payload) {
                Ok(Some(actual)) if actual != *expected => {
                    warn!(
                        expected = %expected,
                        actual = %actual,
                        position = %event.position,
                        "consumed event for a different event type"
                    );
                    Ok(true)
                }
                Ok(_) => Ok(false),
                Err(err) => Err(StreamError::Internal(format!(
                    "failed to parse event metadata at {}: {err}",
                    event.position
                ))),
            },
        }
    }

    /// An event without a consumer-subscription tag is addressed to every
    /// subscription; a tag must match ours exactly.
    fn consumer_tag_matches(&self, event: &ConsumedEvent) -> bool {
        event
            .consumer_tags
            .get(&HeaderTag::ConsumerSubscriptionId)
            .map(|tag| tag == &self.subscription.id)
            .unwrap_or(true)
    }
}

/// Cheap cloneable handle for the request layer: terminate the session,
/// commit cursors, report unprocessable events.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    subscription: Arc<Subscription>,
    commit_timeout: Duration,
    tasks: TaskSender,
    coordination: Arc<dyn CoordinationClient>,
    comparator: Arc<dyn CursorComparator>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Cooperative shutdown; completes within the next loop iteration.
    pub fn terminate(&self) {
        self.tasks.enqueue(SessionTask::Terminate);
    }

    /// Report that a consumer cannot process the event at `cursor`.
    pub fn report_unprocessable(&self, cursor: Cursor, reason: impl Into<String>) {
        self.tasks.enqueue(SessionTask::Unprocessable {
            cursor,
            reason: reason.into(),
        });
    }

    /// Commit cursors on behalf of the client.
    ///
    /// Validation errors are the caller's problem and never touch the
    /// session loop. The result vector matches the input: `true` for a
    /// successful or already-committed cursor, `false` for a stale one.
    pub async fn commit_cursors(
        &self,
        stream_id: &str,
        cursors: Vec<Cursor>,
    ) -> Result<Vec<bool>, ClientError> {
        if stream_id != self.session_id {
            return Err(ClientError::InvalidStreamId(stream_id.to_string()));
        }
        if !self.coordination.is_active_session(stream_id).await? {
            return Err(ClientError::InvalidStreamId(stream_id.to_string()));
        }
        for cursor in &cursors {
            if !self.subscription.contains_event_type(&cursor.key.event_type) {
                return Err(ClientError::WrongEventType(cursor.key.event_type.clone()));
            }
        }

        let ownership: HashMap<_, _> = self
            .coordination
            .list_partitions()
            .await?
            .into_iter()
            .map(|p| (p.key.clone(), p))
            .collect();
        for cursor in &cursors {
            let owned = ownership
                .get(&cursor.key)
                .map(|p| p.is_owned_by(stream_id))
                .unwrap_or(false);
            if !owned {
                return Err(ClientError::PartitionNotOwned(cursor.key.clone()));
            }
        }

        let committed = self
            .coordination
            .commit_offsets(&cursors, self.comparator.as_ref())
            .await?;

        // A commit that failed because the cursor is already the committed
        // one is reported as success: the client's intent is satisfied.
        let mut results = Vec::with_capacity(cursors.len());
        let mut acknowledged = Vec::new();
        for (cursor, fresh) in cursors.into_iter().zip(committed) {
            let accepted = if fresh {
                true
            } else {
                let current = self.coordination.get_offset(&cursor.key).await?;
                self.comparator.compare(&cursor, &current) == Some(Ordering::Equal)
            };
            if accepted {
                acknowledged.push(cursor.clone());
            }
            results.push(accepted);
        }
        if !acknowledged.is_empty() {
            StreamMetrics::increment_commits();
            self.tasks.enqueue(SessionTask::CommitAcknowledged {
                cursors: acknowledged,
            });
        }
        Ok(results)
    }

    /// Atomically reset the subscription's cursors.
    ///
    /// Sessions with events in flight get one commit timeout plus a second
    /// of grace to drain before the reset lands.
    pub async fn reset_cursors(&self, cursors: Vec<Cursor>) -> Result<(), ClientError> {
        for cursor in &cursors {
            if !self.subscription.contains_event_type(&cursor.key.event_type) {
                return Err(ClientError::WrongEventType(cursor.key.event_type.clone()));
            }
        }
        if cursors.is_empty() {
            return Ok(());
        }
        let drain = self.commit_timeout + Duration::from_secs(1);
        self.coordination.reset_cursors(&cursors, drain).await?;
        Ok(())
    }
}

/// Builder assembling a [`StreamingSession`] from its collaborators.
///
/// Mandatory: subscription, coordination client, event storage, output.
/// Everything else has workable defaults.
pub struct StreamingSessionBuilder {
    session: Option<Session>,
    subscription: Option<Subscription>,
    params: StreamParameters,
    coordination: Option<Arc<dyn CoordinationClient>>,
    storage: Option<Arc<dyn EventStorage>>,
    checks: Option<Arc<dyn EventStreamChecks>>,
    registry: Option<Arc<dyn EventTypeRegistry>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    output: Option<Box<dyn SubscriptionOutput>>,
    comparator: Arc<dyn CursorComparator>,
    toggles: FeatureToggles,
    initial_cursors: Vec<Cursor>,
    poll_timeout: Duration,
}

impl StreamingSessionBuilder {
    pub fn new() -> Self {
        Self {
            session: None,
            subscription: None,
            params: StreamParameters::default(),
            coordination: None,
            storage: None,
            checks: None,
            registry: None,
            publisher: None,
            output: None,
            comparator: Arc::new(TimelineCursorComparator),
            toggles: FeatureToggles::default(),
            initial_cursors: Vec::new(),
            poll_timeout: Duration::from_millis(250),
        }
    }

    pub fn session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = Some(subscription);
        self
    }

    pub fn parameters(mut self, params: StreamParameters) -> Self {
        self.params = params;
        self
    }

    pub fn coordination(mut self, coordination: Arc<dyn CoordinationClient>) -> Self {
        self.coordination = Some(coordination);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn EventStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn checks(mut self, checks: Arc<dyn EventStreamChecks>) -> Self {
        self.checks = Some(checks);
        self
    }

    pub fn event_type_registry(mut self, registry: Arc<dyn EventTypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn output(mut self, output: Box<dyn SubscriptionOutput>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn cursor_comparator(mut self, comparator: Arc<dyn CursorComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn feature_toggles(mut self, toggles: FeatureToggles) -> Self {
        self.toggles = toggles;
        self
    }

    /// Starting offsets used to initialize the subscription's cursors when
    /// none are committed yet.
    pub fn initial_cursors(mut self, cursors: Vec<Cursor>) -> Self {
        self.initial_cursors = cursors;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn build(
        self,
    ) -> Result<(StreamingSession, SessionHandle), strom_core::Error> {
        use strom_core::Error::InvalidConfig;

        let subscription = self
            .subscription
            .ok_or_else(|| InvalidConfig("subscription is required".into()))?;
        if subscription.event_types.is_empty() {
            return Err(InvalidConfig(
                "subscription must have at least one event type".into(),
            ));
        }
        let coordination = self
            .coordination
            .ok_or_else(|| InvalidConfig("coordination client is required".into()))?;
        let storage = self
            .storage
            .ok_or_else(|| InvalidConfig("event storage is required".into()))?;
        let output = self
            .output
            .ok_or_else(|| InvalidConfig("subscription output is required".into()))?;
        self.params.validate()?;

        let annotations = &subscription.annotations;
        if annotations.unprocessable_event_policy == Some(UnprocessableEventPolicy::DeadLetterQueue)
        {
            if annotations.dead_letter_queue_event_type.is_none() {
                return Err(InvalidConfig(
                    "DEAD_LETTER_QUEUE policy requires a DLQ event type annotation".into(),
                ));
            }
            if self.publisher.is_none() {
                return Err(InvalidConfig(
                    "DEAD_LETTER_QUEUE policy requires an event publisher".into(),
                ));
            }
        }

        let session = self
            .session
            .unwrap_or_else(|| Session::new(subscription.id.clone(), "anonymous"));
        let subscription = Arc::new(subscription);
        let queue = TaskQueue::new();
        let timer = Timer::new(queue.sender());

        let handle = SessionHandle {
            session_id: session.id.clone(),
            subscription: Arc::clone(&subscription),
            commit_timeout: self.params.commit_timeout,
            tasks: queue.sender(),
            coordination: Arc::clone(&coordination),
            comparator: Arc::clone(&self.comparator),
        };
        let session = StreamingSession {
            session,
            subscription,
            params: self.params,
            coordination,
            storage,
            checks: self.checks.unwrap_or_else(|| Arc::new(crate::checks::PermissiveChecks)),
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(crate::checks::StaticEventTypeRegistry::new())),
            publisher: self.publisher,
            output,
            comparator: self.comparator,
            toggles: self.toggles,
            initial_cursors: self.initial_cursors,
            poll_timeout: self.poll_timeout,
            queue,
            timer,
            state: State::Dead,
            session_registered: false,
            coordination_closed: false,
            session_list_watch: None,
            auth_watch: None,
            started: Instant::now(),
            close_reason: None,
        };
        Ok((session, handle))
    }
}

impl Default for StreamingSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
