//! Steady-state streaming.
//!
//! Owns the assignment view, the batch pipeline, the commit tracker and the
//! DLQ handler. Everything age-based (batch flush timeouts, keep-alives,
//! autocommit, the fatal commit timeout and the stream duration ceiling) is
//! evaluated on the periodic liveness tick.

use super::State;
use crate::assignment::{diff_assignment, AssignmentView, PartitionRuntime};
use crate::commits::CommitTracker;
use crate::dlq::{DlqHandler, DlqOutcome};
use crate::error::StreamError;
use crate::output::{encode_batch, SubscriptionCursor};
use crate::pipeline::{FlushReason, ReadyBatch, StreamPipeline};
use crate::poller::{PartitionPoller, PollGate};
use crate::session::StreamingSession;
use crate::tasks::SessionTask;
use bytes::Bytes;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strom_core::metrics::StreamMetrics;
use strom_core::{ConsumedEvent, Cursor, PartitionKey};
use tracing::{debug, info, warn};

pub struct Streaming {
    assignment: AssignmentView,
    pipeline: StreamPipeline,
    commits: CommitTracker,
    dlq: DlqHandler,
    gate: Arc<PollGate>,
    tick_interval: Duration,
    events_streamed: u64,
    keep_alives_in_row: u32,
    had_partitions: bool,
}

impl Streaming {
    pub(crate) fn new(ctx: &StreamingSession) -> Self {
        let params = &ctx.params;
        let tick_interval = (params
            .batch_flush_timeout
            .min(params.stream_keep_alive_limit)
            / 2)
        .clamp(Duration::from_millis(50), Duration::from_secs(1));
        Self {
            assignment: AssignmentView::new(),
            pipeline: StreamPipeline::new(
                params.batch_limit_events,
                params.batch_flush_timeout,
                params.stream_memory_limit_bytes,
                params.stream_keep_alive_limit,
            ),
            commits: CommitTracker::new(params.commit_timeout),
            dlq: DlqHandler::new(&ctx.subscription.annotations, ctx.publisher.clone()),
            gate: Arc::new(PollGate::new()),
            tick_interval,
            events_streamed: 0,
            keep_alives_in_row: 0,
            had_partitions: false,
        }
    }

    pub(crate) async fn on_enter(
        &mut self,
        ctx: &mut StreamingSession,
    ) -> Result<(), StreamError> {
        self.rebalance(ctx).await?;
        self.schedule_tick(ctx);
        Ok(())
    }

    /// Flush whatever is still buffered, best-effort, and stop all pollers.
    pub(crate) async fn on_exit(&mut self, ctx: &mut StreamingSession) {
        for batch in self.pipeline.drain() {
            let token = ctx.mint_cursor_token();
            let wire = SubscriptionCursor::wrap(&batch.cursor, token);
            let payloads: Vec<Bytes> = batch.events.iter().map(|e| e.payload.clone()).collect();
            match encode_batch(&wire, &payloads, None) {
                Ok(line) => {
                    if let Err(err) = ctx.output.stream_batch(line).await {
                        debug!(error = %err, "failed to flush final batch");
                        break;
                    }
                }
                Err(err) => debug!(error = %err, "failed to encode final batch"),
            }
        }
        // Dropping the runtimes aborts the poll tasks.
        self.assignment.clear();
    }

    pub(crate) async fn handle(
        &mut self,
        ctx: &mut StreamingSession,
        task: SessionTask,
    ) -> Result<(), StreamError> {
        match task {
            SessionTask::Rebalance => self.rebalance(ctx).await,
            SessionTask::EventsArrived { key, events } => self.on_events(ctx, key, events).await,
            SessionTask::PollFailed { key, error } => {
                warn!(partition = %key, error = %error, "partition poll failed");
                Err(StreamError::Storage(error))
            }
            SessionTask::LivenessTick => self.on_tick(ctx).await,
            SessionTask::CommitAcknowledged { cursors } => self.on_commit_ack(ctx, cursors).await,
            SessionTask::RecheckAccess => ctx.check_access_authorized().await,
            SessionTask::Unprocessable { cursor, reason } => {
                self.on_unprocessable(ctx, cursor, reason).await
            }
            // Transitions and terminate are intercepted by the loop itself.
            SessionTask::Transition(_) | SessionTask::Terminate => Ok(()),
        }
    }

    fn schedule_tick(&self, ctx: &StreamingSession) {
        ctx.timer
            .schedule(self.tick_interval, SessionTask::LivenessTick);
    }

    async fn rebalance(&mut self, ctx: &mut StreamingSession) -> Result<(), StreamError> {
        ctx.coordination.rebalance_sessions().await?;
        let listed = ctx.coordination.list_partitions().await?;
        let diff = diff_assignment(self.assignment.keys(), &listed, &ctx.session.id);
        if diff.is_empty() {
            return Ok(());
        }
        info!(
            session_id = %ctx.session.id,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "applying rebalance"
        );
        StreamMetrics::increment_rebalances();

        for key in &diff.removed {
            // Anything buffered for a released partition goes out exactly
            // once, marked, before the partition is forgotten.
            if let Some(batch) = self.pipeline.release_partition(key) {
                self.write_batch(ctx, batch).await?;
            }
            self.commits.drop_partition(key);
            self.assignment.remove(key);
            debug!(partition = %key, "released partition");
        }

        for key in diff.added {
            let offset = ctx.coordination.get_offset(&key).await?;
            let poller = PartitionPoller::spawn(
                Arc::clone(&ctx.storage),
                offset.clone(),
                ctx.params.batch_limit_events,
                ctx.params.stream_memory_limit_bytes,
                ctx.poll_timeout,
                Arc::clone(&self.gate),
                ctx.queue.sender(),
            );
            debug!(partition = %key, cursor = %offset, "acquired partition");
            self.pipeline.register_partition(key.clone(), Instant::now());
            self.assignment.insert(
                key,
                PartitionRuntime {
                    sent: offset.clone(),
                    committed: offset,
                    poller,
                },
            );
        }

        self.update_gate(ctx);
        StreamMetrics::set_assigned_partitions(self.assignment.len());

        if self.assignment.is_empty() && self.had_partitions {
            info!(session_id = %ctx.session.id, "lost ownership of all partitions, closing");
            ctx.switch_state(State::closing(None));
            return Ok(());
        }
        if !self.assignment.is_empty() {
            self.had_partitions = true;
        }
        Ok(())
    }

    async fn on_events(
        &mut self,
        ctx: &mut StreamingSession,
        key: PartitionKey,
        events: Vec<ConsumedEvent>,
    ) -> Result<(), StreamError> {
        if !self.assignment.contains(&key) {
            debug!(partition = %key, "dropping poll result for released partition");
            return Ok(());
        }
        for event in events {
            let position = event.position.clone();
            match ctx.event_drop_reason(&event)? {
                Some(reason) => {
                    debug!(position = %position, reason, "dropping event");
                    StreamMetrics::increment_events_dropped(reason);
                }
                None => {
                    // Memory-pressure evictions must go out immediately to
                    // keep buffered bytes bounded.
                    for batch in self.pipeline.accumulate(event, Instant::now()) {
                        self.write_batch(ctx, batch).await?;
                    }
                }
            }
            // The sent cursor advances for dropped events too, so their
            // offsets get committed with the next flushed batch.
            if let Some(runtime) = self.assignment.get_mut(&key) {
                runtime.sent = position;
            }
        }
        self.flush_eligible(ctx).await?;
        if self.stream_limit_reached(ctx) {
            info!(session_id = %ctx.session.id, "stream event limit reached, closing");
            ctx.switch_state(State::closing(None));
        }
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &mut StreamingSession) -> Result<(), StreamError> {
        if ctx.params.has_stream_timeout() && ctx.started.elapsed() >= ctx.params.stream_timeout {
            info!(session_id = %ctx.session.id, "stream timeout reached, closing");
            ctx.switch_state(State::closing(None));
            return Ok(());
        }
        let now = Instant::now();

        // Aged flushes respect the uncommitted window like any other send;
        // a deferred batch simply ages further until capacity frees up.
        if self.can_send(ctx) {
            for batch in self.pipeline.tick(now) {
                self.write_batch(ctx, batch).await?;
            }
        }

        // Autocommit runs before the fatal check: with it enabled a healthy
        // coordination store never lets a batch age into the commit timeout.
        if let Some(timeout) = ctx.subscription.autocommit_timeout {
            let due = self.commits.autocommit_due(now, timeout);
            if !due.is_empty() {
                ctx.coordination
                    .commit_offsets(&due, ctx.comparator.as_ref())
                    .await?;
                for cursor in &due {
                    self.commits.acknowledge(cursor, ctx.comparator.as_ref());
                    self.note_committed(cursor, ctx);
                }
                debug!(count = due.len(), "cursors autocommitted");
                StreamMetrics::increment_autocommits();
                self.update_gate(ctx);
            }
        }
        self.flush_eligible(ctx).await?;

        if let Some((partition, elapsed)) = self.commits.overdue(now) {
            return Err(StreamError::CommitTimeout { partition, elapsed });
        }

        for key in self.pipeline.keep_alive_due(now) {
            let Some(runtime) = self.assignment.get(&key) else {
                continue;
            };
            let cursor = runtime.sent.clone();
            self.write_keep_alive(ctx, &key, cursor).await?;
        }
        if let Some(limit) = ctx.params.stream_keep_alive_count_limit {
            if self.keep_alives_in_row >= limit {
                info!(
                    session_id = %ctx.session.id,
                    keep_alives = self.keep_alives_in_row,
                    "keep-alive limit reached with no events, closing"
                );
                ctx.switch_state(State::closing(None));
                return Ok(());
            }
        }

        if self.stream_limit_reached(ctx) {
            info!(session_id = %ctx.session.id, "stream event limit reached, closing");
            ctx.switch_state(State::closing(None));
            return Ok(());
        }

        self.schedule_tick(ctx);
        Ok(())
    }

    async fn on_commit_ack(
        &mut self,
        ctx: &mut StreamingSession,
        cursors: Vec<Cursor>,
    ) -> Result<(), StreamError> {
        for cursor in cursors {
            let released = self.commits.acknowledge(&cursor, ctx.comparator.as_ref());
            debug!(cursor = %cursor, released, "commit acknowledged");
            self.note_committed(&cursor, ctx);
        }
        self.update_gate(ctx);
        self.flush_eligible(ctx).await
    }

    async fn on_unprocessable(
        &mut self,
        ctx: &mut StreamingSession,
        cursor: Cursor,
        reason: String,
    ) -> Result<(), StreamError> {
        let outcome = self
            .dlq
            .on_unprocessable(&cursor, &reason, ctx.storage.as_ref())
            .await?;
        match outcome {
            DlqOutcome::RetryAllowed { attempts } => {
                debug!(cursor = %cursor, attempts, "unprocessable event stays in the stream");
                Ok(())
            }
            DlqOutcome::Skipped | DlqOutcome::Published => {
                // Advance the committed cursor past the event so it is
                // never redelivered.
                ctx.coordination
                    .commit_offsets(std::slice::from_ref(&cursor), ctx.comparator.as_ref())
                    .await?;
                self.commits.acknowledge(&cursor, ctx.comparator.as_ref());
                self.note_committed(&cursor, ctx);
                self.update_gate(ctx);
                self.flush_eligible(ctx).await
            }
        }
    }

    async fn write_batch(
        &mut self,
        ctx: &mut StreamingSession,
        batch: ReadyBatch,
    ) -> Result<(), StreamError> {
        let token = ctx.mint_cursor_token();
        let wire = SubscriptionCursor::wrap(&batch.cursor, token);
        let payloads: Vec<Bytes> = batch.events.iter().map(|e| e.payload.clone()).collect();
        let debug_info = matches!(batch.reason, FlushReason::PartitionReleased)
            .then_some("partition released");
        let line = encode_batch(&wire, &payloads, debug_info)?;
        StreamMetrics::record_batch_bytes(line.len());
        ctx.output.stream_batch(line).await?;

        let now = Instant::now();
        self.commits
            .record_flush(batch.cursor.clone(), batch.events.len(), now);
        self.pipeline.note_flushed(&batch.key, now);
        if let Some(runtime) = self.assignment.get_mut(&batch.key) {
            runtime.sent = batch.cursor.clone();
        }
        self.events_streamed += batch.events.len() as u64;
        self.keep_alives_in_row = 0;
        StreamMetrics::increment_batches_flushed();
        StreamMetrics::add_events_streamed(batch.events.len() as u64);
        StreamMetrics::set_buffered_bytes(self.pipeline.buffered_bytes());
        self.update_gate(ctx);
        Ok(())
    }

    async fn write_keep_alive(
        &mut self,
        ctx: &mut StreamingSession,
        key: &PartitionKey,
        cursor: Cursor,
    ) -> Result<(), StreamError> {
        let token = ctx.mint_cursor_token();
        let wire = SubscriptionCursor::wrap(&cursor, token);
        let line = encode_batch(&wire, &[], None)?;
        ctx.output.stream_batch(line).await?;
        self.pipeline.note_flushed(key, Instant::now());
        self.keep_alives_in_row += 1;
        StreamMetrics::increment_keep_alives();
        debug!(partition = %key, cursor = %cursor, "keep-alive batch sent");
        Ok(())
    }

    fn note_committed(&mut self, cursor: &Cursor, ctx: &StreamingSession) {
        if let Some(runtime) = self.assignment.get_mut(&cursor.key) {
            if ctx.comparator.compare(cursor, &runtime.committed) == Some(Ordering::Greater) {
                runtime.committed = cursor.clone();
            }
        }
    }

    /// Whether another batch may be sent without blowing the uncommitted
    /// window.
    fn can_send(&self, ctx: &StreamingSession) -> bool {
        self.commits.uncommitted_events() < ctx.params.max_uncommitted_events
    }

    /// Send full chunks while the uncommitted window has room.
    async fn flush_eligible(&mut self, ctx: &mut StreamingSession) -> Result<(), StreamError> {
        while self.can_send(ctx) {
            let Some(chunk) = self.pipeline.take_full_chunk() else {
                break;
            };
            self.write_batch(ctx, chunk).await?;
        }
        Ok(())
    }

    fn update_gate(&self, ctx: &StreamingSession) {
        let uncommitted = self.commits.uncommitted_events();
        StreamMetrics::set_uncommitted_events(uncommitted);
        if uncommitted >= ctx.params.max_uncommitted_events {
            self.gate.pause();
        } else {
            self.gate.resume();
        }
    }

    fn stream_limit_reached(&self, ctx: &StreamingSession) -> bool {
        ctx.params
            .stream_limit_events
            .map(|limit| self.events_streamed >= limit)
            .unwrap_or(false)
    }
}
