//! Session bootstrap.

use super::{State, Streaming};
use crate::error::StreamError;
use crate::session::StreamingSession;
use crate::tasks::SessionTask;
use tracing::debug;

/// Registers the session, validates access, initializes cursors under the
/// subscription lock, installs watchers and hands over to `Streaming`.
pub struct Starting;

impl Starting {
    pub fn new() -> Self {
        Starting
    }

    pub(crate) async fn on_enter(
        &mut self,
        ctx: &mut StreamingSession,
    ) -> Result<(), StreamError> {
        ctx.register_session().await?;
        ctx.check_access_authorized().await?;

        // First sessions of a subscription race to create the starting
        // cursors; the lock makes exactly one of them win.
        {
            let _lock = ctx.coordination.acquire_lock().await?;
            ctx.coordination
                .initialize_offsets(&ctx.initial_cursors)
                .await?;
        }

        let session_id = ctx.session.id.clone();
        ctx.output.on_initialized(&session_id).await?;

        let tasks = ctx.queue.sender();
        ctx.auth_watch = Some(ctx.checks.subscribe_for_authorization_changes(
            &ctx.subscription.event_types,
            Box::new(move || tasks.enqueue(SessionTask::RecheckAccess)),
        ));

        let tasks = ctx.queue.sender();
        ctx.session_list_watch = Some(ctx.coordination.subscribe_for_session_list_changes(
            Box::new(move || tasks.enqueue(SessionTask::Rebalance)),
        )?);

        // Streaming runs the initial rebalance itself in its on_enter, so a
        // watcher firing between the subscribe above and the transition can
        // safely be ignored here.
        ctx.switch_state(State::Streaming(Box::new(Streaming::new(ctx))));
        Ok(())
    }

    pub(crate) async fn on_exit(&mut self, _ctx: &mut StreamingSession) {}

    pub(crate) async fn handle(
        &mut self,
        _ctx: &mut StreamingSession,
        task: SessionTask,
    ) -> Result<(), StreamError> {
        debug!(task = task.name(), "ignoring task while starting");
        Ok(())
    }
}

impl Default for Starting {
    fn default() -> Self {
        Self::new()
    }
}
