//! Session teardown.

use super::State;
use crate::error::StreamError;
use crate::session::StreamingSession;
use crate::tasks::SessionTask;
use strom_core::metrics::StreamMetrics;
use tracing::{debug, info, warn};

/// Unregisters the session, releases the watchers and the coordination
/// client, reports the terminal error to the client and moves to `Dead`.
///
/// Every step is best-effort: a failing cleanup step must not keep the next
/// one from running, and registration idempotence absorbs repeats.
pub struct Closing {
    reason: Option<StreamError>,
}

impl Closing {
    pub fn new(reason: Option<StreamError>) -> Self {
        Self { reason }
    }

    pub(crate) async fn on_enter(
        &mut self,
        ctx: &mut StreamingSession,
    ) -> Result<(), StreamError> {
        let label = self
            .reason
            .as_ref()
            .map(|err| err.reason_label())
            .unwrap_or("graceful");
        match &self.reason {
            Some(err) => warn!(session_id = %ctx.session.id, error = %err, "closing session on error"),
            None => info!(session_id = %ctx.session.id, "closing session"),
        }

        if let Some(err) = &self.reason {
            ctx.output.on_exception(err).await;
        }
        ctx.unregister_session().await;
        ctx.close_coordination().await;
        StreamMetrics::increment_sessions_closed(label);

        ctx.close_reason = self.reason.take();
        ctx.switch_state(State::Dead);
        Ok(())
    }

    pub(crate) async fn on_exit(&mut self, _ctx: &mut StreamingSession) {}

    pub(crate) async fn handle(
        &mut self,
        _ctx: &mut StreamingSession,
        task: SessionTask,
    ) -> Result<(), StreamError> {
        debug!(task = task.name(), "ignoring task while closing");
        Ok(())
    }
}
