//! Session state machine.
//!
//! One state is current per session and transitions happen only inside the
//! task loop. Each state implements the same three hooks: `on_enter` (may
//! fail, failure routes to `Closing`), `on_exit` (infallible; a state must
//! never be able to block its own replacement) and `handle` for regular
//! tasks.

mod closing;
mod starting;
mod streaming;

pub use closing::Closing;
pub use starting::Starting;
pub use streaming::Streaming;

use crate::error::StreamError;
use crate::session::StreamingSession;
use crate::tasks::SessionTask;
use tracing::debug;

pub enum State {
    Starting(Starting),
    Streaming(Box<Streaming>),
    Closing(Closing),
    Dead,
}

impl State {
    pub fn starting() -> Self {
        State::Starting(Starting::new())
    }

    pub fn closing(reason: Option<StreamError>) -> Self {
        State::Closing(Closing::new(reason))
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Starting(_) => "starting",
            State::Streaming(_) => "streaming",
            State::Closing(_) => "closing",
            State::Dead => "dead",
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, State::Dead)
    }

    pub(crate) async fn on_enter(
        &mut self,
        ctx: &mut StreamingSession,
    ) -> Result<(), StreamError> {
        match self {
            State::Starting(state) => state.on_enter(ctx).await,
            State::Streaming(state) => state.on_enter(ctx).await,
            State::Closing(state) => state.on_enter(ctx).await,
            State::Dead => Ok(()),
        }
    }

    pub(crate) async fn on_exit(&mut self, ctx: &mut StreamingSession) {
        match self {
            State::Starting(state) => state.on_exit(ctx).await,
            State::Streaming(state) => state.on_exit(ctx).await,
            State::Closing(state) => state.on_exit(ctx).await,
            State::Dead => {}
        }
    }

    pub(crate) async fn handle(
        &mut self,
        ctx: &mut StreamingSession,
        task: SessionTask,
    ) -> Result<(), StreamError> {
        match self {
            State::Starting(state) => state.handle(ctx, task).await,
            State::Streaming(state) => state.handle(ctx, task).await,
            State::Closing(state) => state.handle(ctx, task).await,
            State::Dead => {
                debug!(task = task.name(), "ignoring task in dead state");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
