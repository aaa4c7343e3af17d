//! Delayed task scheduling for the session loop.

use crate::tasks::{SessionTask, TaskSender};
use std::time::Duration;

/// Schedules tasks back onto the session queue after a delay.
///
/// Each schedule spawns a short-lived tokio task; if the session is gone by
/// the time the delay elapses, the enqueue is a no-op.
#[derive(Debug, Clone)]
pub struct Timer {
    tasks: TaskSender,
}

impl Timer {
    pub fn new(tasks: TaskSender) -> Self {
        Self { tasks }
    }

    pub fn schedule(&self, delay: Duration, task: SessionTask) {
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tasks.enqueue(task);
        });
    }
}
