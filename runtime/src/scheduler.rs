//! Tokio-backed [`Scheduler`].

use composable_query_core::environment::{ScheduledTask, Scheduler, TimerHandle};
use std::time::Duration;

/// Runs scheduled tasks on the ambient tokio runtime.
///
/// Each task gets its own spawned timer; canceling aborts it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    /// Create a scheduler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> TimerHandle {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                delay_ms = delay.as_millis(),
                "No tokio runtime available, scheduled task will never run"
            );
            return TimerHandle::noop();
        };

        let join = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });

        TimerHandle::new(move || join.abort())
    }
}
