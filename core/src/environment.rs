//! Injected dependencies.
//!
//! The client never touches ambient timers. Delayed work goes through a
//! [`Scheduler`], so production code can use tokio timers while tests drive
//! time by hand.
//!
//! # Examples
//!
//! ```ignore
//! // Production - real timers
//! let client = Client::builder(handler)
//!     .scheduler(Arc::new(TokioScheduler::new()))
//!     .build();
//!
//! // Test - virtual time
//! let scheduler = ManualScheduler::new();
//! let client = Client::builder(handler)
//!     .scheduler(Arc::new(scheduler.clone()))
//!     .build();
//! scheduler.advance(Duration::from_secs(30));
//! ```

use std::fmt;
use std::time::Duration;

/// A unit of delayed work.
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed, unless the returned handle is
    /// canceled first.
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> TimerHandle;
}

/// Cancels a scheduled task.
///
/// Dropping the handle does *not* cancel the task.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    /// Wrap a cancellation function.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle whose task cannot be canceled (already ran, or never will).
    #[must_use]
    pub const fn noop() -> Self {
        Self { cancel: None }
    }

    /// Cancel the task. Safe to call after the task ran.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelable", &self.cancel.is_some())
            .finish()
    }
}
