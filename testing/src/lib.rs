//! # Composable Query Testing
//!
//! Testing utilities and helpers for the Composable Query engine.
//!
//! This crate provides:
//! - A virtual-time [`Scheduler`](composable_query_core::Scheduler) for GC tests
//! - Scriptable fetch handlers whose results the test controls
//! - A subscriber that records every notification
//! - Tracing setup for test runs
//!
//! ## Example
//!
//! ```ignore
//! use composable_query_testing::{ControlledHandler, ManualScheduler, RecordingSubscriber};
//!
//! #[tokio::test]
//! async fn completes_once() {
//!     let handler = ControlledHandler::new();
//!     let scheduler = ManualScheduler::new();
//!     let client = Client::builder(handler.clone())
//!         .scheduler(Arc::new(scheduler.clone()))
//!         .build();
//!
//!     let recorder = RecordingSubscriber::new();
//!     let _sub = client.fetch(&req, Some(recorder.subscriber()))?;
//!
//!     handler.resolve_next(json!({ "ok": true }));
//!     settle().await;
//!     assert_eq!(recorder.states(), vec![QueryState::Completed]);
//! }
//! ```

pub mod handlers;
pub mod recorder;

/// Mock implementations of injected dependencies.
pub mod mocks {
    use composable_query_core::environment::{ScheduledTask, Scheduler, TimerHandle};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    struct Timer {
        id: u64,
        deadline: Duration,
        task: ScheduledTask,
    }

    #[derive(Default)]
    struct Timeline {
        now: Duration,
        next_id: u64,
        timers: Vec<Timer>,
    }

    /// Scheduler driven by hand.
    ///
    /// Nothing runs until [`advance`](Self::advance) moves virtual time past a
    /// task's deadline. Tasks never run inline from `schedule`.
    ///
    /// # Example
    ///
    /// ```
    /// use composable_query_core::Scheduler;
    /// use composable_query_testing::mocks::ManualScheduler;
    /// use std::sync::atomic::{AtomicBool, Ordering};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let scheduler = ManualScheduler::new();
    /// let fired = Arc::new(AtomicBool::new(false));
    /// let flag = Arc::clone(&fired);
    /// let _handle = scheduler.schedule(
    ///     Duration::from_secs(30),
    ///     Box::new(move || flag.store(true, Ordering::SeqCst)),
    /// );
    ///
    /// scheduler.advance(Duration::from_secs(29));
    /// assert!(!fired.load(Ordering::SeqCst));
    /// scheduler.advance(Duration::from_secs(1));
    /// assert!(fired.load(Ordering::SeqCst));
    /// ```
    #[derive(Clone, Default)]
    pub struct ManualScheduler {
        timeline: Arc<Mutex<Timeline>>,
    }

    impl ManualScheduler {
        /// Create a scheduler at virtual time zero.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn timeline(&self) -> MutexGuard<'_, Timeline> {
            self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Elapsed virtual time.
        #[must_use]
        pub fn now(&self) -> Duration {
            self.timeline().now
        }

        /// Number of scheduled, not yet run, not canceled tasks.
        #[must_use]
        pub fn pending(&self) -> usize {
            self.timeline().timers.len()
        }

        /// Move virtual time forward and run every task that came due, in
        /// deadline order.
        ///
        /// Tasks run without the scheduler's lock held, so they may schedule
        /// more work. Work that comes due within the same window runs too.
        pub fn advance(&self, by: Duration) {
            let target = {
                let mut timeline = self.timeline();
                timeline.now += by;
                timeline.now
            };

            loop {
                let due = {
                    let mut timeline = self.timeline();
                    let next = timeline
                        .timers
                        .iter()
                        .enumerate()
                        .filter(|(_, timer)| timer.deadline <= target)
                        .min_by_key(|(_, timer)| (timer.deadline, timer.id))
                        .map(|(index, _)| index);
                    next.map(|index| timeline.timers.remove(index))
                };

                match due {
                    Some(timer) => (timer.task)(),
                    None => break,
                }
            }
        }
    }

    impl Scheduler for ManualScheduler {
        fn schedule(&self, delay: Duration, task: ScheduledTask) -> TimerHandle {
            let mut timeline = self.timeline();
            timeline.next_id += 1;
            let id = timeline.next_id;
            let deadline = timeline.now + delay;
            timeline.timers.push(Timer { id, deadline, task });

            let handle = Arc::clone(&self.timeline);
            TimerHandle::new(move || {
                handle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .timers
                    .retain(|timer| timer.id != id);
            })
        }
    }

    impl std::fmt::Debug for ManualScheduler {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let timeline = self.timeline();
            f.debug_struct("ManualScheduler")
                .field("now", &timeline.now)
                .field("pending", &timeline.timers.len())
                .finish()
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use std::time::Duration;

    /// Install a `tracing` subscriber for the current test binary.
    ///
    /// Honours `RUST_LOG`, defaulting to `debug` for the engine crates.
    /// Safe to call from every test.
    pub fn init_test_tracing() {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(
                "composable_query_core=debug,composable_query_runtime=debug",
            )
        });
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }

    /// Give spawned fetch tasks a chance to run.
    pub async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// Re-export commonly used items
pub use handlers::{ControlledHandler, CountingHandler, StreamHandler};
pub use helpers::{init_test_tracing, settle};
pub use mocks::ManualScheduler;
pub use recorder::{Notification, RecordingSubscriber};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use composable_query_core::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_task(counter: &Arc<AtomicUsize>) -> composable_query_core::ScheduledTask {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn tasks_run_only_when_due() {
        let scheduler = ManualScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let _a = scheduler.schedule(Duration::from_millis(10), counting_task(&runs));
        let _b = scheduler.schedule(Duration::from_millis(20), counting_task(&runs));

        assert_eq!(scheduler.pending(), 2);
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn canceled_tasks_never_run() {
        let scheduler = ManualScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule(Duration::from_millis(5), counting_task(&runs));

        handle.cancel();
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.now(), Duration::from_secs(1));
    }

    #[test]
    fn tasks_may_schedule_more_work() {
        let scheduler = ManualScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let inner = scheduler.clone();
        let counter = Arc::clone(&runs);
        let _handle = scheduler.schedule(
            Duration::from_millis(1),
            Box::new(move || {
                let _nested = inner.schedule(Duration::ZERO, counting_task(&counter));
            }),
        );

        scheduler.advance(Duration::from_millis(1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
