//! Subscriber that records every notification it receives.

use composable_query_core::{FetchError, QueryState};
use composable_query_runtime::Subscriber;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One recorded notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// State the key moved to
    pub state: QueryState,
    /// Cached value passed along
    pub data: Option<Value>,
    /// Rendered error, for rejections
    pub error: Option<String>,
}

/// Captures notifications for later assertions.
///
/// Clones share the same log.
///
/// # Example
///
/// ```
/// use composable_query_core::QueryState;
/// use composable_query_testing::RecordingSubscriber;
/// use serde_json::json;
///
/// let recorder = RecordingSubscriber::new();
/// let subscriber = recorder.subscriber();
/// subscriber(QueryState::Streaming, Some(&json!(1)), None);
///
/// assert_eq!(recorder.states(), vec![QueryState::Streaming]);
/// assert_eq!(recorder.data(), vec![Some(json!(1))]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordingSubscriber {
    log: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingSubscriber {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> MutexGuard<'_, Vec<Notification>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A subscriber callback feeding this recorder.
    #[must_use]
    pub fn subscriber(&self) -> Subscriber {
        let log = Arc::clone(&self.log);
        Arc::new(
            move |state: QueryState, data: Option<&Value>, error: Option<&FetchError>| {
                log.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(Notification {
                        state,
                        data: data.cloned(),
                        error: error.map(ToString::to_string),
                    });
            },
        )
    }

    /// Every notification so far.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.log().clone()
    }

    /// States in notification order.
    #[must_use]
    pub fn states(&self) -> Vec<QueryState> {
        self.log().iter().map(|n| n.state).collect()
    }

    /// Data in notification order.
    #[must_use]
    pub fn data(&self) -> Vec<Option<Value>> {
        self.log().iter().map(|n| n.data.clone()).collect()
    }

    /// The most recent notification.
    #[must_use]
    pub fn last(&self) -> Option<Notification> {
        self.log().last().cloned()
    }

    /// Number of notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log().len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log().is_empty()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.log().clear();
    }
}
