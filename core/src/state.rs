//! Per-key state machine.
//!
//! [`transition`] is a pure function from the current state of a key and an
//! incoming operation to the next state. The client uses it twice: to gate
//! commands before they enter the pipeline, and to update state when events
//! come back.
//!
//! Lifecycle and observation are modelled separately:
//!
//! - [`QueryState`] tracks where the key's work stands. It is what `transition`
//!   produces and what subscribers are told.
//! - [`Observation`] tracks whether anyone is subscribed. It is produced by the
//!   subscriber registry and drives the inactivity GC only.
//!
//! # Transition table
//!
//! | current               | operation  | next          |
//! |-----------------------|------------|---------------|
//! | any                   | `dispose`  | `Disposed`    |
//! | `Streaming`           | `fetch`    | `Streaming`   |
//! | any other             | `fetch`    | `Fetching`    |
//! | `Fetching`/`Streaming`| `cancel`   | `Idle`        |
//! | any other             | `cancel`   | unchanged     |
//! | any                   | `buffer`   | `Streaming`   |
//! | any                   | `complete` | `Completed`   |
//! | any                   | `reject`   | `Failed`      |
//!
//! An absent state is the implicit `Idle`.

use std::fmt;

use crate::operation::Operation;

/// Where a key's work stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum QueryState {
    /// Nothing outstanding
    #[default]
    Idle,
    /// A fetch was issued and has not settled
    Fetching,
    /// A stream source is open and producing values
    Streaming,
    /// The last task finished successfully
    Completed,
    /// The last task was rejected
    Failed,
}

impl QueryState {
    /// Whether work is outstanding for the key.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Fetching | Self::Streaming)
    }

    /// Lowercase state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`transition`]: a next state or the terminal disposal marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Keep tracking the key in this state
    To(QueryState),
    /// Remove state and cache for the key
    Disposed,
}

impl Transition {
    /// The next state, unless disposed.
    #[must_use]
    pub const fn state(self) -> Option<QueryState> {
        match self {
            Self::To(state) => Some(state),
            Self::Disposed => None,
        }
    }

    /// Whether this transition leaves `current` unchanged.
    ///
    /// An absent current state compares as [`QueryState::Idle`].
    #[must_use]
    pub fn is_noop(self, current: Option<QueryState>) -> bool {
        self == Self::To(current.unwrap_or_default())
    }
}

/// Whether a key currently has subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Observation {
    /// At least one subscriber
    Active,
    /// No subscribers; eligible for garbage collection
    Inactive,
}

/// Compute the next state of a key.
///
/// # Examples
///
/// ```
/// use composable_query_core::state::{transition, QueryState, Transition};
/// use composable_query_core::{Operation, Request};
/// use serde_json::json;
///
/// let req = Request::stream(json!({ "feed": "news" })).unwrap();
/// let next = transition(Some(QueryState::Streaming), &Operation::buffer(req, json!(1)));
/// assert_eq!(next, Transition::To(QueryState::Streaming));
/// ```
#[must_use]
pub fn transition(current: Option<QueryState>, op: &Operation) -> Transition {
    let current = current.unwrap_or_default();

    match op {
        Operation::Dispose { .. } => Transition::Disposed,
        Operation::Fetch(_) => match current {
            QueryState::Streaming => Transition::To(QueryState::Streaming),
            _ => Transition::To(QueryState::Fetching),
        },
        Operation::Cancel(_) => {
            if current.is_in_flight() {
                Transition::To(QueryState::Idle)
            } else {
                Transition::To(current)
            }
        }
        Operation::Buffer { .. } => Transition::To(QueryState::Streaming),
        Operation::Complete { .. } => Transition::To(QueryState::Completed),
        Operation::Reject { .. } => Transition::To(QueryState::Failed),
    }
}
