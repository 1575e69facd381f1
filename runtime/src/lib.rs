//! # Composable Query Runtime
//!
//! Runtime for the Composable Query engine.
//!
//! This crate provides the [`Client`] that ties the core pieces together:
//! it gates commands through the per-key state machine, pipes them through
//! the exchange chain, runs fetches in the task manager, and fans results out
//! to subscribers.
//!
//! ## Core Components
//!
//! - **Client**: Owns cache, states, subscribers and inactivity timers
//! - **Pipeline**: Composes exchanges and appends the fetch task manager
//! - **Fetch task manager**: One task per key, dedup, cancellation, stale
//!   event filtering
//! - **Watch**: `tokio::sync::watch` view of a key for presentation layers
//!
//! ## Example
//!
//! ```ignore
//! use composable_query_runtime::Client;
//! use composable_query_core::{FetchOutcome, Request};
//!
//! let client = Client::builder(|req: &Request, _ctx| {
//!     let params = req.params().clone();
//!     FetchOutcome::future(async move { api::query(params).await })
//! })
//! .exchange(auth_exchange)
//! .max_age(Duration::from_secs(60))
//! .build();
//!
//! let req = Request::single(json!({ "query": "users" }))?;
//! let sub = client.subscribe(&req, |state, data, error| render(state, data, error))?;
//! ```

/// Client configuration
pub mod config;

/// The orchestrator
pub mod client;

/// Fetch/cancel task manager
pub mod fetch;

/// Prometheus metrics for observability
pub mod metrics;

/// Exchange pipeline composition
pub mod pipeline;

/// Per-key subscriber registry
pub mod registry;

/// Tokio-backed scheduler
pub mod scheduler;

/// Snapshot-based query watch
pub mod watch;

/// Error types for the client
pub mod error {
    use composable_query_core::{ExchangeError, RequestError};
    use thiserror::Error;

    /// Errors returned by [`Client`](crate::Client) operations.
    ///
    /// Fetch failures are not client errors. They are delivered to
    /// subscribers through `reject`.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum ClientError {
        /// The request could not be built
        #[error(transparent)]
        Request(#[from] RequestError),

        /// An exchange failed while handling the operation
        ///
        /// The key's state is left as it was before the call.
        #[error(transparent)]
        Exchange(#[from] ExchangeError),

        /// The call is not valid in the key's current situation
        #[error("Operation not allowed for request {id}: {reason}")]
        NotAllowed {
            /// Key the call was made for
            id: String,
            /// Why it was refused
            reason: String,
        },

        /// Watch channel closed
        ///
        /// The key stopped publishing snapshots, typically because the
        /// subscription was removed.
        #[error("Watch channel closed")]
        ChannelClosed,
    }
}

pub use client::{Client, ClientBuilder, Subscription};
pub use config::{ClientConfig, GcConfig, DEFAULT_MAX_AGE_MS};
pub use error::ClientError;
pub use fetch::{FetchExchange, OngoingTask, FETCH_EXCHANGE};
pub use pipeline::Pipeline;
pub use registry::{Subscriber, SubscriberId, SubscriberRegistry};
pub use scheduler::TokioScheduler;
pub use watch::{QuerySnapshot, QueryStatus, QueryWatch};
