//! # Composable Query Core
//!
//! Core types for the Composable Query engine.
//!
//! The engine orchestrates asynchronous, key-addressable requests: it
//! deduplicates concurrent fetches of the same request, caches the latest
//! value per key, supports single-shot and streaming responses, allows
//! cancellation, and garbage-collects keys nobody observes.
//!
//! This crate holds the pure pieces. The client that ties them together
//! lives in `composable-query-runtime`.
//!
//! ## Core Concepts
//!
//! - **Request**: What to fetch, keyed by a [`RequestId`]
//! - **Operation**: Commands (`fetch`, `cancel`) and events (`buffer`,
//!   `complete`, `reject`, `dispose`)
//! - **State machine**: Pure `(state, operation) → next state`
//! - **Cache**: Latest value per key, read-only outside the client
//! - **Exchange**: Middleware unit of the command pipeline
//! - **Fetch handler**: The application's pluggable fetch function
//! - **Scheduler**: Injected timers for the inactivity GC
//!
//! ## Data Flow
//!
//! ```text
//! client.fetch(req) ─► apply (state-gated) ─► exchange ─► … ─► task manager
//!                                                                  │
//!        subscribers ◄── state + cache update ◄──── emit ◄─────────┘
//! ```

pub mod cache;
pub mod environment;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod operation;
pub mod request;
pub mod state;

// Re-export commonly used types
pub use cache::{CacheStore, CacheView};
pub use environment::{ScheduledTask, Scheduler, TimerHandle};
pub use error::{ExchangeError, FetchError, RequestError};
pub use exchange::{
    exchange_fn, Emitter, Exchange, ExchangeHandler, ExchangeOptions, Forward,
};
pub use handler::{FetchContext, FetchHandler, FetchOutcome};
pub use operation::{Operation, OperationKind};
pub use request::{Request, RequestId, RequestKind};
pub use serde_json::{json, Value};
pub use state::{transition, Observation, QueryState, Transition};
