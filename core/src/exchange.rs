//! Exchanges: the middleware units of the request pipeline.
//!
//! An [`Exchange`] is initialised once per client with [`ExchangeOptions`] and
//! a [`Forward`] to the next unit in the chain. The resulting
//! [`ExchangeHandler`] sees every command the client injects. For each
//! operation it either consumes it or forwards it unchanged.
//!
//! Results never travel down the chain. Every exchange shares the same
//! [`Emitter`], which delivers events straight back to the client.
//!
//! # Example
//!
//! ```
//! use composable_query_core::exchange::{exchange_fn, Exchange};
//! use composable_query_core::Operation;
//!
//! // Log every operation, then pass it on.
//! let logger = exchange_fn("logger", |_options, next, op: Operation| {
//!     tracing::debug!(op = %op, "saw operation");
//!     next.forward(op)
//! });
//! assert_eq!(logger.name(), "logger");
//! ```

use std::fmt;
use std::sync::Arc;

use crate::cache::CacheView;
use crate::error::ExchangeError;
use crate::operation::Operation;

/// Delivery channel from exchanges back to the client.
///
/// Cloning is cheap; every clone reaches the same client.
#[derive(Clone)]
pub struct Emitter(Arc<dyn Fn(Operation) + Send + Sync>);

impl Emitter {
    /// Wrap a delivery function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Operation) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Deliver an event to the client.
    pub fn emit(&self, op: Operation) {
        (self.0)(op);
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Emitter(<fn>)")
    }
}

/// What every exchange receives at initialisation.
#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    /// Shared channel back to the client
    pub emit: Emitter,
    /// Read-only cache
    pub cache: CacheView,
}

/// An initialised exchange, ready to handle operations.
pub trait ExchangeHandler: Send + Sync {
    /// Consume `op` or forward it to the next unit.
    ///
    /// # Errors
    ///
    /// Any [`ExchangeError`] propagates unchanged to the caller that injected
    /// the operation.
    fn handle(&self, op: Operation) -> Result<(), ExchangeError>;
}

/// Handle to the next unit of the chain.
#[derive(Clone)]
pub struct Forward(Arc<dyn ExchangeHandler>);

impl Forward {
    /// Wrap the next handler.
    pub fn new(next: Arc<dyn ExchangeHandler>) -> Self {
        Self(next)
    }

    /// The end of the chain: operations nobody consumed go back to the client.
    #[must_use]
    pub fn to_emitter(emit: Emitter) -> Self {
        Self(Arc::new(EmitterSink(emit)))
    }

    /// Pass `op` to the next unit.
    ///
    /// # Errors
    ///
    /// Propagates the next unit's error.
    pub fn forward(&self, op: Operation) -> Result<(), ExchangeError> {
        self.0.handle(op)
    }
}

impl fmt::Debug for Forward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Forward(<handler>)")
    }
}

struct EmitterSink(Emitter);

impl ExchangeHandler for EmitterSink {
    fn handle(&self, op: Operation) -> Result<(), ExchangeError> {
        self.0.emit(op);
        Ok(())
    }
}

/// A pipeline middleware unit.
pub trait Exchange: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Build this exchange's handler for one client.
    fn init(&self, options: ExchangeOptions, next: Forward) -> Box<dyn ExchangeHandler>;
}

/// Exchange built from a closure. See [`exchange_fn`].
pub struct FnExchange<F> {
    name: String,
    f: Arc<F>,
}

/// Turn a closure into an [`Exchange`].
///
/// The closure receives the exchange options, the forward handle and the
/// operation. Returning without calling `next.forward(op)` consumes it.
pub fn exchange_fn<F>(name: impl Into<String>, f: F) -> FnExchange<F>
where
    F: Fn(&ExchangeOptions, &Forward, Operation) -> Result<(), ExchangeError>
        + Send
        + Sync
        + 'static,
{
    FnExchange {
        name: name.into(),
        f: Arc::new(f),
    }
}

impl<F> Exchange for FnExchange<F>
where
    F: Fn(&ExchangeOptions, &Forward, Operation) -> Result<(), ExchangeError>
        + Send
        + Sync
        + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, options: ExchangeOptions, next: Forward) -> Box<dyn ExchangeHandler> {
        Box::new(FnHandler {
            options,
            next,
            f: Arc::clone(&self.f),
        })
    }
}

struct FnHandler<F> {
    options: ExchangeOptions,
    next: Forward,
    f: Arc<F>,
}

impl<F> ExchangeHandler for FnHandler<F>
where
    F: Fn(&ExchangeOptions, &Forward, Operation) -> Result<(), ExchangeError> + Send + Sync,
{
    fn handle(&self, op: Operation) -> Result<(), ExchangeError> {
        (self.f)(&self.options, &self.next, op)
    }
}
