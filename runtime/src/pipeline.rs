//! Exchange pipeline composition.
//!
//! Exchanges are composed in the order the caller supplies them and the
//! fetch task manager is always appended last. The list is folded
//! right-to-left: each exchange is initialised with a [`Forward`] to the one
//! after it, and the last unit forwards to the client's emitter so operations
//! nobody consumed (such as `dispose`) still reach the client.
//!
//! ```text
//! pipe_through(op) ─► exchange[0] ─► exchange[1] ─► … ─► fetch ─► emit
//! ```

use composable_query_core::exchange::{Exchange, ExchangeHandler, ExchangeOptions, Forward};
use composable_query_core::handler::FetchHandler;
use composable_query_core::{ExchangeError, Operation};
use std::sync::Arc;

use crate::fetch::FetchExchange;

/// A composed chain of exchanges with a single entry point.
pub struct Pipeline {
    entry: Forward,
    names: Vec<String>,
}

impl Pipeline {
    /// Compose `exchanges` followed by the fetch task manager for `handler`.
    #[must_use]
    pub fn new(
        exchanges: Vec<Box<dyn Exchange>>,
        handler: Arc<dyn FetchHandler>,
        options: &ExchangeOptions,
    ) -> Self {
        let mut chain = exchanges;
        chain.push(Box::new(FetchExchange::new(handler)));
        Self::compose(chain, options)
    }

    /// Compose `chain` exactly as given.
    #[must_use]
    pub fn compose(chain: Vec<Box<dyn Exchange>>, options: &ExchangeOptions) -> Self {
        let names: Vec<String> = chain.iter().map(|e| e.name().to_string()).collect();

        let entry = chain
            .iter()
            .rev()
            .fold(Forward::to_emitter(options.emit.clone()), |next, exchange| {
                tracing::debug!(exchange = exchange.name(), "Initialising exchange");
                let handler: Arc<dyn ExchangeHandler> = Arc::from(exchange.init(options.clone(), next));
                Forward::new(handler)
            });

        tracing::debug!(exchanges = ?names, "Pipeline composed");
        Self { entry, names }
    }

    /// Inject an operation at the head of the chain.
    ///
    /// # Errors
    ///
    /// Exchange errors are not caught and propagate to the caller.
    pub fn pipe_through(&self, op: Operation) -> Result<(), ExchangeError> {
        tracing::trace!(op = %op, "Piping operation");
        self.entry.forward(op)
    }

    /// Exchange names in chain order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("exchanges", &self.names).finish_non_exhaustive()
    }
}
