//! Error types shared by the engine and its exchanges.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while building a [`Request`](crate::request::Request).
///
/// These are construction errors: they are returned synchronously and never
/// reach the pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The input already sets a field the engine owns.
    #[error("request.{field} must not be set by the caller")]
    KindPreset {
        /// The offending field name
        field: String,
    },

    /// `request.id` has a type other than string or null.
    #[error("request.id must be a non-empty string or null, got {0}")]
    InvalidId(String),

    /// `request.id` is an empty string.
    #[error("request.id must not be empty")]
    EmptyId,
}

/// A failure produced by a fetch handler or its stream.
///
/// Delivered to subscribers through `reject` operations. Cloning is cheap so
/// every subscriber of a key sees the same error value.
///
/// # Examples
///
/// ```
/// use composable_query_core::error::FetchError;
///
/// let err = FetchError::msg("upstream unavailable");
/// assert_eq!(err.to_string(), "upstream unavailable");
/// ```
#[derive(Clone)]
pub struct FetchError(Arc<anyhow::Error>);

impl FetchError {
    /// Wrap any error.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self(Arc::new(error.into()))
    }

    /// Build an error from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    /// Access the underlying error.
    #[must_use]
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Whether two handles point at the same underlying error.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FetchError").field(&self.0).finish()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for FetchError {}

impl From<anyhow::Error> for FetchError {
    fn from(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

/// An exchange failed while handling an operation.
///
/// Exchange errors are not caught by the pipeline. They propagate out of
/// `pipe_through` to whoever injected the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The named exchange rejected the operation.
    #[error("exchange '{exchange}' failed: {message}")]
    Failed {
        /// Exchange name
        exchange: String,
        /// What went wrong
        message: String,
    },
}

impl ExchangeError {
    /// Create a failure attributed to `exchange`.
    pub fn failed(exchange: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            exchange: exchange.into(),
            message: message.into(),
        }
    }
}
