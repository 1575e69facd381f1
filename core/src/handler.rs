//! The pluggable fetch handler contract.
//!
//! The engine never knows how data is fetched. It calls a [`FetchHandler`]
//! with the request and a [`FetchContext`], and adapts the returned
//! [`FetchOutcome`] according to the request's kind.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Future, Stream, StreamExt};
use serde_json::Value;
use std::fmt;

use crate::cache::CacheView;
use crate::error::FetchError;
use crate::request::Request;

/// What a handler can see besides the request.
#[derive(Debug, Clone)]
pub struct FetchContext {
    /// Read-only cache, e.g. to page forward from the last value
    pub cache: CacheView,
}

/// What a handler produces.
///
/// The engine adapts any outcome to the request's kind: a single-shot
/// request takes at most one value from it, a stream request turns every
/// value into a `buffer` operation.
pub enum FetchOutcome {
    /// Already resolved. `Ok(None)` means "no value".
    Ready(Result<Option<Value>, FetchError>),
    /// Resolves once.
    Future(BoxFuture<'static, Result<Value, FetchError>>),
    /// Produces values over time.
    Stream(BoxStream<'static, Result<Value, FetchError>>),
}

impl FetchOutcome {
    /// Resolved with a value.
    #[must_use]
    pub const fn value(value: Value) -> Self {
        Self::Ready(Ok(Some(value)))
    }

    /// Resolved without a value.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Ready(Ok(None))
    }

    /// Failed synchronously.
    #[must_use]
    pub const fn error(error: FetchError) -> Self {
        Self::Ready(Err(error))
    }

    /// Box a future.
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        Self::Future(Box::pin(future))
    }

    /// Box a stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, FetchError>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// Whether the outcome is available without awaiting.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// View any outcome as a stream of values.
    ///
    /// `Ready(Ok(None))` becomes an empty stream.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, Result<Value, FetchError>> {
        match self {
            Self::Ready(Ok(None)) => futures::stream::empty().boxed(),
            Self::Ready(Ok(Some(value))) => futures::stream::once(async move { Ok(value) }).boxed(),
            Self::Ready(Err(error)) => futures::stream::once(async move { Err(error) }).boxed(),
            Self::Future(future) => futures::stream::once(future).boxed(),
            Self::Stream(stream) => stream,
        }
    }
}

impl fmt::Debug for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("FetchOutcome::Ready").field(result).finish(),
            Self::Future(_) => write!(f, "FetchOutcome::Future(<future>)"),
            Self::Stream(_) => write!(f, "FetchOutcome::Stream(<stream>)"),
        }
    }
}

/// The embedding application's fetch function.
///
/// Implemented for any `Fn(&Request, FetchContext) -> FetchOutcome`.
///
/// # Example
///
/// ```
/// use composable_query_core::handler::{FetchContext, FetchHandler, FetchOutcome};
/// use composable_query_core::Request;
/// use serde_json::json;
///
/// let handler = |req: &Request, _ctx: FetchContext| {
///     let params = req.params().clone();
///     FetchOutcome::future(async move { Ok(json!({ "echo": params })) })
/// };
/// # fn assert_handler<H: FetchHandler>(_: &H) {}
/// # assert_handler(&handler);
/// ```
pub trait FetchHandler: Send + Sync {
    /// Start fetching `request`.
    fn fetch(&self, request: &Request, context: FetchContext) -> FetchOutcome;
}

impl<F> FetchHandler for F
where
    F: Fn(&Request, FetchContext) -> FetchOutcome + Send + Sync,
{
    fn fetch(&self, request: &Request, context: FetchContext) -> FetchOutcome {
        self(request, context)
    }
}
