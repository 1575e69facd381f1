//! Scriptable fetch handlers.
//!
//! Each handler is `Clone`; keep one clone in the test and hand the other to
//! the client, then drive results from the test body.

use composable_query_core::{FetchContext, FetchError, FetchHandler, FetchOutcome, Request};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wraps a handler and counts how often, and with what, it was called.
#[derive(Clone)]
pub struct CountingHandler {
    inner: Arc<dyn FetchHandler>,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl CountingHandler {
    /// Count calls to `inner`.
    pub fn new<H>(inner: H) -> Self
    where
        H: FetchHandler + 'static,
    {
        Self {
            inner: Arc::new(inner),
            calls: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<Request> {
        lock(&self.requests).clone()
    }
}

impl FetchHandler for CountingHandler {
    fn fetch(&self, request: &Request, context: FetchContext) -> FetchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.clone());
        self.inner.fetch(request, context)
    }
}

type Reply = oneshot::Sender<Result<Value, FetchError>>;

/// Single-value handler whose results the test supplies.
///
/// Every call returns a future that stays pending until the test resolves
/// it with [`resolve_next`](Self::resolve_next) or
/// [`reject_next`](Self::reject_next), oldest call first.
#[derive(Clone, Default)]
pub struct ControlledHandler {
    replies: Arc<Mutex<Vec<Reply>>>,
    calls: Arc<AtomicUsize>,
    contexts: Arc<Mutex<Vec<FetchContext>>>,
}

impl ControlledHandler {
    /// Create a handler with no outstanding calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls whose future is still alive and unresolved.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.replies).iter().filter(|r| !r.is_closed()).count()
    }

    /// Calls whose future was dropped before being resolved.
    #[must_use]
    pub fn canceled(&self) -> usize {
        lock(&self.replies).iter().filter(|r| r.is_closed()).count()
    }

    /// The context passed to the most recent call.
    #[must_use]
    pub fn last_context(&self) -> Option<FetchContext> {
        lock(&self.contexts).last().cloned()
    }

    fn reply(&self, result: Result<Value, FetchError>) -> bool {
        let reply = {
            let mut replies = lock(&self.replies);
            replies
                .iter()
                .position(|r| !r.is_closed())
                .map(|index| replies.remove(index))
        };
        reply.is_some_and(|reply| reply.send(result).is_ok())
    }

    /// Resolve the oldest live call with `value`. Returns whether one existed.
    pub fn resolve_next(&self, value: Value) -> bool {
        self.reply(Ok(value))
    }

    /// Fail the oldest live call. Returns whether one existed.
    pub fn reject_next(&self, message: &str) -> bool {
        self.reply(Err(FetchError::msg(message.to_string())))
    }
}

impl FetchHandler for ControlledHandler {
    fn fetch(&self, _request: &Request, context: FetchContext) -> FetchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.contexts).push(context);

        let (reply, receiver) = oneshot::channel();
        lock(&self.replies).push(reply);

        FetchOutcome::future(async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(FetchError::msg("controlled fetch abandoned")))
        })
    }
}

impl std::fmt::Debug for ControlledHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlledHandler")
            .field("calls", &self.calls())
            .field("pending", &self.pending())
            .finish()
    }
}

type Feed = mpsc::UnboundedSender<Result<Value, FetchError>>;

/// Streaming handler whose values the test pushes.
///
/// Every call opens a new source; [`push`](Self::push),
/// [`fail`](Self::fail) and [`finish`](Self::finish) act on the most recent
/// one.
#[derive(Clone, Default)]
pub struct StreamHandler {
    feeds: Arc<Mutex<Vec<Feed>>>,
    calls: Arc<AtomicUsize>,
}

impl StreamHandler {
    /// Create a handler with no open sources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn send(&self, item: Result<Value, FetchError>) -> bool {
        lock(&self.feeds)
            .last()
            .is_some_and(|feed| feed.send(item).is_ok())
    }

    /// Deliver a value on the latest source. Returns whether it was open.
    pub fn push(&self, value: Value) -> bool {
        self.send(Ok(value))
    }

    /// Fail the latest source. Returns whether it was open.
    pub fn fail(&self, message: &str) -> bool {
        self.send(Err(FetchError::msg(message.to_string())))
    }

    /// End the latest source cleanly.
    pub fn finish(&self) {
        lock(&self.feeds).pop();
    }

    /// Whether the latest source is still being consumed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        lock(&self.feeds).last().is_some_and(|feed| !feed.is_closed())
    }
}

impl FetchHandler for StreamHandler {
    fn fetch(&self, _request: &Request, _context: FetchContext) -> FetchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let (feed, mut receiver) = mpsc::unbounded_channel();
        lock(&self.feeds).push(feed);

        FetchOutcome::stream(async_stream::stream! {
            while let Some(item) = receiver.recv().await {
                yield item;
            }
        })
    }
}

impl std::fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandler")
            .field("calls", &self.calls())
            .field("open", &self.is_open())
            .finish()
    }
}
