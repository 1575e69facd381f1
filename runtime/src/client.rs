//! The orchestrator.
//!
//! A [`Client`] owns the cache, the per-key states, the subscriber registry
//! and the inactivity timers. Commands go in through [`Client::fetch`] and
//! friends, are gated by the state machine and piped through the exchange
//! chain. Events come back through the shared emitter, update cache and state,
//! and are fanned out to the key's subscribers.
//!
//! # Example
//!
//! ```
//! use composable_query_core::{FetchContext, FetchOutcome, QueryState, Request};
//! use composable_query_runtime::Client;
//! use serde_json::json;
//!
//! let client = Client::builder(|req: &Request, _ctx: FetchContext| {
//!     FetchOutcome::value(json!({ "echo": req.params().clone() }))
//! })
//! .build();
//!
//! let req = Request::single(json!({ "query": "me" })).unwrap();
//! let sub = client.subscribe(&req, |state, data, _err| {
//!     println!("{state}: {data:?}");
//! }).unwrap();
//!
//! assert_eq!(client.state_of(req.id()), Some(QueryState::Completed));
//! sub.unsubscribe();
//! ```

use composable_query_core::environment::{Scheduler, TimerHandle};
use composable_query_core::exchange::{Emitter, Exchange, ExchangeOptions};
use composable_query_core::handler::FetchHandler;
use composable_query_core::{
    transition, CacheStore, CacheView, ExchangeError, FetchError, Observation, Operation,
    QueryState, Request, RequestId, Transition,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::metrics::{ClientMetrics, GcMetrics};
use crate::pipeline::Pipeline;
use crate::registry::{Subscriber, SubscriberId, SubscriberRegistry};
use crate::scheduler::TokioScheduler;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    handler: Arc<dyn FetchHandler>,
    exchanges: Vec<Box<dyn Exchange>>,
    config: ClientConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl ClientBuilder {
    /// Start building a client around `handler`.
    pub fn new<H>(handler: H) -> Self
    where
        H: FetchHandler + 'static,
    {
        Self {
            handler: Arc::new(handler),
            exchanges: Vec::new(),
            config: ClientConfig::default(),
            scheduler: None,
        }
    }

    /// Append an exchange. Exchanges run in the order they are added, before
    /// the fetch task manager.
    #[must_use]
    pub fn exchange<E>(mut self, exchange: E) -> Self
    where
        E: Exchange + 'static,
    {
        self.exchanges.push(Box::new(exchange));
        self
    }

    /// Append several boxed exchanges.
    #[must_use]
    pub fn exchanges(mut self, exchanges: impl IntoIterator<Item = Box<dyn Exchange>>) -> Self {
        self.exchanges.extend(exchanges);
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub const fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Shorthand for setting the inactivity max age.
    #[must_use]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.config = self.config.with_max_age(max_age);
        self
    }

    /// Use `scheduler` for GC timers. Defaults to [`TokioScheduler`].
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Compose the pipeline and create the client.
    #[must_use]
    pub fn build(self) -> Client {
        let Self {
            handler,
            exchanges,
            config,
            scheduler,
        } = self;
        let scheduler = scheduler.unwrap_or_else(|| Arc::new(TokioScheduler::new()));

        let inner = Arc::new_cyclic(|this: &Weak<ClientInner>| {
            let target = this.clone();
            let emit = Emitter::new(move |op| match target.upgrade() {
                Some(inner) => inner.emit(op),
                None => tracing::trace!(op = %op, "Client dropped, discarding event"),
            });

            let cache = CacheStore::new();
            let options = ExchangeOptions {
                emit,
                cache: cache.view(),
            };
            let pipeline = Pipeline::new(exchanges, handler, &options);

            ClientInner {
                this: this.clone(),
                pipeline,
                cache,
                states: Mutex::new(HashMap::new()),
                registry: Mutex::new(SubscriberRegistry::new()),
                timers: Mutex::new(HashMap::new()),
                timer_seq: AtomicU64::new(0),
                scheduler,
                config,
            }
        });

        tracing::debug!(
            exchanges = ?inner.pipeline.names(),
            max_age_ms = config.gc.max_age_ms,
            "Client created"
        );
        Client { inner }
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("exchanges", &self.exchanges.iter().map(|e| e.name()).collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Request orchestration client.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Start building a client around `handler`.
    pub fn builder<H>(handler: H) -> ClientBuilder
    where
        H: FetchHandler + 'static,
    {
        ClientBuilder::new(handler)
    }

    /// A client with default configuration and no extra exchanges.
    pub fn new<H>(handler: H) -> Self
    where
        H: FetchHandler + 'static,
    {
        ClientBuilder::new(handler).build()
    }

    /// Fetch `request`, optionally subscribing to its key.
    ///
    /// Without a subscriber and with nobody else listening, the key starts
    /// its inactivity countdown right away.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Exchange`] if an exchange rejected the fetch. The
    /// key's state is left as it was and `subscriber` is not registered.
    #[tracing::instrument(
        skip_all,
        name = "client_fetch",
        fields(request_id = %request.id(), kind = %request.kind())
    )]
    pub fn fetch(
        &self,
        request: &Request,
        subscriber: Option<Subscriber>,
    ) -> Result<Subscription, ClientError> {
        let key = request.id();

        let subscriber_id = match subscriber {
            Some(subscriber) => {
                let (id, change) = lock(&self.inner.registry).add(key, subscriber);
                if let Some(change) = change {
                    self.inner.observe(key, change);
                }
                Some(id)
            }
            None => {
                if lock(&self.inner.registry).count(key) == 0 {
                    self.inner.observe(key, Observation::Inactive);
                }
                None
            }
        };

        ClientMetrics::record_fetch(request.kind());
        if let Err(error) = self.inner.apply(Operation::fetch(request.clone())) {
            if let Some(id) = subscriber_id {
                self.inner.unsubscribe(key, id);
            }
            return Err(error.into());
        }

        Ok(Subscription {
            client: self.clone(),
            request: request.clone(),
            subscriber: Mutex::new(subscriber_id),
        })
    }

    /// Fetch `request` and subscribe `callback` to its key.
    ///
    /// # Errors
    ///
    /// See [`Client::fetch`].
    pub fn subscribe<F>(&self, request: &Request, callback: F) -> Result<Subscription, ClientError>
    where
        F: Fn(QueryState, Option<&Value>, Option<&FetchError>) + Send + Sync + 'static,
    {
        self.fetch(request, Some(Arc::new(callback)))
    }

    /// Warm the cache for `request` without subscribing.
    ///
    /// The key is garbage-collected after the max age unless someone
    /// subscribes in the meantime.
    ///
    /// # Errors
    ///
    /// See [`Client::fetch`].
    pub fn prefetch(&self, request: &Request) -> Result<(), ClientError> {
        self.fetch(request, None).map(drop)
    }

    /// Cancel the key's task, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Exchange`] if an exchange rejected the cancel.
    pub fn cancel(&self, request: &Request) -> Result<(), ClientError> {
        self.inner.apply(Operation::cancel(request.clone()))?;
        Ok(())
    }

    /// Drop everything the client holds for `id`.
    ///
    /// Any ongoing task is canceled. Subscribers are kept and are not
    /// notified.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Exchange`] if an exchange rejected the dispose.
    pub fn dispose(&self, id: &RequestId) -> Result<(), ClientError> {
        self.inner.apply(Operation::dispose(id.clone()))?;
        Ok(())
    }

    /// Current state of the key, `None` if untracked.
    #[must_use]
    pub fn state_of(&self, id: &RequestId) -> Option<QueryState> {
        lock(&self.inner.states).get(id).copied()
    }

    /// Cached value for the key.
    #[must_use]
    pub fn cached(&self, id: &RequestId) -> Option<Value> {
        self.inner.cache.get(id)
    }

    /// Number of subscribers for the key.
    #[must_use]
    pub fn subscriber_count(&self, id: &RequestId) -> usize {
        lock(&self.inner.registry).count(id)
    }

    /// Whether the key has a pending inactivity timer.
    #[must_use]
    pub fn pending_gc(&self, id: &RequestId) -> bool {
        lock(&self.inner.timers).contains_key(id)
    }

    /// Read-only view of the cache.
    #[must_use]
    pub fn cache(&self) -> CacheView {
        self.inner.cache.view()
    }

    /// The client's configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pipeline", &self.inner.pipeline)
            .field("config", &self.inner.config)
            .field("cached_keys", &self.inner.cache.len())
            .finish_non_exhaustive()
    }
}

struct PendingGc {
    generation: u64,
    handle: TimerHandle,
}

struct ClientInner {
    this: Weak<ClientInner>,
    pipeline: Pipeline,
    cache: CacheStore,
    states: Mutex<HashMap<RequestId, QueryState>>,
    registry: Mutex<SubscriberRegistry>,
    timers: Mutex<HashMap<RequestId, PendingGc>>,
    timer_seq: AtomicU64,
    scheduler: Arc<dyn Scheduler>,
    config: ClientConfig,
}

impl ClientInner {
    /// Gate a command through the state machine and pipe it.
    fn apply(&self, op: Operation) -> Result<(), ExchangeError> {
        let key = op.key().clone();
        // A cancel takes effect once the task is retired, so a value still in
        // delivery cannot land on top of it
        let cancel = matches!(op, Operation::Cancel(_)).then(|| op.clone());

        let (previous, recorded) = {
            let mut states = lock(&self.states);
            let current = states.get(&key).copied();
            let next = transition(current, &op);

            if current != Some(QueryState::Streaming) && next.is_noop(current) {
                tracing::trace!(request_id = %key, op = op.name(), "Operation has no effect, dropping");
                return Ok(());
            }

            let recorded = match next {
                Transition::To(state) if op.is_command() && cancel.is_none() => {
                    states.insert(key.clone(), state);
                    Some(state)
                }
                _ => None,
            };
            (current, recorded)
        };

        let result = self.pipeline.pipe_through(op);

        if let (Ok(()), Some(cancel)) = (&result, cancel) {
            let mut states = lock(&self.states);
            // A key disposed meanwhile stays untracked
            let next = states.get(&key).copied().map(|current| transition(Some(current), &cancel));
            if let Some(Transition::To(state)) = next {
                states.insert(key.clone(), state);
            }
        }

        if let (Err(error), Some(recorded)) = (&result, recorded) {
            let mut states = lock(&self.states);
            // Events emitted before the failure take precedence
            if states.get(&key) == Some(&recorded) {
                match previous {
                    Some(state) => states.insert(key.clone(), state),
                    None => states.remove(&key),
                };
            }
            tracing::warn!(request_id = %key, error = %error, "Pipeline rejected operation");
        }
        result
    }

    /// Handle an event coming back from the pipeline.
    fn emit(&self, op: Operation) {
        let key = op.key().clone();

        if let Some(data) = op.cache_update() {
            self.cache.set(key.clone(), data.clone());
            ClientMetrics::record_cache_entries(self.cache.len());
        }

        let next = {
            let mut states = lock(&self.states);
            let next = transition(states.get(&key).copied(), &op);
            match next {
                Transition::To(state) => {
                    states.insert(key.clone(), state);
                }
                Transition::Disposed => {
                    states.remove(&key);
                }
            }
            next
        };

        match next {
            Transition::Disposed => {
                self.cache.delete(&key);
                ClientMetrics::record_cache_entries(self.cache.len());
                if let Some(pending) = lock(&self.timers).remove(&key) {
                    pending.handle.cancel();
                }
                tracing::debug!(request_id = %key, "Key disposed");
            }
            Transition::To(state) => {
                let subscribers = lock(&self.registry).subscribers(&key);
                tracing::trace!(
                    request_id = %key,
                    op = op.name(),
                    state = %state,
                    subscribers = subscribers.len(),
                    "Notifying subscribers"
                );
                if subscribers.is_empty() {
                    return;
                }
                let data = self.cache.get(&key);
                for subscriber in subscribers {
                    subscriber(state, data.as_ref(), op.error());
                }
            }
        }
    }

    /// React to a key gaining its first or losing its last subscriber.
    fn observe(&self, key: &RequestId, observation: Observation) {
        let mut timers = lock(&self.timers);
        if let Some(pending) = timers.remove(key) {
            pending.handle.cancel();
        }

        match observation {
            Observation::Active => {
                tracing::trace!(request_id = %key, "Key observed");
            }
            Observation::Inactive => {
                let generation = self.timer_seq.fetch_add(1, Ordering::Relaxed) + 1;
                let max_age = self.config.gc.max_age();
                let this = self.this.clone();
                let target = key.clone();

                let handle = self.scheduler.schedule(
                    max_age,
                    Box::new(move || {
                        if let Some(inner) = this.upgrade() {
                            inner.collect(&target, generation);
                        }
                    }),
                );
                timers.insert(key.clone(), PendingGc { generation, handle });
                tracing::debug!(
                    request_id = %key,
                    max_age_ms = self.config.gc.max_age_ms,
                    "Key unobserved, scheduling disposal"
                );
            }
        }
    }

    /// Inactivity timer fired.
    fn collect(&self, key: &RequestId, generation: u64) {
        {
            let mut timers = lock(&self.timers);
            match timers.get(key) {
                Some(pending) if pending.generation == generation => {
                    timers.remove(key);
                }
                _ => return,
            }
        }

        if lock(&self.registry).count(key) > 0 {
            tracing::trace!(request_id = %key, "Key observed again, skipping disposal");
            return;
        }

        GcMetrics::record_disposed();
        tracing::debug!(request_id = %key, "Disposing inactive key");
        if let Err(error) = self.apply(Operation::dispose(key.clone())) {
            tracing::warn!(request_id = %key, error = %error, "Inactive key disposal failed");
        }
    }

    fn unsubscribe(&self, key: &RequestId, id: SubscriberId) {
        let change = lock(&self.registry).remove(key, id);
        if let Some(change) = change {
            self.observe(key, change);
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for (_, pending) in lock(&self.timers).drain() {
            pending.handle.cancel();
        }
    }
}

/// Handle returned by [`Client::fetch`].
///
/// Dropping it keeps the subscriber registered; call
/// [`unsubscribe`](Self::unsubscribe) to stop receiving updates.
#[must_use = "dropping a Subscription does not unsubscribe"]
pub struct Subscription {
    client: Client,
    request: Request,
    subscriber: Mutex<Option<SubscriberId>>,
}

impl Subscription {
    /// The request this subscription was created for.
    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.request
    }

    /// Cancel the key's ongoing task.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Exchange`] if an exchange rejected the cancel.
    pub fn cancel(&self) -> Result<(), ClientError> {
        self.client.cancel(&self.request)
    }

    /// Remove this subscription's callback. Other subscribers of the key are
    /// unaffected. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        let id = lock(&self.subscriber).take();
        if let Some(id) = id {
            tracing::trace!(request_id = %self.request.id(), subscriber = %id, "Unsubscribing");
            self.client.inner.unsubscribe(self.request.id(), id);
        }
    }

    /// Whether the key still has work in flight.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.client
            .state_of(self.request.id())
            .is_some_and(QueryState::is_in_flight)
    }

    /// Fetch the key again so the handler can page forward from the cached
    /// value.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotAllowed`] when no data has arrived for the
    /// key yet, and [`ClientError::Exchange`] if an exchange rejected the
    /// fetch.
    pub fn fetch_more(&self) -> Result<(), ClientError> {
        let id = self.request.id();
        if !self.client.inner.cache.view().contains(id) {
            tracing::warn!(request_id = %id, "fetch_more called before any data arrived");
            return Err(ClientError::NotAllowed {
                id: id.to_string(),
                reason: "fetch_more requires data to have been received".to_string(),
            });
        }

        ClientMetrics::record_fetch(self.request.kind());
        self.client.inner.apply(Operation::fetch(self.request.clone()))?;
        Ok(())
    }

    /// The client this subscription belongs to.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("request_id", self.request.id())
            .field("subscriber", &*lock(&self.subscriber))
            .finish_non_exhaustive()
    }
}
