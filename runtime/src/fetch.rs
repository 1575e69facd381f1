//! The fetch/cancel task manager.
//!
//! This is the terminal exchange of every pipeline. It owns at most one
//! [`OngoingTask`] per request key, invokes the application's
//! [`FetchHandler`], and turns the handler's outcome into `buffer`,
//! `complete` and `reject` events.
//!
//! # Outcome adaptation
//!
//! - **Single-shot**: the first value is emitted as `complete(data)`. There is
//!   no intermediate `buffer`. An outcome with no value completes with `None`.
//! - **Stream**: every value is emitted as `buffer(data)`. A clean end emits
//!   `complete(None)`, which leaves the cached value alone.
//! - Any failure emits `reject(error)` and ends the task.
//!
//! # Stale events
//!
//! A task that was canceled, disposed or replaced is retired. Emitting and
//! retiring are serialised per task, so retiring waits for an emission already
//! under way and nothing the task produces afterwards reaches the client, even
//! when the task runs on another worker thread.

use composable_query_core::exchange::{
    Emitter, Exchange, ExchangeHandler, ExchangeOptions, Forward,
};
use composable_query_core::handler::{FetchContext, FetchHandler, FetchOutcome};
use composable_query_core::{
    CacheView, ExchangeError, FetchError, Operation, Request, RequestId, RequestKind,
};
use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Instant;

use crate::metrics::TaskMetrics;

/// Name of the fetch exchange.
pub const FETCH_EXCHANGE: &str = "fetch";

type TaskMap = Arc<Mutex<HashMap<RequestId, OngoingTask>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exchange that runs fetches. Appended to every pipeline.
#[derive(Clone)]
pub struct FetchExchange {
    handler: Arc<dyn FetchHandler>,
}

impl FetchExchange {
    /// Create the exchange around the application's handler.
    #[must_use]
    pub fn new(handler: Arc<dyn FetchHandler>) -> Self {
        Self { handler }
    }
}

impl Exchange for FetchExchange {
    fn name(&self) -> &str {
        FETCH_EXCHANGE
    }

    fn init(&self, options: ExchangeOptions, next: Forward) -> Box<dyn ExchangeHandler> {
        Box::new(TaskManager {
            handler: Arc::clone(&self.handler),
            emit: options.emit,
            cache: options.cache,
            next,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        })
    }
}

/// Serialises a task's emissions against its retirement.
///
/// An emission holds the slot for its whole trip through the client,
/// subscriber callbacks included. Retiring waits for the slot, so a retired
/// task has nothing in flight and never emits again. A callback that retires
/// the task it is being notified by runs on the holding thread and only sets
/// the flag.
#[derive(Default)]
struct DeliveryGate {
    retired: AtomicBool,
    finished: AtomicBool,
    slot: Mutex<()>,
    holder: Mutex<Option<ThreadId>>,
}

impl DeliveryGate {
    fn enter(&self) -> Option<Delivering<'_>> {
        let slot = lock(&self.slot);
        if self.retired.load(Ordering::Acquire) {
            return None;
        }
        *lock(&self.holder) = Some(thread::current().id());
        Some(Delivering {
            gate: self,
            _slot: slot,
        })
    }

    fn retire(&self) {
        let held_here = *lock(&self.holder) == Some(thread::current().id());
        if held_here {
            self.retired.store(true, Ordering::Release);
            return;
        }
        let _slot = lock(&self.slot);
        self.retired.store(true, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        !self.finished.load(Ordering::Acquire) && !self.retired.load(Ordering::Acquire)
    }
}

struct Delivering<'a> {
    gate: &'a DeliveryGate,
    _slot: MutexGuard<'a, ()>,
}

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        *lock(&self.gate.holder) = None;
    }
}

/// The live unit of work backing one fetch.
pub struct OngoingTask {
    generation: u64,
    gate: Arc<DeliveryGate>,
    abort: Option<AbortHandle>,
}

impl OngoingTask {
    /// Whether the task is still producing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.gate.is_open() && !self.abort.as_ref().is_some_and(AbortHandle::is_aborted)
    }

    /// Tear down the underlying source.
    ///
    /// Waits for an emission in progress on another thread. Once this returns
    /// the task emits nothing further.
    pub fn cancel(self) {
        self.gate.retire();
        if let Some(abort) = self.abort {
            abort.abort();
        }
    }
}

impl std::fmt::Debug for OngoingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OngoingTask")
            .field("generation", &self.generation)
            .field("running", &self.is_running())
            .finish()
    }
}

/// The initialised fetch exchange.
struct TaskManager {
    handler: Arc<dyn FetchHandler>,
    emit: Emitter,
    cache: CacheView,
    next: Forward,
    tasks: TaskMap,
    generations: AtomicU64,
}

impl TaskManager {
    fn cancel(&self, key: &RequestId) {
        let task = lock(&self.tasks).remove(key);
        match task {
            Some(task) => {
                tracing::debug!(request_id = %key, generation = task.generation, "Canceling task");
                TaskMetrics::record_canceled();
                task.cancel();
            }
            None => tracing::trace!(request_id = %key, "Cancel with no ongoing task"),
        }
    }

    fn fetch(&self, request: Request) -> Result<(), ExchangeError> {
        let key = request.id().clone();

        if lock(&self.tasks).get(&key).is_some_and(OngoingTask::is_running) {
            tracing::debug!(request_id = %key, "Joining ongoing task");
            TaskMetrics::record_deduplicated();
            return Ok(());
        }

        let outcome = self.handler.fetch(
            &request,
            FetchContext {
                cache: self.cache.clone(),
            },
        );

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let gate = Arc::new(DeliveryGate::default());
        let flight = Flight {
            tasks: Arc::clone(&self.tasks),
            key: key.clone(),
            generation,
            gate: Arc::clone(&gate),
            emit: self.emit.clone(),
            started: Instant::now(),
        };
        TaskMetrics::record_started(request.kind());

        match outcome {
            FetchOutcome::Ready(result) => {
                self.register(&key, OngoingTask {
                    generation,
                    gate,
                    abort: None,
                });
                tracing::trace!(request_id = %key, generation, "Handler resolved synchronously");
                flight.resolve(&request, result);
                Ok(())
            }
            outcome => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    return Err(ExchangeError::failed(
                        FETCH_EXCHANGE,
                        "asynchronous fetch outcomes require a tokio runtime",
                    ));
                };

                let (abort, registration) = AbortHandle::new_pair();
                self.register(&key, OngoingTask {
                    generation,
                    gate,
                    abort: Some(abort),
                });
                tracing::debug!(request_id = %key, generation, kind = %request.kind(), "Spawning task");

                let driver = Abortable::new(flight.drive(request, outcome), registration);
                runtime.spawn(driver);
                Ok(())
            }
        }
    }

    fn register(&self, key: &RequestId, task: OngoingTask) {
        // A task stays in the map until its terminal event has been delivered,
        // so a fetch issued from that delivery replaces it here
        let previous = lock(&self.tasks).insert(key.clone(), task);
        if let Some(previous) = previous {
            tracing::trace!(request_id = %key, generation = previous.generation, "Replacing finished task");
            previous.cancel();
        }
    }
}

impl ExchangeHandler for TaskManager {
    fn handle(&self, op: Operation) -> Result<(), ExchangeError> {
        match op {
            Operation::Fetch(request) => self.fetch(request),
            Operation::Cancel(request) => {
                self.cancel(request.id());
                Ok(())
            }
            Operation::Dispose { ref id } => {
                self.cancel(id);
                self.next.forward(op)
            }
            other => self.next.forward(other),
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        let tasks: Vec<OngoingTask> = lock(&self.tasks).drain().map(|(_, task)| task).collect();
        for task in tasks {
            task.cancel();
        }
    }
}

/// Bookkeeping carried by one task while it runs.
struct Flight {
    tasks: TaskMap,
    key: RequestId,
    generation: u64,
    gate: Arc<DeliveryGate>,
    emit: Emitter,
    started: Instant,
}

impl Flight {
    /// Emit a non-terminal event unless the task was retired.
    fn deliver(&self, op: Operation) -> bool {
        let Some(_delivering) = self.gate.enter() else {
            self.stale(&op);
            return false;
        };
        self.emit.emit(op);
        true
    }

    /// Emit the terminal event, then drop the task from the map.
    fn finish(&self, op: Operation) {
        {
            let Some(_delivering) = self.gate.enter() else {
                self.stale(&op);
                return;
            };
            self.gate.finished.store(true, Ordering::Release);
            TaskMetrics::record_finished(self.started.elapsed(), op.error().is_some());
            tracing::debug!(
                request_id = %self.key,
                generation = self.generation,
                op = op.name(),
                "Task finished"
            );
            self.emit.emit(op);
        }

        let mut tasks = lock(&self.tasks);
        if tasks
            .get(&self.key)
            .is_some_and(|task| task.generation == self.generation)
        {
            tasks.remove(&self.key);
        }
    }

    fn stale(&self, op: &Operation) {
        TaskMetrics::record_stale();
        tracing::trace!(
            request_id = %self.key,
            generation = self.generation,
            op = op.name(),
            "Dropping event from retired task"
        );
    }

    /// Settle a synchronously resolved outcome.
    fn resolve(&self, request: &Request, result: Result<Option<Value>, FetchError>) {
        match (request.kind(), result) {
            (_, Err(error)) => self.finish(Operation::reject(request.clone(), error)),
            (RequestKind::SingleShot, Ok(data)) => {
                self.finish(Operation::complete(request.clone(), data));
            }
            (RequestKind::Stream, Ok(data)) => {
                if let Some(data) = data {
                    if !self.deliver(Operation::buffer(request.clone(), data)) {
                        return;
                    }
                }
                self.finish(Operation::complete(request.clone(), None));
            }
        }
    }

    /// Drive an asynchronous outcome to its end.
    async fn drive(self, request: Request, outcome: FetchOutcome) {
        let mut source = outcome.into_stream();

        match request.kind() {
            RequestKind::SingleShot => {
                let op = match source.next().await {
                    Some(Ok(data)) => Operation::complete(request, Some(data)),
                    Some(Err(error)) => Operation::reject(request, error),
                    None => Operation::complete(request, None),
                };
                // At most one value is taken
                drop(source);
                self.finish(op);
            }
            RequestKind::Stream => {
                while let Some(item) = source.next().await {
                    match item {
                        Ok(data) => {
                            if !self.deliver(Operation::buffer(request.clone(), data)) {
                                return;
                            }
                        }
                        Err(error) => {
                            self.finish(Operation::reject(request, error));
                            return;
                        }
                    }
                }
                self.finish(Operation::complete(request, None));
            }
        }
    }
}
