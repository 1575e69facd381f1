//! Prometheus metrics for observability and monitoring.
//!
//! The client and the fetch task manager record metrics for:
//! - Commands issued through the client
//! - Task lifecycle (start, dedup, cancel, finish)
//! - Inactivity garbage collection
//! - Cache size
//!
//! Recording is always on. Without an installed recorder the `metrics` macros
//! are no-ops. [`MetricsExporter`] installs a Prometheus recorder once per
//! process and can serve the scrape endpoint itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use composable_query_runtime::metrics::MetricsExporter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve `/metrics` on port 9090
//! let handle = MetricsExporter::new()
//!     .with_http_listener("0.0.0.0:9090".parse()?)
//!     .install()?;
//!
//! // Or render the body from the application's own endpoint
//! let body = handle.render();
//! # Ok(())
//! # }
//! ```

use composable_query_core::RequestKind;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Histogram buckets for task durations, in seconds.
const TASK_DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0,
];

static INSTALLED: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Errors from metrics installation.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The Prometheus builder rejected its configuration
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Another global recorder is already in place
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
    /// Serving the scrape endpoint needs a tokio runtime to run on
    #[error("Serving metrics over HTTP requires a tokio runtime")]
    NoRuntime,
}

/// Installs the Prometheus recorder for the engine's metrics.
///
/// The first successful [`install`](Self::install) in a process wins; later
/// calls return the same handle and ignore their own settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsExporter {
    listen: Option<SocketAddr>,
}

impl MetricsExporter {
    /// An exporter that only records. Render through the returned handle.
    #[must_use]
    pub const fn new() -> Self {
        Self { listen: None }
    }

    /// Also serve the scrape endpoint on `addr`.
    #[must_use]
    pub const fn with_http_listener(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    /// Describe the metrics and install the global recorder.
    ///
    /// With a listener, the HTTP exporter is spawned on the current tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::NoRuntime`] when a listener is configured
    /// outside a tokio runtime, and [`MetricsError::Install`] when a recorder
    /// not installed by this type is already in place.
    pub fn install(self) -> Result<PrometheusHandle, MetricsError> {
        let runtime = match self.listen {
            Some(_) => Some(
                tokio::runtime::Handle::try_current().map_err(|_| MetricsError::NoRuntime)?,
            ),
            None => None,
        };

        let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = installed.as_ref() {
            tracing::debug!("Metrics recorder already installed, reusing it");
            return Ok(handle.clone());
        }

        register_metrics();
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                TASK_DURATION_BUCKETS,
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = match (self.listen, runtime) {
            (Some(addr), Some(runtime)) => {
                let (recorder, exporter) = builder
                    .with_http_listener(addr)
                    .build()
                    .map_err(|e| MetricsError::Build(e.to_string()))?;
                let handle = recorder.handle();
                metrics::set_global_recorder(recorder).map_err(|_| {
                    MetricsError::Install("a global metrics recorder is already set".to_string())
                })?;
                runtime.spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!(%addr, "Metrics listener stopped");
                    }
                });
                tracing::info!(%addr, "Serving Prometheus metrics");
                handle
            }
            _ => {
                let handle = builder
                    .install_recorder()
                    .map_err(|e| MetricsError::Install(e.to_string()))?;
                tracing::info!("Prometheus metrics recorder installed");
                handle
            }
        };

        *installed = Some(handle.clone());
        Ok(handle)
    }
}

/// The handle installed by [`MetricsExporter::install`], if any.
#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    INSTALLED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Register all metric descriptions.
fn register_metrics() {
    // Client
    describe_counter!(
        "query_fetch_total",
        "Total number of fetch commands accepted by clients"
    );
    describe_gauge!(
        "query_cache_entries",
        "Number of keys with a cached value"
    );

    // Tasks
    describe_counter!(
        "query_tasks_started_total",
        "Total number of fetch tasks started"
    );
    describe_counter!(
        "query_tasks_deduplicated_total",
        "Total number of fetches joined to an ongoing task"
    );
    describe_counter!(
        "query_tasks_canceled_total",
        "Total number of tasks canceled before finishing"
    );
    describe_counter!(
        "query_tasks_stale_events_total",
        "Total number of events dropped because their task was retired"
    );
    describe_counter!(
        "query_rejections_total",
        "Total number of tasks that ended in rejection"
    );
    describe_histogram!(
        "query_task_duration_seconds",
        "Time from task start to its terminal event"
    );

    // GC
    describe_counter!(
        "query_gc_disposed_total",
        "Total number of keys disposed by inactivity GC"
    );
}

/// Client command metrics recorder.
pub struct ClientMetrics;

impl ClientMetrics {
    /// Record an accepted fetch command.
    pub fn record_fetch(kind: RequestKind) {
        counter!("query_fetch_total", "kind" => kind.to_string()).increment(1);
    }

    /// Record the current number of cached keys.
    #[allow(clippy::cast_precision_loss)] // gauge values are f64
    pub fn record_cache_entries(entries: usize) {
        gauge!("query_cache_entries").set(entries as f64);
    }
}

/// Task lifecycle metrics recorder.
pub struct TaskMetrics;

impl TaskMetrics {
    /// Record a task start.
    pub fn record_started(kind: RequestKind) {
        counter!("query_tasks_started_total", "kind" => kind.to_string()).increment(1);
    }

    /// Record a fetch that joined an ongoing task.
    pub fn record_deduplicated() {
        counter!("query_tasks_deduplicated_total").increment(1);
    }

    /// Record a canceled task.
    pub fn record_canceled() {
        counter!("query_tasks_canceled_total").increment(1);
    }

    /// Record an event dropped from a retired task.
    pub fn record_stale() {
        counter!("query_tasks_stale_events_total").increment(1);
    }

    /// Record a task reaching its terminal event.
    pub fn record_finished(duration: Duration, rejected: bool) {
        histogram!("query_task_duration_seconds").record(duration.as_secs_f64());
        if rejected {
            counter!("query_rejections_total").increment(1);
        }
    }
}

/// Inactivity GC metrics recorder.
pub struct GcMetrics;

impl GcMetrics {
    /// Record a key disposed by the GC.
    pub fn record_disposed() {
        counter!("query_gc_disposed_total").increment(1);
    }
}
