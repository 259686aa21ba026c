//! Prometheus metrics for the replica router.
//!
//! Exposes scheduler internals (running scheduling tasks, pending
//! requests, tasks sitting in backoff) alongside counters for probe
//! traffic and assignment outcomes. The registry is owned by the
//! scheduler and exposed in-process; serving it over HTTP (or pushing it
//! anywhere) is the integrator's job.

use prometheus::{
    histogram_opts, opts, Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder,
};

use crate::types::RouterResult;

/// Metric handles registered against a private registry.
///
/// All handles are cheaply cloneable and safe to touch from concurrent
/// scheduling tasks.
#[derive(Clone)]
pub struct RouterMetrics {
    registry: Registry,

    /// Number of scheduling tasks currently running.
    pub scheduling_tasks: IntGauge,
    /// Number of requests waiting for a replica assignment.
    pub pending_requests: IntGauge,
    /// Number of scheduling tasks currently sleeping in backoff.
    ///
    /// A sustained non-zero value means the replica set is saturated;
    /// autoscalers can key off this.
    pub tasks_in_backoff: IntGauge,

    /// Total requests assigned to a replica.
    pub assignments_total: IntCounter,
    /// Total queue-length probes issued, foreground and background.
    pub probes_total: IntCounter,
    /// Probes that missed their response deadline.
    pub probe_timeouts_total: IntCounter,
    /// Probes that failed with a transport error.
    pub probe_errors_total: IntCounter,
    /// Assignment attempts satisfied from the queue-length cache.
    pub cache_hits_total: IntCounter,

    /// Seconds between enqueue and replica assignment.
    pub time_to_assignment_seconds: Histogram,
}

impl RouterMetrics {
    /// Create and register all router metrics on a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Metrics`](crate::RouterError::Metrics) if
    /// registration fails (duplicate metric names; cannot happen with a
    /// private registry).
    pub fn new() -> RouterResult<Self> {
        let registry = Registry::new();

        let scheduling_tasks = IntGauge::with_opts(opts!(
            "router_scheduling_tasks",
            "Number of scheduling tasks currently running"
        ))?;
        let pending_requests = IntGauge::with_opts(opts!(
            "router_pending_requests",
            "Number of requests waiting for a replica assignment"
        ))?;
        let tasks_in_backoff = IntGauge::with_opts(opts!(
            "router_scheduling_tasks_in_backoff",
            "Number of scheduling tasks currently sleeping in backoff"
        ))?;
        let assignments_total = IntCounter::with_opts(opts!(
            "router_assignments_total",
            "Total requests assigned to a replica"
        ))?;
        let probes_total = IntCounter::with_opts(opts!(
            "router_queue_len_probes_total",
            "Total queue-length probes issued"
        ))?;
        let probe_timeouts_total = IntCounter::with_opts(opts!(
            "router_queue_len_probe_timeouts_total",
            "Queue-length probes that missed their response deadline"
        ))?;
        let probe_errors_total = IntCounter::with_opts(opts!(
            "router_queue_len_probe_errors_total",
            "Queue-length probes that failed with a transport error"
        ))?;
        let cache_hits_total = IntCounter::with_opts(opts!(
            "router_queue_len_cache_hits_total",
            "Assignment attempts satisfied from the queue-length cache"
        ))?;
        let time_to_assignment_seconds = Histogram::with_opts(histogram_opts!(
            "router_time_to_assignment_seconds",
            "Seconds between request enqueue and replica assignment",
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
        ))?;

        registry.register(Box::new(scheduling_tasks.clone()))?;
        registry.register(Box::new(pending_requests.clone()))?;
        registry.register(Box::new(tasks_in_backoff.clone()))?;
        registry.register(Box::new(assignments_total.clone()))?;
        registry.register(Box::new(probes_total.clone()))?;
        registry.register(Box::new(probe_timeouts_total.clone()))?;
        registry.register(Box::new(probe_errors_total.clone()))?;
        registry.register(Box::new(cache_hits_total.clone()))?;
        registry.register(Box::new(time_to_assignment_seconds.clone()))?;

        Ok(Self {
            registry,
            scheduling_tasks,
            pending_requests,
            tasks_in_backoff,
            assignments_total,
            probes_total,
            probe_timeouts_total,
            probe_errors_total,
            cache_hits_total,
            time_to_assignment_seconds,
        })
    }

    /// The registry all router metrics are registered on.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the current metric values in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Metrics`](crate::RouterError::Metrics) if
    /// encoding fails.
    pub fn export_text(&self) -> RouterResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for RouterMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterMetrics")
            .field("metrics", &self.registry.gather().len())
            .finish()
    }
}
