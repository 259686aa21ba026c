//! Core type definitions for the replica router.
//!
//! This module defines the data structures shared across the scheduler,
//! cache, and replica boundary: pending requests, the FIFO ordering key,
//! and the crate-wide error type.
//!
//! All plain data types implement serde serialization so that request
//! metadata can cross process boundaries for tracing and debugging.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for requests awaiting assignment.
///
/// Opaque to the scheduler; used only for tracing and log correlation.
pub type RequestId = Uuid;

/// A request awaiting assignment to a replica.
///
/// A `PendingRequest` is created by the caller, owned by the scheduler
/// while queued, and released when assigned or cancelled. The creation
/// timestamp establishes its position in the global FIFO order; on a
/// retry the caller submits the same request again so that the original
/// position is preserved.
///
/// # Examples
/// ```
/// use replica_router::PendingRequest;
///
/// let plain = PendingRequest::new();
/// assert!(plain.model_id.is_none());
///
/// let tagged = PendingRequest::with_model_id("m1");
/// assert_eq!(tagged.model_id.as_deref(), Some("m1"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequest {
    /// Creation timestamp in seconds (injected-clock domain).
    ///
    /// Set at construction from the wall clock; the scheduler overwrites
    /// it with its own clock on first submission and preserves it on
    /// retries so that retried requests keep their original FIFO slot.
    pub created_at: f64,

    /// Optional multiplex tag attaching the request to the subset of
    /// replicas that have the named model loaded.
    pub model_id: Option<String>,

    /// Opaque identifier used only for tracing.
    pub request_id: RequestId,
}

impl PendingRequest {
    /// Create a request with no model-id tag.
    pub fn new() -> Self {
        Self {
            created_at: crate::clock::unix_time_s(),
            model_id: None,
            request_id: Uuid::new_v4(),
        }
    }

    /// Create a request tagged with a model id.
    pub fn with_model_id(model_id: impl Into<String>) -> Self {
        Self {
            model_id: Some(model_id.into()),
            ..Self::new()
        }
    }

    /// Override the creation timestamp.
    ///
    /// Used by callers that re-submit a request (`is_retry = true`) and
    /// by tests that need deterministic ordering.
    #[must_use]
    pub fn with_created_at(mut self, created_at: f64) -> Self {
        self.created_at = created_at;
        self
    }
}

impl Default for PendingRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Total-order key for the pending queue: creation time, then a
/// tie-breaking sequence number assigned at enqueue.
///
/// Two requests enqueued with the same `created_at` keep their arrival
/// order; otherwise the earlier `created_at` always sorts first,
/// regardless of the order the scheduler received them in.
#[derive(Debug, Clone, Copy)]
pub struct FifoKey {
    created_at: f64,
    seq: u64,
}

impl FifoKey {
    /// Build a key from a creation timestamp and an enqueue sequence
    /// number.
    pub fn new(created_at: f64, seq: u64) -> Self {
        Self { created_at, seq }
    }

    /// The creation timestamp this key sorts by.
    pub fn created_at(&self) -> f64 {
        self.created_at
    }
}

impl PartialEq for FifoKey {
    fn eq(&self, other: &Self) -> bool {
        self.created_at.total_cmp(&other.created_at) == Ordering::Equal && self.seq == other.seq
    }
}

impl Eq for FifoKey {}

impl PartialOrd for FifoKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FifoKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .total_cmp(&other.created_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl fmt::Display for FifoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}#{}", self.created_at, self.seq)
    }
}

/// Errors produced by the replica router.
///
/// Nothing here is fatal: probe failures are recovered locally by the
/// scheduler, and the only error a caller of
/// [`choose_replica_for_request`](crate::PowerOfTwoScheduler::choose_replica_for_request)
/// can observe is [`RouterError::Cancelled`].
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// A replica did not answer a queue-length probe within the current
    /// deadline. Recovered locally: the replica is treated as
    /// unacceptable for the attempt and the deadline is backed off.
    #[error("queue length probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    /// A replica was unreachable. Recovered locally by evicting its
    /// cache entry; the external health monitor is responsible for
    /// eventually removing dead replicas from the active set.
    #[error("replica transport error: {0}")]
    ProbeTransport(String),

    /// The active replica set is empty. Never surfaced to callers; the
    /// scheduling task waits on the replicas-updated signal instead.
    #[error("no replicas available")]
    NoReplicasAvailable,

    /// The caller abandoned the assignment before it completed.
    #[error("request was cancelled before assignment")]
    Cancelled,

    /// A configuration value could not be parsed.
    ///
    /// Only produced by [`RouterConfig::from_env`](crate::RouterConfig::from_env);
    /// out-of-range values passed to the constructor are clamped with a
    /// warning instead.
    #[error("invalid configuration: {0}")]
    Misconfiguration(String),

    /// A metric could not be registered.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Convenience alias for router operations.
pub type RouterResult<T> = Result<T, RouterError>;
