//! The replica boundary consumed by the scheduler.
//!
//! A [`ReplicaHandle`] is an opaque reference to one worker instance.
//! The scheduler only ever reads identity metadata and probes the
//! replica's queue length; forwarding the actual request to the chosen
//! replica is the caller's job.

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;

use crate::types::RouterResult;

/// Opaque reference to one worker replica.
///
/// Identity metadata (`replica_id`, `node_id`, `availability_zone`,
/// `model_ids`, `max_concurrent_requests`) is immutable for the lifetime
/// of a handle; the scheduler snapshots it when the active set is
/// updated. Liveness is managed externally: replicas appear and
/// disappear only through
/// [`update_replicas`](crate::PowerOfTwoScheduler::update_replicas).
///
/// # Contract for implementors
///
/// - `replica_id` must be unique and stable across the replica's life.
/// - `node_id` returns the physical host identifier; an empty string
///   means unknown, which opts the replica out of same-node routing.
/// - `max_concurrent_requests` must be greater than zero. A replica is
///   acceptable for assignment only while its observed queue length is
///   strictly below this threshold.
/// - `probe_queue_length` must respond within `deadline` or fail; the
///   scheduler additionally enforces the deadline locally and drops the
///   in-flight probe when it expires.
#[async_trait]
pub trait ReplicaHandle: Send + Sync {
    /// Unique, stable replica identifier.
    fn replica_id(&self) -> &str;

    /// Physical host identifier; empty means unknown.
    fn node_id(&self) -> &str;

    /// Coarse locality domain, if known.
    fn availability_zone(&self) -> Option<&str>;

    /// The model ids this replica currently has loaded.
    fn model_ids(&self) -> HashSet<String>;

    /// Saturation threshold for this replica.
    fn max_concurrent_requests(&self) -> u32;

    /// Ask the replica for its current queue length.
    ///
    /// The number of requests the replica has accepted but not yet
    /// completed. `deadline` bounds how long the replica may spend
    /// answering; implementations should propagate it to the far side so
    /// work is not wasted on an answer nobody is waiting for.
    ///
    /// # Errors
    ///
    /// [`RouterError::ProbeTimeout`](crate::RouterError::ProbeTimeout) or
    /// [`RouterError::ProbeTransport`](crate::RouterError::ProbeTransport);
    /// both are recovered locally by the scheduler.
    async fn probe_queue_length(&self, deadline: Duration) -> RouterResult<u32>;
}
