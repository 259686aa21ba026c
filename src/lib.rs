//! Replica Router - Power-of-Two-Choices Request Scheduler
//!
//! This library implements the request-to-replica scheduling core of an
//! online inference serving system. It assigns incoming requests to one
//! of N interchangeable worker replicas such that load is balanced by
//! observed queue length, locality and model-id affinity preferences are
//! honored, and the system stays responsive under replica churn, probe
//! timeouts, and bursty load.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Pending Queue  │───▶│    Scheduler    │───▶│ ReplicaHandle   │
//! │ (FIFO by time)  │    │  (two-choice)   │    │  (probe/assign) │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!         │                       │                       │
//!         ▼                       ▼                       ▼
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Cancellation   │    │ QueueLengthCache│    │   Prometheus    │
//! │  (future drop)  │    │  (staleness)    │    │    Metrics      │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - **[`PowerOfTwoScheduler`]**: candidate sampling, probe
//!   orchestration, FIFO fulfillment, deadline backoff
//! - **[`ReplicaHandle`]**: the boundary trait a worker must implement
//! - **[`QueueLengthCache`]**: last-known queue lengths with staleness
//! - **[`Clock`]**: injectable time source for deterministic tests
//! - **[`RouterConfig`]**: locality, affinity, deadline, and cache
//!   tunables (struct literal or `REPLICA_ROUTER_*` environment)
//!
//! ## What this crate does not do
//!
//! Forwarding the request to the chosen replica, health-monitoring the
//! replica set, and shipping metrics anywhere are the integrator's job.
//! The scheduler consumes a replica set via
//! [`PowerOfTwoScheduler::update_replicas`] and hands back
//! [`ReplicaHandle`]s; everything else stays outside.

#![deny(missing_docs, unsafe_code, unused_qualifications)]
#![warn(clippy::all, clippy::pedantic)]

pub mod cache;
pub mod clock;
pub mod metrics;
pub mod replica;
pub mod scheduler;
pub mod types;

// Re-export commonly used types for convenience
pub use cache::QueueLengthCache;
pub use clock::{Clock, MockClock, SystemClock};
pub use metrics::RouterMetrics;
pub use replica::ReplicaHandle;
pub use scheduler::{PowerOfTwoScheduler, RouterConfig};
pub use types::{FifoKey, PendingRequest, RequestId, RouterError, RouterResult};

/// Version of the replica router crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Simple build information (version only, no git metadata).
pub const BUILD_INFO: &str = concat!("version=", env!("CARGO_PKG_VERSION"));
