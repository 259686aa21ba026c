//! Shared test utilities for the replica router test suite.
//!
//! Provides:
//! - A scriptable fake replica with controllable queue-length responses
//! - Ordered request submission helpers (spawn + wait for enqueue)
//! - A polling wait-for-condition helper
//! - Tracing setup for test debugging

#![allow(dead_code)]

use async_trait::async_trait;
use replica_router::{
    PendingRequest, PowerOfTwoScheduler, ReplicaHandle, RouterConfig, RouterError, RouterResult,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Node id the test scheduler claims to run on.
pub const SCHEDULER_NODE_ID: &str = "scheduler-node";
/// Availability zone the test scheduler claims to run in.
pub const SCHEDULER_AZ: &str = "scheduler-az";
/// Default saturation threshold for fake replicas.
pub const DEFAULT_MAX_CONCURRENT: u32 = 10;

/// Install a tracing subscriber honoring `RUST_LOG`, once.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Base configuration for tests: short model-id match window so
/// fallback paths run quickly.
pub fn test_config() -> RouterConfig {
    RouterConfig {
        model_id_match_timeout: Duration::from_millis(10),
        ..RouterConfig::default()
    }
}

struct ResponseState {
    queue_len: u32,
    error: Option<String>,
    has_response: bool,
}

/// A replica whose queue-length responses are scripted by the test.
///
/// A probe blocks until a response has been set. With
/// `reset_after_response` each set response is consumed by exactly one
/// probe, which lets a test release assignments one at a time.
pub struct FakeReplica {
    replica_id: String,
    node_id: String,
    availability_zone: Option<String>,
    model_ids: HashSet<String>,
    max_concurrent: u32,
    reset_after_response: bool,

    state: Mutex<ResponseState>,
    response_ready: Notify,
    probe_deadlines: Mutex<Vec<Duration>>,
    probe_cancelled: AtomicBool,
}

impl FakeReplica {
    pub fn new(replica_id: &str) -> Arc<Self> {
        Arc::new(Self {
            replica_id: replica_id.to_string(),
            node_id: String::new(),
            availability_zone: None,
            model_ids: HashSet::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            reset_after_response: false,
            state: Mutex::new(ResponseState {
                queue_len: 0,
                error: None,
                has_response: false,
            }),
            response_ready: Notify::new(),
            probe_deadlines: Mutex::new(Vec::new()),
            probe_cancelled: AtomicBool::new(false),
        })
    }

    /// Builder-style constructor for the less common knobs.
    pub fn builder(replica_id: &str) -> FakeReplicaBuilder {
        FakeReplicaBuilder {
            replica_id: replica_id.to_string(),
            node_id: String::new(),
            availability_zone: None,
            model_ids: HashSet::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            reset_after_response: false,
        }
    }

    /// Script the next queue-length response. Unblocks waiting probes.
    pub fn set_queue_len_response(&self, queue_len: u32) {
        {
            let mut state = self.state.lock().unwrap();
            state.queue_len = queue_len;
            state.error = None;
            state.has_response = true;
        }
        self.response_ready.notify_waiters();
    }

    /// Script a transport failure. Unblocks waiting probes.
    pub fn set_error_response(&self, message: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.error = Some(message.to_string());
            state.has_response = true;
        }
        self.response_ready.notify_waiters();
    }

    /// Deadlines of every probe issued so far, in order.
    pub fn probe_deadline_history(&self) -> Vec<Duration> {
        self.probe_deadlines.lock().unwrap().clone()
    }

    /// Number of probes issued so far.
    pub fn num_probes(&self) -> usize {
        self.probe_deadlines.lock().unwrap().len()
    }

    /// Whether any probe was dropped before completing.
    pub fn probe_was_cancelled(&self) -> bool {
        self.probe_cancelled.load(Ordering::SeqCst)
    }
}

/// Builder for [`FakeReplica`].
pub struct FakeReplicaBuilder {
    replica_id: String,
    node_id: String,
    availability_zone: Option<String>,
    model_ids: HashSet<String>,
    max_concurrent: u32,
    reset_after_response: bool,
}

impl FakeReplicaBuilder {
    pub fn node_id(mut self, node_id: &str) -> Self {
        self.node_id = node_id.to_string();
        self
    }

    pub fn availability_zone(mut self, az: &str) -> Self {
        self.availability_zone = Some(az.to_string());
        self
    }

    pub fn model_ids<const N: usize>(mut self, ids: [&str; N]) -> Self {
        self.model_ids = ids.into_iter().map(String::from).collect();
        self
    }

    pub fn max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn reset_after_response(mut self) -> Self {
        self.reset_after_response = true;
        self
    }

    pub fn build(self) -> Arc<FakeReplica> {
        Arc::new(FakeReplica {
            replica_id: self.replica_id,
            node_id: self.node_id,
            availability_zone: self.availability_zone,
            model_ids: self.model_ids,
            max_concurrent: self.max_concurrent,
            reset_after_response: self.reset_after_response,
            state: Mutex::new(ResponseState {
                queue_len: 0,
                error: None,
                has_response: false,
            }),
            response_ready: Notify::new(),
            probe_deadlines: Mutex::new(Vec::new()),
            probe_cancelled: AtomicBool::new(false),
        })
    }
}

/// Sets the cancellation flag unless the probe completed normally.
struct CancelGuard<'a>(&'a AtomicBool);

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReplicaHandle for FakeReplica {
    fn replica_id(&self) -> &str {
        &self.replica_id
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn availability_zone(&self) -> Option<&str> {
        self.availability_zone.as_deref()
    }

    fn model_ids(&self) -> HashSet<String> {
        self.model_ids.clone()
    }

    fn max_concurrent_requests(&self) -> u32 {
        self.max_concurrent
    }

    async fn probe_queue_length(&self, deadline: Duration) -> RouterResult<u32> {
        self.probe_deadlines.lock().unwrap().push(deadline);
        let guard = CancelGuard(&self.probe_cancelled);

        loop {
            let notified = self.response_ready.notified();
            tokio::pin!(notified);
            // Register before checking state so a response set between
            // the check and the await is not missed.
            let _ = notified.as_mut().enable();

            let result = {
                let mut state = self.state.lock().unwrap();
                if state.has_response {
                    if self.reset_after_response {
                        state.has_response = false;
                    }
                    Some(match &state.error {
                        Some(message) => Err(RouterError::ProbeTransport(message.clone())),
                        None => Ok(state.queue_len),
                    })
                } else {
                    None
                }
            };

            if let Some(result) = result {
                std::mem::forget(guard);
                return result;
            }
            notified.await;
        }
    }
}

/// Upcast fake replicas to the handle type the scheduler consumes.
pub fn as_handles(replicas: &[&Arc<FakeReplica>]) -> Vec<Arc<dyn ReplicaHandle>> {
    replicas
        .iter()
        .map(|r| Arc::clone(r) as Arc<dyn ReplicaHandle>)
        .collect()
}

/// Spawn an assignment as a separate task (so it can be observed and
/// aborted without dropping it immediately).
pub fn spawn_choose(
    scheduler: &PowerOfTwoScheduler,
    request: PendingRequest,
    is_retry: bool,
) -> JoinHandle<RouterResult<Arc<dyn ReplicaHandle>>> {
    let scheduler = scheduler.clone();
    tokio::spawn(async move { scheduler.choose_replica_for_request(request, is_retry).await })
}

/// Spawn an assignment and wait until the scheduler has actually
/// enqueued it, so submission order equals FIFO order in tests that
/// depend on it.
pub async fn spawn_choose_enqueued(
    scheduler: &PowerOfTwoScheduler,
    request: PendingRequest,
    is_retry: bool,
    expected_pending: usize,
) -> JoinHandle<RouterResult<Arc<dyn ReplicaHandle>>> {
    let handle = spawn_choose(scheduler, request, is_retry);
    let scheduler = scheduler.clone();
    wait_for_condition("request enqueued", Duration::from_secs(5), move || {
        scheduler.num_pending_requests() >= expected_pending
    })
    .await;
    handle
}

/// Poll `condition` every 10ms until it holds, panicking after `timeout`.
pub async fn wait_for_condition(
    description: &str,
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within {timeout:?}: {description}");
}

/// Wait until the scheduler has no pending requests and no scheduling
/// tasks; every test should end in this state once its assignments
/// are drained.
pub async fn assert_drained(scheduler: &PowerOfTwoScheduler) {
    let s = scheduler.clone();
    wait_for_condition(
        "scheduling tasks and pending requests drained",
        Duration::from_secs(10),
        move || s.curr_num_scheduling_tasks() == 0 && s.num_pending_requests() == 0,
    )
    .await;
}
