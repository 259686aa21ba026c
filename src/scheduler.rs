//! Power-of-two-choices replica scheduler.
//!
//! This module implements the core of the request router: assignment of
//! incoming requests to one of N interchangeable replicas, balanced by
//! observed queue length and overlaid with locality and model-id
//! affinity preferences.
//!
//! ## Architecture
//!
//! ```text
//! caller ──choose_replica_for_request──► pending queue (FIFO by creation)
//!                                             │
//!                               scheduling tasks (≤ min(2·|R|, cap))
//!                                             │
//!                    candidate pool (model id → node → AZ → all)
//!                                             │
//!                sample two ─► queue lengths (cache or probe) ─► shorter
//!                                             │
//!                              fulfill current FIFO head
//! ```
//!
//! ## Scheduling model
//!
//! Each pending request adds one claim to a claim queue. A scheduling
//! task claims one request per cycle and uses its model id to steer
//! candidate selection, but the replica it finds is always handed to the
//! *current head* of the FIFO order. This decoupling of task identity
//! from request identity is what keeps retried requests in their
//! original creation order. Tasks exit when there is nothing left to
//! claim.
//!
//! ## Failure handling
//!
//! Probe timeouts grow the per-cycle response deadline exponentially up
//! to a configured maximum; failed attempts sleep on a fixed backoff
//! ladder before resampling. Replicas that leave the active set while a
//! probe is in flight are cancelled and their late answers discarded.
//! Nothing here is fatal: an empty replica set simply parks the
//! scheduling tasks on the replicas-updated signal.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::QueueLengthCache;
use crate::clock::{Clock, SystemClock};
use crate::metrics::RouterMetrics;
use crate::replica::ReplicaHandle;
use crate::types::{FifoKey, PendingRequest, RequestId, RouterError, RouterResult};

/// Sleep ladder between failed assignment attempts.
///
/// The index saturates at the last entry. The leading zero makes the
/// first retry immediate so a transient rejection costs nothing.
const BACKOFF_SEQUENCE: &[Duration] = &[
    Duration::from_millis(0),
    Duration::from_millis(25),
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_millis(1000),
];

/// A request that has waited this long for an assignment gets a warning
/// log with its id, once per scheduling cycle.
const SLOW_SCHEDULING_WARNING_S: f64 = 30.0;

/// Scheduler configuration.
///
/// Tunables for locality routing, model-id affinity, probe deadlines,
/// and the queue-length cache. All values are per-scheduler, not
/// per-call; a scheduler routes requests for exactly one deployment.
///
/// Out-of-range values are clamped with a warning at construction;
/// misconfiguration is never fatal at runtime.
///
/// # Examples
/// ```
/// use replica_router::RouterConfig;
///
/// let config = RouterConfig {
///     prefer_local_node: true,
///     self_node_id: "node-1".to_string(),
///     ..RouterConfig::default()
/// };
/// assert!(config.prefer_local_node);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Prefer replicas colocated on this scheduler's node.
    pub prefer_local_node: bool,

    /// Prefer replicas in this scheduler's availability zone.
    pub prefer_local_az: bool,

    /// The node this scheduler runs on; empty disables same-node
    /// matching even when `prefer_local_node` is set.
    pub self_node_id: String,

    /// The availability zone this scheduler runs on.
    pub self_az: Option<String>,

    /// Consult the queue-length cache before probing.
    ///
    /// Cache reads never substitute for a probe when the cached value is
    /// at or above the replica's capacity: a saturated-looking replica
    /// is always re-probed.
    pub use_queue_len_cache: bool,

    /// Initial deadline for a queue-length probe.
    pub queue_len_response_deadline: Duration,

    /// Upper bound the probe deadline grows to under repeated timeouts.
    ///
    /// If configured below the initial deadline, the initial deadline is
    /// used for every probe (the deadline never shrinks).
    pub queue_len_response_deadline_max: Duration,

    /// Absolute cap on concurrently running scheduling tasks.
    ///
    /// The effective cap is `min(2 × replica count, this value)`.
    /// Defaults to `usize::MAX`, i.e. only the replica-derived bound.
    pub max_scheduling_tasks_hard_cap: usize,

    /// How long a request with a model id waits for a replica carrying
    /// that model before falling back to other replicas. The window is
    /// jittered up to 2× so concurrent cycles do not fall back in
    /// lockstep.
    pub model_id_match_timeout: Duration,

    /// How long a queue-length cache entry stays fresh.
    pub queue_len_cache_staleness: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            prefer_local_node: false,
            prefer_local_az: false,
            self_node_id: String::new(),
            self_az: None,
            use_queue_len_cache: false,
            queue_len_response_deadline: Duration::from_millis(100),
            queue_len_response_deadline_max: Duration::from_secs(5),
            max_scheduling_tasks_hard_cap: usize::MAX,
            model_id_match_timeout: Duration::from_secs(1),
            queue_len_cache_staleness: Duration::from_secs(10),
        }
    }
}

impl RouterConfig {
    /// Build a configuration from `REPLICA_ROUTER_*` environment
    /// variables, falling back to [`RouterConfig::default`] for anything
    /// unset.
    ///
    /// Recognized variables: `PREFER_LOCAL_NODE`, `PREFER_LOCAL_AZ`,
    /// `SELF_NODE_ID`, `SELF_AZ`, `USE_QUEUE_LEN_CACHE`,
    /// `QUEUE_LEN_RESPONSE_DEADLINE_S`,
    /// `MAX_QUEUE_LEN_RESPONSE_DEADLINE_S`, `MAX_SCHEDULING_TASKS`,
    /// `MODEL_ID_MATCH_TIMEOUT_S`, `QUEUE_LEN_CACHE_TIMEOUT_S`
    /// (each prefixed with `REPLICA_ROUTER_`).
    ///
    /// # Errors
    ///
    /// [`RouterError::Misconfiguration`] if a variable is set but cannot
    /// be parsed.
    pub fn from_env() -> RouterResult<Self> {
        let mut config = Self::default();

        if let Some(v) = env_bool("REPLICA_ROUTER_PREFER_LOCAL_NODE")? {
            config.prefer_local_node = v;
        }
        if let Some(v) = env_bool("REPLICA_ROUTER_PREFER_LOCAL_AZ")? {
            config.prefer_local_az = v;
        }
        if let Ok(v) = std::env::var("REPLICA_ROUTER_SELF_NODE_ID") {
            config.self_node_id = v;
        }
        if let Ok(v) = std::env::var("REPLICA_ROUTER_SELF_AZ") {
            config.self_az = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = env_bool("REPLICA_ROUTER_USE_QUEUE_LEN_CACHE")? {
            config.use_queue_len_cache = v;
        }
        if let Some(v) = env_duration_s("REPLICA_ROUTER_QUEUE_LEN_RESPONSE_DEADLINE_S")? {
            config.queue_len_response_deadline = v;
        }
        if let Some(v) = env_duration_s("REPLICA_ROUTER_MAX_QUEUE_LEN_RESPONSE_DEADLINE_S")? {
            config.queue_len_response_deadline_max = v;
        }
        if let Some(v) = env_usize("REPLICA_ROUTER_MAX_SCHEDULING_TASKS")? {
            config.max_scheduling_tasks_hard_cap = v;
        }
        if let Some(v) = env_duration_s("REPLICA_ROUTER_MODEL_ID_MATCH_TIMEOUT_S")? {
            config.model_id_match_timeout = v;
        }
        if let Some(v) = env_duration_s("REPLICA_ROUTER_QUEUE_LEN_CACHE_TIMEOUT_S")? {
            config.queue_len_cache_staleness = v;
        }

        Ok(config)
    }

    /// Clamp out-of-range values, warning about each adjustment.
    fn clamped(mut self) -> Self {
        if self.queue_len_response_deadline.is_zero() {
            warn!("queue_len_response_deadline of zero clamped to 1ms");
            self.queue_len_response_deadline = Duration::from_millis(1);
        }
        if self.max_scheduling_tasks_hard_cap == 0 {
            warn!("max_scheduling_tasks_hard_cap of zero clamped to 1");
            self.max_scheduling_tasks_hard_cap = 1;
        }
        if self.queue_len_response_deadline_max < self.queue_len_response_deadline {
            warn!(
                initial = ?self.queue_len_response_deadline,
                max = ?self.queue_len_response_deadline_max,
                "probe deadline max is below the initial deadline; the initial deadline will be used"
            );
        }
        self
    }
}

fn env_bool(name: &str) -> RouterResult<Option<bool>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    match raw.trim() {
        "1" | "true" | "True" | "TRUE" => Ok(Some(true)),
        "0" | "false" | "False" | "FALSE" => Ok(Some(false)),
        _ => Err(RouterError::Misconfiguration(format!(
            "{name}: expected a boolean, got {raw:?}"
        ))),
    }
}

fn env_duration_s(name: &str) -> RouterResult<Option<Duration>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let seconds: f64 = raw.trim().parse().map_err(|_| {
        RouterError::Misconfiguration(format!("{name}: expected seconds, got {raw:?}"))
    })?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(RouterError::Misconfiguration(format!(
            "{name}: expected non-negative seconds, got {raw:?}"
        )));
    }
    Ok(Some(Duration::from_secs_f64(seconds)))
}

fn env_usize(name: &str) -> RouterResult<Option<usize>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let value = raw.trim().parse().map_err(|_| {
        RouterError::Misconfiguration(format!("{name}: expected an integer, got {raw:?}"))
    })?;
    Ok(Some(value))
}

/// A queued request together with its response channel.
struct QueuedAssignment {
    request: PendingRequest,
    response_tx: async_channel::Sender<Arc<dyn ReplicaHandle>>,
    enqueued_at: f64,
}

/// The pending state: fulfillment order plus the claim queue.
#[derive(Default)]
struct PendingQueue {
    /// Requests ordered by creation time. Fulfillment always takes the
    /// earliest live entry (optionally filtered by model id).
    by_creation: BTreeMap<FifoKey, QueuedAssignment>,
    /// Keys in arrival order; each scheduling-task cycle claims one.
    claimable: VecDeque<FifoKey>,
    next_seq: u64,
}

/// Snapshot of the active replica set with precomputed routing indexes.
#[derive(Default)]
struct ReplicaSet {
    by_id: HashMap<String, Arc<dyn ReplicaHandle>>,
    all_ids: Vec<String>,
    same_node: Vec<String>,
    same_az: Vec<String>,
    model_index: HashMap<String, Vec<String>>,
    /// Replicas carrying the fewest model ids, the cheapest targets to
    /// force-load a model onto.
    fewest_models: Vec<String>,
}

impl ReplicaSet {
    fn build(config: &RouterConfig, replicas: Vec<Arc<dyn ReplicaHandle>>) -> Self {
        let mut set = Self::default();
        for replica in replicas {
            let id = replica.replica_id().to_owned();
            if !config.self_node_id.is_empty() && replica.node_id() == config.self_node_id {
                set.same_node.push(id.clone());
            }
            if let (Some(self_az), Some(replica_az)) =
                (config.self_az.as_deref(), replica.availability_zone())
            {
                if self_az == replica_az {
                    set.same_az.push(id.clone());
                }
            }
            for model_id in replica.model_ids() {
                set.model_index.entry(model_id).or_default().push(id.clone());
            }
            set.all_ids.push(id.clone());
            set.by_id.insert(id, replica);
        }

        if let Some(fewest) = set.by_id.values().map(|r| r.model_ids().len()).min() {
            set.fewest_models = set
                .by_id
                .values()
                .filter(|r| r.model_ids().len() == fewest)
                .map(|r| r.replica_id().to_owned())
                .collect();
        }
        set
    }

    fn resolve(&self, ids: &[String]) -> Vec<Arc<dyn ReplicaHandle>> {
        ids.iter()
            .filter_map(|id| self.by_id.get(id))
            .cloned()
            .collect()
    }
}

/// Result of one queue-length probe.
enum ProbeOutcome {
    /// The replica answered within the deadline.
    QueueLen(u32),
    /// The deadline expired; the probe future was dropped.
    TimedOut,
    /// Transport failure, or the answer was discarded because the
    /// replica left the active set.
    Discarded,
}

/// Per-request-cycle scheduling state.
///
/// A cycle starts when a scheduling task claims a request and ends when
/// some request is fulfilled. The probe deadline, locality-tier flags,
/// and the model-id match window all reset between cycles.
struct AttemptCycle {
    /// When the cycle first saw a non-empty replica set; the model-id
    /// match window is measured from here.
    started_at: Option<f64>,
    match_window_s: f64,
    tried_same_node: bool,
    tried_same_az: bool,
    tried_fewest_models: bool,
    deadline: Duration,
    warned_slow: bool,
}

impl AttemptCycle {
    fn new(config: &RouterConfig) -> Self {
        let jitter = rand::thread_rng().gen_range(1.0..2.0);
        Self {
            started_at: None,
            match_window_s: config.model_id_match_timeout.as_secs_f64() * jitter,
            tried_same_node: false,
            tried_same_az: false,
            tried_fewest_models: false,
            deadline: config.queue_len_response_deadline,
            warned_slow: false,
        }
    }

    fn ensure_started(&mut self, now: f64) -> f64 {
        *self.started_at.get_or_insert(now)
    }

    /// Double the probe deadline, bounded above by the configured max
    /// and below by the initial deadline (no shrinkage when the max is
    /// misconfigured below the initial value).
    fn grow_deadline(&mut self, config: &RouterConfig) {
        self.deadline = cmp::max(
            config.queue_len_response_deadline,
            cmp::min(
                self.deadline.saturating_mul(2),
                config.queue_len_response_deadline_max,
            ),
        );
    }

    fn maybe_warn_slow(&mut self, now: f64, request_id: RequestId) {
        let Some(started_at) = self.started_at else {
            return;
        };
        let elapsed = now - started_at;
        if !self.warned_slow && elapsed > SLOW_SCHEDULING_WARNING_S {
            self.warned_slow = true;
            warn!(
                %request_id,
                elapsed_s = elapsed,
                "request has been waiting a long time for a replica assignment"
            );
        }
    }
}

/// Shared scheduler state referenced by the public handle and every
/// scheduling task.
struct SchedulerCore {
    config: RouterConfig,
    clock: Arc<dyn Clock>,
    cache: QueueLengthCache,
    metrics: RouterMetrics,

    replicas: RwLock<ReplicaSet>,
    replica_count: AtomicUsize,
    replicas_updated: watch::Sender<u64>,

    queue: Mutex<PendingQueue>,
    num_pending: AtomicUsize,
    num_scheduling_tasks: AtomicUsize,
    num_tasks_in_backoff: AtomicUsize,

    /// Back-reference used to hand owned clones to spawned tasks.
    self_ref: Weak<SchedulerCore>,
}

impl SchedulerCore {
    fn max_num_scheduling_tasks(&self) -> usize {
        cmp::min(
            self.replica_count.load(Ordering::SeqCst).saturating_mul(2),
            self.config.max_scheduling_tasks_hard_cap,
        )
    }

    fn record_pending_len(&self, len: usize) {
        self.num_pending.store(len, Ordering::SeqCst);
        self.metrics.pending_requests.set(len as i64);
    }

    /// Spawn scheduling tasks until there are enough to cover the
    /// pending requests, bounded by `min(2 × replicas, hard cap)`.
    fn maybe_start_scheduling_tasks(&self) {
        loop {
            let target = cmp::min(
                self.num_pending.load(Ordering::SeqCst),
                self.max_num_scheduling_tasks(),
            );
            let current = self.num_scheduling_tasks.load(Ordering::SeqCst);
            if current >= target {
                break;
            }
            let Some(core) = self.self_ref.upgrade() else {
                break;
            };
            if self
                .num_scheduling_tasks
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.metrics.scheduling_tasks.set((current + 1) as i64);
                debug!(tasks = current + 1, "starting scheduling task");
                tokio::spawn(async move { core.fulfill_pending_requests().await });
            }
        }
    }

    /// Body of one scheduling task: claim and place requests until there
    /// is nothing left to claim.
    async fn fulfill_pending_requests(self: Arc<Self>) {
        while let Some((model_id, request_id)) = self.claim_next_request().await {
            self.schedule_one(model_id, request_id).await;
        }

        let remaining = self.num_scheduling_tasks.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.scheduling_tasks.set(remaining as i64);
        debug!(tasks = remaining, "scheduling task exiting");

        // A request may have been enqueued between the failed claim and
        // the counter decrement; re-check so it is not stranded.
        self.maybe_start_scheduling_tasks();
    }

    /// Take the next unclaimed request, discarding cancelled entries.
    async fn claim_next_request(&self) -> Option<(Option<String>, RequestId)> {
        let mut queue = self.queue.lock().await;
        while let Some(key) = queue.claimable.pop_front() {
            let claim = match queue.by_creation.get(&key) {
                // Fulfilled out of order via model-id matching.
                None => continue,
                Some(entry) if entry.response_tx.is_closed() => None,
                Some(entry) => Some((entry.request.model_id.clone(), entry.request.request_id)),
            };
            match claim {
                Some(claim) => return Some(claim),
                None => {
                    queue.by_creation.remove(&key);
                    let len = queue.by_creation.len();
                    self.record_pending_len(len);
                    debug!("discarded cancelled request while claiming");
                }
            }
        }
        None
    }

    /// Run assignment attempts for one claimed request until some
    /// request is fulfilled.
    async fn schedule_one(&self, model_id: Option<String>, request_id: RequestId) {
        let mut cycle = AttemptCycle::new(&self.config);
        let mut updates = self.replicas_updated.subscribe();
        let mut backoff_index = 0usize;
        let mut in_backoff = false;

        loop {
            while self.replica_count.load(Ordering::SeqCst) == 0 {
                info!(%request_id, "no replicas available; waiting for a replica set update");
                if updates.changed().await.is_err() {
                    self.leave_backoff(&mut in_backoff);
                    return;
                }
            }

            let (candidates, should_backoff) =
                self.candidate_pool(model_id.as_deref(), &mut cycle).await;
            if !candidates.is_empty() {
                if let Some(replica) = self.select_from_candidates(candidates, &mut cycle).await {
                    self.fulfill_next_pending_request(&replica, model_id.as_deref())
                        .await;
                    self.leave_backoff(&mut in_backoff);
                    return;
                }
            }

            if should_backoff {
                self.enter_backoff(&mut in_backoff);
                let delay = BACKOFF_SEQUENCE[backoff_index.min(BACKOFF_SEQUENCE.len() - 1)];
                backoff_index += 1;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            cycle.maybe_warn_slow(self.clock.now(), request_id);
        }
    }

    fn enter_backoff(&self, in_backoff: &mut bool) {
        if !*in_backoff {
            *in_backoff = true;
            let count = self.num_tasks_in_backoff.fetch_add(1, Ordering::SeqCst) + 1;
            self.metrics.tasks_in_backoff.set(count as i64);
        }
    }

    fn leave_backoff(&self, in_backoff: &mut bool) {
        if *in_backoff {
            *in_backoff = false;
            let count = self.num_tasks_in_backoff.fetch_sub(1, Ordering::SeqCst) - 1;
            self.metrics.tasks_in_backoff.set(count as i64);
        }
    }

    /// Build the candidate pool for one attempt, narrowing the active
    /// set by affinity tiers.
    ///
    /// Tier order: model-id affinity (when the request carries a model
    /// id), then same node, then same availability zone, then all
    /// replicas. Model-id affinity deliberately takes precedence over
    /// locality. The returned flag says whether a failed attempt against
    /// this pool should sleep before the next one; untried locality
    /// tiers are retried immediately instead.
    async fn candidate_pool(
        &self,
        model_id: Option<&str>,
        cycle: &mut AttemptCycle,
    ) -> (Vec<Arc<dyn ReplicaHandle>>, bool) {
        let now = self.clock.now();
        let started_at = cycle.ensure_started(now);
        let set = self.replicas.read().await;

        if let Some(model_id) = model_id {
            let pool = if now - started_at < cycle.match_window_s {
                match set.model_index.get(model_id) {
                    Some(ids) if !ids.is_empty() => set.resolve(ids),
                    // No replica carries this model yet; steer to the
                    // replicas with the fewest loaded models, the
                    // cheapest targets to load it onto.
                    _ => set.resolve(&set.fewest_models),
                }
            } else if !cycle.tried_fewest_models {
                cycle.tried_fewest_models = true;
                set.resolve(&set.fewest_models)
            } else {
                set.resolve(&set.all_ids)
            };
            return (pool, true);
        }

        if self.config.prefer_local_node && !cycle.tried_same_node && !set.same_node.is_empty() {
            cycle.tried_same_node = true;
            return (set.resolve(&set.same_node), false);
        }

        if self.config.prefer_local_az && !cycle.tried_same_az && !set.same_az.is_empty() {
            cycle.tried_same_az = true;
            return (set.resolve(&set.same_az), false);
        }

        (set.resolve(&set.all_ids), true)
    }

    /// Sample two candidates, obtain their queue lengths, and return the
    /// less loaded acceptable one.
    ///
    /// A replica is acceptable iff its observed queue length is strictly
    /// below its `max_concurrent_requests`. Fresh cache entries below
    /// capacity short-circuit the probe; anything else is probed under
    /// the cycle's current deadline. When the cache already produced a
    /// viable choice, the remaining candidates are probed in a
    /// background task purely to keep the cache warm.
    async fn select_from_candidates(
        &self,
        pool: Vec<Arc<dyn ReplicaHandle>>,
        cycle: &mut AttemptCycle,
    ) -> Option<Arc<dyn ReplicaHandle>> {
        let sampled: Vec<Arc<dyn ReplicaHandle>> = {
            let mut rng = rand::thread_rng();
            pool.choose_multiple(&mut rng, 2).cloned().collect()
        };

        let mut best: Option<(u32, Arc<dyn ReplicaHandle>)> = None;
        let mut to_probe = Vec::new();

        if self.config.use_queue_len_cache {
            for replica in sampled {
                match self.cache.get(replica.replica_id()) {
                    Some(queue_len) if queue_len < replica.max_concurrent_requests() => {
                        self.metrics.cache_hits_total.inc();
                        if best.as_ref().map_or(true, |(b, _)| queue_len < *b) {
                            best = Some((queue_len, replica));
                        }
                    }
                    // Missing, stale, or at capacity. A cached value at
                    // capacity is a hint, not proof of saturation, so the
                    // replica is re-probed.
                    _ => to_probe.push(replica),
                }
            }
        } else {
            to_probe = sampled;
        }

        if best.is_some() {
            if !to_probe.is_empty() {
                // The cache already produced a viable choice; warm the
                // cache for the other candidates off the critical path.
                if let Some(core) = self.self_ref.upgrade() {
                    let deadline = cycle.deadline;
                    tokio::spawn(async move {
                        core.probe_queue_lens(to_probe, deadline).await;
                    });
                }
            }
        } else if !to_probe.is_empty() {
            let mut timed_out = false;
            for (replica, outcome) in self.probe_queue_lens(to_probe, cycle.deadline).await {
                match outcome {
                    ProbeOutcome::QueueLen(queue_len)
                        if queue_len < replica.max_concurrent_requests() =>
                    {
                        if best.as_ref().map_or(true, |(b, _)| queue_len < *b) {
                            best = Some((queue_len, replica));
                        }
                    }
                    ProbeOutcome::QueueLen(_) => {}
                    ProbeOutcome::TimedOut => timed_out = true,
                    ProbeOutcome::Discarded => {}
                }
            }
            if timed_out {
                cycle.grow_deadline(&self.config);
            }
        }

        best.map(|(_, replica)| replica)
    }

    /// Probe the queue length of every given replica concurrently.
    ///
    /// Successful answers update the cache. An answer from a replica
    /// that left the active set while the probe was in flight is
    /// discarded and its cache entry evicted; a replica-set change also
    /// cancels the in-flight probe outright when the probed replica was
    /// removed.
    async fn probe_queue_lens(
        &self,
        targets: Vec<Arc<dyn ReplicaHandle>>,
        deadline: Duration,
    ) -> Vec<(Arc<dyn ReplicaHandle>, ProbeOutcome)> {
        let probes = targets
            .into_iter()
            .map(|replica| self.probe_one(replica, deadline));
        let mut results = futures::future::join_all(probes).await;

        let active = self.replicas.read().await;
        for (replica, outcome) in &mut results {
            if let ProbeOutcome::QueueLen(queue_len) = *outcome {
                if active.by_id.contains_key(replica.replica_id()) {
                    self.cache.update(replica.replica_id(), queue_len);
                } else {
                    debug!(
                        replica_id = replica.replica_id(),
                        "discarding queue length from removed replica"
                    );
                    self.cache.invalidate(replica.replica_id());
                    *outcome = ProbeOutcome::Discarded;
                }
            }
        }
        results
    }

    async fn probe_one(
        &self,
        replica: Arc<dyn ReplicaHandle>,
        deadline: Duration,
    ) -> (Arc<dyn ReplicaHandle>, ProbeOutcome) {
        self.metrics.probes_total.inc();
        let mut updates = self.replicas_updated.subscribe();
        let mut updates_open = true;
        let probe = {
            let replica = Arc::clone(&replica);
            tokio::time::timeout(deadline, async move {
                replica.probe_queue_length(deadline).await
            })
        };
        tokio::pin!(probe);

        let result = loop {
            if updates_open {
                tokio::select! {
                    result = &mut probe => break result,
                    changed = updates.changed() => match changed {
                        Ok(()) => {
                            if !self.replica_is_active(replica.replica_id()).await {
                                debug!(
                                    replica_id = replica.replica_id(),
                                    "replica removed from active set; cancelling in-flight probe"
                                );
                                self.cache.invalidate(replica.replica_id());
                                return (replica, ProbeOutcome::Discarded);
                            }
                        }
                        // The scheduler is being torn down; no further
                        // replica updates will arrive.
                        Err(_) => updates_open = false,
                    },
                }
            } else {
                break (&mut probe).await;
            }
        };

        let outcome = match result {
            Ok(Ok(queue_len)) => ProbeOutcome::QueueLen(queue_len),
            Ok(Err(err)) => {
                warn!(
                    replica_id = replica.replica_id(),
                    %err,
                    "queue length probe failed"
                );
                self.metrics.probe_errors_total.inc();
                self.cache.invalidate(replica.replica_id());
                ProbeOutcome::Discarded
            }
            Err(_) => {
                warn!(
                    replica_id = replica.replica_id(),
                    deadline_ms = deadline.as_millis() as u64,
                    "queue length probe timed out"
                );
                self.metrics.probe_timeouts_total.inc();
                ProbeOutcome::TimedOut
            }
        };
        (replica, outcome)
    }

    async fn replica_is_active(&self, replica_id: &str) -> bool {
        self.replicas.read().await.by_id.contains_key(replica_id)
    }

    /// Hand `replica` to the earliest live pending request.
    ///
    /// When the claimed request carried a model id, the earliest live
    /// request with the *same* model id is preferred so FIFO holds
    /// per model id; otherwise the global head is used. Cancelled
    /// entries surfacing at the head are discarded. If every entry is
    /// gone the replica simply goes unconsumed.
    async fn fulfill_next_pending_request(
        &self,
        replica: &Arc<dyn ReplicaHandle>,
        model_id: Option<&str>,
    ) {
        loop {
            let entry = {
                let mut queue = self.queue.lock().await;
                let matched = model_id.and_then(|mid| {
                    queue
                        .by_creation
                        .iter()
                        .find(|(_, entry)| {
                            !entry.response_tx.is_closed()
                                && entry.request.model_id.as_deref() == Some(mid)
                        })
                        .map(|(key, _)| *key)
                });
                let key = matched.or_else(|| queue.by_creation.keys().next().copied());
                let Some(key) = key else {
                    return;
                };
                let entry = queue.by_creation.remove(&key);
                let len = queue.by_creation.len();
                self.record_pending_len(len);
                entry
            };

            let Some(entry) = entry else {
                return;
            };
            if entry.response_tx.is_closed() {
                debug!(
                    request_id = %entry.request.request_id,
                    "dropping cancelled request at the queue head"
                );
                continue;
            }
            match entry.response_tx.send(Arc::clone(replica)).await {
                Ok(()) => {
                    let waited = (self.clock.now() - entry.enqueued_at).max(0.0);
                    self.metrics.assignments_total.inc();
                    self.metrics.time_to_assignment_seconds.observe(waited);
                    debug!(
                        request_id = %entry.request.request_id,
                        replica_id = replica.replica_id(),
                        waited_s = waited,
                        "assigned request to replica"
                    );
                    return;
                }
                // Cancelled between the liveness check and the send; the
                // replica goes to the next request instead.
                Err(_) => continue,
            }
        }
    }
}

/// The power-of-two-choices replica scheduler.
///
/// Routes requests for one deployment. For every assignment attempt the
/// scheduler samples two candidate replicas from the best non-empty
/// affinity tier, obtains their queue lengths (from the cache when fresh
/// and below capacity, otherwise by probing), and hands the FIFO-head
/// pending request to the less loaded acceptable candidate.
///
/// Multiple schedulers coexist independently in one process; there is no
/// global state.
///
/// Cancellation is dropping the future returned by
/// [`choose_replica_for_request`](Self::choose_replica_for_request):
/// the request is discarded the next time it surfaces, it can never be
/// assigned a replica afterward, and sibling requests are unaffected.
///
/// # Examples
/// ```no_run
/// use replica_router::{PowerOfTwoScheduler, RouterConfig};
///
/// # #[tokio::main]
/// # async fn main() -> replica_router::RouterResult<()> {
/// let scheduler = PowerOfTwoScheduler::new(RouterConfig::default())?;
/// scheduler.update_replicas(Vec::new()).await;
/// assert_eq!(scheduler.num_pending_requests(), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PowerOfTwoScheduler {
    core: Arc<SchedulerCore>,
}

impl PowerOfTwoScheduler {
    /// Create a scheduler driven by the system wall clock.
    ///
    /// # Errors
    ///
    /// [`RouterError::Metrics`] if metric registration fails.
    pub fn new(config: RouterConfig) -> RouterResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a scheduler with an injected clock.
    ///
    /// All time reads inside the scheduler and its queue-length cache go
    /// through `clock`, which makes staleness and FIFO behavior
    /// deterministic under test.
    ///
    /// # Errors
    ///
    /// [`RouterError::Metrics`] if metric registration fails.
    pub fn with_clock(config: RouterConfig, clock: Arc<dyn Clock>) -> RouterResult<Self> {
        let config = config.clamped();
        let cache = QueueLengthCache::new(config.queue_len_cache_staleness, Arc::clone(&clock));
        let metrics = RouterMetrics::new()?;
        let (replicas_updated, _) = watch::channel(0);

        let core = Arc::new_cyclic(|self_ref| SchedulerCore {
            config,
            clock,
            cache,
            metrics,
            replicas: RwLock::new(ReplicaSet::default()),
            replica_count: AtomicUsize::new(0),
            replicas_updated,
            queue: Mutex::new(PendingQueue::default()),
            num_pending: AtomicUsize::new(0),
            num_scheduling_tasks: AtomicUsize::new(0),
            num_tasks_in_backoff: AtomicUsize::new(0),
            self_ref: Weak::clone(self_ref),
        });

        Ok(Self { core })
    }

    /// Replace the active replica set.
    ///
    /// Prunes the queue-length cache to the new set, signals every
    /// waiting scheduling task, and spawns new tasks if the larger set
    /// raises the concurrency cap. Does not itself fulfill pending
    /// requests.
    pub async fn update_replicas(&self, replicas: Vec<Arc<dyn ReplicaHandle>>) {
        let core = &self.core;
        let new_set = ReplicaSet::build(&core.config, replicas);
        let active_ids: HashSet<String> = new_set.by_id.keys().cloned().collect();

        {
            let mut guard = core.replicas.write().await;
            let old_ids: HashSet<String> = guard.by_id.keys().cloned().collect();
            if old_ids != active_ids {
                let added: Vec<&String> = active_ids.difference(&old_ids).collect();
                let removed: Vec<&String> = old_ids.difference(&active_ids).collect();
                info!(?added, ?removed, total = active_ids.len(), "replica set updated");
            }
            *guard = new_set;
            core.replica_count
                .store(active_ids.len(), Ordering::SeqCst);
        }

        core.cache.remove_inactive(&active_ids);
        core.replicas_updated.send_modify(|version| *version += 1);
        core.maybe_start_scheduling_tasks();
    }

    /// Enqueue a request and wait for its replica assignment.
    ///
    /// On a fresh submission the request's creation timestamp is
    /// overwritten with the scheduler clock; a retry (`is_retry`)
    /// keeps the original timestamp so the request re-enters the FIFO
    /// order at its original position.
    ///
    /// Dropping the returned future cancels the request.
    ///
    /// # Errors
    ///
    /// [`RouterError::Cancelled`] if the scheduler is torn down while
    /// the request is still waiting.
    pub async fn choose_replica_for_request(
        &self,
        mut request: PendingRequest,
        is_retry: bool,
    ) -> RouterResult<Arc<dyn ReplicaHandle>> {
        let core = &self.core;
        if !is_retry {
            request.created_at = core.clock.now();
        }
        let request_id = request.request_id;
        let (response_tx, response_rx) = async_channel::bounded(1);

        {
            let mut queue = core.queue.lock().await;
            let key = FifoKey::new(request.created_at, queue.next_seq);
            queue.next_seq += 1;
            let enqueued_at = core.clock.now();
            queue.by_creation.insert(
                key,
                QueuedAssignment {
                    request,
                    response_tx,
                    enqueued_at,
                },
            );
            queue.claimable.push_back(key);
            let len = queue.by_creation.len();
            core.record_pending_len(len);
            debug!(%request_id, is_retry, pending = len, "queued request for assignment");
        }
        core.maybe_start_scheduling_tasks();

        response_rx.recv().await.map_err(|_| RouterError::Cancelled)
    }

    /// An event handle observing replica set changes.
    ///
    /// The value is a version counter bumped on every
    /// [`update_replicas`](Self::update_replicas); waiters use
    /// [`tokio::sync::watch::Receiver::changed`].
    pub fn subscribe_replica_updates(&self) -> watch::Receiver<u64> {
        self.core.replicas_updated.subscribe()
    }

    /// Number of scheduling tasks currently running.
    pub fn curr_num_scheduling_tasks(&self) -> usize {
        self.core.num_scheduling_tasks.load(Ordering::SeqCst)
    }

    /// Number of requests waiting for an assignment.
    pub fn num_pending_requests(&self) -> usize {
        self.core.num_pending.load(Ordering::SeqCst)
    }

    /// Current cap on scheduling tasks: `min(2 × replicas, hard cap)`.
    pub fn max_num_scheduling_tasks(&self) -> usize {
        self.core.max_num_scheduling_tasks()
    }

    /// Number of scheduling tasks currently sleeping in backoff.
    pub fn num_scheduling_tasks_in_backoff(&self) -> usize {
        self.core.num_tasks_in_backoff.load(Ordering::SeqCst)
    }

    /// The queue-length cache backing this scheduler.
    ///
    /// Exposed so integrators can fold queue lengths learned out-of-band
    /// (for example from response metadata) into scheduling decisions.
    pub fn queue_len_cache(&self) -> &QueueLengthCache {
        &self.core.cache
    }

    /// Metric handles for this scheduler.
    pub fn metrics(&self) -> &RouterMetrics {
        &self.core.metrics
    }

    /// The configuration this scheduler was built with (post-clamping).
    pub fn config(&self) -> &RouterConfig {
        &self.core.config
    }
}

impl std::fmt::Debug for PowerOfTwoScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerOfTwoScheduler")
            .field("replicas", &self.core.replica_count.load(Ordering::SeqCst))
            .field("pending", &self.num_pending_requests())
            .field("scheduling_tasks", &self.curr_num_scheduling_tasks())
            .finish()
    }
}
