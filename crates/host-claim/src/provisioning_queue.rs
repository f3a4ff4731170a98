//! BMC operation governor
//!
//! Bounds how many hardware operations run at once and keeps a minimum idle
//! gap between operations on the same management controller. Two ways in:
//!
//! - permit mode: `acquire_bmc_permit` / `release_bmc_permit` around work
//!   the caller does itself
//! - queue mode: `submit_request` / `wait_for_result`, executed by a fixed
//!   pool of workers through a `HardwareOperator`
//!
//! Both share one slot table, so a permit holder and a queue worker can
//! never hit the same BMC at the same time. Endpoints are compared by
//! normalized `host:port`.

use crate::config::ProvisioningQueueConfig;
use crate::error::QueueError;
use crate::hardware::HardwareOperator;
use crate::metrics::ClaimMetrics;
use crds::PhysicalHost;
use redfish_client::bmc_endpoint;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const QUEUE_LABEL: &str = "provisioning";

/// Kind of hardware operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisioningOperation {
    Claim,
    Provision,
    Deprovision,
    Release,
}

impl ProvisioningOperation {
    /// Hardware operations fail transiently; metadata operations do not.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ProvisioningOperation::Provision | ProvisioningOperation::Deprovision
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProvisioningOperation::Claim => "Claim",
            ProvisioningOperation::Provision => "Provision",
            ProvisioningOperation::Deprovision => "Deprovision",
            ProvisioningOperation::Release => "Release",
        }
    }
}

impl fmt::Display for ProvisioningOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a queued operation.
#[derive(Debug, Clone)]
pub struct ProvisioningResult {
    pub request_id: Uuid,
    /// `namespace/name` of the host
    pub host: String,
    pub operation: ProvisioningOperation,
    pub success: bool,
    pub error: Option<String>,
    /// Whether resubmitting may succeed
    pub retryable: bool,
    pub submitted_at: Instant,
    /// `None` when the request never reached a worker
    pub started_at: Option<Instant>,
    pub completed_at: Instant,
}

impl ProvisioningResult {
    /// Time spent executing, zero if never started.
    pub fn duration(&self) -> Duration {
        self.started_at
            .map(|started| self.completed_at.saturating_duration_since(started))
            .unwrap_or_default()
    }
}

/// A queued unit of work
struct ProvisioningRequest {
    id: Uuid,
    host: PhysicalHost,
    host_key: String,
    endpoint: String,
    machine: Option<String>,
    operation: ProvisioningOperation,
    submitted_at: Instant,
    deadline: Instant,
    token: CancellationToken,
    result_tx: oneshot::Sender<ProvisioningResult>,
}

impl ProvisioningRequest {
    fn finish(self, started_at: Option<Instant>, completed_at: Instant, outcome: Result<(), String>) {
        let success = outcome.is_ok();
        let result = ProvisioningResult {
            request_id: self.id,
            host: self.host_key,
            operation: self.operation,
            success,
            retryable: !success && self.operation.is_retryable(),
            error: outcome.err(),
            submitted_at: self.submitted_at,
            started_at,
            completed_at,
        };
        // The submitter may have stopped waiting
        let _ = self.result_tx.send(result);
    }

    fn expired(&self, now: Instant) -> Option<String> {
        if self.token.is_cancelled() {
            Some("request cancelled".to_string())
        } else if now >= self.deadline {
            Some("request deadline exceeded before start".to_string())
        } else {
            None
        }
    }
}

/// Handle for a submitted request.
#[derive(Debug)]
pub struct ProvisioningTicket {
    pub id: Uuid,
    pub host: String,
    receiver: oneshot::Receiver<ProvisioningResult>,
    token: CancellationToken,
}

impl ProvisioningTicket {
    /// Cancels the request; a worker running it stops waiting on the BMC.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// A reserved BMC slot; give it back with `release_bmc_permit`.
#[derive(Debug)]
#[must_use = "a permit holds a BMC slot until released"]
pub struct BmcPermit {
    host: String,
    endpoint: String,
}

impl BmcPermit {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    /// Queue-mode requests being executed
    pub processing: usize,
    /// Slots held in permit mode
    pub permits_held: usize,
    pub max_concurrent_ops: usize,
    pub max_queue_size: usize,
    pub stopping: bool,
}

#[derive(Debug)]
struct Slot {
    endpoint: String,
    /// Re-entrant permit depth; queue slots stay at 1
    depth: u32,
    queued: bool,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ProvisioningRequest>,
    /// host key -> slot
    active: HashMap<String, Slot>,
    /// endpoint -> completion of the last operation
    last_operation: HashMap<String, Instant>,
    stopping: bool,
}

impl QueueState {
    fn processing(&self) -> usize {
        self.active.values().filter(|s| s.queued).count()
    }

    fn endpoint_ready(&self, endpoint: &str, cooldown: Duration, now: Instant) -> bool {
        if self.active.values().any(|s| s.endpoint == endpoint) {
            return false;
        }
        self.last_operation
            .get(endpoint)
            .is_none_or(|last| now.saturating_duration_since(*last) >= cooldown)
    }

    fn has_host(&self, host_key: &str) -> bool {
        self.active.contains_key(host_key) || self.pending.iter().any(|r| r.host_key == host_key)
    }

    fn release_slot(&mut self, host_key: &str, now: Instant) {
        if let Some(slot) = self.active.remove(host_key) {
            self.last_operation.insert(slot.endpoint, now);
        }
    }
}

struct QueueInner {
    config: ProvisioningQueueConfig,
    operator: Arc<dyn HardwareOperator>,
    state: Mutex<QueueState>,
    root: CancellationToken,
    metrics: Option<ClaimMetrics>,
}

impl QueueInner {
    fn publish_depth(&self, state: &QueueState) {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(QUEUE_LABEL, state.pending.len());
        }
    }

    /// Takes the oldest request whose BMC is idle and out of cooldown.
    async fn next_eligible(&self) -> Option<ProvisioningRequest> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        // Fail anything cancelled or past its deadline without running it
        let mut index = 0;
        while index < state.pending.len() {
            if let Some(reason) = state.pending[index].expired(now) {
                if let Some(request) = state.pending.remove(index) {
                    debug!("Dropping {} request for host {}: {}", request.operation, request.host_key, reason);
                    request.finish(None, now, Err(reason));
                }
            } else {
                index += 1;
            }
        }

        if state.active.len() >= self.config.max_concurrent_ops {
            self.publish_depth(&state);
            return None;
        }

        let cooldown = self.config.bmc_cooldown_period;
        let position = state
            .pending
            .iter()
            .position(|r| state.endpoint_ready(&r.endpoint, cooldown, now))?;
        let request = state.pending.remove(position)?;
        state.active.insert(
            request.host_key.clone(),
            Slot {
                endpoint: request.endpoint.clone(),
                depth: 1,
                queued: true,
            },
        );
        self.publish_depth(&state);
        Some(request)
    }

    async fn process(&self, request: ProvisioningRequest) {
        let started_at = Instant::now();
        debug!(
            "Executing {} for host {} on {} (machine {:?})",
            request.operation, request.host_key, request.endpoint, request.machine
        );

        let outcome = tokio::select! {
            result = self.operator.execute(&request.host, request.operation) => {
                result.map_err(|e| e.to_string())
            }
            () = request.token.cancelled() => Err("request cancelled".to_string()),
            () = tokio::time::sleep_until(request.deadline.into()) => {
                Err("request deadline exceeded".to_string())
            }
        };

        let completed_at = Instant::now();
        {
            let mut state = self.state.lock().await;
            state.release_slot(&request.host_key, completed_at);
        }

        match &outcome {
            Ok(()) => info!(
                "{} for host {} completed in {:?}",
                request.operation,
                request.host_key,
                completed_at - started_at
            ),
            Err(e) if request.operation.is_retryable() => debug!(
                "{} for host {} failed (retryable): {}",
                request.operation, request.host_key, e
            ),
            Err(e) => warn!("{} for host {} failed: {}", request.operation, request.host_key, e),
        }
        if let Some(metrics) = &self.metrics {
            metrics.observe_operation(request.operation.as_str(), outcome.is_ok(), completed_at - started_at);
        }
        request.finish(Some(started_at), completed_at, outcome);
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!("Provisioning worker {} started", worker);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.root.cancelled() => break,
                _ = ticker.tick() => {}
            }
            while let Some(request) = self.next_eligible().await {
                self.process(request).await;
                if self.root.is_cancelled() {
                    break;
                }
            }
        }
        debug!("Provisioning worker {} stopped", worker);
    }
}

/// Global concurrency limit plus per-BMC cooldown for hardware operations
pub struct ProvisioningQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ProvisioningQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningQueue")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ProvisioningQueue {
    /// Creates a stopped queue; call `start` to run workers.
    pub fn new(config: ProvisioningQueueConfig, operator: Arc<dyn HardwareOperator>) -> Self {
        Self::build(config, operator, None)
    }

    /// Like `new`, recording metrics.
    ///
    /// The queue is cancelled only by its own `stop`.
    pub fn with_metrics(
        config: ProvisioningQueueConfig,
        operator: Arc<dyn HardwareOperator>,
        metrics: ClaimMetrics,
    ) -> Self {
        Self::build(config, operator, Some(metrics))
    }

    fn build(config: ProvisioningQueueConfig, operator: Arc<dyn HardwareOperator>, metrics: Option<ClaimMetrics>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                operator,
                state: Mutex::new(QueueState::default()),
                root: CancellationToken::new(),
                metrics,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ProvisioningQueueConfig {
        &self.inner.config
    }

    /// Spawns the worker pool. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        info!(
            "Starting provisioning queue: {} workers, {} concurrent ops, {:?} BMC cooldown",
            self.inner.config.worker_count,
            self.inner.config.max_concurrent_ops,
            self.inner.config.bmc_cooldown_period
        );
        for worker in 0..self.inner.config.worker_count.max(1) {
            workers.push(tokio::spawn(Arc::clone(&self.inner).worker_loop(worker)));
        }
    }

    /// Refuses new work, waits up to the grace period for the queue to
    /// drain, then cancels and fails whatever is left.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.stopping {
                return;
            }
            state.stopping = true;
        }
        info!("Stopping provisioning queue");

        let deadline = Instant::now() + self.inner.config.shutdown_grace_period;
        loop {
            let busy = {
                let state = self.inner.state.lock().await;
                !state.pending.is_empty() || state.processing() > 0
            };
            if !busy || Instant::now() >= deadline || self.workers.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }

        self.inner.root.cancel();
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Provisioning worker ended abnormally: {}", e);
            }
        }

        let mut state = self.inner.state.lock().await;
        let leftovers: Vec<_> = state.pending.drain(..).collect();
        if !leftovers.is_empty() {
            warn!("Failing {} provisioning requests left at shutdown", leftovers.len());
        }
        for request in leftovers {
            request.finish(None, Instant::now(), Err(QueueError::Stopped.to_string()));
        }
        self.inner.publish_depth(&state);
    }

    /// Current occupancy.
    pub async fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock().await;
        let processing = state.processing();
        QueueStatus {
            pending: state.pending.len(),
            processing,
            permits_held: state.active.len() - processing,
            max_concurrent_ops: self.inner.config.max_concurrent_ops,
            max_queue_size: self.inner.config.max_queue_size,
            stopping: state.stopping,
        }
    }

    /// Enqueues `operation` for `host`.
    ///
    /// Rejects immediately when pending plus processing requests reach
    /// `max_queue_size`, or when the host already has work queued, running
    /// or holding a permit.
    pub async fn submit_request(
        &self,
        host: PhysicalHost,
        machine: Option<String>,
        operation: ProvisioningOperation,
    ) -> Result<ProvisioningTicket, QueueError> {
        let mut state = self.inner.state.lock().await;
        if state.stopping || self.inner.root.is_cancelled() {
            return Err(QueueError::Stopped);
        }
        let host_key = host.key();
        if state.has_host(&host_key) {
            return Err(QueueError::AlreadyQueued(host_key));
        }
        let capacity = self.inner.config.max_queue_size;
        if state.pending.len() + state.processing() >= capacity {
            debug!("Provisioning queue full, rejecting {} for host {}", operation, host_key);
            return Err(QueueError::Full { capacity });
        }

        let now = Instant::now();
        let token = self.inner.root.child_token();
        let (result_tx, receiver) = oneshot::channel();
        let id = Uuid::new_v4();
        state.pending.push_back(ProvisioningRequest {
            id,
            endpoint: bmc_endpoint(&host.spec.redfish.address),
            host_key: host_key.clone(),
            host,
            machine,
            operation,
            submitted_at: now,
            deadline: now + self.inner.config.request_timeout,
            token: token.clone(),
            result_tx,
        });
        debug!("Queued {} for host {} ({} pending)", operation, host_key, state.pending.len());
        self.inner.publish_depth(&state);

        Ok(ProvisioningTicket {
            id,
            host: host_key,
            receiver,
            token,
        })
    }

    /// Waits for a submitted request's result.
    ///
    /// On timeout the request is cancelled so it frees its slot.
    pub async fn wait_for_result(
        &self,
        ticket: ProvisioningTicket,
        timeout: Duration,
    ) -> Result<ProvisioningResult, QueueError> {
        match tokio::time::timeout(timeout, ticket.receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(QueueError::ResultDropped),
            Err(_) => {
                ticket.token.cancel();
                Err(QueueError::Timeout(timeout))
            }
        }
    }

    /// Blocks until `host` may talk to its BMC, then reserves a slot.
    ///
    /// Re-entrant: a host already holding a permit gets another immediately
    /// and must release each one.
    pub async fn acquire_bmc_permit(
        &self,
        host: &PhysicalHost,
        cancel: &CancellationToken,
    ) -> Result<BmcPermit, QueueError> {
        let host_key = host.key();
        let endpoint = bmc_endpoint(&host.spec.redfish.address);
        loop {
            {
                let mut state = self.inner.state.lock().await;
                if state.stopping {
                    return Err(QueueError::Stopped);
                }
                if let Some(slot) = state.active.get_mut(&host_key) {
                    if !slot.queued {
                        slot.depth += 1;
                        return Ok(BmcPermit { host: host_key, endpoint });
                    }
                } else if state.active.len() < self.inner.config.max_concurrent_ops
                    && state.endpoint_ready(&endpoint, self.inner.config.bmc_cooldown_period, Instant::now())
                {
                    state.active.insert(
                        host_key.clone(),
                        Slot {
                            endpoint: endpoint.clone(),
                            depth: 1,
                            queued: false,
                        },
                    );
                    debug!("BMC permit granted to host {} on {}", host_key, endpoint);
                    return Ok(BmcPermit { host: host_key, endpoint });
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(QueueError::Cancelled(host_key)),
                () = self.inner.root.cancelled() => return Err(QueueError::Stopped),
                () = tokio::time::sleep(self.inner.config.poll_interval) => {}
            }
        }
    }

    /// Frees a permit and starts the endpoint's cooldown.
    pub async fn release_bmc_permit(&self, permit: BmcPermit) {
        let mut state = self.inner.state.lock().await;
        let Some(slot) = state.active.get_mut(&permit.host) else {
            warn!("Released a BMC permit host {} does not hold", permit.host);
            return;
        };
        if slot.queued {
            warn!("Host {} permit release collides with a queued operation", permit.host);
            return;
        }
        slot.depth = slot.depth.saturating_sub(1);
        if slot.depth == 0 {
            state.release_slot(&permit.host, Instant::now());
            debug!("BMC permit released by host {} on {}", permit.host, permit.endpoint);
        }
    }
}
