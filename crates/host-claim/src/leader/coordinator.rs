//! Claim coordination behind an elected leader
//!
//! The leader funnels claims through a priority queue and a batch ticker,
//! so under contention older and simpler requests are served first. Host
//! selection itself is the optimistic coordinator's; only the ordering
//! changes. Replicas that are not leading claim directly through the
//! optimistic coordinator, which stays correct because every write is
//! still a conditional update.

use crate::claim::{ClaimCoordinator, ClaimRequest, ClaimResult, HostClaimCoordinator};
use crate::config::{LeaderCoordinatorConfig, LeaderElectionConfig};
use crate::error::{ClaimError, LeaseError};
use crate::leader::election::{LeaderCallbacks, LeaderElector};
use crate::leader::lease::LeaseLock;
use crate::leader::priority::{ClaimPriorityQueue, LeaderCoordinatedClaim, compute_priority};
use crate::metrics::{ClaimMetrics, ClaimOutcome};
use chrono::{DateTime, Utc};
use crds::MetalMachine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const QUEUE_LABEL: &str = "leader_claims";

/// Who leads and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipStatus {
    pub identity: String,
    pub is_leader: bool,
    /// Last observed holder of the lease
    pub leader: Option<String>,
    pub leading_since: Option<DateTime<Utc>>,
    /// Claims answered by the leader path since start
    pub claims_processed: u64,
}

/// Leader claim queue occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimQueueStatus {
    pub depth: usize,
    pub highest_priority: Option<i64>,
    pub oldest_wait: Option<Duration>,
    pub batch_processor_running: bool,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    is_leader: bool,
    leader: Option<String>,
    leading_since: Option<DateTime<Utc>>,
    claims_processed: u64,
    queue: ClaimPriorityQueue,
    batch: Option<(CancellationToken, JoinHandle<()>)>,
    election: Option<(CancellationToken, JoinHandle<()>)>,
}

struct Shared {
    optimistic: HostClaimCoordinator,
    config: LeaderCoordinatorConfig,
    identity: String,
    state: Mutex<CoordinatorState>,
    metrics: Option<ClaimMetrics>,
}

/// `ClaimCoordinator` that orders claims through the elected leader
#[derive(Clone)]
pub struct LeaderElectionClaimCoordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LeaderElectionClaimCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElectionClaimCoordinator")
            .field("identity", &self.shared.identity)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl LeaderElectionClaimCoordinator {
    pub fn new(
        optimistic: HostClaimCoordinator,
        config: LeaderCoordinatorConfig,
        identity: impl Into<String>,
        metrics: Option<ClaimMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                optimistic,
                config,
                identity: identity.into(),
                state: Mutex::new(CoordinatorState::default()),
                metrics,
            }),
        }
    }

    /// Joins the election on `lock`; runs until `stop` or `shutdown`.
    pub async fn start(
        &self,
        lock: Arc<dyn LeaseLock>,
        election: LeaderElectionConfig,
        shutdown: &CancellationToken,
    ) {
        let mut state = self.shared.state.lock().await;
        if state.election.is_some() {
            return;
        }
        let mut elector = LeaderElector::new(lock, election, Arc::new(self.clone()));
        if let Some(metrics) = &self.shared.metrics {
            elector = elector.with_metrics(metrics.clone());
        }
        let token = shutdown.child_token();
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = elector.run(run_token).await {
                warn!("Leader election ended with error: {}", e);
            }
        });
        state.election = Some((token, handle));
    }

    /// Leaves the election. Queued claims are answered before this returns.
    pub async fn stop(&self) -> Result<(), LeaseError> {
        let election = self.shared.state.lock().await.election.take();
        if let Some((token, handle)) = election {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Leader election task ended abnormally: {}", e);
            }
        }
        // Covers leadership granted without an elector
        if self.shared.state.lock().await.is_leader {
            self.on_stopped_leading().await;
        }
        Ok(())
    }

    pub async fn leadership_status(&self) -> LeadershipStatus {
        let state = self.shared.state.lock().await;
        LeadershipStatus {
            identity: self.shared.identity.clone(),
            is_leader: state.is_leader,
            leader: state.leader.clone(),
            leading_since: state.leading_since,
            claims_processed: state.claims_processed,
        }
    }

    pub async fn claim_queue_status(&self) -> ClaimQueueStatus {
        let state = self.shared.state.lock().await;
        ClaimQueueStatus {
            depth: state.queue.len(),
            highest_priority: state.queue.peek_priority(),
            oldest_wait: state.queue.oldest_enqueued().map(|t| t.elapsed()),
            batch_processor_running: state.batch.is_some(),
        }
    }

    fn spawn_batch_processor(&self, leading: CancellationToken) -> JoinHandle<()> {
        let coordinator = self.clone();
        let interval = self.shared.config.batch_interval;
        tokio::spawn(async move {
            debug!("Leader batch processor started");
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = leading.cancelled() => break,
                    _ = ticker.tick() => coordinator.process_batch().await,
                }
            }
            debug!("Leader batch processor stopped");
        })
    }

    /// Runs up to `batch_size` claims, highest priority first.
    async fn process_batch(&self) {
        let batch: Vec<LeaderCoordinatedClaim> = {
            let mut state = self.shared.state.lock().await;
            let take = self.shared.config.batch_size.min(state.queue.len());
            (0..take).filter_map(|_| state.queue.pop()).collect()
        };
        if batch.is_empty() {
            return;
        }
        debug!("Processing {} leader claims", batch.len());

        let mut requeue = Vec::new();
        for mut claim in batch {
            if claim.is_abandoned() {
                debug!("Dropping abandoned claim for {}", claim.request.machine.key());
                continue;
            }
            let outcome = self.shared.optimistic.claim_host(&claim.request).await;
            let retry = matches!(&outcome, Ok(r) if !r.success && r.retry);
            if retry && claim.retries + 1 < self.shared.config.max_retries {
                claim.retries += 1;
                requeue.push(claim);
                continue;
            }
            self.answer(claim, outcome).await;
        }

        let mut state = self.shared.state.lock().await;
        // Leadership may have ended while claims were running
        if state.is_leader {
            for claim in requeue {
                state.queue.push(claim);
            }
            requeue = Vec::new();
        }
        self.publish_depth(&state);
        drop(state);
        for claim in requeue {
            let outcome = self.shared.optimistic.claim_host(&claim.request).await;
            self.answer(claim, outcome).await;
        }
    }

    async fn answer(&self, claim: LeaderCoordinatedClaim, outcome: Result<ClaimResult, ClaimError>) {
        if let Some(metrics) = &self.shared.metrics {
            let label = match &outcome {
                Ok(r) if r.success => ClaimOutcome::Claimed,
                Ok(_) => ClaimOutcome::LostRaces,
                Err(_) => ClaimOutcome::Failed,
            };
            metrics.record_claim("leader", label);
        }
        self.shared.state.lock().await.claims_processed += 1;
        claim.respond(outcome);
    }

    fn publish_depth(&self, state: &CoordinatorState) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.set_queue_depth(QUEUE_LABEL, state.queue.len());
        }
    }
}

#[async_trait::async_trait]
impl ClaimCoordinator for LeaderElectionClaimCoordinator {
    async fn claim_host(&self, request: &ClaimRequest) -> Result<ClaimResult, ClaimError> {
        let receiver = {
            let mut state = self.shared.state.lock().await;
            if state.is_leader {
                let priority = compute_priority(&self.shared.config.priority, request, Utc::now());
                let (claim, receiver) = LeaderCoordinatedClaim::new(request.clone(), priority);
                debug!(
                    "Queued claim for {} at priority {} ({} queued)",
                    request.machine.key(),
                    priority,
                    state.queue.len() + 1
                );
                state.queue.push(claim);
                self.publish_depth(&state);
                Some(receiver)
            } else {
                None
            }
        };

        let Some(receiver) = receiver else {
            debug!(
                "Not leader, claiming for {} through the optimistic coordinator",
                request.machine.key()
            );
            return self.shared.optimistic.claim_host(request).await;
        };

        let wait = self.shared.config.claim_wait_timeout;
        match tokio::time::timeout(wait, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                debug!("Leader dropped claim for {}, claiming directly", request.machine.key());
                self.shared.optimistic.claim_host(request).await
            }
            Err(_) => Ok(ClaimResult::retry_later(
                self.shared.optimistic.retry_after(),
                format!("leader did not process the claim within {wait:?}"),
            )),
        }
    }

    async fn release_host(&self, machine: &MetalMachine) -> Result<(), ClaimError> {
        // Releases never contend for hosts, so they skip the queue
        self.shared.optimistic.release_host(machine).await
    }
}

#[async_trait::async_trait]
impl LeaderCallbacks for LeaderElectionClaimCoordinator {
    async fn on_started_leading(&self, leading: CancellationToken) {
        let mut state = self.shared.state.lock().await;
        if state.is_leader {
            return;
        }
        info!("{} is now the claim leader", self.shared.identity);
        state.is_leader = true;
        state.leader = Some(self.shared.identity.clone());
        state.leading_since = Some(Utc::now());
        let handle = self.spawn_batch_processor(leading.clone());
        state.batch = Some((leading, handle));
    }

    async fn on_stopped_leading(&self) {
        let batch = {
            let mut state = self.shared.state.lock().await;
            if !state.is_leader {
                return;
            }
            state.is_leader = false;
            state.leading_since = None;
            if state.leader.as_deref() == Some(self.shared.identity.as_str()) {
                state.leader = None;
            }
            state.batch.take()
        };
        info!("{} stopped leading, draining claim queue", self.shared.identity);

        if let Some((token, handle)) = batch {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Leader batch processor ended abnormally: {}", e);
            }
        }

        let started = Instant::now();
        let drained = {
            let mut state = self.shared.state.lock().await;
            let drained = state.queue.drain_ordered();
            self.publish_depth(&state);
            drained
        };
        let count = drained.len();
        for claim in drained {
            if claim.is_abandoned() {
                continue;
            }
            let outcome = self.shared.optimistic.claim_host(&claim.request).await;
            self.answer(claim, outcome).await;
        }
        if count > 0 {
            info!("Drained {} queued claims in {:?}", count, started.elapsed());
        }
    }

    async fn on_new_leader(&self, identity: &str) {
        info!("Claim leader is now {}", identity);
        self.shared.state.lock().await.leader = Some(identity.to_string());
    }
}
