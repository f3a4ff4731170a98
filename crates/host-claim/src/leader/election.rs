//! Lease-based leader election
//!
//! Follows client-go's loop: followers poll the lease every retry period
//! and take it over once it is released or expired; the leader renews every
//! retry period and steps down when it cannot renew within the renew
//! deadline. On shutdown the leader releases the lease so a successor does
//! not have to wait out the lease duration.

use crate::config::LeaderElectionConfig;
use crate::error::LeaseError;
use crate::leader::lease::{LeaderRecord, LeaseLock};
use crate::metrics::ClaimMetrics;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hooks invoked as leadership changes.
#[async_trait::async_trait]
pub trait LeaderCallbacks: Send + Sync {
    /// This replica became leader; `leading` is cancelled when it stops.
    async fn on_started_leading(&self, leading: CancellationToken);

    /// This replica is no longer leader. Runs to completion before the
    /// lease is given up on shutdown.
    async fn on_stopped_leading(&self);

    /// A different replica was observed holding the lease.
    async fn on_new_leader(&self, identity: &str);
}

/// Runs the election loop for one replica
pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    config: LeaderElectionConfig,
    callbacks: Arc<dyn LeaderCallbacks>,
    is_leader: AtomicBool,
    observed_leader: Mutex<Option<String>>,
    metrics: Option<ClaimMetrics>,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lease", &self.lock.describe())
            .field("identity", &self.config.identity)
            .field("is_leader", &self.is_leader())
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    pub fn new(
        lock: Arc<dyn LeaseLock>,
        config: LeaderElectionConfig,
        callbacks: Arc<dyn LeaderCallbacks>,
    ) -> Self {
        Self {
            lock,
            config,
            callbacks,
            is_leader: AtomicBool::new(false),
            observed_leader: Mutex::new(None),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: ClaimMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Campaigns, leads and re-campaigns until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), LeaseError> {
        info!(
            "Starting leader election on {} as {}",
            self.lock.describe(),
            self.config.identity
        );
        loop {
            if !self.acquire(&shutdown).await {
                return Ok(());
            }

            self.set_leading(true);
            let leading = shutdown.child_token();
            self.callbacks.on_started_leading(leading.clone()).await;

            self.renew_until_lost(&shutdown).await;

            self.set_leading(false);
            leading.cancel();
            self.callbacks.on_stopped_leading().await;

            if shutdown.is_cancelled() {
                self.release().await;
                return Ok(());
            }
        }
    }

    /// Returns `false` if shutdown came first.
    async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("{} acquired {}", self.config.identity, self.lock.describe());
                    return true;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to acquire {}: {}", self.lock.describe(), e),
            }
            tokio::select! {
                () = shutdown.cancelled() => return false,
                () = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    async fn renew_until_lost(&self, shutdown: &CancellationToken) {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(self.config.retry_period) => {}
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewal = Instant::now(),
                Ok(false) => {
                    warn!("{} lost {}", self.config.identity, self.lock.describe());
                    return;
                }
                Err(e) => {
                    warn!("Failed to renew {}: {}", self.lock.describe(), e);
                    if last_renewal.elapsed() >= self.config.renew_deadline {
                        warn!(
                            "{} could not renew within {:?}, stepping down",
                            self.config.identity, self.config.renew_deadline
                        );
                        return;
                    }
                }
            }
        }
    }

    /// One acquire-or-renew round; `Ok(true)` when we hold the lease after it.
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaseError> {
        let now = Utc::now();
        let identity = self.config.identity.as_str();

        let Some(current) = self.lock.get().await? else {
            let record = LeaderRecord {
                holder_identity: Some(identity.to_string()),
                lease_duration: self.config.lease_duration,
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: 0,
            };
            return match self.lock.create(&record).await {
                Ok(_) => {
                    self.observe(identity).await;
                    Ok(true)
                }
                Err(LeaseError::AlreadyExists(_)) => Ok(false),
                Err(e) => Err(e),
            };
        };

        if let Some(holder) = current.record.holder() {
            self.observe(holder).await;
        }

        let held_by_us = current.record.is_held_by(identity);
        if !held_by_us && current.record.holder().is_some() && !current.record.is_expired_at(now) {
            return Ok(false);
        }

        let mut record = current.record.clone();
        record.lease_duration = self.config.lease_duration;
        record.renew_time = Some(now);
        if !held_by_us {
            debug!(
                "Taking over {} from {:?}",
                self.lock.describe(),
                current.record.holder()
            );
            record.holder_identity = Some(identity.to_string());
            record.acquire_time = Some(now);
            record.lease_transitions += 1;
        }

        match self.lock.update(&record, &current.version).await {
            Ok(_) => {
                self.observe(identity).await;
                Ok(true)
            }
            Err(LeaseError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Clears the holder if it is still us.
    async fn release(&self) {
        let current = match self.lock.get().await {
            Ok(Some(current)) if current.record.is_held_by(&self.config.identity) => current,
            Ok(_) => return,
            Err(e) => {
                warn!("Failed to read {} for release: {}", self.lock.describe(), e);
                return;
            }
        };
        let mut record = current.record;
        record.holder_identity = None;
        record.renew_time = Some(Utc::now());
        match self.lock.update(&record, &current.version).await {
            Ok(_) => info!("{} released {}", self.config.identity, self.lock.describe()),
            Err(e) => warn!("Failed to release {}: {}", self.lock.describe(), e),
        }
    }

    fn set_leading(&self, leading: bool) {
        self.is_leader.store(leading, Ordering::SeqCst);
        if let Some(metrics) = &self.metrics {
            metrics.record_leader_transition(leading);
        }
    }

    async fn observe(&self, holder: &str) {
        let changed = {
            let mut observed = self
                .observed_leader
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if observed.as_deref() == Some(holder) {
                false
            } else {
                *observed = Some(holder.to_string());
                true
            }
        };
        if changed {
            info!("Observed new leader {} on {}", holder, self.lock.describe());
            if holder != self.config.identity {
                self.callbacks.on_new_leader(holder).await;
            }
        }
    }
}
