//! Stuck-state detection and recovery
//!
//! A host is stuck when it sits in a transient state longer than the
//! caller's timeout. The lifecycle clock is the most recent condition
//! transition, falling back to the creation timestamp.

use crate::error::ClaimError;
use crate::guard::StateTransitionGuard;
use chrono::{DateTime, Utc};
use crds::meta::creation_time;
use crds::{
    CONDITION_STUCK_RECOVERY, ConditionStatus, HostCondition, HostState, PhysicalHost,
    latest_transition, set_condition,
};
use std::time::Duration;
use tracing::{debug, warn};

/// A host found past its timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckState {
    pub host: String,
    pub state: HostState,
    pub elapsed: Duration,
}

/// What recovery did to a stuck host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// State re-armed with a fresh condition so the reconciler tries again
    Retried,
    /// Orphaned provisioning host returned to the pool
    Released,
    /// Moved to `Error` for operator attention
    Escalated,
}

impl RecoveryAction {
    fn reason(self) -> &'static str {
        match self {
            RecoveryAction::Retried => "Retrying",
            RecoveryAction::Released => "Released",
            RecoveryAction::Escalated => "Escalated",
        }
    }
}

/// Pure stuck check against an explicit clock.
pub fn detect_stuck_state_at(
    host: &PhysicalHost,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Option<StuckState> {
    let state = host.state();
    if !state.is_transient() {
        return None;
    }
    let since = latest_transition(&host.spec.conditions).or_else(|| creation_time(&host.metadata))?;
    // A clock in the future reads as zero elapsed
    let elapsed = (now - since).to_std().unwrap_or_default();
    (elapsed > timeout).then(|| StuckState {
        host: host.key(),
        state,
        elapsed,
    })
}

/// Picks and applies the recovery policy for stuck hosts
#[derive(Debug, Clone)]
pub struct StateRecoveryManager {
    guard: StateTransitionGuard,
}

impl StateRecoveryManager {
    /// Creates a manager writing through `guard`.
    pub fn new(guard: StateTransitionGuard) -> Self {
        Self { guard }
    }

    /// Stuck check against the wall clock.
    pub fn detect_stuck_state(&self, host: &PhysicalHost, timeout: Duration) -> Option<StuckState> {
        detect_stuck_state_at(host, timeout, Utc::now())
    }

    /// Recovers `host` if it is stuck; `Ok(None)` when it is not.
    pub async fn recover(
        &self,
        host: &mut PhysicalHost,
        timeout: Duration,
    ) -> Result<Option<RecoveryAction>, ClaimError> {
        let Some(stuck) = self.detect_stuck_state(host, timeout) else {
            return Ok(None);
        };

        let action = match stuck.state {
            HostState::Provisioning if host.spec.consumer_ref.is_none() => RecoveryAction::Released,
            HostState::Enrolling | HostState::Provisioning | HostState::Deprovisioning => {
                RecoveryAction::Retried
            }
            _ => RecoveryAction::Escalated,
        };

        warn!(
            "Host {} stuck in {} for {}s, recovery: {:?}",
            stuck.host,
            stuck.state,
            stuck.elapsed.as_secs(),
            action
        );

        let condition = HostCondition::new(
            CONDITION_STUCK_RECOVERY,
            ConditionStatus::True,
            action.reason(),
            format!("stuck in {} for {}s", stuck.state, stuck.elapsed.as_secs()),
        );
        let expect_state = |h: &PhysicalHost| {
            if h.state() == stuck.state {
                Ok(())
            } else {
                Err(ClaimError::Rejected {
                    host: h.key(),
                    reason: format!("moved from {} to {} before recovery", stuck.state, h.state()),
                })
            }
        };

        match action {
            RecoveryAction::Released => {
                self.guard
                    .transition_with(host, HostState::Available, |h| {
                        expect_state(h)?;
                        h.spec.boot_iso_source = None;
                        set_condition(&mut h.spec.conditions, condition.clone());
                        Ok(())
                    })
                    .await?;
            }
            RecoveryAction::Retried => {
                self.guard
                    .refresh_with(host, |h| {
                        expect_state(h)?;
                        set_condition(&mut h.spec.conditions, condition.clone());
                        Ok(())
                    })
                    .await?;
            }
            RecoveryAction::Escalated => {
                self.guard
                    .transition_with(host, HostState::Error, |h| {
                        expect_state(h)?;
                        set_condition(&mut h.spec.conditions, condition.clone());
                        Ok(())
                    })
                    .await?;
            }
        }
        Ok(Some(action))
    }

    /// Checks every stored host; per-host failures are logged and skipped.
    pub async fn recover_stuck_hosts(
        &self,
        timeout: Duration,
    ) -> Result<Vec<(String, RecoveryAction)>, ClaimError> {
        let hosts = self.guard.store().list().await?;
        let mut recovered = Vec::new();
        for mut host in hosts {
            let key = host.key();
            match self.recover(&mut host, timeout).await {
                Ok(Some(action)) => recovered.push((key, action)),
                Ok(None) => {}
                Err(e) if e.is_lost_race() => {
                    debug!("Skipping recovery of host {}: {}", key, e);
                }
                Err(e) => warn!("Recovery of host {} failed: {}", key, e),
            }
        }
        Ok(recovered)
    }
}
