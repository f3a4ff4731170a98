//! Guarded lifecycle transitions
//!
//! The only code path that writes `PhysicalHost` state. Each attempt works
//! on a freshly read copy: mutate, validate, conditional update. Conflicts
//! are retried with exponential backoff; everything else aborts.

use crate::config::GuardConfig;
use crate::error::ClaimError;
use crate::state_machine::PhysicalHostStateMachine;
use crate::store::{HostStore, host_namespace};
use crds::{
    CONDITION_STATE_TRANSITION, ConditionStatus, HostCondition, HostState, PhysicalHost,
    set_condition,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Serializes lifecycle changes through validation and conditional writes
#[derive(Clone)]
pub struct StateTransitionGuard {
    store: Arc<dyn HostStore>,
    state_machine: PhysicalHostStateMachine,
    config: GuardConfig,
}

impl std::fmt::Debug for StateTransitionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTransitionGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StateTransitionGuard {
    /// Creates a guard writing through `store`.
    pub fn new(store: Arc<dyn HostStore>, config: GuardConfig) -> Self {
        Self {
            store,
            state_machine: PhysicalHostStateMachine::new(),
            config,
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn HostStore> {
        &self.store
    }

    /// The validator used on every attempt.
    pub fn state_machine(&self) -> &PhysicalHostStateMachine {
        &self.state_machine
    }

    /// Moves `host` to `target` without touching other fields.
    pub async fn transition_to(
        &self,
        host: &mut PhysicalHost,
        target: HostState,
    ) -> Result<(), ClaimError> {
        self.transition_with(host, target, |_| Ok(())).await
    }

    /// Moves `host` to `target`, applying `mutate` to each fresh copy first.
    ///
    /// If the stored host is already in `target` the stored copy is adopted
    /// into `host` and the call succeeds without writing; callers that care
    /// who put it there must inspect the adopted copy. `mutate` may return
    /// `ClaimError::Rejected` to abort without retry.
    pub async fn transition_with<F>(
        &self,
        host: &mut PhysicalHost,
        target: HostState,
        mutate: F,
    ) -> Result<(), ClaimError>
    where
        F: Fn(&mut PhysicalHost) -> Result<(), ClaimError> + Send + Sync,
    {
        self.apply(host, Some(target), &mutate).await
    }

    /// Conditional same-state update, e.g. to re-arm a transient state.
    pub async fn refresh_with<F>(&self, host: &mut PhysicalHost, mutate: F) -> Result<(), ClaimError>
    where
        F: Fn(&mut PhysicalHost) -> Result<(), ClaimError> + Send + Sync,
    {
        self.apply(host, None, &mutate).await
    }

    async fn apply<F>(
        &self,
        host: &mut PhysicalHost,
        target: Option<HostState>,
        mutate: &F,
    ) -> Result<(), ClaimError>
    where
        F: Fn(&mut PhysicalHost) -> Result<(), ClaimError> + Send + Sync,
    {
        let key = host.key();
        let namespace = host_namespace(host).to_string();
        let name = host.name().to_string();
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.initial_backoff;

        for attempt in 1..=max_attempts {
            let mut latest = self.store.get(&namespace, &name).await?;
            let from = latest.state();
            let to = target.unwrap_or(from);

            if target.is_some() && from == to {
                debug!("Host {} already {}, adopting stored copy", key, to);
                *host = latest;
                return Ok(());
            }

            mutate(&mut latest)?;
            // Mutations may not move state themselves
            latest.spec.state = from;
            self.state_machine.validate_transition(&latest, to)?;
            latest.spec.state = to;
            if from != to {
                set_condition(
                    &mut latest.spec.conditions,
                    HostCondition::new(
                        CONDITION_STATE_TRANSITION,
                        ConditionStatus::True,
                        format!("{from}To{to}"),
                        format!("{from} -> {to}"),
                    ),
                );
            }

            match self.store.update(&latest).await {
                Ok(stored) => {
                    if from == to {
                        debug!("Refreshed host {} in state {}", key, to);
                    } else {
                        info!("Host {} transitioned {} -> {}", key, from, to);
                    }
                    *host = stored;
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(
                        "Conflict writing host {} (attempt {}/{}), retrying in {:?}",
                        key, attempt, max_attempts, backoff
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            "Giving up on host {} after {} conflicting updates",
            key, max_attempts
        );
        Err(ClaimError::ConflictRetriesExhausted {
            host: key,
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::InMemoryHostStore;
    use crate::test_fixtures::{available_host, claim_consumer, host_in_state};
    use crds::find_condition;
    use std::time::Duration;

    fn guard(store: &InMemoryHostStore) -> StateTransitionGuard {
        StateTransitionGuard::new(
            Arc::new(store.clone()),
            GuardConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_transition_stamps_condition() {
        let store = InMemoryHostStore::new();
        let mut host = store.insert(host_in_state("h1", HostState::None));

        guard(&store).transition_to(&mut host, HostState::Enrolling).await.unwrap();

        let stored = store.snapshot("default", "h1").unwrap();
        assert_eq!(stored.state(), HostState::Enrolling);
        assert_eq!(host.metadata.resource_version, stored.metadata.resource_version);
        let condition = find_condition(&stored.spec.conditions, CONDITION_STATE_TRANSITION).unwrap();
        assert_eq!(condition.reason, "NoneToEnrolling");
    }

    #[tokio::test]
    async fn test_invalid_transition_is_never_persisted() {
        let store = InMemoryHostStore::new();
        let mut host = store.insert(available_host("h1"));

        let err = guard(&store).transition_to(&mut host, HostState::Claimed).await.unwrap_err();

        assert!(matches!(err, ClaimError::Transition(_)));
        assert_eq!(store.update_count(), 0);
        assert_eq!(store.snapshot("default", "h1").unwrap().state(), HostState::Available);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = InMemoryHostStore::new();
        let mut host = store.insert(available_host("h1"));
        store.inject_conflicts(2);

        guard(&store)
            .transition_with(&mut host, HostState::Claimed, |h| {
                h.spec.consumer_ref = Some(claim_consumer("m1"));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(host.state(), HostState::Claimed);
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn test_conflict_budget_exhausted() {
        let store = InMemoryHostStore::new();
        let mut host = store.insert(available_host("h1"));
        store.inject_conflicts(3);

        let err = guard(&store)
            .transition_with(&mut host, HostState::Claimed, |h| {
                h.spec.consumer_ref = Some(claim_consumer("m1"));
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ClaimError::ConflictRetriesExhausted { attempts: 3, .. }));
        assert!(err.is_lost_race());
    }

    #[tokio::test]
    async fn test_backend_error_aborts_immediately() {
        let store = InMemoryHostStore::new();
        let mut host = store.insert(host_in_state("h1", HostState::None));
        store.fail_with("etcd unavailable");

        let err = guard(&store).transition_to(&mut host, HostState::Enrolling).await.unwrap_err();

        assert!(matches!(err, ClaimError::Store(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_adopts_when_already_in_target() {
        let store = InMemoryHostStore::new();
        let mut stale = store.insert(available_host("h1"));
        let mut winner = stale.clone();
        guard(&store)
            .transition_with(&mut winner, HostState::Claimed, |h| {
                h.spec.consumer_ref = Some(claim_consumer("winner"));
                Ok(())
            })
            .await
            .unwrap();

        guard(&store).transition_to(&mut stale, HostState::Claimed).await.unwrap();

        assert_eq!(stale.spec.consumer_ref.unwrap().name, "winner");
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn test_rejecting_mutation_aborts() {
        let store = InMemoryHostStore::new();
        let mut host = store.insert(available_host("h1"));

        let err = guard(&store)
            .transition_with(&mut host, HostState::Claimed, |h| {
                Err(ClaimError::Rejected {
                    host: h.key(),
                    reason: "not for you".to_string(),
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ClaimError::Rejected { .. }));
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_keeps_state_and_bumps_version() {
        let store = InMemoryHostStore::new();
        let mut host = store.insert(host_in_state("h1", HostState::Provisioning));
        let before = host.metadata.resource_version.clone();

        guard(&store)
            .refresh_with(&mut host, |h| {
                h.spec.boot_iso_source = Some("http://images/v2.iso".to_string());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(host.state(), HostState::Provisioning);
        assert_ne!(host.metadata.resource_version, before);
        assert!(find_condition(&host.spec.conditions, CONDITION_STATE_TRANSITION).is_none());
    }
}
