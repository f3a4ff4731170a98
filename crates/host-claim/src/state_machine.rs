//! PhysicalHost lifecycle state machine
//!
//! Pure validation: no I/O, no mutation. The allowed-transition table is
//! keyed by the current state; each rule names a target and a guard that
//! must hold on the host's fields for the move to be legal.
//!
//! ```text
//! None -> Enrolling -> Available -> Claimed -> Provisioning -> Provisioned
//!                         ^   |                                     |
//!                         |   +--> Deprovisioning <-----------------+
//!                         +--------------/
//! Error <- every active state;  Unknown -> Enrolling
//! ```

use crate::error::{ConsistencyError, TransitionError};
use crds::{HostState, PhysicalHost};
use std::collections::HashMap;

type Guard = fn(&PhysicalHost) -> Result<(), String>;

#[derive(Debug, Clone, Copy)]
struct TransitionRule {
    target: HostState,
    guard: Guard,
}

const fn rule(target: HostState, guard: Guard) -> TransitionRule {
    TransitionRule { target, guard }
}

fn always(_: &PhysicalHost) -> Result<(), String> {
    Ok(())
}

fn connection_present(host: &PhysicalHost) -> Result<(), String> {
    if host.spec.redfish.address.trim().is_empty() {
        return Err("redfish connection address is required".to_string());
    }
    if host.spec.redfish.credentials_name.trim().is_empty() {
        return Err("redfish credentials reference is required".to_string());
    }
    Ok(())
}

fn consumer_present(host: &PhysicalHost) -> Result<(), String> {
    match host.spec.consumer_ref {
        Some(_) => Ok(()),
        None => Err("consumerRef is required".to_string()),
    }
}

fn consumer_absent(host: &PhysicalHost) -> Result<(), String> {
    match &host.spec.consumer_ref {
        None => Ok(()),
        Some(consumer) => Err(format!("consumerRef must be cleared (held by {})", consumer.name)),
    }
}

fn ready_to_provision(host: &PhysicalHost) -> Result<(), String> {
    consumer_present(host)?;
    if !host.has_boot_iso() {
        return Err("bootIsoSource must be set".to_string());
    }
    Ok(())
}

fn deletion_requested(host: &PhysicalHost) -> Result<(), String> {
    if host.is_being_deleted() {
        Ok(())
    } else {
        Err("deletion marker is required".to_string())
    }
}

fn deletion_requested_unowned(host: &PhysicalHost) -> Result<(), String> {
    deletion_requested(host)?;
    consumer_absent(host)
}

/// Validates lifecycle transitions and state/field consistency
#[derive(Debug, Clone)]
pub struct PhysicalHostStateMachine {
    transitions: HashMap<HostState, Vec<TransitionRule>>,
}

impl Default for PhysicalHostStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalHostStateMachine {
    /// Builds the transition table.
    pub fn new() -> Self {
        use HostState as S;

        let mut transitions = HashMap::new();
        transitions.insert(S::None, vec![rule(S::Enrolling, connection_present)]);
        transitions.insert(
            S::Enrolling,
            vec![
                rule(S::Available, consumer_absent),
                rule(S::Error, always),
                rule(S::Unknown, always),
            ],
        );
        transitions.insert(
            S::Available,
            vec![
                rule(S::Claimed, consumer_present),
                rule(S::Deprovisioning, deletion_requested_unowned),
                rule(S::Enrolling, connection_present),
                rule(S::Error, always),
                rule(S::Unknown, always),
            ],
        );
        transitions.insert(
            S::Claimed,
            vec![
                rule(S::Provisioning, ready_to_provision),
                rule(S::Available, consumer_absent),
                rule(S::Error, always),
                rule(S::Unknown, always),
            ],
        );
        transitions.insert(
            S::Provisioning,
            vec![
                rule(S::Provisioned, ready_to_provision),
                rule(S::Claimed, consumer_present),
                rule(S::Available, consumer_absent),
                rule(S::Error, always),
                rule(S::Unknown, always),
            ],
        );
        transitions.insert(
            S::Provisioned,
            vec![
                rule(S::Deprovisioning, deletion_requested),
                rule(S::Claimed, consumer_present),
                rule(S::Available, consumer_absent),
                rule(S::Error, always),
                rule(S::Unknown, always),
            ],
        );
        transitions.insert(
            S::Deprovisioning,
            vec![
                rule(S::Available, consumer_absent),
                rule(S::Error, always),
                rule(S::Unknown, always),
            ],
        );
        transitions.insert(
            S::Error,
            vec![
                rule(S::Enrolling, connection_present),
                rule(S::Available, consumer_absent),
                rule(S::Claimed, consumer_present),
                rule(S::Deprovisioning, deletion_requested_unowned),
            ],
        );
        transitions.insert(
            S::Unknown,
            vec![rule(S::Enrolling, connection_present), rule(S::Error, always)],
        );

        Self { transitions }
    }

    /// Checks whether `host` may move from its current state to `target`.
    ///
    /// Same-state transitions always succeed so reconciliation can replay.
    pub fn validate_transition(
        &self,
        host: &PhysicalHost,
        target: HostState,
    ) -> Result<(), TransitionError> {
        let from = host.state();
        if from == target {
            return Ok(());
        }

        let error = |reason: String| TransitionError {
            host: host.key(),
            from,
            to: target,
            reason,
        };

        let rule = self
            .transitions
            .get(&from)
            .and_then(|rules| rules.iter().find(|r| r.target == target))
            .ok_or_else(|| error(format!("no transition from {from} to {target}")))?;

        (rule.guard)(host).map_err(error)
    }

    /// Legal targets from `state`, in table order.
    pub fn allowed_targets(&self, state: HostState) -> Vec<HostState> {
        self.transitions
            .get(&state)
            .map(|rules| rules.iter().map(|r| r.target).collect())
            .unwrap_or_default()
    }

    /// Cross-checks the state against the host's fields.
    pub fn validate_state_consistency(&self, host: &PhysicalHost) -> Result<(), ConsistencyError> {
        let state = host.state();
        let error = |reason: &str| ConsistencyError {
            host: host.key(),
            state,
            reason: reason.to_string(),
        };

        match state {
            HostState::None | HostState::Enrolling => {
                if host.spec.consumer_ref.is_some() {
                    return Err(error("consumerRef set before the host is available"));
                }
            }
            HostState::Available => {
                if host.spec.consumer_ref.is_some() {
                    return Err(error("available host must not carry a consumerRef"));
                }
                if host.spec.boot_iso_source.is_some() {
                    return Err(error("available host must not carry a bootIsoSource"));
                }
            }
            HostState::Claimed => {
                if host.spec.consumer_ref.is_none() {
                    return Err(error("claimed host has no consumerRef"));
                }
            }
            HostState::Provisioning | HostState::Provisioned => {
                if host.spec.consumer_ref.is_none() {
                    return Err(error("provisioning host has no consumerRef"));
                }
                if !host.has_boot_iso() {
                    return Err(error("provisioning host has no bootIsoSource"));
                }
            }
            HostState::Deprovisioning | HostState::Error | HostState::Unknown => {}
        }

        if state != HostState::None && !host.spec.redfish.is_complete() {
            return Err(error("redfish connection is incomplete"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{available_host, claim_consumer, host_in_state};
    use crds::HostState as S;

    fn sm() -> PhysicalHostStateMachine {
        PhysicalHostStateMachine::new()
    }

    #[test]
    fn test_same_state_always_allowed() {
        for state in S::ALL {
            let host = host_in_state("h", state);
            assert!(sm().validate_transition(&host, state).is_ok(), "{state} -> {state}");
        }
    }

    #[test]
    fn test_claimed_guard_depends_only_on_consumer() {
        // For every consistent host the answer is "consumerRef present?"
        for state in S::ALL {
            let host = host_in_state("h", state);
            if sm().validate_state_consistency(&host).is_err() || state == S::Claimed {
                continue;
            }
            let result = sm().validate_transition(&host, S::Claimed);
            assert_eq!(
                result.is_ok(),
                host.spec.consumer_ref.is_some(),
                "{state} -> Claimed: {result:?}"
            );
        }
    }

    #[test]
    fn test_available_to_claimed_requires_consumer() {
        let mut host = available_host("h");
        let err = sm().validate_transition(&host, S::Claimed).unwrap_err();
        assert_eq!(err.from, S::Available);
        assert_eq!(err.to, S::Claimed);
        assert!(err.reason.contains("consumerRef"));

        host.spec.consumer_ref = Some(claim_consumer("m1"));
        assert!(sm().validate_transition(&host, S::Claimed).is_ok());
    }

    #[test]
    fn test_provisioning_requires_boot_iso() {
        let mut host = host_in_state("h", S::Claimed);
        assert!(sm().validate_transition(&host, S::Provisioning).is_err());

        host.spec.boot_iso_source = Some("  ".to_string());
        assert!(sm().validate_transition(&host, S::Provisioning).is_err());

        host.spec.boot_iso_source = Some("http://images/ubuntu.iso".to_string());
        assert!(sm().validate_transition(&host, S::Provisioning).is_ok());
    }

    #[test]
    fn test_enrolling_requires_connection() {
        let mut host = host_in_state("h", S::None);
        host.spec.redfish.credentials_name.clear();
        let err = sm().validate_transition(&host, S::Enrolling).unwrap_err();
        assert!(err.reason.contains("credentials"));
    }

    #[test]
    fn test_deprovisioning_requires_deletion_marker() {
        let provisioned = host_in_state("h", S::Provisioned);
        assert!(sm().validate_transition(&provisioned, S::Deprovisioning).is_err());

        let mut deleting = provisioned.clone();
        deleting.metadata.deletion_timestamp = Some(crds::meta::from_utc(chrono::Utc::now()).unwrap());
        // Provisioned hosts may keep their consumer while deprovisioning
        assert!(sm().validate_transition(&deleting, S::Deprovisioning).is_ok());

        let mut available = available_host("a");
        available.metadata.deletion_timestamp = deleting.metadata.deletion_timestamp.clone();
        assert!(sm().validate_transition(&available, S::Deprovisioning).is_ok());
        available.spec.consumer_ref = Some(claim_consumer("m1"));
        assert!(sm().validate_transition(&available, S::Deprovisioning).is_err());
    }

    #[test]
    fn test_no_rule_is_an_error() {
        let host = host_in_state("h", S::None);
        let err = sm().validate_transition(&host, S::Provisioned).unwrap_err();
        assert!(err.reason.contains("no transition"));
    }

    #[test]
    fn test_error_reachable_from_every_active_state() {
        for state in [S::Enrolling, S::Available, S::Claimed, S::Provisioning, S::Provisioned, S::Deprovisioning, S::Unknown] {
            assert!(sm().allowed_targets(state).contains(&S::Error), "{state}");
        }
    }

    #[test]
    fn test_unknown_routes_through_enrolling() {
        assert_eq!(sm().allowed_targets(S::Unknown), vec![S::Enrolling, S::Error]);
    }

    #[test]
    fn test_available_with_consumer_is_inconsistent() {
        let mut host = available_host("h");
        assert!(sm().validate_state_consistency(&host).is_ok());
        host.spec.consumer_ref = Some(claim_consumer("m1"));
        let err = sm().validate_state_consistency(&host).unwrap_err();
        assert_eq!(err.state, S::Available);
    }
}
