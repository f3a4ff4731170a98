//! Host claiming with optimistic locking
//!
//! Candidates are ranked, then claimed one at a time through the transition
//! guard. The guard's conditional write is the only arbiter between
//! concurrent claimers: whoever loses the race moves on to the next
//! candidate, and running out of candidates is a normal "retry later".

use crate::config::ClaimConfig;
use crate::error::ClaimError;
use crate::guard::StateTransitionGuard;
use crate::metrics::{ClaimMetrics, ClaimOutcome};
use crds::{ConsumerRef, HostSelector, HostState, MetalMachine, PhysicalHost};
use std::cmp::Reverse;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Anything that can hand out and take back physical hosts.
#[async_trait::async_trait]
pub trait ClaimCoordinator: Send + Sync {
    /// Claims a host for the request's machine.
    ///
    /// "Nothing available" is `Ok` with `success == false`; `Err` is
    /// reserved for validation and infrastructure failures.
    async fn claim_host(&self, request: &ClaimRequest) -> Result<ClaimResult, ClaimError>;

    /// Releases whatever host `machine` owns. Releasing nothing is `Ok`.
    async fn release_host(&self, machine: &MetalMachine) -> Result<(), ClaimError>;
}

/// What a machine needs from a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostRequirements {
    /// Every tag must match
    pub required_tags: Vec<String>,
    /// Matches raise a host's rank
    pub preferred_tags: Vec<String>,
    pub min_cpu_count: Option<u32>,
    pub min_memory_gib: Option<u32>,
}

impl HostRequirements {
    /// Requirements from a machine's selector.
    pub fn from_selector(selector: &HostSelector) -> Self {
        Self {
            required_tags: selector.required_tags.clone(),
            preferred_tags: selector.preferred_tags.clone(),
            min_cpu_count: selector.min_cpu_count,
            min_memory_gib: selector.min_memory_gib,
        }
    }

    /// No tags at all.
    pub fn is_untagged(&self) -> bool {
        self.required_tags.is_empty() && self.preferred_tags.is_empty()
    }

    /// Hard filter: required tags and hardware minimums.
    ///
    /// A host without inspection data fails any hardware minimum.
    pub fn matches(&self, host: &PhysicalHost) -> bool {
        if !self.required_tags.iter().all(|tag| tag_matches(host, tag)) {
            return false;
        }
        let hardware = host.spec.hardware.as_ref();
        if let Some(min) = self.min_cpu_count {
            if hardware.and_then(|h| h.cpu_count).is_none_or(|cpus| cpus < min) {
                return false;
            }
        }
        if let Some(min) = self.min_memory_gib {
            if hardware.and_then(|h| h.memory_gib).is_none_or(|mem| mem < min) {
                return false;
            }
        }
        true
    }

    /// Number of preferred tags the host satisfies.
    pub fn preference_score(&self, host: &PhysicalHost) -> usize {
        self.preferred_tags
            .iter()
            .filter(|tag| tag_matches(host, tag))
            .count()
    }
}

/// `key=value` matches label `key` with that value; bare `key` matches any value.
pub fn tag_matches(host: &PhysicalHost, tag: &str) -> bool {
    match tag.split_once('=') {
        Some((key, value)) => host.label(key.trim()) == Some(value.trim()),
        None => host.has_label(tag.trim()),
    }
}

/// A machine asking for a host.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub machine: MetalMachine,
    pub requirements: HostRequirements,
}

impl ClaimRequest {
    /// Request built from the machine's own selector.
    pub fn for_machine(machine: MetalMachine) -> Self {
        let requirements = HostRequirements::from_selector(&machine.spec.host_selector);
        Self {
            machine,
            requirements,
        }
    }

    fn validate(&self) -> Result<(), ClaimError> {
        if self.machine.metadata.name.as_deref().is_none_or(str::is_empty) {
            return Err(ClaimError::InvalidRequest("machine has no name".to_string()));
        }
        Ok(())
    }
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimResult {
    pub success: bool,
    /// The claimed host on success
    pub host: Option<PhysicalHost>,
    /// Whether trying again later may succeed
    pub retry: bool,
    /// Suggested wait before the next attempt
    pub retry_after: Option<Duration>,
    /// Human-readable explanation
    pub reason: String,
}

impl ClaimResult {
    /// A successful claim.
    pub fn claimed(host: PhysicalHost) -> Self {
        let reason = format!("claimed host {}", host.key());
        Self {
            success: true,
            host: Some(host),
            retry: false,
            retry_after: None,
            reason,
        }
    }

    /// Nothing claimable now; try again after `after`.
    pub fn retry_later(after: Duration, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            host: None,
            retry: true,
            retry_after: Some(after),
            reason: reason.into(),
        }
    }

    /// Failure that retrying will not fix.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            host: None,
            retry: false,
            retry_after: None,
            reason: reason.into(),
        }
    }
}

/// Claims hosts using conditional writes only
#[derive(Debug, Clone)]
pub struct HostClaimCoordinator {
    guard: StateTransitionGuard,
    config: ClaimConfig,
    metrics: Option<ClaimMetrics>,
}

impl HostClaimCoordinator {
    /// Creates a coordinator writing through `guard`.
    pub fn new(guard: StateTransitionGuard, config: ClaimConfig) -> Self {
        Self {
            guard,
            config,
            metrics: None,
        }
    }

    /// Records claim outcomes on `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: ClaimMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The guard used for every write.
    pub fn guard(&self) -> &StateTransitionGuard {
        &self.guard
    }

    /// Configured wait suggested on retryable failures.
    pub fn retry_after(&self) -> Duration {
        self.config.retry_after
    }

    /// The host `machine` currently owns, if any.
    pub async fn find_claimed_host(
        &self,
        machine: &MetalMachine,
    ) -> Result<Option<PhysicalHost>, ClaimError> {
        let hosts = self.guard.store().list().await?;
        Ok(hosts.into_iter().find(|h| owned_by(h, machine)))
    }

    /// Available, unowned, not being deleted, and meets `requirements`,
    /// best first.
    pub fn rank_candidates(
        hosts: Vec<PhysicalHost>,
        requirements: &HostRequirements,
    ) -> Vec<PhysicalHost> {
        let mut candidates: Vec<(usize, PhysicalHost)> = hosts
            .into_iter()
            .filter(|h| is_claimable(h) && requirements.matches(h))
            .map(|h| (requirements.preference_score(&h), h))
            .collect();
        candidates.sort_by(|(a_score, a), (b_score, b)| {
            (Reverse(*a_score), a.name()).cmp(&(Reverse(*b_score), b.name()))
        });
        candidates.into_iter().map(|(_, h)| h).collect()
    }

    fn record(&self, outcome: ClaimOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.record_claim("optimistic", outcome);
        }
    }

    async fn try_claim(
        &self,
        mut host: PhysicalHost,
        request: &ClaimRequest,
    ) -> Result<Option<PhysicalHost>, ClaimError> {
        let machine = &request.machine;
        let consumer = ConsumerRef::for_machine(machine);

        let result = self
            .guard
            .transition_with(&mut host, HostState::Claimed, |fresh| {
                if let Some(owner) = &fresh.spec.consumer_ref {
                    if !owner.same_consumer(&consumer) {
                        return Err(ClaimError::Rejected {
                            host: fresh.key(),
                            reason: format!("already claimed by {}", owner.name),
                        });
                    }
                }
                if !is_claimable(fresh) || !request.requirements.matches(fresh) {
                    return Err(ClaimError::Rejected {
                        host: fresh.key(),
                        reason: format!("no longer claimable ({})", fresh.state()),
                    });
                }
                fresh.spec.consumer_ref = Some(consumer.clone());
                Ok(())
            })
            .await;

        match result {
            // Adoption hands back a host some other machine may have claimed
            Ok(()) if owned_by(&host, machine) => Ok(Some(host)),
            Ok(()) => {
                debug!("Host {} was claimed concurrently by another machine", host.key());
                Ok(None)
            }
            Err(e) if e.is_lost_race() => {
                debug!("Lost race for host {}: {}", host.key(), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl ClaimCoordinator for HostClaimCoordinator {
    async fn claim_host(&self, request: &ClaimRequest) -> Result<ClaimResult, ClaimError> {
        request.validate()?;
        let machine = &request.machine;

        let hosts = match self.guard.store().list().await {
            Ok(hosts) => hosts,
            Err(e) => {
                self.record(ClaimOutcome::Failed);
                return Err(e.into());
            }
        };

        if let Some(existing) = hosts.iter().find(|h| owned_by(h, machine)) {
            debug!("Machine {} already owns host {}", machine.key(), existing.key());
            self.record(ClaimOutcome::Replayed);
            return Ok(ClaimResult::claimed(existing.clone()));
        }

        let candidates = Self::rank_candidates(hosts, &request.requirements);
        if candidates.is_empty() {
            debug!("No available host matches machine {}", machine.key());
            self.record(ClaimOutcome::NoCandidates);
            return Ok(ClaimResult::retry_later(
                self.config.retry_after,
                "no available host matches the requirements",
            ));
        }

        let attempted = candidates.len();
        for candidate in candidates {
            match self.try_claim(candidate, request).await {
                Ok(Some(host)) => {
                    info!("Machine {} claimed host {}", machine.key(), host.key());
                    self.record(ClaimOutcome::Claimed);
                    return Ok(ClaimResult::claimed(host));
                }
                Ok(None) => {}
                Err(e) => {
                    self.record(ClaimOutcome::Failed);
                    return Err(e);
                }
            }
        }

        debug!(
            "Machine {} lost all {} candidate races",
            machine.key(),
            attempted
        );
        self.record(ClaimOutcome::LostRaces);
        Ok(ClaimResult::retry_later(
            self.config.retry_after,
            format!("all {attempted} matching hosts were claimed concurrently"),
        ))
    }

    async fn release_host(&self, machine: &MetalMachine) -> Result<(), ClaimError> {
        let hosts = self.guard.store().list().await?;
        let owned: Vec<PhysicalHost> = hosts.into_iter().filter(|h| owned_by(h, machine)).collect();
        if owned.is_empty() {
            debug!("Machine {} owns no host, nothing to release", machine.key());
            return Ok(());
        }

        for mut host in owned {
            let result = self
                .guard
                .transition_with(&mut host, HostState::Available, |fresh| {
                    match &fresh.spec.consumer_ref {
                        Some(owner) if owner.refers_to(machine) => {}
                        Some(owner) => {
                            return Err(ClaimError::Rejected {
                                host: fresh.key(),
                                reason: format!("now owned by {}", owner.name),
                            });
                        }
                        None => {}
                    }
                    fresh.spec.consumer_ref = None;
                    fresh.spec.boot_iso_source = None;
                    Ok(())
                })
                .await;

            match result {
                Ok(()) => info!("Machine {} released host {}", machine.key(), host.key()),
                Err(e @ ClaimError::Rejected { .. }) => {
                    debug!("Skipping release of host {}: {}", host.key(), e);
                }
                Err(e) => {
                    warn!("Failed to release host {}: {}", host.key(), e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

fn is_claimable(host: &PhysicalHost) -> bool {
    host.state() == HostState::Available
        && host.spec.consumer_ref.is_none()
        && !host.is_being_deleted()
}

fn owned_by(host: &PhysicalHost, machine: &MetalMachine) -> bool {
    host.spec
        .consumer_ref
        .as_ref()
        .is_some_and(|c| c.refers_to(machine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{available_host, with_labels};
    use crds::HardwareDetails;

    #[test]
    fn test_tag_matching() {
        let host = with_labels(available_host("h1"), &[("rack", "r1"), ("gpu", "a100")]);
        assert!(tag_matches(&host, "rack=r1"));
        assert!(!tag_matches(&host, "rack=r2"));
        assert!(tag_matches(&host, "gpu"));
        assert!(!tag_matches(&host, "ssd"));
    }

    #[test]
    fn test_hardware_minimums() {
        let mut host = available_host("h1");
        host.spec.hardware = Some(HardwareDetails {
            cpu_count: Some(16),
            memory_gib: Some(64),
            ..Default::default()
        });
        let mut req = HostRequirements {
            min_cpu_count: Some(16),
            min_memory_gib: Some(64),
            ..Default::default()
        };
        assert!(req.matches(&host));
        req.min_memory_gib = Some(65);
        assert!(!req.matches(&host));

        host.spec.hardware = None;
        req.min_memory_gib = None;
        assert!(!req.matches(&host));
    }

    #[test]
    fn test_ranking_prefers_tags_then_name() {
        let hosts = vec![
            with_labels(available_host("c"), &[("ssd", "true")]),
            available_host("a"),
            with_labels(available_host("b"), &[("ssd", "true"), ("rack", "r1")]),
            with_labels(available_host("d"), &[("ssd", "true")]),
        ];
        let req = HostRequirements {
            preferred_tags: vec!["ssd".to_string(), "rack=r1".to_string()],
            ..Default::default()
        };
        let ranked: Vec<_> = HostClaimCoordinator::rank_candidates(hosts, &req)
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(ranked, vec!["b", "c", "d", "a"]);
    }

    #[test]
    fn test_ranking_excludes_unclaimable() {
        let mut deleting = available_host("deleting");
        deleting.metadata.deletion_timestamp = Some(crds::meta::from_utc(chrono::Utc::now()).unwrap());
        let hosts = vec![
            deleting,
            crate::test_fixtures::host_in_state("claimed", HostState::Claimed),
            crate::test_fixtures::host_in_state("enrolling", HostState::Enrolling),
            with_labels(available_host("untagged"), &[]),
            with_labels(available_host("tagged"), &[("zone", "a")]),
        ];
        let req = HostRequirements {
            required_tags: vec!["zone=a".to_string()],
            ..Default::default()
        };
        let ranked = HostClaimCoordinator::rank_candidates(hosts, &req);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name(), "tagged");
    }
}
