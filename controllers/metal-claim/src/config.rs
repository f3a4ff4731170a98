//! Controller configuration from environment variables.

use crate::error::ControllerError;
use host_claim::{
    ClaimConfig, GuardConfig, LeaderCoordinatorConfig, LeaderElectionConfig, ProvisioningQueueConfig,
};
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Everything the controller reads at startup.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    pub leader_election_enabled: bool,
    pub election: LeaderElectionConfig,
    pub coordinator: LeaderCoordinatorConfig,
    pub claim: ClaimConfig,
    pub guard: GuardConfig,
    pub queue: ProvisioningQueueConfig,
    /// Transient states older than this are recovered
    pub stuck_state_timeout: Duration,
    /// How often the stuck-state sweep runs
    pub recovery_interval: Duration,
    /// Listen address for `/metrics` and `/healthz`
    pub metrics_addr: SocketAddr,
}

impl ControllerConfig {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());

        let mut election = LeaderElectionConfig::default();
        if let Some(identity) = lookup("POD_NAME").filter(|n| !n.is_empty()) {
            election.identity = identity;
        }
        if let Some(name) = lookup("LEASE_NAME") {
            election.lease_name = name;
        }
        election.lease_namespace = lookup("LEASE_NAMESPACE")
            .or_else(|| lookup("POD_NAMESPACE"))
            .or_else(|| namespace.clone())
            .unwrap_or(election.lease_namespace);
        election.lease_duration = secs(&lookup, "LEASE_DURATION_SECS", election.lease_duration)?;
        election.renew_deadline = secs(&lookup, "RENEW_DEADLINE_SECS", election.renew_deadline)?;
        election.retry_period = secs(&lookup, "RETRY_PERIOD_SECS", election.retry_period)?;

        let mut queue = ProvisioningQueueConfig::default();
        queue.max_concurrent_ops = parse(&lookup, "MAX_CONCURRENT_BMC_OPS", queue.max_concurrent_ops)?;
        queue.bmc_cooldown_period = secs(&lookup, "BMC_COOLDOWN_SECS", queue.bmc_cooldown_period)?;
        queue.max_queue_size = parse(&lookup, "MAX_QUEUE_SIZE", queue.max_queue_size)?;
        queue.worker_count = parse(&lookup, "QUEUE_WORKERS", queue.worker_count)?;

        let mut claim = ClaimConfig::default();
        claim.retry_after = secs(&lookup, "CLAIM_RETRY_AFTER_SECS", claim.retry_after)?;

        let config = Self {
            namespace,
            leader_election_enabled: parse(&lookup, "LEADER_ELECTION_ENABLED", true)?,
            election,
            coordinator: LeaderCoordinatorConfig::default(),
            claim,
            guard: GuardConfig::default(),
            queue,
            stuck_state_timeout: secs(&lookup, "STUCK_STATE_TIMEOUT_SECS", Duration::from_secs(600))?,
            recovery_interval: secs(&lookup, "RECOVERY_INTERVAL_SECS", Duration::from_secs(60))?,
            metrics_addr: parse(&lookup, "METRICS_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ControllerError> {
        let invalid = |msg: &str| Err(ControllerError::InvalidConfig(msg.to_string()));
        if self.election.renew_deadline >= self.election.lease_duration {
            return invalid("RENEW_DEADLINE_SECS must be shorter than LEASE_DURATION_SECS");
        }
        if self.election.retry_period >= self.election.renew_deadline {
            return invalid("RETRY_PERIOD_SECS must be shorter than RENEW_DEADLINE_SECS");
        }
        if self.queue.max_concurrent_ops == 0 {
            return invalid("MAX_CONCURRENT_BMC_OPS must be at least 1");
        }
        if self.queue.worker_count == 0 {
            return invalid("QUEUE_WORKERS must be at least 1");
        }
        if self.queue.max_queue_size == 0 {
            return invalid("MAX_QUEUE_SIZE must be at least 1");
        }
        Ok(())
    }

    /// Logs the effective configuration.
    pub fn log(&self) {
        info!("Configuration:");
        info!("  Namespace: {}", self.namespace.as_deref().unwrap_or("all namespaces"));
        if self.leader_election_enabled {
            info!(
                "  Leader election: lease {}/{} as {} ({:?}/{:?}/{:?})",
                self.election.lease_namespace,
                self.election.lease_name,
                self.election.identity,
                self.election.lease_duration,
                self.election.renew_deadline,
                self.election.retry_period
            );
        } else {
            info!("  Leader election: disabled");
        }
        info!(
            "  BMC operations: {} concurrent, {:?} cooldown, queue size {}, {} workers",
            self.queue.max_concurrent_ops,
            self.queue.bmc_cooldown_period,
            self.queue.max_queue_size,
            self.queue.worker_count
        );
        info!("  Stuck state timeout: {:?}", self.stuck_state_timeout);
        info!("  Metrics address: {}", self.metrics_addr);
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw}: {e}"))),
        None => Ok(default),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ControllerError> {
    parse(lookup, key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ControllerConfig, ControllerError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ControllerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.namespace, None);
        assert!(config.leader_election_enabled);
        assert_eq!(config.election.lease_name, "metal-claim-leader");
        assert_eq!(config.election.lease_namespace, "default");
        assert!(config.election.identity.starts_with("metal-claim-"));
        assert_eq!(config.queue.max_concurrent_ops, 5);
        assert_eq!(config.queue.bmc_cooldown_period, Duration::from_secs(5));
        assert_eq!(config.stuck_state_timeout, Duration::from_secs(600));
        assert_eq!(config.metrics_addr.port(), 8080);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("WATCH_NAMESPACE", "metal"),
            ("POD_NAME", "metal-claim-7f9c"),
            ("LEADER_ELECTION_ENABLED", "false"),
            ("LEASE_DURATION_SECS", "30"),
            ("RENEW_DEADLINE_SECS", "20"),
            ("RETRY_PERIOD_SECS", "4"),
            ("MAX_CONCURRENT_BMC_OPS", "2"),
            ("BMC_COOLDOWN_SECS", "10"),
            ("CLAIM_RETRY_AFTER_SECS", "15"),
            ("METRICS_ADDR", "127.0.0.1:9100"),
        ])
        .unwrap();

        assert_eq!(config.namespace.as_deref(), Some("metal"));
        assert_eq!(config.election.lease_namespace, "metal");
        assert_eq!(config.election.identity, "metal-claim-7f9c");
        assert!(!config.leader_election_enabled);
        assert_eq!(config.election.lease_duration, Duration::from_secs(30));
        assert_eq!(config.queue.max_concurrent_ops, 2);
        assert_eq!(config.queue.bmc_cooldown_period, Duration::from_secs(10));
        assert_eq!(config.claim.retry_after, Duration::from_secs(15));
        assert_eq!(config.metrics_addr.to_string(), "127.0.0.1:9100");
    }

    #[test]
    fn test_rejects_unparsable_value() {
        let err = config(&[("MAX_QUEUE_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("MAX_QUEUE_SIZE=lots"));
    }

    #[test]
    fn test_rejects_inconsistent_lease_timing() {
        let err = config(&[("LEASE_DURATION_SECS", "5"), ("RENEW_DEADLINE_SECS", "10")]).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }
}
