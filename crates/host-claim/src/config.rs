//! Tunables for the claim, provisioning and leader-election components.
//!
//! The controller binary fills these from environment variables; the
//! defaults are the values used when a variable is unset.

use std::time::Duration;

/// Transition guard retry policy.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Conditional-update attempts before giving up on conflicts
    pub max_attempts: u32,
    /// Sleep before the second attempt; doubles each further attempt
    pub initial_backoff: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

/// Optimistic coordinator settings.
#[derive(Debug, Clone)]
pub struct ClaimConfig {
    /// Suggested wait before retrying when no host could be claimed
    pub retry_after: Duration,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            retry_after: Duration::from_secs(30),
        }
    }
}

/// Provisioning queue settings.
#[derive(Debug, Clone)]
pub struct ProvisioningQueueConfig {
    /// Operations allowed in flight across all BMCs
    pub max_concurrent_ops: usize,
    /// Minimum gap between two operations on one BMC endpoint
    pub bmc_cooldown_period: Duration,
    /// Pending plus processing requests accepted at once
    pub max_queue_size: usize,
    /// Worker tasks draining the queue
    pub worker_count: usize,
    /// Worker tick and permit poll interval
    pub poll_interval: Duration,
    /// Per-request deadline, measured from submission
    pub request_timeout: Duration,
    /// How long `stop` waits for in-flight work
    pub shutdown_grace_period: Duration,
}

impl Default for ProvisioningQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ops: 5,
            bmc_cooldown_period: Duration::from_secs(5),
            max_queue_size: 100,
            worker_count: 3,
            poll_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(600),
            shutdown_grace_period: Duration::from_secs(30),
        }
    }
}

/// Lease timing, client-go style.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Name of the Lease object
    pub lease_name: String,
    /// Namespace of the Lease object
    pub lease_namespace: String,
    /// This replica's identity, usually the pod name
    pub identity: String,
    /// How long a lease is valid after its last renewal
    pub lease_duration: Duration,
    /// The leader steps down if it cannot renew within this window
    pub renew_deadline: Duration,
    /// Interval between acquire/renew attempts
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_name: "metal-claim-leader".to_string(),
            lease_namespace: "default".to_string(),
            identity: format!("metal-claim-{}", uuid::Uuid::new_v4()),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Weights for leader-side claim ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityPolicy {
    /// Every claim starts here
    pub base: i64,
    /// Added per whole minute of machine age
    pub per_minute_of_age: i64,
    /// Added when the machine asks for no tags at all
    pub untagged_bonus: i64,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            base: 100,
            per_minute_of_age: 1,
            untagged_bonus: 50,
        }
    }
}

/// Leader coordinator batch settings.
#[derive(Debug, Clone)]
pub struct LeaderCoordinatorConfig {
    /// Claims processed per batch tick
    pub batch_size: usize,
    /// Batch tick interval
    pub batch_interval: Duration,
    /// Attempts per claim before a retryable failure is returned
    pub max_retries: u32,
    /// How long a caller waits for the leader to process its claim
    pub claim_wait_timeout: Duration,
    pub priority: PriorityPolicy,
}

impl Default for LeaderCoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_interval: Duration::from_millis(500),
            max_retries: 3,
            claim_wait_timeout: Duration::from_secs(30),
            priority: PriorityPolicy::default(),
        }
    }
}
