//! Physical host claiming and lifecycle control
//!
//! Building blocks for a bare-metal claim controller:
//!
//! - [`state_machine`]: legal `PhysicalHost` lifecycle transitions
//! - [`guard`]: transitions written with optimistic concurrency and retries
//! - [`recovery`]: detection and recovery of hosts stuck in transient states
//! - [`claim`]: conflict-free host claiming through conditional writes
//! - [`provisioning_queue`]: BMC concurrency limits and per-BMC cooldowns
//! - [`leader`]: lease-based leader election with priority-ordered claims
//!
//! Everything that talks to the cluster goes through [`store::HostStore`] or
//! [`leader::LeaseLock`], so the logic runs unchanged against the in-memory
//! backends enabled by the `test-util` feature.

pub mod claim;
pub mod config;
pub mod error;
pub mod guard;
pub mod hardware;
pub mod leader;
pub mod metrics;
pub mod provisioning_queue;
pub mod recovery;
pub mod state_machine;
pub mod store;

#[cfg(test)]
mod test_fixtures;

#[cfg(test)]
mod provisioning_queue_test;

pub use claim::{ClaimCoordinator, ClaimRequest, ClaimResult, HostClaimCoordinator, HostRequirements};
pub use config::{
    ClaimConfig, GuardConfig, LeaderCoordinatorConfig, LeaderElectionConfig, PriorityPolicy,
    ProvisioningQueueConfig,
};
pub use error::{ClaimError, ConsistencyError, LeaseError, QueueError, StoreError, TransitionError};
pub use guard::StateTransitionGuard;
pub use hardware::{HardwareOperator, RedfishConnector, RedfishOperator};
pub use leader::{LeaderElectionClaimCoordinator, LeaderElector, LeaseLock};
pub use metrics::{ClaimMetrics, ClaimOutcome, MetricsError};
pub use provisioning_queue::{
    BmcPermit, ProvisioningOperation, ProvisioningQueue, ProvisioningResult, ProvisioningTicket, QueueStatus,
};
pub use recovery::{RecoveryAction, StateRecoveryManager, StuckState};
pub use state_machine::PhysicalHostStateMachine;
pub use store::{HostStore, KubeHostStore};
