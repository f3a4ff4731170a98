//! Leader-ordered claim coordination
//!
//! One replica holds a Lease and serves claims from a priority queue; the
//! others claim optimistically until they win the lease.

pub mod coordinator;
pub mod election;
pub mod lease;
pub mod priority;

pub use coordinator::{ClaimQueueStatus, LeaderElectionClaimCoordinator, LeadershipStatus};
pub use election::{LeaderCallbacks, LeaderElector};
#[cfg(any(test, feature = "test-util"))]
pub use lease::InMemoryLeaseLock;
pub use lease::{KubeLeaseLock, LeaderRecord, LeaseLock, VersionedRecord};
pub use priority::{ClaimPriorityQueue, LeaderCoordinatedClaim, compute_priority};
