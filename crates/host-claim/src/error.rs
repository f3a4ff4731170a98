//! Error types for host claiming, lifecycle transitions and BMC operations.
//!
//! Expected, retryable outcomes (no host available, queue full) are not
//! errors at the coordinator level: they come back as `ClaimResult` /
//! `ProvisioningResult` values. The types here cover terminal validation
//! failures and infrastructure failures.

use crds::HostState;
use std::time::Duration;
use thiserror::Error;

/// Errors from the versioned object store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Conditional update rejected because the stored version moved on
    #[error("update conflict on {0}: object was modified")]
    Conflict(String),

    /// Object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Any other backend failure
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// An illegal lifecycle transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid transition for host {host} from {from} to {to}: {reason}")]
pub struct TransitionError {
    pub host: String,
    pub from: HostState,
    pub to: HostState,
    /// The violated precondition
    pub reason: String,
}

/// Host fields contradict its state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("host {host} in state {state} is inconsistent: {reason}")]
pub struct ConsistencyError {
    pub host: String,
    pub state: HostState,
    pub reason: String,
}

/// Errors from the provisioning queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Pending plus processing requests reached the capacity
    #[error("provisioning queue is full (capacity {capacity})")]
    Full { capacity: usize },

    /// The host already has a request pending or processing
    #[error("host {0} already has a queued or in-flight operation")]
    AlreadyQueued(String),

    /// The queue is shutting down
    #[error("provisioning queue is stopped")]
    Stopped,

    /// The caller's token was cancelled while waiting
    #[error("cancelled while waiting for {0}")]
    Cancelled(String),

    /// No result within the wait timeout
    #[error("timed out after {0:?} waiting for provisioning result")]
    Timeout(Duration),

    /// The request was dropped without a result
    #[error("provisioning result channel closed")]
    ResultDropped,
}

/// Errors from the leader lease backend.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Lease changed since it was read
    #[error("lease {0} was modified concurrently")]
    Conflict(String),

    /// Lease already exists on create
    #[error("lease {0} already exists")]
    AlreadyExists(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Any other backend failure
    #[error("lease backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by claim coordinators and the transition guard.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// Illegal transition; fix the object before retrying
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Store failure other than a resolved conflict
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Conflicts persisted past the attempt budget
    #[error("gave up on host {host} after {attempts} conflicting updates")]
    ConflictRetriesExhausted { host: String, attempts: u32 },

    /// The fresh copy of the host no longer accepts the change
    #[error("host {host} rejected the update: {reason}")]
    Rejected { host: String, reason: String },

    /// The request itself is unusable
    #[error("invalid claim request: {0}")]
    InvalidRequest(String),

    /// Provisioning queue failure
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Leader election failure
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

impl ClaimError {
    /// The host lost a race or changed under us; the caller may try another.
    pub fn is_lost_race(&self) -> bool {
        matches!(
            self,
            ClaimError::ConflictRetriesExhausted { .. }
                | ClaimError::Rejected { .. }
                | ClaimError::Transition(_)
                | ClaimError::Store(StoreError::NotFound(_))
        )
    }
}
