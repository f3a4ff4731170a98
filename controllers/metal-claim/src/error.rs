//! Controller-specific error types.
//!
//! Library errors from `host-claim` and `redfish-client` are wrapped as-is;
//! the variants here cover what only the binary can get wrong.

use host_claim::{ClaimError, MetricsError, QueueError};
use kube::Error as KubeError;
use redfish_client::RedfishError;
use thiserror::Error;

/// Errors that can occur in the Metal Claim Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Claim, release or lifecycle transition failed
    #[error("Claim error: {0}")]
    Claim(#[from] ClaimError),

    /// Provisioning queue refused or lost the request
    #[error("Provisioning queue error: {0}")]
    Queue(#[from] QueueError),

    /// BMC error
    #[error("Redfish error: {0}")]
    Redfish(#[from] RedfishError),

    /// Metric registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// A hardware operation finished unsuccessfully
    #[error("Operation {operation} on host {host} failed: {message}")]
    OperationFailed {
        host: String,
        operation: String,
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics server I/O
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}
