//! Redfish client errors

use thiserror::Error;

/// Errors that can occur when talking to a BMC
#[derive(Debug, Error)]
pub enum RedfishError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// BMC returned an error status
    #[error("Redfish API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Credentials rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Address or request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
