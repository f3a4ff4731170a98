//! RedfishClient trait for mocking
//!
//! This trait abstracts the RedfishClient to enable mocking in unit tests.
//! The concrete RedfishClient implements this trait, and tests can use mock implementations.

use crate::error::RedfishError;
use crate::models::{PowerState, ResetType, SystemInfo};

/// Trait for the BMC operations the controller performs
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait RedfishClientTrait: Send + Sync {
    /// BMC address this client talks to
    fn endpoint(&self) -> &str;

    async fn get_power_state(&self) -> Result<PowerState, RedfishError>;
    async fn set_power_state(&self, state: PowerState) -> Result<(), RedfishError>;
    /// One-shot boot override to PXE for the next boot
    async fn set_boot_source_pxe(&self) -> Result<(), RedfishError>;
    async fn get_system_info(&self) -> Result<SystemInfo, RedfishError>;
    async fn reset(&self, reset_type: ResetType) -> Result<(), RedfishError>;
}
