//! Redfish BMC Client
//!
//! A thin client for the handful of Redfish operations the claim controller
//! needs: power state, one-shot PXE boot override, system inventory and
//! reset. Vendor extensions are not handled.
//!
//! # Example
//!
//! ```no_run
//! use redfish_client::{RedfishClient, RedfishClientTrait, ResetType};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RedfishClient::new(
//!     "https://10.0.0.5",
//!     "admin".to_string(),
//!     "secret".to_string(),
//!     true,
//! )?;
//!
//! let info = client.get_system_info().await?;
//! client.set_boot_source_pxe().await?;
//! client.reset(ResetType::ForceRestart).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod endpoint;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod redfish_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::RedfishClient;
pub use endpoint::bmc_endpoint;
pub use error::RedfishError;
pub use models::*;
pub use redfish_trait::RedfishClientTrait;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockRedfishClient, RecordedCall};
