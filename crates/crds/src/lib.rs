//! DCops CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the bare-metal claim
//! controller: `PhysicalHost` (managed servers) and `MetalMachine`
//! (compute requests that consume them).

pub mod conditions;
pub mod meta;
pub mod metal_machine;
pub mod physical_host;
pub mod references;

pub use conditions::*;
pub use metal_machine::*;
pub use physical_host::*;
pub use references::*;
