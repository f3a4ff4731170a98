//! Versioned PhysicalHost storage
//!
//! Every write is conditional on the `resourceVersion` the writer read. A
//! stale version fails with `StoreError::Conflict`, which is the only
//! error the transition guard retries.

mod kube_store;
#[cfg(any(test, feature = "test-util"))]
mod memory;

pub use kube_store::KubeHostStore;
#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryHostStore;

use crate::error::StoreError;
use crds::PhysicalHost;

/// Optimistic-concurrency store for PhysicalHost objects
#[async_trait::async_trait]
pub trait HostStore: Send + Sync {
    /// Latest stored version of a host
    async fn get(&self, namespace: &str, name: &str) -> Result<PhysicalHost, StoreError>;

    /// All hosts in the store's scope
    async fn list(&self) -> Result<Vec<PhysicalHost>, StoreError>;

    /// Writes `host` if its `resourceVersion` is still current.
    ///
    /// Returns the stored object with its new version.
    async fn update(&self, host: &PhysicalHost) -> Result<PhysicalHost, StoreError>;
}

/// Namespace of a host, defaulting like the API server does.
pub(crate) fn host_namespace(host: &PhysicalHost) -> &str {
    host.metadata.namespace.as_deref().unwrap_or("default")
}
