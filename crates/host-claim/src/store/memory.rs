//! In-memory HostStore for tests
//!
//! Mirrors the API server's compare-and-set on `resourceVersion`, and can
//! inject conflicts or failures to exercise retry paths.

use super::{HostStore, host_namespace};
use crate::error::StoreError;
use crds::PhysicalHost;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Inner {
    hosts: BTreeMap<(String, String), PhysicalHost>,
    next_version: u64,
    injected_conflicts: u32,
    injected_failure: Option<String>,
    update_count: u64,
}

/// Mock store for testing
#[derive(Debug, Clone, Default)]
pub struct InMemoryHostStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryHostStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite a host (for test setup); assigns a fresh version
    pub fn insert(&self, mut host: PhysicalHost) -> PhysicalHost {
        let mut inner = self.inner.lock().unwrap();
        inner.next_version += 1;
        host.metadata.resource_version = Some(inner.next_version.to_string());
        if host.metadata.namespace.is_none() {
            host.metadata.namespace = Some("default".to_string());
        }
        let key = (host_namespace(&host).to_string(), host.name().to_string());
        inner.hosts.insert(key, host.clone());
        host
    }

    /// Current stored copy
    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<PhysicalHost> {
        self.inner
            .lock()
            .unwrap()
            .hosts
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// All stored hosts
    pub fn all(&self) -> Vec<PhysicalHost> {
        self.inner.lock().unwrap().hosts.values().cloned().collect()
    }

    /// Make the next `count` updates fail with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.inner.lock().unwrap().injected_conflicts = count;
    }

    /// Make every subsequent call fail with a backend error
    pub fn fail_with(&self, message: impl Into<String>) {
        self.inner.lock().unwrap().injected_failure = Some(message.into());
    }

    /// Successful updates so far
    pub fn update_count(&self) -> u64 {
        self.inner.lock().unwrap().update_count
    }

    fn check_failure(inner: &Inner) -> Result<(), StoreError> {
        match &inner.injected_failure {
            Some(message) => Err(StoreError::Backend(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl HostStore for InMemoryHostStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<PhysicalHost, StoreError> {
        let inner = self.inner.lock().unwrap();
        Self::check_failure(&inner)?;
        inner
            .hosts
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{namespace}/{name}")))
    }

    async fn list(&self) -> Result<Vec<PhysicalHost>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Self::check_failure(&inner)?;
        Ok(inner.hosts.values().cloned().collect())
    }

    async fn update(&self, host: &PhysicalHost) -> Result<PhysicalHost, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_failure(&inner)?;
        let key = (host_namespace(host).to_string(), host.name().to_string());
        let what = format!("{}/{}", key.0, key.1);

        if inner.injected_conflicts > 0 {
            inner.injected_conflicts -= 1;
            return Err(StoreError::Conflict(what));
        }

        let stored_version = inner
            .hosts
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(what.clone()))?
            .metadata
            .resource_version
            .clone();
        if stored_version != host.metadata.resource_version {
            return Err(StoreError::Conflict(what));
        }

        inner.next_version += 1;
        let mut stored = host.clone();
        stored.metadata.resource_version = Some(inner.next_version.to_string());
        inner.hosts.insert(key, stored.clone());
        inner.update_count += 1;
        Ok(stored)
    }
}
