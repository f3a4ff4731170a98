//! Lease storage for leader election
//!
//! A lease is a small record (holder, duration, acquire/renew times) updated
//! with compare-and-set on an opaque version. The Kubernetes backend maps it
//! onto a `coordination.k8s.io/v1` Lease and uses its resourceVersion.

use crate::error::LeaseError;
use chrono::{DateTime, Utc};
use crds::meta::{from_utc, to_utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use std::time::Duration;

/// Leadership as recorded in the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderRecord {
    /// Current holder; `None` when released
    pub holder_identity: Option<String>,
    pub lease_duration: Duration,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of times the holder changed
    pub lease_transitions: i32,
}

impl LeaderRecord {
    /// Holder identity, treating an empty string as released.
    pub fn holder(&self) -> Option<&str> {
        self.holder_identity.as_deref().filter(|h| !h.is_empty())
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder() == Some(identity)
    }

    /// Not renewed within its duration, or never renewed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match (self.renew_time, chrono::Duration::from_std(self.lease_duration)) {
            (Some(renewed), Ok(duration)) => now > renewed + duration,
            _ => true,
        }
    }
}

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub record: LeaderRecord,
    pub version: String,
}

/// Compare-and-set storage for a single lease.
#[async_trait::async_trait]
pub trait LeaseLock: Send + Sync {
    /// Human-readable lease location for logs
    fn describe(&self) -> String;

    /// Current record, `None` if the lease does not exist yet
    async fn get(&self) -> Result<Option<VersionedRecord>, LeaseError>;

    /// Creates the lease; `LeaseError::AlreadyExists` if someone beat us
    async fn create(&self, record: &LeaderRecord) -> Result<VersionedRecord, LeaseError>;

    /// Replaces the record if `version` is still current; `LeaseError::Conflict` otherwise
    async fn update(&self, record: &LeaderRecord, version: &str) -> Result<VersionedRecord, LeaseError>;
}

/// Lease lock on a `coordination.k8s.io/v1` Lease
#[derive(Clone)]
pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl std::fmt::Debug for KubeLeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeLeaseLock")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeLeaseLock {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaderRecord, version: Option<&str>) -> Result<Lease, LeaseError> {
        let micro = |t: Option<DateTime<Utc>>| {
            t.map(from_utc)
                .transpose()
                .map_err(|e| LeaseError::Backend(format!("invalid lease timestamp: {e}")))
        };
        Ok(Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: version.map(str::to_string),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(
                    i32::try_from(record.lease_duration.as_secs()).unwrap_or(i32::MAX),
                ),
                acquire_time: micro(record.acquire_time)?,
                renew_time: micro(record.renew_time)?,
                lease_transitions: Some(record.lease_transitions),
                ..Default::default()
            }),
        })
    }

    fn from_lease(lease: Lease) -> Result<VersionedRecord, LeaseError> {
        let version = lease
            .metadata
            .resource_version
            .ok_or_else(|| LeaseError::Backend("lease has no resourceVersion".to_string()))?;
        let spec = lease.spec.unwrap_or_default();
        Ok(VersionedRecord {
            record: LeaderRecord {
                holder_identity: spec.holder_identity,
                lease_duration: Duration::from_secs(
                    u64::try_from(spec.lease_duration_seconds.unwrap_or_default()).unwrap_or_default(),
                ),
                acquire_time: spec.acquire_time.as_ref().and_then(to_utc),
                renew_time: spec.renew_time.as_ref().and_then(to_utc),
                lease_transitions: spec.lease_transitions.unwrap_or_default(),
            },
            version,
        })
    }
}

#[async_trait::async_trait]
impl LeaseLock for KubeLeaseLock {
    fn describe(&self) -> String {
        format!("lease {}/{}", self.namespace, self.name)
    }

    async fn get(&self) -> Result<Option<VersionedRecord>, LeaseError> {
        match self.api.get(&self.name).await {
            Ok(lease) => Self::from_lease(lease).map(Some),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, record: &LeaderRecord) -> Result<VersionedRecord, LeaseError> {
        let lease = self.to_lease(record, None)?;
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(created) => Self::from_lease(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(LeaseError::AlreadyExists(self.describe())),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, record: &LeaderRecord, version: &str) -> Result<VersionedRecord, LeaseError> {
        let lease = self.to_lease(record, Some(version))?;
        match self.api.replace(&self.name, &PostParams::default(), &lease).await {
            Ok(updated) => Self::from_lease(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(LeaseError::Conflict(self.describe())),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryLeaseLock;

#[cfg(any(test, feature = "test-util"))]
mod memory {
    use super::{LeaderRecord, LeaseError, LeaseLock, VersionedRecord};
    use std::sync::{Arc, Mutex};

    /// Mock lease for testing; shared by cloning
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryLeaseLock {
        inner: Arc<Mutex<Option<(LeaderRecord, u64)>>>,
    }

    impl InMemoryLeaseLock {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed the lease (for test setup)
        pub fn set(&self, record: LeaderRecord) {
            let mut inner = self.inner.lock().unwrap();
            let version = inner.as_ref().map_or(1, |(_, v)| v + 1);
            *inner = Some((record, version));
        }

        /// Current record without a version
        pub fn record(&self) -> Option<LeaderRecord> {
            self.inner.lock().unwrap().as_ref().map(|(r, _)| r.clone())
        }
    }

    #[async_trait::async_trait]
    impl LeaseLock for InMemoryLeaseLock {
        fn describe(&self) -> String {
            "in-memory lease".to_string()
        }

        async fn get(&self) -> Result<Option<VersionedRecord>, LeaseError> {
            Ok(self.inner.lock().unwrap().as_ref().map(|(record, version)| VersionedRecord {
                record: record.clone(),
                version: version.to_string(),
            }))
        }

        async fn create(&self, record: &LeaderRecord) -> Result<VersionedRecord, LeaseError> {
            let mut inner = self.inner.lock().unwrap();
            if inner.is_some() {
                return Err(LeaseError::AlreadyExists(self.describe()));
            }
            *inner = Some((record.clone(), 1));
            Ok(VersionedRecord {
                record: record.clone(),
                version: "1".to_string(),
            })
        }

        async fn update(&self, record: &LeaderRecord, version: &str) -> Result<VersionedRecord, LeaseError> {
            let mut inner = self.inner.lock().unwrap();
            let current = inner.as_ref().map(|(_, v)| v.to_string());
            if current.as_deref() != Some(version) {
                return Err(LeaseError::Conflict(self.describe()));
            }
            let next = inner.as_ref().map_or(1, |(_, v)| v + 1);
            *inner = Some((record.clone(), next));
            Ok(VersionedRecord {
                record: record.clone(),
                version: next.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(holder: Option<&str>, renewed_secs_ago: i64) -> LeaderRecord {
        LeaderRecord {
            holder_identity: holder.map(str::to_string),
            lease_duration: Duration::from_secs(15),
            acquire_time: None,
            renew_time: Some(Utc::now() - chrono::Duration::seconds(renewed_secs_ago)),
            lease_transitions: 0,
        }
    }

    #[test]
    fn test_expiry_uses_renew_time_and_duration() {
        assert!(!record(Some("a"), 5).is_expired_at(Utc::now()));
        assert!(record(Some("a"), 20).is_expired_at(Utc::now()));
        let mut never = record(Some("a"), 0);
        never.renew_time = None;
        assert!(never.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_empty_holder_is_released() {
        let released = record(Some(""), 0);
        assert_eq!(released.holder(), None);
        assert!(!released.is_held_by(""));
    }

    #[tokio::test]
    async fn test_in_memory_cas() {
        let lock = InMemoryLeaseLock::new();
        let created = lock.create(&record(Some("a"), 0)).await.unwrap();
        assert!(matches!(
            lock.create(&record(Some("b"), 0)).await,
            Err(LeaseError::AlreadyExists(_))
        ));

        let updated = lock.update(&record(Some("a"), 0), &created.version).await.unwrap();
        assert!(matches!(
            lock.update(&record(Some("b"), 0), &created.version).await,
            Err(LeaseError::Conflict(_))
        ));
        assert_ne!(updated.version, created.version);
    }
}
