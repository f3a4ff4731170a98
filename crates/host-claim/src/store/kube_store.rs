//! HostStore backed by the Kubernetes API server.

use super::{HostStore, host_namespace};
use crate::error::StoreError;
use crds::PhysicalHost;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

/// PhysicalHost store using `replace` with resourceVersion preconditions
#[derive(Clone)]
pub struct KubeHostStore {
    client: Client,
    /// Namespace to list from; `None` lists cluster-wide
    namespace: Option<String>,
}

impl std::fmt::Debug for KubeHostStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeHostStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeHostStore {
    /// Creates a store scoped to `namespace` (or all namespaces).
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api(&self, namespace: &str) -> Api<PhysicalHost> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_kube_error(err: kube::Error, what: &str) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(what.to_string()),
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what.to_string()),
        other => StoreError::Kube(other),
    }
}

#[async_trait::async_trait]
impl HostStore for KubeHostStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<PhysicalHost, StoreError> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_error(e, &format!("{namespace}/{name}")))
    }

    async fn list(&self) -> Result<Vec<PhysicalHost>, StoreError> {
        let api: Api<PhysicalHost> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn update(&self, host: &PhysicalHost) -> Result<PhysicalHost, StoreError> {
        let namespace = host_namespace(host);
        let name = host
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| StoreError::Backend("PhysicalHost missing name".to_string()))?;
        if host.metadata.resource_version.is_none() {
            // Without a version the API server would accept a blind overwrite
            return Err(StoreError::Backend(format!(
                "refusing unconditional update of {namespace}/{name}"
            )));
        }

        debug!(
            "Replacing PhysicalHost {}/{} at resourceVersion {:?}",
            namespace, name, host.metadata.resource_version
        );
        self.api(namespace)
            .replace(name, &PostParams::default(), host)
            .await
            .map_err(|e| map_kube_error(e, &format!("{namespace}/{name}")))
    }
}
