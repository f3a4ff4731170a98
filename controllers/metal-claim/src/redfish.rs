//! Redfish clients built from host credential Secrets.

use async_trait::async_trait;
use crds::PhysicalHost;
use host_claim::RedfishConnector;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use redfish_client::{RedfishClient, RedfishClientTrait, RedfishError};
use std::sync::Arc;
use tracing::debug;

const USERNAME_KEY: &str = "username";
const PASSWORD_KEY: &str = "password";

/// Reads `spec.redfish.credentialsName` from the host's namespace
#[derive(Clone)]
pub struct SecretRedfishConnector {
    client: Client,
}

impl std::fmt::Debug for SecretRedfishConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRedfishConnector").finish_non_exhaustive()
    }
}

impl SecretRedfishConnector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RedfishConnector for SecretRedfishConnector {
    async fn connect(&self, host: &PhysicalHost) -> Result<Arc<dyn RedfishClientTrait>, RedfishError> {
        let namespace = host.metadata.namespace.as_deref().unwrap_or("default");
        let secret_name = &host.spec.redfish.credentials_name;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        let secret = secrets.get(secret_name).await.map_err(|e| {
            RedfishError::Authentication(format!(
                "failed to read credentials Secret {namespace}/{secret_name}: {e}"
            ))
        })?;
        let (username, password) = credentials_from_secret(&secret)?;
        debug!("Connecting to BMC {} for host {}", host.spec.redfish.address, host.key());

        let client = RedfishClient::new(
            &host.spec.redfish.address,
            username,
            password,
            host.spec.redfish.disable_certificate_verification,
        )?;
        Ok(Arc::new(client))
    }
}

/// Username and password from a basic-auth style Secret.
pub fn credentials_from_secret(secret: &Secret) -> Result<(String, String), RedfishError> {
    let name = secret.metadata.name.as_deref().unwrap_or("<unknown>");
    let field = |key: &str| -> Result<String, RedfishError> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|value| value.0.clone())
            .or_else(|| {
                secret
                    .string_data
                    .as_ref()
                    .and_then(|data| data.get(key))
                    .map(|value| value.clone().into_bytes())
            })
            .ok_or_else(|| RedfishError::Authentication(format!("Secret {name} has no {key}")))?;
        let value = String::from_utf8(bytes)
            .map_err(|_| RedfishError::Authentication(format!("Secret {name} {key} is not UTF-8")))?;
        if value.is_empty() {
            return Err(RedfishError::Authentication(format!("Secret {name} {key} is empty")));
        }
        Ok(value)
    };
    Ok((field(USERNAME_KEY)?, field(PASSWORD_KEY)?))
}
