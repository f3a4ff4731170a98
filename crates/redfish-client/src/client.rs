//! Redfish REST client

use crate::endpoint::parse_address;
use crate::error::RedfishError;
use crate::models::{Collection, ComputerSystem, PowerState, ResetType, SystemInfo};
use crate::redfish_trait::RedfishClientTrait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

const SYSTEMS_PATH: &str = "/redfish/v1/Systems";

/// Redfish client bound to one computer system
pub struct RedfishClient {
    client: Client,
    address: String,
    base_url: Url,
    username: String,
    password: String,
    /// `/redfish/v1/Systems/<id>`, from the address or discovered lazily
    system_path: OnceCell<String>,
}

impl std::fmt::Debug for RedfishClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedfishClient")
            .field("address", &self.address)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl RedfishClient {
    /// Create a new Redfish client
    ///
    /// `address` may point at the BMC root or directly at a system
    /// (`.../redfish/v1/Systems/<id>`).
    pub fn new(
        address: &str,
        username: String,
        password: String,
        disable_certificate_verification: bool,
    ) -> Result<Self, RedfishError> {
        let url = parse_address(address)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(disable_certificate_verification)
            .build()?;

        let system_path = OnceCell::new();
        let path = url.path().trim_end_matches('/');
        if path.starts_with(SYSTEMS_PATH) && path.len() > SYSTEMS_PATH.len() + 1 {
            // Address already names the system; cannot fail on a fresh cell
            let _ = system_path.set(path.to_string());
        }

        let mut base_url = url.clone();
        base_url.set_path("");

        Ok(Self {
            client,
            address: address.to_string(),
            base_url,
            username,
            password,
            system_path,
        })
    }

    fn url(&self, path: &str) -> Result<Url, RedfishError> {
        self.base_url
            .join(path)
            .map_err(|e| RedfishError::InvalidRequest(format!("invalid path {path}: {e}")))
    }

    async fn check(response: Response) -> Result<Response, RedfishError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RedfishError::Authentication(format!("{status}: {body}")))
            }
            StatusCode::NOT_FOUND => Err(RedfishError::NotFound(body)),
            _ => Err(RedfishError::Api(format!("{status}: {body}"))),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RedfishError> {
        let url = self.url(path)?;
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await?;
        let text = Self::check(response).await?.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<(), RedfishError> {
        let url = self.url(path)?;
        debug!("{} {}", method, url);
        let response = self
            .client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn system_path(&self) -> Result<&str, RedfishError> {
        self.system_path
            .get_or_try_init(|| async {
                let systems: Collection = self.get(SYSTEMS_PATH).await?;
                systems
                    .members
                    .into_iter()
                    .next()
                    .map(|m| m.odata_id)
                    .ok_or_else(|| RedfishError::NotFound(format!("no systems at {}", self.address)))
            })
            .await
            .map(String::as_str)
    }
}

#[async_trait::async_trait]
impl RedfishClientTrait for RedfishClient {
    fn endpoint(&self) -> &str {
        &self.address
    }

    async fn get_power_state(&self) -> Result<PowerState, RedfishError> {
        Ok(self.get_system_info().await?.power_state)
    }

    async fn set_power_state(&self, state: PowerState) -> Result<(), RedfishError> {
        let reset_type = ResetType::for_power_state(state).ok_or_else(|| {
            RedfishError::InvalidRequest(format!("cannot request power state {state}"))
        })?;
        self.reset(reset_type).await
    }

    async fn set_boot_source_pxe(&self) -> Result<(), RedfishError> {
        let path = self.system_path().await?.to_string();
        let body = serde_json::json!({
            "Boot": {
                "BootSourceOverrideTarget": "Pxe",
                "BootSourceOverrideEnabled": "Once"
            }
        });
        self.send_json(reqwest::Method::PATCH, &path, &body).await
    }

    async fn get_system_info(&self) -> Result<SystemInfo, RedfishError> {
        let path = self.system_path().await?.to_string();
        let system: ComputerSystem = self.get(&path).await?;
        Ok(system.into())
    }

    async fn reset(&self, reset_type: ResetType) -> Result<(), RedfishError> {
        let path = format!("{}/Actions/ComputerSystem.Reset", self.system_path().await?);
        let body = serde_json::json!({ "ResetType": reset_type });
        self.send_json(reqwest::Method::POST, &path, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_path_taken_from_address() {
        let client = RedfishClient::new(
            "https://10.0.0.5/redfish/v1/Systems/System.Embedded.1",
            "admin".to_string(),
            "pw".to_string(),
            true,
        )
        .unwrap();
        assert_eq!(
            client.system_path.get().map(String::as_str),
            Some("/redfish/v1/Systems/System.Embedded.1")
        );
        assert_eq!(client.url("/redfish/v1").unwrap().as_str(), "https://10.0.0.5/redfish/v1");
    }

    #[test]
    fn test_root_address_discovers_system_later() {
        let client =
            RedfishClient::new("10.0.0.5", "admin".to_string(), "pw".to_string(), false).unwrap();
        assert!(client.system_path.get().is_none());
    }
}
