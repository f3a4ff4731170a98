//! Hardware side of provisioning operations
//!
//! Queue workers hand each operation to a `HardwareOperator`. The Redfish
//! implementation resolves a client per host through a `RedfishConnector`,
//! so credentials stay with whoever owns them (the controller reads them
//! from Secrets).

use crate::provisioning_queue::ProvisioningOperation;
use crds::PhysicalHost;
use redfish_client::{PowerState, RedfishClientTrait, RedfishError, ResetType};
use std::sync::Arc;
use tracing::{debug, info};

/// Executes provisioning operations against a host's hardware.
#[async_trait::async_trait]
pub trait HardwareOperator: Send + Sync {
    async fn execute(
        &self,
        host: &PhysicalHost,
        operation: ProvisioningOperation,
    ) -> Result<(), RedfishError>;
}

/// Produces a Redfish client for a host.
#[async_trait::async_trait]
pub trait RedfishConnector: Send + Sync {
    async fn connect(&self, host: &PhysicalHost) -> Result<Arc<dyn RedfishClientTrait>, RedfishError>;
}

/// Drives hosts through Redfish
#[derive(Clone)]
pub struct RedfishOperator {
    connector: Arc<dyn RedfishConnector>,
}

impl std::fmt::Debug for RedfishOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedfishOperator").finish_non_exhaustive()
    }
}

impl RedfishOperator {
    pub fn new(connector: Arc<dyn RedfishConnector>) -> Self {
        Self { connector }
    }

    /// One-shot PXE boot, then restart (or power on) into it.
    async fn provision(&self, host: &PhysicalHost, client: &dyn RedfishClientTrait) -> Result<(), RedfishError> {
        let power = client.get_power_state().await?;
        client.set_boot_source_pxe().await?;
        if power == PowerState::On {
            client.reset(ResetType::ForceRestart).await?;
        } else {
            client.set_power_state(PowerState::On).await?;
        }
        info!(
            "Host {} set to PXE boot via {} (was {})",
            host.key(),
            client.endpoint(),
            power
        );
        Ok(())
    }

    async fn deprovision(&self, host: &PhysicalHost, client: &dyn RedfishClientTrait) -> Result<(), RedfishError> {
        let power = client.get_power_state().await?;
        if power == PowerState::Off {
            debug!("Host {} already powered off", host.key());
            return Ok(());
        }
        client.set_power_state(PowerState::Off).await?;
        info!("Host {} powered off via {}", host.key(), client.endpoint());
        Ok(())
    }
}

#[async_trait::async_trait]
impl HardwareOperator for RedfishOperator {
    async fn execute(
        &self,
        host: &PhysicalHost,
        operation: ProvisioningOperation,
    ) -> Result<(), RedfishError> {
        match operation {
            // Claim and release only touch the object store
            ProvisioningOperation::Claim | ProvisioningOperation::Release => Ok(()),
            ProvisioningOperation::Provision => {
                let client = self.connector.connect(host).await?;
                self.provision(host, client.as_ref()).await
            }
            ProvisioningOperation::Deprovision => {
                let client = self.connector.connect(host).await?;
                self.deprovision(host, client.as_ref()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::host_in_state;
    use crds::HostState;
    use redfish_client::{MockRedfishClient, RecordedCall};

    struct FixedConnector(MockRedfishClient);

    #[async_trait::async_trait]
    impl RedfishConnector for FixedConnector {
        async fn connect(&self, _host: &PhysicalHost) -> Result<Arc<dyn RedfishClientTrait>, RedfishError> {
            Ok(Arc::new(self.0.clone()))
        }
    }

    fn operator(mock: &MockRedfishClient) -> RedfishOperator {
        RedfishOperator::new(Arc::new(FixedConnector(mock.clone())))
    }

    #[tokio::test]
    async fn test_provision_powered_off_host_powers_on() {
        let mock = MockRedfishClient::new("https://10.0.0.5");
        let host = host_in_state("h1", HostState::Provisioning);

        operator(&mock).execute(&host, ProvisioningOperation::Provision).await.unwrap();

        assert_eq!(
            mock.calls(),
            vec![
                RecordedCall::GetPowerState,
                RecordedCall::SetBootSourcePxe,
                RecordedCall::SetPowerState(PowerState::On),
            ]
        );
    }

    #[tokio::test]
    async fn test_provision_running_host_restarts() {
        let mock = MockRedfishClient::new("https://10.0.0.5");
        mock.set_power_state(PowerState::On).await.unwrap();
        let host = host_in_state("h1", HostState::Provisioning);

        operator(&mock).execute(&host, ProvisioningOperation::Provision).await.unwrap();

        assert_eq!(mock.calls().last(), Some(&RecordedCall::Reset(ResetType::ForceRestart)));
    }

    #[tokio::test]
    async fn test_deprovision_skips_powered_off_host() {
        let mock = MockRedfishClient::new("https://10.0.0.5");
        let host = host_in_state("h1", HostState::Deprovisioning);

        operator(&mock).execute(&host, ProvisioningOperation::Deprovision).await.unwrap();

        assert_eq!(mock.calls(), vec![RecordedCall::GetPowerState]);
    }

    #[tokio::test]
    async fn test_claim_never_touches_bmc() {
        let mock = MockRedfishClient::new("https://10.0.0.5");
        mock.fail_with("unreachable");
        let host = host_in_state("h1", HostState::Available);

        operator(&mock).execute(&host, ProvisioningOperation::Claim).await.unwrap();
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_bmc_failure_propagates() {
        let mock = MockRedfishClient::new("https://10.0.0.5");
        mock.fail_with("BMC busy");
        let host = host_in_state("h1", HostState::Provisioning);

        let err = operator(&mock).execute(&host, ProvisioningOperation::Provision).await.unwrap_err();
        assert!(matches!(err, RedfishError::Api(_)));
    }
}
