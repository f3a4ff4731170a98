//! Mock RedfishClient for unit testing
//!
//! Keeps power state in memory, records every call, and can be told to fail
//! so callers can exercise their error paths without a BMC.

use crate::error::RedfishError;
use crate::models::{PowerState, ResetType, SystemInfo};
use crate::redfish_trait::RedfishClientTrait;
use std::sync::{Arc, Mutex};

/// A call received by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    GetPowerState,
    SetPowerState(PowerState),
    SetBootSourcePxe,
    GetSystemInfo,
    Reset(ResetType),
}

/// Mock RedfishClient for testing
#[derive(Debug, Clone)]
pub struct MockRedfishClient {
    endpoint: String,
    pub(crate) power_state: Arc<Mutex<PowerState>>,
    pub(crate) system_info: Arc<Mutex<SystemInfo>>,
    pub(crate) calls: Arc<Mutex<Vec<RecordedCall>>>,
    pub(crate) failure: Arc<Mutex<Option<String>>>,
}

impl MockRedfishClient {
    /// Create a new mock client, powered off
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            power_state: Arc::new(Mutex::new(PowerState::Off)),
            system_info: Arc::new(Mutex::new(SystemInfo {
                id: "1".to_string(),
                manufacturer: Some("Mock".to_string()),
                model: Some("Mock Server".to_string()),
                serial_number: Some("MOCK0001".to_string()),
                power_state: PowerState::Off,
                cpu_count: Some(32),
                memory_gib: Some(128),
            })),
            calls: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Replace the inventory returned by `get_system_info` (for test setup)
    pub fn set_system_info(&self, info: SystemInfo) {
        *self.system_info.lock().unwrap() = info;
    }

    /// Make every subsequent call fail with an API error
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().unwrap() = Some(message.into());
    }

    /// Stop failing
    pub fn clear_failure(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Current simulated power state
    pub fn current_power_state(&self) -> PowerState {
        *self.power_state.lock().unwrap()
    }

    fn record(&self, call: RecordedCall) -> Result<(), RedfishError> {
        self.calls.lock().unwrap().push(call);
        match self.failure.lock().unwrap().as_ref() {
            Some(message) => Err(RedfishError::Api(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl RedfishClientTrait for MockRedfishClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn get_power_state(&self) -> Result<PowerState, RedfishError> {
        self.record(RecordedCall::GetPowerState)?;
        Ok(self.current_power_state())
    }

    async fn set_power_state(&self, state: PowerState) -> Result<(), RedfishError> {
        self.record(RecordedCall::SetPowerState(state))?;
        *self.power_state.lock().unwrap() = state;
        Ok(())
    }

    async fn set_boot_source_pxe(&self) -> Result<(), RedfishError> {
        self.record(RecordedCall::SetBootSourcePxe)
    }

    async fn get_system_info(&self) -> Result<SystemInfo, RedfishError> {
        self.record(RecordedCall::GetSystemInfo)?;
        let mut info = self.system_info.lock().unwrap().clone();
        info.power_state = self.current_power_state();
        Ok(info)
    }

    async fn reset(&self, reset_type: ResetType) -> Result<(), RedfishError> {
        self.record(RecordedCall::Reset(reset_type))?;
        let next = match reset_type {
            ResetType::ForceOff | ResetType::GracefulShutdown => PowerState::Off,
            _ => PowerState::On,
        };
        *self.power_state.lock().unwrap() = next;
        Ok(())
    }
}
