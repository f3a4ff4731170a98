//! Redfish data models
//!
//! Only the subset of the `ComputerSystem` schema the controller reads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// System power state (`PowerState` property)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PowerState {
    On,
    Off,
    PoweringOn,
    PoweringOff,
    Paused,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::On => "On",
            PowerState::Off => "Off",
            PowerState::PoweringOn => "PoweringOn",
            PowerState::PoweringOff => "PoweringOff",
            PowerState::Paused => "Paused",
            PowerState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// `ResetType` parameter of `ComputerSystem.Reset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetType {
    On,
    ForceOff,
    GracefulShutdown,
    GracefulRestart,
    ForceRestart,
    PowerCycle,
}

impl ResetType {
    /// Reset that brings the system to `target`.
    pub fn for_power_state(target: PowerState) -> Option<Self> {
        match target {
            PowerState::On => Some(ResetType::On),
            PowerState::Off => Some(ResetType::ForceOff),
            _ => None,
        }
    }
}

/// Inventory summary of a system
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemInfo {
    pub id: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub power_state: PowerState,
    pub cpu_count: Option<u32>,
    pub memory_gib: Option<u32>,
}

/// Raw `ComputerSystem` resource
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComputerSystem {
    pub id: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default)]
    pub processor_summary: Option<ProcessorSummary>,
    #[serde(default)]
    pub memory_summary: Option<MemorySummary>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessorSummary {
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub logical_processor_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemorySummary {
    #[serde(rename = "TotalSystemMemoryGiB", default)]
    pub total_system_memory_gib: Option<f64>,
}

/// Redfish resource collection
#[derive(Debug, Clone, Deserialize)]
pub struct Collection {
    #[serde(rename = "Members", default)]
    pub members: Vec<ODataLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ODataLink {
    #[serde(rename = "@odata.id")]
    pub odata_id: String,
}

impl From<ComputerSystem> for SystemInfo {
    fn from(system: ComputerSystem) -> Self {
        let cpu_count = system
            .processor_summary
            .as_ref()
            .and_then(|p| p.logical_processor_count.or(p.count));
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "memory GiB fits in u32")]
        let memory_gib = system
            .memory_summary
            .as_ref()
            .and_then(|m| m.total_system_memory_gib)
            .map(|gib| gib.round() as u32);

        Self {
            id: system.id,
            manufacturer: system.manufacturer,
            model: system.model,
            serial_number: system.serial_number,
            power_state: system.power_state,
            cpu_count,
            memory_gib,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_computer_system_to_system_info() {
        let raw = serde_json::json!({
            "Id": "1",
            "Manufacturer": "Dell Inc.",
            "Model": "PowerEdge R650",
            "SerialNumber": "ABC123",
            "PowerState": "On",
            "ProcessorSummary": { "Count": 2, "LogicalProcessorCount": 64 },
            "MemorySummary": { "TotalSystemMemoryGiB": 255.9 }
        });
        let system: ComputerSystem = serde_json::from_value(raw).unwrap();
        let info = SystemInfo::from(system);

        assert_eq!(info.power_state, PowerState::On);
        assert_eq!(info.cpu_count, Some(64));
        assert_eq!(info.memory_gib, Some(256));
        assert_eq!(info.model.as_deref(), Some("PowerEdge R650"));
    }

    #[test]
    fn test_unknown_power_state_tolerated() {
        let state: PowerState = serde_json::from_str("\"Resetting\"").unwrap();
        assert_eq!(state, PowerState::Unknown);
    }
}
