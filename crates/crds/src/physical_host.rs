//! PhysicalHost CRD
//!
//! A managed bare-metal server reachable through its BMC. Ownership
//! (`consumerRef`) and lifecycle (`state`) both live under `.spec`, so one
//! resourceVersion-checked write moves them together.

use crate::conditions::HostCondition;
use crate::references::ConsumerRef;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "dcops.microscaler.io",
    version = "v1alpha1",
    kind = "PhysicalHost",
    namespaced,
    shortname = "phost",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.state"}"#,
    printcolumn = r#"{"name":"Consumer","type":"string","jsonPath":".spec.consumerRef.name"}"#,
    printcolumn = r#"{"name":"BMC","type":"string","jsonPath":".spec.redfish.address"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalHostSpec {
    /// Out-of-band management connection
    pub redfish: RedfishConnection,

    /// Machine currently owning this host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_ref: Option<ConsumerRef>,

    /// Boot image served to the host while provisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_iso_source: Option<String>,

    /// Lifecycle state
    #[serde(default)]
    pub state: HostState,

    /// Details gathered during inspection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareDetails>,

    /// Condition history
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<HostCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RedfishConnection {
    /// BMC address, e.g. `https://10.0.0.5` or `https://10.0.0.5/redfish/v1/Systems/1`
    pub address: String,

    /// Name of the Secret holding `username` and `password`
    pub credentials_name: String,

    /// Skip TLS verification of the BMC certificate
    #[serde(default)]
    pub disable_certificate_verification: bool,
}

impl RedfishConnection {
    /// Both the address and the credential reference are filled in.
    pub fn is_complete(&self) -> bool {
        !self.address.trim().is_empty() && !self.credentials_name.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HardwareDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    /// Logical processor count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<u32>,

    /// Installed memory in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_gib: Option<u32>,
}

/// Physical host lifecycle state
///
/// Serializes as PascalCase ("Available", "Claimed", ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[serde(rename_all = "PascalCase")]
pub enum HostState {
    /// Registered, enrollment not started
    #[default]
    None,

    /// BMC being contacted and hardware inspected
    Enrolling,

    /// Ready to be claimed
    Available,

    /// Owned by a machine, not yet provisioned
    Claimed,

    /// Boot image being written
    Provisioning,

    /// Running the machine's image
    Provisioned,

    /// Being wiped/powered down before removal or reuse
    Deprovisioning,

    /// Needs operator attention
    Error,

    /// State could not be determined
    Unknown,
}

impl HostState {
    /// All states, in lifecycle order.
    pub const ALL: [HostState; 9] = [
        HostState::None,
        HostState::Enrolling,
        HostState::Available,
        HostState::Claimed,
        HostState::Provisioning,
        HostState::Provisioned,
        HostState::Deprovisioning,
        HostState::Error,
        HostState::Unknown,
    ];

    /// PascalCase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::None => "None",
            HostState::Enrolling => "Enrolling",
            HostState::Available => "Available",
            HostState::Claimed => "Claimed",
            HostState::Provisioning => "Provisioning",
            HostState::Provisioned => "Provisioned",
            HostState::Deprovisioning => "Deprovisioning",
            HostState::Error => "Error",
            HostState::Unknown => "Unknown",
        }
    }

    /// States that carry a consumer reference.
    pub fn is_owned(&self) -> bool {
        matches!(self, HostState::Claimed | HostState::Provisioning | HostState::Provisioned)
    }

    /// States the host is expected to leave on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HostState::Enrolling | HostState::Provisioning | HostState::Deprovisioning | HostState::Unknown
        )
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PhysicalHost {
    /// Lifecycle state.
    pub fn state(&self) -> HostState {
        self.spec.state
    }

    /// `namespace/name`, used as the key for in-process bookkeeping.
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or("<unknown>")
        )
    }

    /// Resource name, empty when unset.
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// The host has a deletion marker.
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// `bootIsoSource` is set and not blank.
    pub fn has_boot_iso(&self) -> bool {
        self.spec
            .boot_iso_source
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }

    /// Label value lookup.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    /// Whether the host carries label `key`.
    pub fn has_label(&self, key: &str) -> bool {
        self.metadata
            .labels
            .as_ref()
            .is_some_and(|labels| labels.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_state_serializes_pascal_case() {
        let json = serde_json::to_string(&HostState::Deprovisioning).unwrap();
        assert_eq!(json, "\"Deprovisioning\"");
        let parsed: HostState = serde_json::from_str("\"Provisioned\"").unwrap();
        assert_eq!(parsed, HostState::Provisioned);
    }

    #[test]
    fn test_spec_defaults_to_none_state() {
        let spec: PhysicalHostSpec = serde_json::from_value(serde_json::json!({
            "redfish": { "address": "https://10.0.0.5", "credentialsName": "bmc-creds" }
        }))
        .unwrap();
        assert_eq!(spec.state, HostState::None);
        assert!(spec.consumer_ref.is_none());
        assert!(spec.redfish.is_complete());
    }

    #[test]
    fn test_owned_states() {
        let owned: Vec<_> = HostState::ALL.iter().filter(|s| s.is_owned()).collect();
        assert_eq!(owned, vec![&HostState::Claimed, &HostState::Provisioning, &HostState::Provisioned]);
    }
}
