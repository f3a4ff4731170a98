//! MetalMachine CRD
//!
//! A compute request that needs a physical host. The machine never stores
//! ownership itself; the claimed host's `consumerRef` does.

use crate::conditions::HostCondition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "dcops.microscaler.io",
    version = "v1alpha1",
    kind = "MetalMachine",
    namespaced,
    status = "MetalMachineStatus",
    shortname = "mm",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".status.hostRef"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MetalMachineSpec {
    /// Placement constraints for host selection
    #[serde(default)]
    pub host_selector: HostSelector,

    /// Image to provision; the URL becomes the host's `bootIsoSource`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<MachineImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostSelector {
    /// Tags every candidate host must carry (`key` or `key=value`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_tags: Vec<String>,

    /// Tags that rank candidates higher when present
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_tags: Vec<String>,

    /// Minimum logical CPU count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cpu_count: Option<u32>,

    /// Minimum memory in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_memory_gib: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineImage {
    /// ISO/image URL
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetalMachineStatus {
    /// Name of the claimed PhysicalHost
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ref: Option<String>,

    #[serde(default)]
    pub phase: MachinePhase,

    /// Host provisioned and running the image
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<HostCondition>,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,

    /// Error message if reconciliation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum MachinePhase {
    /// Waiting for a host
    #[default]
    Pending,

    /// Host claimed
    Claimed,

    /// Image being written to the host
    Provisioning,

    /// Host running the image
    Provisioned,

    /// Provisioning failed terminally
    Failed,
}

impl MetalMachine {
    /// `namespace/name`.
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or("<unknown>")
        )
    }

    /// The machine asks for nothing beyond "any host".
    pub fn has_no_tags(&self) -> bool {
        self.spec.host_selector.required_tags.is_empty()
            && self.spec.host_selector.preferred_tags.is_empty()
    }

    /// Host recorded in status, if any.
    pub fn host_ref(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.host_ref.as_deref())
    }
}
