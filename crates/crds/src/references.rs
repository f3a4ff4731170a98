//! Consumer references
//!
//! A PhysicalHost is owned by at most one machine. Ownership is recorded on
//! the host as a Kubernetes-style object reference; the UID disambiguates a
//! machine from a deleted-and-recreated namesake.

use crate::metal_machine::MetalMachine;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of DCops resources.
pub const API_GROUP: &str = "dcops.microscaler.io";

/// Reference from a PhysicalHost to the machine consuming it.
///
/// Follows the Kubernetes `ObjectReference` shape: `apiVersion`, `kind`,
/// `name`, `namespace`, `uid`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    /// API version of the consumer (e.g., "dcops.microscaler.io/v1alpha1")
    pub api_version: String,

    /// Kind of the consumer (e.g., "MetalMachine")
    pub kind: String,

    /// Name of the consumer
    pub name: String,

    /// Namespace of the consumer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// UID of the consumer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ConsumerRef {
    /// Builds a reference to the given machine.
    pub fn for_machine(machine: &MetalMachine) -> Self {
        Self {
            api_version: format!("{API_GROUP}/v1alpha1"),
            kind: "MetalMachine".to_string(),
            name: machine.metadata.name.clone().unwrap_or_default(),
            namespace: machine.metadata.namespace.clone(),
            uid: machine.metadata.uid.clone(),
        }
    }

    /// Whether this reference points at `machine`.
    ///
    /// When both sides carry a UID it decides; otherwise name and namespace do.
    pub fn refers_to(&self, machine: &MetalMachine) -> bool {
        if let (Some(uid), Some(machine_uid)) = (&self.uid, &machine.metadata.uid) {
            return uid == machine_uid;
        }
        Some(&self.name) == machine.metadata.name.as_ref()
            && self.namespace == machine.metadata.namespace
    }

    /// Same consumer, compared the way `refers_to` does.
    pub fn same_consumer(&self, other: &ConsumerRef) -> bool {
        if let (Some(a), Some(b)) = (&self.uid, &other.uid) {
            return a == b;
        }
        self.name == other.name && self.namespace == other.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metal_machine::MetalMachineSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn machine(name: &str, uid: Option<&str>) -> MetalMachine {
        MetalMachine {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: uid.map(str::to_string),
                ..Default::default()
            },
            spec: MetalMachineSpec::default(),
            status: None,
        }
    }

    #[test]
    fn test_uid_decides_when_present() {
        let original = machine("worker-0", Some("uid-1"));
        let recreated = machine("worker-0", Some("uid-2"));
        let reference = ConsumerRef::for_machine(&original);

        assert!(reference.refers_to(&original));
        assert!(!reference.refers_to(&recreated));
    }

    #[test]
    fn test_name_fallback_without_uid() {
        let m = machine("worker-1", None);
        let reference = ConsumerRef::for_machine(&m);
        assert!(reference.refers_to(&m));
        assert!(!reference.refers_to(&machine("worker-2", None)));
    }
}
