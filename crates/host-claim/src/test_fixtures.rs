//! Shared builders for unit tests.

use crds::{
    ConsumerRef, HardwareDetails, HostSelector, HostState, MetalMachine, MetalMachineSpec,
    PhysicalHost, PhysicalHostSpec, RedfishConnection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

pub(crate) fn claim_consumer(machine: &str) -> ConsumerRef {
    ConsumerRef::for_machine(&machine_named(machine))
}

/// A host whose fields are consistent with `state`.
pub(crate) fn host_in_state(name: &str, state: HostState) -> PhysicalHost {
    let mut host = PhysicalHost::new(
        name,
        PhysicalHostSpec {
            redfish: RedfishConnection {
                address: format!("https://bmc-{name}.lab:443"),
                credentials_name: format!("{name}-bmc"),
                disable_certificate_verification: true,
            },
            state,
            hardware: Some(HardwareDetails {
                cpu_count: Some(32),
                memory_gib: Some(128),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    host.metadata.namespace = Some("default".to_string());
    if state.is_owned() {
        host.spec.consumer_ref = Some(claim_consumer("owner"));
    }
    if matches!(state, HostState::Provisioning | HostState::Provisioned) {
        host.spec.boot_iso_source = Some("http://images/ubuntu.iso".to_string());
    }
    host
}

pub(crate) fn available_host(name: &str) -> PhysicalHost {
    host_in_state(name, HostState::Available)
}

pub(crate) fn with_labels(mut host: PhysicalHost, labels: &[(&str, &str)]) -> PhysicalHost {
    let map: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    host.metadata.labels = Some(map);
    host
}

pub(crate) fn with_bmc(mut host: PhysicalHost, address: &str) -> PhysicalHost {
    host.spec.redfish.address = address.to_string();
    host
}

pub(crate) fn machine_named(name: &str) -> MetalMachine {
    MetalMachine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: MetalMachineSpec::default(),
        status: None,
    }
}

pub(crate) fn machine_with_selector(name: &str, selector: HostSelector) -> MetalMachine {
    let mut machine = machine_named(name);
    machine.spec.host_selector = selector;
    machine
}
