//! Test utilities for unit testing reconcilers
//!
//! Builds a `Reconciler` over an in-memory host store, a mock BMC and a
//! machine API that records writes instead of sending them.

use crate::backoff::RequeueBackoff;
use crate::error::ControllerError;
use crate::reconciler::{HOST_FINALIZER, MACHINE_FINALIZER, MachineApi, Reconciler};
use async_trait::async_trait;
use crds::{
    ConsumerRef, HostState, MachineImage, MetalMachine, MetalMachineSpec, MetalMachineStatus, PhysicalHost,
    PhysicalHostSpec, RedfishConnection,
};
use host_claim::store::InMemoryHostStore;
use host_claim::{
    ClaimConfig, GuardConfig, HostClaimCoordinator, ProvisioningQueue, ProvisioningQueueConfig, RedfishConnector,
    RedfishOperator, StateTransitionGuard,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use redfish_client::{MockRedfishClient, RedfishClientTrait, RedfishError};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const POLL: Duration = Duration::from_millis(50);
pub const RETRY_MIN: Duration = Duration::from_secs(1);

/// Records machine writes
#[derive(Default)]
pub struct RecordingMachineApi {
    statuses: Mutex<Vec<MetalMachineStatus>>,
    finalizers: Mutex<Vec<Vec<String>>>,
}

impl RecordingMachineApi {
    pub fn statuses(&self) -> Vec<MetalMachineStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn last_status(&self) -> MetalMachineStatus {
        self.statuses().pop().expect("no status was written")
    }

    pub fn finalizer_writes(&self) -> Vec<Vec<String>> {
        self.finalizers.lock().unwrap().clone()
    }
}

#[async_trait]
impl MachineApi for RecordingMachineApi {
    async fn patch_status(&self, _machine: &MetalMachine, status: &MetalMachineStatus) -> Result<(), ControllerError> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }

    async fn set_finalizers(&self, _machine: &MetalMachine, finalizers: Vec<String>) -> Result<(), ControllerError> {
        self.finalizers.lock().unwrap().push(finalizers);
        Ok(())
    }
}

/// Hands every host the same mock BMC
pub struct FixedConnector(pub MockRedfishClient);

#[async_trait]
impl RedfishConnector for FixedConnector {
    async fn connect(&self, _host: &PhysicalHost) -> Result<Arc<dyn RedfishClientTrait>, RedfishError> {
        Ok(Arc::new(self.0.clone()))
    }
}

/// A reconciler and the fakes behind it
pub struct TestEnv {
    pub store: InMemoryHostStore,
    pub bmc: MockRedfishClient,
    pub machines: Arc<RecordingMachineApi>,
    pub queue: Arc<ProvisioningQueue>,
    pub reconciler: Reconciler,
}

impl TestEnv {
    pub async fn new() -> Self {
        let store = InMemoryHostStore::new();
        let bmc = MockRedfishClient::new("https://10.0.0.5");
        let machines = Arc::new(RecordingMachineApi::default());

        let guard = StateTransitionGuard::new(
            Arc::new(store.clone()),
            GuardConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
            },
        );
        let coordinator = HostClaimCoordinator::new(guard.clone(), ClaimConfig { retry_after: RETRY_MIN });

        let connector: Arc<dyn RedfishConnector> = Arc::new(FixedConnector(bmc.clone()));
        let queue = Arc::new(ProvisioningQueue::new(
            ProvisioningQueueConfig {
                max_concurrent_ops: 5,
                bmc_cooldown_period: Duration::from_millis(10),
                max_queue_size: 10,
                worker_count: 2,
                poll_interval: Duration::from_millis(5),
                request_timeout: Duration::from_secs(5),
                shutdown_grace_period: Duration::from_secs(1),
            },
            Arc::new(RedfishOperator::new(Arc::clone(&connector))),
        ));
        queue.start().await;

        let reconciler = Reconciler::new(
            Arc::new(coordinator),
            guard,
            Arc::clone(&queue),
            connector,
            machines.clone(),
            RequeueBackoff::new(RETRY_MIN, RETRY_MIN * 10),
            POLL,
            CancellationToken::new(),
        );

        Self {
            store,
            bmc,
            machines,
            queue,
            reconciler,
        }
    }

    /// Stored copy of `default/<name>`
    pub fn host(&self, name: &str) -> PhysicalHost {
        self.store.snapshot("default", name).expect("host not in store")
    }
}

/// Helper to create a test PhysicalHost whose fields match `state`
pub fn create_test_host(name: &str, state: HostState) -> PhysicalHost {
    let mut host = PhysicalHost::new(
        name,
        PhysicalHostSpec {
            redfish: RedfishConnection {
                address: format!("https://bmc-{name}.lab:443"),
                credentials_name: format!("{name}-bmc"),
                disable_certificate_verification: true,
            },
            state,
            ..Default::default()
        },
    );
    host.metadata.namespace = Some("default".to_string());
    host
}

/// Helper to create a host owned by `machine` in `state`
pub fn create_owned_host(name: &str, state: HostState, machine: &MetalMachine) -> PhysicalHost {
    let mut host = create_test_host(name, state);
    host.spec.consumer_ref = Some(ConsumerRef::for_machine(machine));
    host.spec.boot_iso_source = Some("http://images/ubuntu.iso".to_string());
    host
}

/// Adds the host finalizer, as an earlier reconcile would have
pub fn with_host_finalizer(mut host: PhysicalHost) -> PhysicalHost {
    host.metadata.finalizers = Some(vec![HOST_FINALIZER.to_string()]);
    host
}

/// Helper to create a test MetalMachine that already carries the finalizer
pub fn create_test_machine(name: &str, image: Option<&str>) -> MetalMachine {
    MetalMachine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{name}")),
            resource_version: Some("1".to_string()),
            finalizers: Some(vec![MACHINE_FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: MetalMachineSpec {
            image: image.map(|url| MachineImage { url: url.to_string() }),
            ..Default::default()
        },
        status: None,
    }
}

/// Marks an object's metadata as deleted
pub fn deleted(metadata: &mut ObjectMeta) {
    metadata.deletion_timestamp = Some(crds::meta::from_utc(chrono::Utc::now()).unwrap());
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
