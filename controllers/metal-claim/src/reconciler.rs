//! Reconciliation logic for MetalMachine and PhysicalHost CRDs.
//!
//! Machines are bound to hosts through the claim coordinator and then
//! driven through `Claimed -> Provisioning -> Provisioned`. Hardware work
//! goes through the provisioning queue so BMC limits hold across every
//! reconcile. Hosts are enrolled (inspected) and deprovisioned here too.

use crate::backoff::RequeueBackoff;
use crate::error::ControllerError;
use async_trait::async_trait;
use chrono::Utc;
use crds::{
    CONDITION_HOST_CLAIMED, CONDITION_HOST_PROVISIONED, ConditionStatus, HardwareDetails, HostCondition,
    HostState, MachinePhase, MetalMachine, MetalMachineStatus, PhysicalHost,
};
use host_claim::{
    ClaimCoordinator, ClaimError, ClaimRequest, ClaimResult, ProvisioningOperation, ProvisioningQueue,
    ProvisioningTicket, QueueError, RedfishConnector, StateTransitionGuard, StoreError,
};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use kube_runtime::controller::Action;
use redfish_client::{RedfishError, SystemInfo};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Finalizer that keeps a deleted machine around until its host is released
pub const MACHINE_FINALIZER: &str = "dcops.microscaler.io/host-release";

/// Finalizer that keeps a deleted host until it is powered off and unowned
pub const HOST_FINALIZER: &str = "dcops.microscaler.io/host-deprovision";

/// `HostProvisioned` reason recorded once the BMC accepted the PXE boot
pub const PXE_BOOT_ISSUED: &str = "PxeBootIssued";

/// Writes to MetalMachine objects.
#[async_trait]
pub trait MachineApi: Send + Sync {
    async fn patch_status(&self, machine: &MetalMachine, status: &MetalMachineStatus) -> Result<(), ControllerError>;

    /// Replaces `metadata.finalizers`, conditional on the machine's resourceVersion
    async fn set_finalizers(&self, machine: &MetalMachine, finalizers: Vec<String>) -> Result<(), ControllerError>;
}

/// `MachineApi` over the Kubernetes API
#[derive(Clone)]
pub struct KubeMachineApi {
    client: Client,
}

impl KubeMachineApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, machine: &MetalMachine) -> Api<MetalMachine> {
        let namespace = machine.metadata.namespace.as_deref().unwrap_or("default");
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl MachineApi for KubeMachineApi {
    async fn patch_status(&self, machine: &MetalMachine, status: &MetalMachineStatus) -> Result<(), ControllerError> {
        let name = machine_name(machine)?;
        let patch = serde_json::json!({ "status": status });
        self.api(machine)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_finalizers(&self, machine: &MetalMachine, finalizers: Vec<String>) -> Result<(), ControllerError> {
        let name = machine_name(machine)?;
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": machine.metadata.resource_version,
            }
        });
        self.api(machine)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Reconciles machines and hosts.
pub struct Reconciler {
    coordinator: Arc<dyn ClaimCoordinator>,
    guard: StateTransitionGuard,
    queue: Arc<ProvisioningQueue>,
    connector: Arc<dyn RedfishConnector>,
    machines: Arc<dyn MachineApi>,
    backoff: RequeueBackoff,
    /// Requeue interval while hardware work is in flight
    poll_interval: Duration,
    shutdown: CancellationToken,
    /// Hosts whose provision finished but is not yet recorded
    completing: Arc<Mutex<HashSet<String>>>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments, reason = "wires every collaborator in one place")]
    pub fn new(
        coordinator: Arc<dyn ClaimCoordinator>,
        guard: StateTransitionGuard,
        queue: Arc<ProvisioningQueue>,
        connector: Arc<dyn RedfishConnector>,
        machines: Arc<dyn MachineApi>,
        backoff: RequeueBackoff,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            guard,
            queue,
            connector,
            machines,
            backoff,
            poll_interval,
            shutdown,
            completing: Arc::default(),
        }
    }

    /// Reconciles a MetalMachine.
    ///
    /// This method:
    /// 1. Releases the host and drops the finalizer if the machine is being deleted
    /// 2. Claims a host (or replays the existing claim)
    /// 3. Points the host at the machine image and starts provisioning
    /// 4. Mirrors progress into the machine status
    pub async fn reconcile_machine(&self, machine: &MetalMachine) -> Result<Action, ControllerError> {
        machine_name(machine)?;
        let key = machine.key();

        if machine.metadata.deletion_timestamp.is_some() {
            return self.finalize_machine(machine).await;
        }
        if !has_finalizer(machine) {
            let mut finalizers = machine.metadata.finalizers.clone().unwrap_or_default();
            finalizers.push(MACHINE_FINALIZER.to_string());
            self.machines.set_finalizers(machine, finalizers).await?;
        }

        debug!("Reconciling MetalMachine {}", key);
        let result = self
            .coordinator
            .claim_host(&ClaimRequest::for_machine(machine.clone()))
            .await;
        let result = match result {
            Ok(result) => result,
            Err(ClaimError::InvalidRequest(reason)) => {
                self.update_status(machine, failed_status(machine, &reason)).await?;
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        };

        let host = match result {
            ClaimResult {
                success: true,
                host: Some(host),
                ..
            } => host,
            waiting => return self.wait_for_host(machine, waiting).await,
        };
        self.backoff.reset(&key);

        match host.state() {
            HostState::Claimed => self.begin_provisioning(machine, host).await,
            HostState::Provisioning if pxe_boot_issued(&host) => self.finish_provisioning(machine, host).await,
            HostState::Provisioning => self.provision(machine, host).await,
            HostState::Provisioned => self.provisioned(machine, &host).await,
            HostState::Error => {
                let reason = format!("host {} is in Error state", host.name());
                let status = next_status(
                    machine,
                    MachinePhase::Failed,
                    Some(&host),
                    Some(reason.clone()),
                    [
                        claimed_condition(&host),
                        HostCondition::new(CONDITION_HOST_PROVISIONED, ConditionStatus::False, "HostError", reason),
                    ],
                );
                self.update_status(machine, status).await?;
                Ok(Action::await_change())
            }
            other => {
                debug!("Host {} for machine {} is {}, waiting", host.key(), key, other);
                Ok(Action::requeue(self.poll_interval))
            }
        }
    }

    async fn wait_for_host(&self, machine: &MetalMachine, result: ClaimResult) -> Result<Action, ControllerError> {
        if !result.retry {
            warn!("Claim for machine {} failed: {}", machine.key(), result.reason);
            self.update_status(machine, failed_status(machine, &result.reason)).await?;
            return Ok(Action::await_change());
        }

        let delay = self.backoff.next(&machine.key());
        info!(
            "No host for machine {} yet ({}), retrying in {:?}",
            machine.key(),
            result.reason,
            delay
        );
        let status = next_status(
            machine,
            MachinePhase::Pending,
            None,
            None,
            [HostCondition::new(
                CONDITION_HOST_CLAIMED,
                ConditionStatus::False,
                "WaitingForAvailableHost",
                result.reason,
            )],
        );
        self.update_status(machine, status).await?;
        Ok(Action::requeue(delay))
    }

    /// Sets the boot ISO and moves the host to `Provisioning`.
    async fn begin_provisioning(&self, machine: &MetalMachine, mut host: PhysicalHost) -> Result<Action, ControllerError> {
        let Some(image) = machine.spec.image.as_ref().map(|i| i.url.clone()) else {
            let status = next_status(
                machine,
                MachinePhase::Claimed,
                Some(&host),
                None,
                [
                    claimed_condition(&host),
                    HostCondition::new(
                        CONDITION_HOST_PROVISIONED,
                        ConditionStatus::False,
                        "NoImage",
                        "spec.image is not set",
                    ),
                ],
            );
            self.update_status(machine, status).await?;
            return Ok(Action::await_change());
        };

        self.guard
            .transition_with(&mut host, HostState::Provisioning, move |h| {
                h.spec.boot_iso_source = Some(image.clone());
                crds::set_condition(
                    &mut h.spec.conditions,
                    HostCondition::new(
                        CONDITION_HOST_PROVISIONED,
                        ConditionStatus::False,
                        "PxeBootPending",
                        format!("booting {image}"),
                    ),
                );
                Ok(())
            })
            .await?;
        info!("Host {} provisioning for machine {}", host.key(), machine.key());
        self.provision(machine, host).await
    }

    /// Queues the hardware side of provisioning unless it is already in flight.
    async fn provision(&self, machine: &MetalMachine, host: PhysicalHost) -> Result<Action, ControllerError> {
        let recording = self
            .completing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&host.key());
        let message = if recording {
            debug!("Provisioning of host {} finished, waiting for it to be recorded", host.key());
            format!("PXE boot in progress on {}", host.name())
        } else {
            match self
                .queue
                .submit_request(host.clone(), Some(machine.key()), ProvisioningOperation::Provision)
                .await
            {
                Ok(ticket) => {
                    self.spawn_completion(ticket, host.clone());
                    format!("PXE boot requested on {}", host.name())
                }
                Err(QueueError::AlreadyQueued(_)) => {
                    debug!("Provisioning of host {} already in flight", host.key());
                    format!("PXE boot in progress on {}", host.name())
                }
                Err(QueueError::Full { capacity }) => {
                    warn!(
                        "Provisioning queue full ({}), host {} will be retried",
                        capacity,
                        host.key()
                    );
                    format!("waiting for a provisioning slot for {}", host.name())
                }
                Err(e) => return Err(e.into()),
            }
        };

        let status = next_status(
            machine,
            MachinePhase::Provisioning,
            Some(&host),
            None,
            [
                claimed_condition(&host),
                HostCondition::new(CONDITION_HOST_PROVISIONED, ConditionStatus::False, "Provisioning", message),
            ],
        );
        self.update_status(machine, status).await?;
        Ok(Action::requeue(self.poll_interval))
    }

    /// Records a provision whose PXE boot was already issued.
    async fn finish_provisioning(&self, machine: &MetalMachine, mut host: PhysicalHost) -> Result<Action, ControllerError> {
        debug!("Host {} already booted, recording provision", host.key());
        self.guard.transition_to(&mut host, HostState::Provisioned).await?;
        self.provisioned(machine, &host).await
    }

    async fn provisioned(&self, machine: &MetalMachine, host: &PhysicalHost) -> Result<Action, ControllerError> {
        let status = next_status(
            machine,
            MachinePhase::Provisioned,
            Some(host),
            None,
            [
                claimed_condition(host),
                HostCondition::new(
                    CONDITION_HOST_PROVISIONED,
                    ConditionStatus::True,
                    "Provisioned",
                    format!("host {} is running the image", host.name()),
                ),
            ],
        );
        self.update_status(machine, status).await?;
        Ok(Action::await_change())
    }

    /// Moves the host on once the queued provision finishes. The host stays
    /// in `completing` until the outcome is written.
    fn spawn_completion(&self, ticket: ProvisioningTicket, host: PhysicalHost) {
        let key = host.key();
        self.completing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());

        let completing = Arc::clone(&self.completing);
        let queue = Arc::clone(&self.queue);
        let guard = self.guard.clone();
        let retry = self.poll_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            record_provision(&queue, &guard, ticket, host, retry, &shutdown).await;
            completing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        });
    }

    /// Powers off and releases the machine's host, then drops the finalizer.
    async fn finalize_machine(&self, machine: &MetalMachine) -> Result<Action, ControllerError> {
        if !has_finalizer(machine) {
            return Ok(Action::await_change());
        }
        let key = machine.key();
        info!("MetalMachine {} deleted, releasing host", key);

        let owned: Vec<PhysicalHost> = self
            .guard
            .store()
            .list()
            .await
            .map_err(ClaimError::from)?
            .into_iter()
            .filter(|h| h.spec.consumer_ref.as_ref().is_some_and(|c| c.refers_to(machine)))
            .collect();

        for host in owned {
            if matches!(host.state(), HostState::Provisioning | HostState::Provisioned) {
                self.run_operation(host, Some(key.clone()), ProvisioningOperation::Deprovision)
                    .await?;
            }
        }
        self.coordinator.release_host(machine).await?;
        self.backoff.reset(&key);

        let finalizers = machine
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != MACHINE_FINALIZER)
            .cloned()
            .collect();
        self.machines.set_finalizers(machine, finalizers).await?;
        Ok(Action::await_change())
    }

    /// Reconciles a PhysicalHost.
    ///
    /// Adds the host finalizer, enrolls new hosts and hands deleted ones
    /// to `finalize_host`.
    pub async fn reconcile_host(&self, host: &PhysicalHost) -> Result<Action, ControllerError> {
        let mut host = host.clone();
        if let Err(e) = self.guard.state_machine().validate_state_consistency(&host) {
            warn!("{}", e);
        }

        if host.is_being_deleted() {
            return self.finalize_host(host).await;
        }
        if !host_has_finalizer(&host) {
            self.guard
                .refresh_with(&mut host, |h| {
                    let finalizers = h.metadata.finalizers.get_or_insert_with(Vec::new);
                    if !finalizers.iter().any(|f| f == HOST_FINALIZER) {
                        finalizers.push(HOST_FINALIZER.to_string());
                    }
                    Ok(())
                })
                .await?;
        }

        match host.state() {
            HostState::None => {
                match self.guard.transition_to(&mut host, HostState::Enrolling).await {
                    Ok(()) => {}
                    Err(ClaimError::Transition(e)) => {
                        warn!("Cannot enroll host {}: {}", host.key(), e.reason);
                        return Ok(Action::await_change());
                    }
                    Err(e) => return Err(e.into()),
                }
                self.inspect(host).await
            }
            HostState::Enrolling => self.inspect(host).await,
            HostState::Deprovisioning => {
                self.deprovision(&mut host).await?;
                Ok(Action::await_change())
            }
            _ => Ok(Action::await_change()),
        }
    }

    /// Powers a deleted host off and drops its finalizer once nothing owns it.
    ///
    /// Provisioned hosts are deprovisioned even while owned. Claimed and
    /// Provisioning hosts wait for their machine to release them.
    async fn finalize_host(&self, mut host: PhysicalHost) -> Result<Action, ControllerError> {
        if !host_has_finalizer(&host) {
            return Ok(Action::await_change());
        }
        let owned = host.spec.consumer_ref.is_some();
        let power_off = match host.state() {
            HostState::Provisioned | HostState::Deprovisioning => true,
            HostState::Available | HostState::Error => !owned,
            _ => false,
        };
        if power_off {
            info!("PhysicalHost {} deleted, deprovisioning", host.key());
            self.guard.transition_to(&mut host, HostState::Deprovisioning).await?;
            self.deprovision(&mut host).await?;
        }

        if let Some(consumer) = &host.spec.consumer_ref {
            info!(
                "Deleted host {} is still owned by {}, waiting for release",
                host.key(),
                consumer.name
            );
            return Ok(Action::requeue(self.poll_interval));
        }
        self.guard
            .refresh_with(&mut host, |h| {
                if let Some(consumer) = &h.spec.consumer_ref {
                    return Err(ClaimError::Rejected {
                        host: h.key(),
                        reason: format!("still owned by {}", consumer.name),
                    });
                }
                if let Some(finalizers) = h.metadata.finalizers.as_mut() {
                    finalizers.retain(|f| f != HOST_FINALIZER);
                }
                Ok(())
            })
            .await?;
        info!("Host {} released for deletion", host.key());
        Ok(Action::await_change())
    }

    /// Reads inventory under a BMC permit and makes the host `Available`.
    async fn inspect(&self, mut host: PhysicalHost) -> Result<Action, ControllerError> {
        let permit = self.queue.acquire_bmc_permit(&host, &self.shutdown).await?;
        let inventory: Result<SystemInfo, RedfishError> = async {
            let client = self.connector.connect(&host).await?;
            client.get_system_info().await
        }
        .await;
        self.queue.release_bmc_permit(permit).await;

        let info = match inventory {
            Ok(info) => info,
            Err(e) => {
                warn!("Inspection of host {} failed: {}", host.key(), e);
                return Ok(Action::requeue(self.poll_interval));
            }
        };

        let hardware = hardware_details(&info);
        self.guard
            .transition_with(&mut host, HostState::Available, move |h| {
                h.spec.hardware = Some(hardware.clone());
                Ok(())
            })
            .await?;
        info!(
            "Host {} enrolled: {} {} ({} CPUs, {} GiB)",
            host.key(),
            info.manufacturer.as_deref().unwrap_or("unknown"),
            info.model.as_deref().unwrap_or("model"),
            info.cpu_count.unwrap_or_default(),
            info.memory_gib.unwrap_or_default()
        );
        Ok(Action::await_change())
    }

    /// Powers the host off, then returns it to the pool.
    async fn deprovision(&self, host: &mut PhysicalHost) -> Result<(), ControllerError> {
        self.run_operation(host.clone(), None, ProvisioningOperation::Deprovision)
            .await?;
        self.guard
            .transition_with(host, HostState::Available, |h| {
                h.spec.consumer_ref = None;
                h.spec.boot_iso_source = None;
                Ok(())
            })
            .await?;
        info!("Host {} deprovisioned", host.key());
        Ok(())
    }

    /// Submits an operation and waits for it.
    async fn run_operation(
        &self,
        host: PhysicalHost,
        machine: Option<String>,
        operation: ProvisioningOperation,
    ) -> Result<(), ControllerError> {
        let key = host.key();
        let ticket = self.queue.submit_request(host, machine, operation).await?;
        let result = self
            .queue
            .wait_for_result(ticket, self.queue.config().request_timeout)
            .await?;
        if result.success {
            Ok(())
        } else {
            Err(ControllerError::OperationFailed {
                host: key,
                operation: operation.to_string(),
                message: result.error.unwrap_or_default(),
            })
        }
    }

    /// Patches the status unless only the timestamp would change.
    async fn update_status(&self, machine: &MetalMachine, status: MetalMachineStatus) -> Result<(), ControllerError> {
        let unchanged = machine.status.as_ref().is_some_and(|current| {
            let mut current = current.clone();
            current.last_reconciled = status.last_reconciled;
            current == status
        });
        if unchanged {
            return Ok(());
        }
        self.machines.patch_status(machine, &status).await
    }
}

/// Waits for a provision and writes its outcome to the host.
///
/// Success is written together with a `PxeBootIssued` condition and
/// retried until it lands.
async fn record_provision(
    queue: &ProvisioningQueue,
    guard: &StateTransitionGuard,
    ticket: ProvisioningTicket,
    mut host: PhysicalHost,
    retry: Duration,
    shutdown: &CancellationToken,
) {
    let result = match queue.wait_for_result(ticket, queue.config().request_timeout).await {
        Ok(result) => result,
        Err(e) => {
            warn!("Lost provisioning result for host {}: {}", host.key(), e);
            return;
        }
    };

    if result.success {
        let booted = HostCondition::new(
            CONDITION_HOST_PROVISIONED,
            ConditionStatus::True,
            PXE_BOOT_ISSUED,
            format!("PXE boot issued on {}", host.name()),
        );
        loop {
            let outcome = guard
                .transition_with(&mut host, HostState::Provisioned, |h| {
                    crds::set_condition(&mut h.spec.conditions, booted.clone());
                    Ok(())
                })
                .await;
            match outcome {
                Ok(()) => {
                    info!("Host {} provisioned in {:?}", host.key(), result.duration());
                    return;
                }
                Err(e) if is_transient(&e) => {
                    warn!("Recording provision of host {} failed, retrying in {:?}: {}", host.key(), retry, e);
                    tokio::select! {
                        () = shutdown.cancelled() => return,
                        () = tokio::time::sleep(retry) => {}
                    }
                }
                Err(e) => {
                    warn!("Host {} provisioned but not recorded: {}", host.key(), e);
                    return;
                }
            }
        }
    }

    let message = result.error.unwrap_or_default();
    if result.retryable {
        warn!("Provisioning host {} failed, will retry: {}", host.key(), message);
        return;
    }
    error!("Provisioning host {} failed: {}", host.key(), message);
    let condition = HostCondition::new(
        CONDITION_HOST_PROVISIONED,
        ConditionStatus::False,
        "ProvisioningFailed",
        message,
    );
    let outcome = guard
        .transition_with(&mut host, HostState::Error, move |h| {
            crds::set_condition(&mut h.spec.conditions, condition.clone());
            Ok(())
        })
        .await;
    if let Err(e) = outcome {
        warn!("Failed to mark host {} as Error: {}", host.key(), e);
    }
}

fn is_transient(error: &ClaimError) -> bool {
    matches!(
        error,
        ClaimError::ConflictRetriesExhausted { .. } | ClaimError::Store(StoreError::Backend(_) | StoreError::Kube(_))
    )
}

fn pxe_boot_issued(host: &PhysicalHost) -> bool {
    crds::find_condition(&host.spec.conditions, CONDITION_HOST_PROVISIONED)
        .is_some_and(|c| c.status == ConditionStatus::True && c.reason == PXE_BOOT_ISSUED)
}

fn machine_name(machine: &MetalMachine) -> Result<&str, ControllerError> {
    machine
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ControllerError::InvalidConfig("MetalMachine missing name".to_string()))
}

fn has_finalizer(machine: &MetalMachine) -> bool {
    machine
        .metadata
        .finalizers
        .iter()
        .flatten()
        .any(|f| f == MACHINE_FINALIZER)
}

fn host_has_finalizer(host: &PhysicalHost) -> bool {
    host.metadata
        .finalizers
        .iter()
        .flatten()
        .any(|f| f == HOST_FINALIZER)
}

fn claimed_condition(host: &PhysicalHost) -> HostCondition {
    HostCondition::new(
        CONDITION_HOST_CLAIMED,
        ConditionStatus::True,
        "HostClaimed",
        format!("claimed host {}", host.name()),
    )
}

fn failed_status(machine: &MetalMachine, reason: &str) -> MetalMachineStatus {
    next_status(
        machine,
        MachinePhase::Failed,
        None,
        Some(reason.to_string()),
        [HostCondition::new(CONDITION_HOST_CLAIMED, ConditionStatus::False, "ClaimFailed", reason)],
    )
}

/// Builds the next machine status from the current one.
///
/// A condition keeps its `lastTransitionTime` while its status is unchanged.
pub(crate) fn next_status<const N: usize>(
    machine: &MetalMachine,
    phase: MachinePhase,
    host: Option<&PhysicalHost>,
    error: Option<String>,
    updates: [HostCondition; N],
) -> MetalMachineStatus {
    let previous = machine.status.clone().unwrap_or_default();
    let mut conditions = previous.conditions;
    for mut update in updates {
        if let Some(existing) = crds::find_condition(&conditions, &update.type_) {
            if existing.status == update.status {
                update.last_transition_time = existing.last_transition_time;
            }
        }
        crds::set_condition(&mut conditions, update);
    }
    MetalMachineStatus {
        host_ref: host.map(|h| h.name().to_string()),
        phase,
        ready: phase == MachinePhase::Provisioned,
        conditions,
        last_reconciled: Some(Utc::now()),
        error,
    }
}

fn hardware_details(info: &SystemInfo) -> HardwareDetails {
    HardwareDetails {
        manufacturer: info.manufacturer.clone(),
        model: info.model.clone(),
        serial_number: info.serial_number.clone(),
        cpu_count: info.cpu_count,
        memory_gib: info.memory_gib,
    }
}
