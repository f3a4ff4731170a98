//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the claim
//! coordinator, provisioning queue, stuck-state sweep, metrics server and
//! resource watchers together, and tears them down in order on shutdown.

use crate::backoff::RequeueBackoff;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::{KubeMachineApi, Reconciler};
use crate::redfish::SecretRedfishConnector;
use crate::server;
use crate::watcher::Watcher;
use crds::{MetalMachine, PhysicalHost};
use host_claim::leader::KubeLeaseLock;
use host_claim::{
    ClaimCoordinator, ClaimMetrics, HostClaimCoordinator, HostStore, KubeHostStore, LeaderElectionClaimCoordinator,
    ProvisioningQueue, RedfishConnector, RedfishOperator, StateRecoveryManager, StateTransitionGuard,
};
use kube::{Api, Client};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Requeue interval while a host is being provisioned or inspected
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Main controller for host claiming and provisioning.
pub struct Controller {
    machine_watcher: JoinHandle<Result<(), ControllerError>>,
    host_watcher: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
    recovery_sweep: JoinHandle<()>,
    queue: Arc<ProvisioningQueue>,
    leader: Option<LeaderElectionClaimCoordinator>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Creates a new controller instance and starts its background tasks.
    pub async fn new(config: ControllerConfig, shutdown: CancellationToken) -> Result<Self, ControllerError> {
        info!("Initializing Metal Claim Controller");

        let kube_client = Client::try_default().await?;

        let registry = Registry::new();
        let metrics = ClaimMetrics::new(&registry)?;

        let store: Arc<dyn HostStore> = Arc::new(KubeHostStore::new(kube_client.clone(), config.namespace.clone()));
        let guard = StateTransitionGuard::new(store, config.guard.clone());
        let optimistic = HostClaimCoordinator::new(guard.clone(), config.claim.clone()).with_metrics(metrics.clone());

        let (coordinator, leader) = if config.leader_election_enabled {
            let leader = LeaderElectionClaimCoordinator::new(
                optimistic,
                config.coordinator.clone(),
                config.election.identity.clone(),
                Some(metrics.clone()),
            );
            let lock = Arc::new(KubeLeaseLock::new(
                kube_client.clone(),
                &config.election.lease_namespace,
                &config.election.lease_name,
            ));
            leader.start(lock, config.election.clone(), &shutdown).await;
            let coordinator: Arc<dyn ClaimCoordinator> = Arc::new(leader.clone());
            (coordinator, Some(leader))
        } else {
            info!("Leader election disabled, claiming optimistically");
            let coordinator: Arc<dyn ClaimCoordinator> = Arc::new(optimistic);
            (coordinator, None)
        };

        let connector: Arc<dyn RedfishConnector> = Arc::new(SecretRedfishConnector::new(kube_client.clone()));
        let operator = Arc::new(RedfishOperator::new(Arc::clone(&connector)));
        let queue = Arc::new(ProvisioningQueue::with_metrics(config.queue.clone(), operator, metrics));
        queue.start().await;

        let reconciler = Arc::new(Reconciler::new(
            coordinator,
            guard.clone(),
            Arc::clone(&queue),
            connector,
            Arc::new(KubeMachineApi::new(kube_client.clone())),
            RequeueBackoff::new(config.claim.retry_after, config.claim.retry_after * 10),
            POLL_INTERVAL,
            shutdown.clone(),
        ));

        let (machine_api, host_api): (Api<MetalMachine>, Api<PhysicalHost>) = match config.namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(kube_client.clone(), ns),
                Api::namespaced(kube_client.clone(), ns),
            ),
            None => (Api::all(kube_client.clone()), Api::all(kube_client)),
        };

        let watcher = Arc::new(Watcher::new(reconciler, machine_api, host_api, shutdown.clone()));
        let machine_watcher = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.watch_machines().await })
        };
        let host_watcher = tokio::spawn(async move { watcher.watch_hosts().await });

        let recovery_sweep = tokio::spawn(recovery_sweep(
            StateRecoveryManager::new(guard),
            config.stuck_state_timeout,
            config.recovery_interval,
            shutdown.clone(),
        ));

        let metrics_server = tokio::spawn(server::serve(config.metrics_addr, registry, shutdown.clone()));

        Ok(Self {
            machine_watcher,
            host_watcher,
            metrics_server,
            recovery_sweep,
            queue,
            leader,
            shutdown,
        })
    }

    /// Runs the controller until shutdown or until a watcher exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Metal Claim Controller running");

        let outcome = tokio::select! {
            result = &mut self.machine_watcher => task_outcome("MetalMachine watcher", result),
            result = &mut self.host_watcher => task_outcome("PhysicalHost watcher", result),
            result = &mut self.metrics_server => task_outcome("Metrics server", result),
            () = self.shutdown.cancelled() => Ok(()),
        };
        if let Err(e) = &outcome {
            warn!("Shutting down after failure: {}", e);
        }

        self.stop().await;
        outcome
    }

    /// Hands leadership over, drains the queue, then stops the watchers.
    /// The queue drains before `shutdown` is cancelled.
    async fn stop(self) {
        info!("Stopping Metal Claim Controller");

        if let Some(leader) = &self.leader {
            if let Err(e) = leader.stop().await {
                warn!("Leader shutdown failed: {}", e);
            }
        }
        self.queue.stop().await;
        self.shutdown.cancel();

        let grace = self.queue.config().shutdown_grace_period;
        for (name, handle) in [
            ("MetalMachine watcher", self.machine_watcher),
            ("PhysicalHost watcher", self.host_watcher),
            ("Metrics server", self.metrics_server),
        ] {
            if handle.is_finished() {
                continue;
            }
            match tokio::time::timeout(grace, handle).await {
                Ok(result) => {
                    if let Err(e) = task_outcome(name, result) {
                        warn!("{}", e);
                    }
                }
                Err(_) => warn!("{} did not stop within {:?}", name, grace),
            }
        }
        if tokio::time::timeout(grace, self.recovery_sweep).await.is_err() {
            warn!("Recovery sweep did not stop within {:?}", grace);
        }
        info!("Metal Claim Controller stopped");
    }
}

fn task_outcome(
    name: &str,
    result: Result<Result<(), ControllerError>, JoinError>,
) -> Result<(), ControllerError> {
    result.map_err(|e| ControllerError::Watch(format!("{name} panicked: {e}")))?
}

/// Periodically recovers hosts stuck in transient states.
async fn recovery_sweep(
    recovery: StateRecoveryManager,
    timeout: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match recovery.recover_stuck_hosts(timeout).await {
            Ok(recovered) if !recovered.is_empty() => {
                info!("Recovered {} stuck hosts", recovered.len());
            }
            Ok(_) => {}
            Err(e) => warn!("Stuck-state sweep failed: {}", e),
        }
    }
}
