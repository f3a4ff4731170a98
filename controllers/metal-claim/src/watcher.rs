//! Kubernetes resource watchers.
//!
//! Both watchers go through `watch_resource()`, which runs a
//! `kube_runtime::Controller` with automatic reconnection, requeues and a
//! shared error policy, and stops when the shutdown token is cancelled.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::{MetalMachine, PhysicalHost};
use futures::StreamExt;
use futures::future::BoxFuture;
use kube::Api;
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{Controller, watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Requeue delay after a failed reconcile
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

type ReconcileFn<K> = fn(Arc<Reconciler>, Arc<K>) -> BoxFuture<'static, Result<Action, ControllerError>>;

async fn watch_resource<K>(
    api: Api<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: ReconcileFn<K>,
    resource_name: &'static str,
    concurrency: u16,
    shutdown: CancellationToken,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
{
    info!("Starting {} watcher", resource_name);

    let error_policy = move |obj: Arc<K>, error: &ControllerError, _ctx: Arc<Reconciler>| {
        error!(
            "Reconciliation error for {} {}: {}",
            resource_name,
            obj.meta().name.as_deref().unwrap_or("<unknown>"),
            error
        );
        Action::requeue(ERROR_REQUEUE)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        debug!(
            "Reconciling {} {}",
            resource_name,
            obj.meta().name.as_deref().unwrap_or("<unknown>")
        );
        reconcile_fn(ctx, obj)
    };

    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(concurrency);

    Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            if let Err(e) = res {
                debug!("Controller error for {}: {}", resource_name, e);
            }
        })
        .await;

    info!("{} watcher stopped", resource_name);
    Ok(())
}

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    machine_api: Api<MetalMachine>,
    host_api: Api<PhysicalHost>,
    shutdown: CancellationToken,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        machine_api: Api<MetalMachine>,
        host_api: Api<PhysicalHost>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            machine_api,
            host_api,
            shutdown,
        }
    }

    /// Starts watching MetalMachine resources.
    pub async fn watch_machines(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.machine_api.clone(),
            Arc::clone(&self.reconciler),
            |reconciler, machine| Box::pin(async move { reconciler.reconcile_machine(&machine).await }),
            "MetalMachine",
            8,
            self.shutdown.clone(),
        )
        .await
    }

    /// Starts watching PhysicalHost resources.
    pub async fn watch_hosts(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.host_api.clone(),
            Arc::clone(&self.reconciler),
            |reconciler, host| Box::pin(async move { reconciler.reconcile_host(&host).await }),
            "PhysicalHost",
            4,
            self.shutdown.clone(),
        )
        .await
    }
}
