//! Metal Claim Controller
//!
//! Binds MetalMachines to PhysicalHosts and drives the claimed hosts through
//! provisioning:
//! - PhysicalHost: enrolls, inspects and deprovisions hosts over Redfish
//! - MetalMachine: claims a matching Available host and provisions it
//!
//! Claims are serialized through a leader-elected coordinator when leader
//! election is enabled, and BMC operations are rate limited per endpoint.

mod backoff;
mod config;
mod controller;
mod error;
mod reconciler;
mod redfish;
mod server;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "metal_claim_controller=info,host_claim=info,kube_runtime=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Metal Claim Controller");

    let config = ControllerConfig::from_env()?;
    config.log();

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let controller = Controller::new(config, shutdown).await?;
    controller.run().await?;

    info!("Metal Claim Controller exited");
    Ok(())
}

/// Cancels `shutdown` on Ctrl+C or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
        () = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
