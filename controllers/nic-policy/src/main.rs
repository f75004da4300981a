//! NIC Policy Controller
//!
//! Reconciles the cluster-wide `NicClusterPolicy` into the workloads it asks
//! for:
//! - NIC driver, RDMA shared and SR-IOV device plugin DaemonSets
//! - Multus, CNI plugins and whereabouts IPAM DaemonSets
//! - Node labels gating staged driver installation
//!
//! Policy status reports whether everything rolled out.

mod backoff;
mod config;
mod controller;
mod error;
mod labels;
mod reconciler;
mod render;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::controller::Controller;
use crate::error::ControllerError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting NIC Policy Controller");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace);
    info!("  NIC discovery label: {}", config.nic_discovery_label);
    info!("  Debounce: {:?}", config.debounce);
    info!(
        "  Backoff: {}s..{}s, {} transient retries before Error",
        config.backoff_min_seconds, config.backoff_max_seconds, config.max_transient_retries
    );

    let controller = Controller::new(config).await?;
    controller.run().await?;

    info!("NIC Policy Controller stopped");
    Ok(())
}
