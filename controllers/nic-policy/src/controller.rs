//! Main controller implementation.
//!
//! Builds the cluster client and reconciler, then runs the NicClusterPolicy
//! watcher in a background task until it stops.

use crate::config::Config;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use cluster_client::KubeClusterClient;
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for NIC cluster policy reconciliation.
#[derive(Debug)]
pub struct Controller {
    policy_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing NIC policy controller");

        let kube_client = Client::try_default().await?;
        let cluster_client = KubeClusterClient::new(kube_client.clone());
        let reconciler = Arc::new(Reconciler::new(Box::new(cluster_client), config.clone()));
        let watcher = Watcher::new(&kube_client, reconciler, config);

        let policy_watcher = tokio::spawn(async move { watcher.watch_policies().await });

        Ok(Self { policy_watcher })
    }

    /// Runs the controller until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("NIC policy controller running");

        self.policy_watcher
            .await
            .map_err(|e| ControllerError::Watch(format!("NicClusterPolicy watcher panicked: {e}")))?
    }
}
