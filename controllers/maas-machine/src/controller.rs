//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the MAAS client,
//! the provisioning engine and the MaasMachine watcher together, and serves
//! the probe and metrics endpoints next to them.

use crate::config::Config;
use crate::error::ControllerError;
use crate::metrics::{self, Metrics};
use crate::persister::KubeStatePersister;
use crate::reconciler::placement::PlacementPolicy;
use crate::reconciler::{EngineOptions, Reconciler};
use crate::watcher::Watcher;
use crds::MaasMachine;
use kube::{Api, Client};
use maas_client::{MaasClient, MaasConnection};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Main controller for MaasMachine provisioning.
pub struct Controller {
    maas_machine_watcher: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing MAAS Machine Controller");

        let kube_client = Client::try_default()
            .await
            .map_err(ControllerError::Kube)?;

        let maas_client = MaasClient::new(config.maas_url.clone(), &config.maas_api_key)
            .map_err(|e| ControllerError::InvalidConfig(format!("MAAS_API_KEY: {}", e)))?;

        info!("Validating MAAS credentials and connectivity...");
        maas_client.validate_credentials().await.map_err(|e| {
            error!("Failed to validate MAAS credentials: {}", e);
            error!("Please ensure:");
            error!("  1. MAAS_API_KEY is set to consumer:token:secret");
            error!("  2. The key belongs to a MAAS user allowed to allocate machines");
            error!("  3. MAAS is reachable at {}", config.maas_url);
            ControllerError::backend("validate MAAS credentials", e)
        })?;
        info!("MAAS credentials validated at {}", maas_client.base_url());

        let metrics = Arc::new(Metrics::new().map_err(|e| {
            ControllerError::InvalidConfig(format!("metrics registry: {}", e))
        })?);
        let persister = Arc::new(KubeStatePersister::new(kube_client.clone()));
        let options = EngineOptions {
            placement: PlacementPolicy {
                relaxation: config.relaxation,
                maintenance_tags: config.maintenance_tags.clone(),
            },
            default_distro_series: config.default_distro_series.clone(),
        };
        let reconciler = Arc::new(Reconciler::new(
            maas_client,
            persister.clone(),
            persister,
            options,
            metrics.clone(),
        ));

        let maas_machine_api: Api<MaasMachine> = match config.namespace.as_deref() {
            Some(ns) => Api::namespaced(kube_client.clone(), ns),
            None => Api::all(kube_client.clone()),
        };
        let watcher_instance = Arc::new(Watcher::new(
            reconciler,
            kube_client,
            maas_machine_api,
            metrics.clone(),
        ));

        let maas_machine_watcher = {
            let watcher = watcher_instance;
            tokio::spawn(async move { watcher.watch_maas_machines().await })
        };

        let metrics_server = {
            let addr = config.metrics_addr;
            tokio::spawn(async move { metrics::serve(addr, metrics).await })
        };

        Ok(Self {
            maas_machine_watcher,
            metrics_server,
        })
    }

    /// Runs the controller until a watcher or the metrics server stops.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("MAAS Machine Controller running");

        tokio::select! {
            result = self.maas_machine_watcher => {
                result
                    .map_err(|e| ControllerError::Watch(format!("MaasMachine watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("MaasMachine watcher failed: {}", e)))?;
            }
            result = self.metrics_server => {
                result
                    .map_err(|e| ControllerError::Watch(format!("Metrics server panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Metrics server failed: {}", e)))?;
            }
        }

        Ok(())
    }
}
