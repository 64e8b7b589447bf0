//! MAAS Machine Controller
//!
//! Provisions MaasMachine resources through MAAS:
//! - Bare metal: allocate by constraints, configure and deploy
//! - Virtualized: place on a VM host, compose, then deploy
//!
//! The MAAS system_id is recorded in the MaasMachine status before any
//! further change, so restarts resume the same instance instead of creating
//! a new one.

mod backoff;
mod config;
mod controller;
mod error;
mod metrics;
mod persister;
mod reconciler;
mod watcher;
#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
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

    info!("Starting MAAS Machine Controller");

    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  MAAS URL: {}", config.maas_url);
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Placement relaxation: {}", config.relaxation);
    info!("  Maintenance tags: {}", config.maintenance_tags.join(", "));
    info!("  Default distro series: {}", config.default_distro_series);
    info!("  Metrics address: {}", config.metrics_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
