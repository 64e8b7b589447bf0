//! Controller configuration loaded from environment variables.

use crate::error::ControllerError;
use crate::reconciler::placement::RelaxationOrder;
use std::net::SocketAddr;

const DEFAULT_MAAS_URL: &str = "http://maas.maas:5240/MAAS";
const DEFAULT_DISTRO_SERIES: &str = "jammy";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";

/// Tags that take a VM host's backing machine out of placement
pub const DEFAULT_MAINTENANCE_TAGS: &[&str] = &["maintenance", "no-schedule"];

#[derive(Clone)]
pub struct Config {
    pub maas_url: String,
    pub maas_api_key: String,
    /// Namespace to watch; all namespaces when unset
    pub namespace: Option<String>,
    pub relaxation: RelaxationOrder,
    pub maintenance_tags: Vec<String>,
    pub default_distro_series: String,
    pub metrics_addr: SocketAddr,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("maas_url", &self.maas_url)
            .field("maas_api_key", &"<redacted>")
            .field("namespace", &self.namespace)
            .field("relaxation", &self.relaxation)
            .field("maintenance_tags", &self.maintenance_tags)
            .field("default_distro_series", &self.default_distro_series)
            .field("metrics_addr", &self.metrics_addr)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup (the environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let maas_url = non_empty("MAAS_URL").unwrap_or_else(|| DEFAULT_MAAS_URL.to_string());
        let maas_api_key = non_empty("MAAS_API_KEY").ok_or_else(|| {
            ControllerError::InvalidConfig(
                "MAAS_API_KEY environment variable is required".to_string(),
            )
        })?;

        let relaxation = match non_empty("PLACEMENT_RELAXATION") {
            Some(value) => value.parse::<RelaxationOrder>().map_err(|e| {
                ControllerError::InvalidConfig(format!("PLACEMENT_RELAXATION: {}", e))
            })?,
            None => RelaxationOrder::default(),
        };

        let maintenance_tags = match non_empty("MAINTENANCE_TAGS") {
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_MAINTENANCE_TAGS.iter().map(|t| t.to_string()).collect(),
        };

        let metrics_addr = non_empty("METRICS_ADDR")
            .unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ControllerError::InvalidConfig(format!("METRICS_ADDR: {}", e)))?;

        Ok(Self {
            maas_url,
            maas_api_key,
            namespace: non_empty("WATCH_NAMESPACE"),
            relaxation,
            maintenance_tags,
            default_distro_series: non_empty("DEFAULT_DISTRO_SERIES")
                .unwrap_or_else(|| DEFAULT_DISTRO_SERIES.to_string()),
            metrics_addr,
        })
    }
}
