//! Controller-specific error types.
//!
//! Provisioning failures carry a [`ProvisioningErrorKind`] that decides
//! whether the work is retried. [`is_retryable`] answers that question for any
//! error, walking wrapped sources until it finds a typed one.

use kube::Error as KubeError;
use maas_client::MaasError;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Requeue delay while MAAS is still working on the instance
pub const STILL_PROVISIONING_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue delay for errors that will not clear without a spec change
pub const TERMINAL_REQUEUE: Duration = Duration::from_secs(600);

/// Detail key set on provisioning errors whose instance was released
pub const RELEASED_DETAIL: &str = "released";

/// Category of a provisioning failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisioningErrorKind {
    /// No VM host or machine eligible for placement right now
    HostUnavailable,
    /// Capacity exhausted on the selected host or pool
    InsufficientResources,
    /// Compose request failed on the VM host
    VmCreationFailed,
    /// Deploy was rejected or ended in a failed deployment
    VmDeploymentFailed,
    /// Interface wiring or address binding failed
    NetworkConfiguration,
    /// LXD profile referenced by the host is missing
    ProfileNotFound,
    /// LXD project referenced by the host is missing
    ProjectNotFound,
    /// Storage pool on the host is missing or misconfigured
    StorageConfiguration,
}

impl ProvisioningErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ProvisioningErrorKind::HostUnavailable
                | ProvisioningErrorKind::InsufficientResources
                | ProvisioningErrorKind::VmCreationFailed
                | ProvisioningErrorKind::VmDeploymentFailed
                | ProvisioningErrorKind::NetworkConfiguration
        )
    }
}

impl fmt::Display for ProvisioningErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisioningErrorKind::HostUnavailable => "HostUnavailable",
            ProvisioningErrorKind::InsufficientResources => "InsufficientResources",
            ProvisioningErrorKind::VmCreationFailed => "VMCreationFailed",
            ProvisioningErrorKind::VmDeploymentFailed => "VMDeploymentFailed",
            ProvisioningErrorKind::NetworkConfiguration => "NetworkConfiguration",
            ProvisioningErrorKind::ProfileNotFound => "ProfileNotFound",
            ProvisioningErrorKind::ProjectNotFound => "ProjectNotFound",
            ProvisioningErrorKind::StorageConfiguration => "StorageConfiguration",
        };
        f.write_str(s)
    }
}

/// Categorized provisioning failure
#[derive(Debug)]
pub struct ProvisioningError {
    pub kind: ProvisioningErrorKind,
    pub message: String,
    /// VM host or machine the failure concerns
    pub host: Option<String>,
    pub source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    pub details: BTreeMap<String, String>,
}

impl ProvisioningError {
    pub fn new(kind: ProvisioningErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            host: None,
            source: None,
            details: BTreeMap::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for ProvisioningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(host) = &self.host {
            write!(f, " (host {})", host)?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl StdError for ProvisioningError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Static IP declaration that fails validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StaticIpError {
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("invalid gateway: {0}")]
    InvalidGateway(String),

    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("subnet mask {0} is not contiguous")]
    NonContiguousMask(String),

    #[error("address {address} is not inside subnet {subnet}")]
    NotInSubnet { address: String, subnet: String },

    #[error("address {0} is in a reserved range")]
    ReservedRange(String),

    #[error("gateway {gateway} is not inside subnet {subnet}")]
    GatewayNotInSubnet { gateway: String, subnet: String },

    #[error("invalid DNS server: {0}")]
    InvalidDnsServer(String),

    #[error("static IP {address} is already declared by {owner}")]
    Conflict { address: String, owner: String },
}

/// Errors that can occur in the MAAS Machine Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error("static IP validation failed: {0}")]
    StaticIp(#[from] StaticIpError),

    /// MAAS is still working on the instance; check again shortly
    #[error("machine {system_id} still provisioning: {reason}")]
    StillProvisioning { system_id: String, reason: String },

    /// The instance was found broken, force released and forgotten
    #[error("instance {system_id} was broken and has been released")]
    BrokenInstanceEncountered { system_id: String },

    /// The checkpointed instance no longer exists in MAAS
    #[error("instance {0} no longer exists in MAAS")]
    InstanceGone(String),

    /// Declared configuration cannot be satisfied; needs a spec change
    #[error("configuration error: {0}")]
    Configuration(String),

    /// MAAS call failed without a more specific classification
    #[error("MAAS error during {context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: MaasError,
    },

    /// Durable state could not be read or written
    #[error("state persistence failed: {0}")]
    Persist(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Invalid controller configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    pub fn backend(context: impl Into<String>, source: MaasError) -> Self {
        ControllerError::Backend {
            context: context.into(),
            source,
        }
    }

    pub fn still_provisioning(system_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ControllerError::StillProvisioning {
            system_id: system_id.into(),
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Provisioning(e) => e.is_retryable(),
            ControllerError::StaticIp(_)
            | ControllerError::Configuration(_)
            | ControllerError::InvalidConfig(_)
            | ControllerError::Watch(_) => false,
            ControllerError::StillProvisioning { .. }
            | ControllerError::BrokenInstanceEncountered { .. }
            | ControllerError::InstanceGone(_)
            | ControllerError::Persist(_)
            | ControllerError::Kube(_) => true,
            ControllerError::Backend { source, .. } => !matches!(
                source,
                MaasError::Authentication(_) | MaasError::InvalidRequest(_)
            ),
        }
    }

    /// True when the pass ended with the instance released or gone from MAAS
    pub fn released_instance(&self) -> bool {
        match self {
            ControllerError::BrokenInstanceEncountered { .. } | ControllerError::InstanceGone(_) => {
                true
            }
            ControllerError::Provisioning(e) => e.details.contains_key(RELEASED_DETAIL),
            _ => false,
        }
    }

    /// Short machine-readable reason for status conditions and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::Provisioning(_) => "ProvisioningFailed",
            ControllerError::StaticIp(_) => "InvalidStaticIP",
            ControllerError::StillProvisioning { .. } => "StillProvisioning",
            ControllerError::BrokenInstanceEncountered { .. } => "BrokenInstance",
            ControllerError::InstanceGone(_) => "InstanceGone",
            ControllerError::Configuration(_) | ControllerError::InvalidConfig(_) => {
                "ConfigurationError"
            }
            ControllerError::Backend { .. } => "BackendError",
            ControllerError::Persist(_) | ControllerError::Kube(_) => "PersistenceError",
            ControllerError::Watch(_) => "WatchError",
        }
    }
}

/// Whether the error, or any error it wraps, is marked retryable.
///
/// Untyped errors are not retryable.
pub fn is_retryable(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(p) = e.downcast_ref::<ProvisioningError>() {
            return p.is_retryable();
        }
        if let Some(c) = e.downcast_ref::<ControllerError>() {
            return c.is_retryable();
        }
        current = e.source();
    }
    false
}
