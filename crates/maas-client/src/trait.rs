//! MAAS capability traits
//!
//! The MAAS API is split into the capabilities the provisioning engine consumes.
//! The concrete `MaasClient` implements all of them, and tests use `MockMaasClient`.
//! All async methods must be `Send` to work with Tokio's work-stealing runtime.

use crate::error::MaasError;
use crate::models::*;

/// Machine allocation, lifecycle and power operations
#[async_trait::async_trait]
pub trait MachineRegistry: Send + Sync {
    /// Allocate a machine matching the constraints
    async fn allocate(&self, params: AllocateParams) -> Result<Machine, MaasError>;
    async fn get_machine(&self, system_id: &str) -> Result<Machine, MaasError>;
    /// List machines, filtered by query parameters such as `hostname` or `zone`
    async fn list_machines(&self, filters: &[(&str, &str)]) -> Result<Vec<Machine>, MaasError>;
    /// Release a machine; `force` skips the graceful checks MAAS applies
    async fn release_machine(&self, system_id: &str, force: bool) -> Result<(), MaasError>;
    async fn set_swap_size(&self, system_id: &str, bytes: u64) -> Result<Machine, MaasError>;
    async fn set_hostname(&self, system_id: &str, hostname: &str) -> Result<Machine, MaasError>;
    async fn deploy(&self, system_id: &str, params: DeployParams) -> Result<Machine, MaasError>;
    async fn power_on(&self, system_id: &str) -> Result<Machine, MaasError>;
}

/// VM host (pod) operations
#[async_trait::async_trait]
pub trait VmHostRegistry: Send + Sync {
    async fn list_vm_hosts(&self) -> Result<Vec<VmHost>, MaasError>;
    async fn get_vm_host(&self, id: u64) -> Result<VmHost, MaasError>;
    /// Compose a VM on the host. Not idempotent server side.
    async fn compose_vm(&self, host_id: u64, params: ComposeParams) -> Result<ComposedVm, MaasError>;
    /// Machines composed on the host
    async fn list_host_vms(&self, host_id: u64) -> Result<Vec<Machine>, MaasError>;
}

/// Network interface operations on a node
#[async_trait::async_trait]
pub trait NetworkInterfaceRegistry: Send + Sync {
    async fn list_interfaces(&self, system_id: &str) -> Result<Vec<Interface>, MaasError>;
    async fn get_interface(&self, system_id: &str, interface_id: u64) -> Result<Interface, MaasError>;
    async fn link_subnet(
        &self,
        system_id: &str,
        interface_id: u64,
        params: LinkSubnetParams,
    ) -> Result<Interface, MaasError>;
    async fn unlink_subnet(
        &self,
        system_id: &str,
        interface_id: u64,
        link_id: u64,
    ) -> Result<Interface, MaasError>;
    /// Link the machine's boot interface to a subnet with a static address
    async fn set_boot_interface_static_ip(
        &self,
        system_id: &str,
        params: LinkSubnetParams,
    ) -> Result<Interface, MaasError>;
    /// Create a bridge whose parent is the machine's boot interface
    async fn create_bridge_on_boot_interface(
        &self,
        system_id: &str,
        params: BridgeParams,
    ) -> Result<Interface, MaasError>;
}

/// IP address registry operations
#[async_trait::async_trait]
pub trait IpAddressRegistry: Send + Sync {
    /// Look up an allocation; `None` when MAAS has no record of the address
    async fn get_ip_address(&self, ip: &str) -> Result<Option<IpAllocation>, MaasError>;
    async fn release_ip_address(&self, ip: &str, force: bool) -> Result<(), MaasError>;
}

/// Tag operations
#[async_trait::async_trait]
pub trait TagRegistry: Send + Sync {
    /// Create a tag. An existing tag with the same name is success.
    async fn create_tag(&self, name: &str) -> Result<Tag, MaasError>;
    async fn assign_tag(&self, name: &str, system_id: &str) -> Result<(), MaasError>;
}

/// Connection level operations
#[async_trait::async_trait]
pub trait MaasConnection: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Validate the API key with a lightweight authenticated request
    async fn validate_credentials(&self) -> Result<(), MaasError>;
}

/// Full MAAS client: every capability plus connection helpers.
///
/// Implemented automatically for any type providing all the capabilities,
/// so the engine can hold a single `Box<dyn MaasClientTrait>`.
pub trait MaasClientTrait:
    MaasConnection
    + MachineRegistry
    + VmHostRegistry
    + NetworkInterfaceRegistry
    + IpAddressRegistry
    + TagRegistry
{
}

impl<T> MaasClientTrait for T where
    T: MaasConnection
        + MachineRegistry
        + VmHostRegistry
        + NetworkInterfaceRegistry
        + IpAddressRegistry
        + TagRegistry
{
}
