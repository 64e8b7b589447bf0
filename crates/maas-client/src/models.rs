//! MAAS API models
//!
//! These models match the JSON emitted by the MAAS 2.0 REST API handlers.
//! Only the fields the DCops controllers read are modelled; unknown fields
//! are ignored on deserialization.

use serde::{Deserialize, Serialize};

/// Zone or resource pool reference as nested in machine and VM host objects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NamedRef {
    pub id: u64,
    pub name: String,
}

/// Machine model (from `/api/2.0/machines/`)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct Machine {
    pub system_id: String,
    pub hostname: String,
    #[serde(default)]
    pub fqdn: String,
    #[serde(default)]
    pub cpu_count: u32,
    /// Memory in MiB
    #[serde(default)]
    pub memory: u64,
    /// Lifecycle state as rendered by MAAS (e.g. "Deployed", "Failed deployment")
    #[serde(default)]
    pub status_name: String,
    /// "on", "off", "unknown" or "error"
    #[serde(default)]
    pub power_state: String,
    #[serde(default)]
    pub zone: Option<NamedRef>,
    #[serde(default)]
    pub pool: Option<NamedRef>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub tag_names: Vec<String>,
    /// Swap size in bytes; `None` means the MAAS default
    #[serde(default)]
    pub swap_size: Option<u64>,
    #[serde(default)]
    pub boot_interface: Option<Interface>,
    #[serde(default)]
    pub interface_set: Vec<Interface>,
    /// VM host this machine was composed on (MAAS still calls these pods)
    #[serde(default)]
    pub pod: Option<NamedRef>,
    #[serde(default)]
    pub distro_series: String,
}

/// Backing machine reference of a VM host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VmHostMachineRef {
    pub system_id: String,
}

/// Resources still available on a VM host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct VmHostResources {
    #[serde(default)]
    pub cores: u32,
    /// Memory in MiB
    #[serde(default)]
    pub memory: u64,
    /// Local storage in bytes
    #[serde(default)]
    pub local_storage: u64,
}

/// VM host model (from `/api/2.0/vm-hosts/`)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct VmHost {
    pub id: u64,
    pub name: String,
    /// "lxd" or "virsh"
    #[serde(rename = "type", default)]
    pub host_type: String,
    #[serde(default)]
    pub zone: Option<NamedRef>,
    #[serde(default)]
    pub pool: Option<NamedRef>,
    /// Bare-metal machine hosting this VM host; `None` when registered out of band
    #[serde(default)]
    pub host: Option<VmHostMachineRef>,
    #[serde(default)]
    pub available: VmHostResources,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl VmHost {
    /// System ID of the backing bare-metal machine, if MAAS knows it
    pub fn host_system_id(&self) -> Option<&str> {
        self.host
            .as_ref()
            .map(|h| h.system_id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// Subnet model (nested in interface links)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Subnet {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub gateway_ip: Option<String>,
    #[serde(default)]
    pub vlan: Option<NestedVlan>,
}

/// VLAN (nested in subnets)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct NestedVlan {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fabric: String,
}

/// Link of an interface to a subnet
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Link {
    pub id: u64,
    pub mode: LinkMode,
    /// Populated by MAAS once commissioning has discovered the network
    #[serde(default)]
    pub subnet: Option<Subnet>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

/// Interface link modes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    Auto,
    Dhcp,
    Static,
    #[default]
    LinkUp,
}

impl LinkMode {
    /// Value expected by the `link_subnet` operation
    pub fn as_param(self) -> &'static str {
        match self {
            LinkMode::Auto => "AUTO",
            LinkMode::Dhcp => "DHCP",
            LinkMode::Static => "STATIC",
            LinkMode::LinkUp => "LINK_UP",
        }
    }
}

/// Interface model (from `/api/2.0/nodes/{system_id}/interfaces/`)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Interface {
    pub id: u64,
    pub name: String,
    /// "physical", "bridge", "bond", "vlan"
    #[serde(rename = "type", default)]
    pub interface_type: String,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub links: Vec<Link>,
}

/// IP address allocation (from `/api/2.0/ipaddresses/`)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct IpAllocation {
    pub ip: String,
    #[serde(default)]
    pub alloc_type_name: String,
    /// Interfaces currently holding this address
    #[serde(default)]
    pub interface_set: Vec<AllocationInterface>,
}

/// Interface reference inside an IP allocation
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AllocationInterface {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub system_id: Option<String>,
}

/// Tag model (from `/api/2.0/tags/`)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    #[serde(default)]
    pub comment: String,
}

/// Result of a compose request
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ComposedVm {
    pub system_id: String,
    #[serde(default)]
    pub resource_uri: String,
}

/// Constraints for `machines?op=allocate`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocateParams {
    /// Allocate this exact machine (used for composed VMs that reached Ready)
    pub system_id: Option<String>,
    pub cpu_count: Option<u32>,
    /// Minimum memory in MiB
    pub mem: Option<u64>,
    pub zone: Option<String>,
    pub pool: Option<String>,
    pub tags: Vec<String>,
}

/// Parameters for `machines/{id}?op=deploy`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployParams {
    pub distro_series: Option<String>,
    /// Raw user data; the client base64-encodes it
    pub user_data: Option<String>,
}

/// Parameters for `vm-hosts/{id}?op=compose`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeParams {
    pub cores: u32,
    /// Memory in MiB
    pub memory: u64,
    /// Storage constraint, e.g. "root:20"
    pub storage: Option<String>,
    pub hostname: String,
    pub zone: Option<u64>,
    pub pool: Option<u64>,
    /// Interface constraint string, e.g. "eth0:subnet=mgmt;eth1:subnet=workload,ip=10.0.0.5"
    pub interfaces: Option<String>,
}

/// Parameters for `interfaces/{id}?op=link_subnet`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSubnetParams {
    pub mode: LinkMode,
    /// Subnet specifier: an id, `cidr:<cidr>` or `name:<name>`
    pub subnet: String,
    pub ip_address: Option<String>,
    pub default_gateway: bool,
}

/// Parameters for `interfaces?op=create_bridge`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeParams {
    pub name: String,
    pub stp: bool,
    pub forward_delay: u32,
}
