//! MaasMachine CRD
//!
//! Declares one bare-metal or virtual machine to be provisioned through MAAS.
//! The status carries the provisioning checkpoint (`instanceId`) and the
//! observed state of the MAAS machine.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dcops.microscaler.io",
    version = "v1alpha1",
    kind = "MaasMachine",
    namespaced,
    status = "MaasMachineStatus",
    shortname = "mm",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".status.instanceId"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.machineState"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MaasMachineSpec {
    /// Minimum CPU cores
    pub min_cpu: u32,

    /// Minimum memory in MiB
    pub min_memory_mib: u64,

    /// OS image (MAAS distro series, e.g. "jammy"); controller default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Availability zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,

    /// MAAS resource pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,

    /// Tags: allocation constraints for bare metal, assigned to the VM when virtualized
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Bare metal allocation or VM composition
    #[serde(default)]
    pub provisioning_mode: ProvisioningMode,

    /// Hostname to set on the instance; defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Cloud-init user data passed to deploy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,

    /// Static network configuration; DHCP when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_ip: Option<StaticIpSpec>,

    /// Bridge to create on the boot interface before deploy (bare metal only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeSpec>,

    /// VM shape and placement (virtualized only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtualized: Option<VirtualizedSpec>,
}

/// How the machine is backed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisioningMode {
    /// Allocate a physical machine
    #[default]
    BareMetal,
    /// Compose a VM on a MAAS VM host
    Virtualized,
}

impl std::fmt::Display for ProvisioningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningMode::BareMetal => write!(f, "bare-metal"),
            ProvisioningMode::Virtualized => write!(f, "virtualized"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaticIpSpec {
    /// IPv4 or IPv6 address
    pub address: String,

    /// Default gateway
    pub gateway: String,

    /// Subnet as CIDR ("10.0.0.0/24"), prefix length ("/24") or dotted mask ("255.255.255.0")
    pub subnet: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,

    /// Interface to bind; discovered from subnet membership when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSpec {
    /// Bridge interface name (e.g. "br0")
    pub name: String,

    #[serde(default)]
    pub stp: bool,

    /// Forward delay in seconds
    #[serde(default = "default_forward_delay")]
    pub forward_delay: u32,
}

fn default_forward_delay() -> u32 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualizedSpec {
    /// Root disk size in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_gib: Option<u32>,

    /// Networks (subnet names or CIDRs). With two entries the first is the
    /// management network on eth0 and the second the workload network on eth1.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(length(max = 2))]
    pub networks: Vec<String>,

    /// Pin composition to the VM host with this name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaasMachineStatus {
    /// MAAS system_id of the instance; the provisioning checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// `maas:///<zone>/<system_id>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// MAAS lifecycle state (e.g. "Deployed")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub running: bool,

    #[serde(default)]
    pub operational: bool,

    /// False when MAAS reported a state the controller does not recognise
    #[serde(default)]
    pub known_state: bool,

    /// Deployed and addresses observed
    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub phase: MachinePhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MachineCondition>,

    /// Last error message, retryable or terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,
}

/// Provisioning phase
///
/// Serializes as PascalCase and also accepts lowercase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum MachinePhase {
    #[default]
    #[serde(alias = "pending")]
    Pending,
    #[serde(alias = "allocated")]
    Allocated,
    /// VM composed, waiting for commissioning
    #[serde(alias = "commissioning")]
    Commissioning,
    #[serde(alias = "deploying")]
    Deploying,
    #[serde(alias = "deployed")]
    Deployed,
    #[serde(alias = "releasing")]
    Releasing,
    #[serde(alias = "failed")]
    Failed,
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachinePhase::Pending => "Pending",
            MachinePhase::Allocated => "Allocated",
            MachinePhase::Commissioning => "Commissioning",
            MachinePhase::Deploying => "Deploying",
            MachinePhase::Deployed => "Deployed",
            MachinePhase::Releasing => "Releasing",
            MachinePhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Status condition in the usual Kubernetes shape
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec: MaasMachineSpec =
            serde_json::from_value(serde_json::json!({"minCpu": 4, "minMemoryMib": 8192}))
                .unwrap();
        assert_eq!(spec.provisioning_mode, ProvisioningMode::BareMetal);
        assert!(spec.tags.is_empty());
        assert!(spec.virtualized.is_none());
    }

    #[test]
    fn test_virtualized_spec() {
        let spec: MaasMachineSpec = serde_json::from_value(serde_json::json!({
            "minCpu": 2,
            "minMemoryMib": 4096,
            "provisioningMode": "virtualized",
            "failureDomain": "z1",
            "resourcePool": "p1",
            "virtualized": {"storageGib": 40, "networks": ["mgmt", "workload"]},
            "bridge": {"name": "br0"}
        }))
        .unwrap();
        assert_eq!(spec.provisioning_mode, ProvisioningMode::Virtualized);
        let virt = spec.virtualized.unwrap();
        assert_eq!(virt.networks, vec!["mgmt", "workload"]);
        assert_eq!(spec.bridge.unwrap().forward_delay, 15);
    }

    #[test]
    fn test_phase_accepts_lowercase() {
        let phase: MachinePhase = serde_json::from_str("\"deploying\"").unwrap();
        assert_eq!(phase, MachinePhase::Deploying);
        assert_eq!(serde_json::to_string(&MachinePhase::Deployed).unwrap(), "\"Deployed\"");
    }

    #[test]
    fn test_status_round_trips_camel_case() {
        let status = MaasMachineStatus {
            instance_id: Some("abc123".to_string()),
            provider_id: Some("maas:///z1/abc123".to_string()),
            known_state: true,
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["instanceId"], "abc123");
        assert_eq!(value["providerId"], "maas:///z1/abc123");
        assert_eq!(value["knownState"], true);
    }
}
