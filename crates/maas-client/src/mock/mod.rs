//! Mock MaasClient for unit testing
//!
//! This module provides an in-memory implementation of every MAAS capability
//! trait so the provisioning engine can be tested without a MAAS region.
//!
//! The mock is organized into domain-specific modules:
//! - `machines.rs` - allocation, release, deploy and power
//! - `vm_hosts.rs` - VM hosts and composition
//! - `interfaces.rs` - interface links and bridges
//! - `ip_addresses.rs` - IP address registry
//! - `tags.rs` - tags
//! - `helpers.rs` - fixture builders for tests
//!
//! Composition is asynchronous in MAAS: a composed VM starts in
//! `Commissioning` and only becomes allocatable after
//! [`MockMaasClient::complete_commissioning`].

pub mod helpers;
mod interfaces;
mod ip_addresses;
mod machines;
mod tags;
mod vm_hosts;

use crate::error::MaasError;
use crate::maas_trait::*;
use crate::models::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Number of calls made to the mutating operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub allocate: usize,
    pub compose: usize,
    pub release: usize,
    pub forced_release: usize,
    pub link: usize,
    pub unlink: usize,
    pub deploy: usize,
    pub power_on: usize,
    pub ip_release: usize,
    pub bridge: usize,
    pub tag: usize,
}

/// Errors injected into the next call of an operation
#[derive(Default)]
pub(crate) struct InjectedFailures {
    pub(crate) allocate: Option<MaasError>,
    pub(crate) compose: Option<MaasError>,
    pub(crate) deploy: Option<MaasError>,
    pub(crate) release: Option<MaasError>,
    pub(crate) list_interfaces: Option<MaasError>,
}

/// Mock MaasClient for testing
///
/// Stores resources in memory. Clones share the same stores, so a test can
/// hand one clone to the engine and inspect state through another.
#[derive(Clone)]
pub struct MockMaasClient {
    pub(crate) base_url: String,
    pub(crate) machines: Arc<Mutex<HashMap<String, Machine>>>,
    pub(crate) vm_hosts: Arc<Mutex<HashMap<u64, VmHost>>>,
    /// Interfaces per system_id, in creation order
    pub(crate) interfaces: Arc<Mutex<HashMap<String, Vec<Interface>>>>,
    /// Boot interface id per system_id
    pub(crate) boot_interfaces: Arc<Mutex<HashMap<String, u64>>>,
    pub(crate) subnets: Arc<Mutex<HashMap<u64, Subnet>>>,
    pub(crate) ip_allocations: Arc<Mutex<HashMap<String, IpAllocation>>>,
    pub(crate) tags: Arc<Mutex<HashMap<String, Tag>>>,
    pub(crate) failures: Arc<Mutex<InjectedFailures>>,
    pub(crate) calls: Arc<Mutex<CallCounts>>,
    // Counter for generating IDs
    pub(crate) next_id: Arc<Mutex<u64>>,
}

impl MockMaasClient {
    /// Create a new mock client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            machines: Arc::new(Mutex::new(HashMap::new())),
            vm_hosts: Arc::new(Mutex::new(HashMap::new())),
            interfaces: Arc::new(Mutex::new(HashMap::new())),
            boot_interfaces: Arc::new(Mutex::new(HashMap::new())),
            subnets: Arc::new(Mutex::new(HashMap::new())),
            ip_allocations: Arc::new(Mutex::new(HashMap::new())),
            tags: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(InjectedFailures::default())),
            calls: Arc::new(Mutex::new(CallCounts::default())),
            next_id: Arc::new(Mutex::new(1000)),
        }
    }

    /// Add a machine to the mock store (for test setup)
    pub fn add_machine(&self, machine: Machine) {
        self.machines
            .lock()
            .unwrap()
            .insert(machine.system_id.clone(), machine);
    }

    /// Add a VM host to the mock store (for test setup)
    pub fn add_vm_host(&self, host: VmHost) {
        self.vm_hosts.lock().unwrap().insert(host.id, host);
    }

    /// Add a subnet that `link_subnet` can resolve by id, `cidr:` or `name:`
    pub fn add_subnet(&self, subnet: Subnet) {
        self.subnets.lock().unwrap().insert(subnet.id, subnet);
    }

    /// Add an interface to a machine. The first interface added becomes the boot interface.
    pub fn add_interface(&self, system_id: &str, interface: Interface) {
        self.boot_interfaces
            .lock()
            .unwrap()
            .entry(system_id.to_string())
            .or_insert(interface.id);
        self.interfaces
            .lock()
            .unwrap()
            .entry(system_id.to_string())
            .or_default()
            .push(interface);
    }

    /// Add an IP allocation to the mock store (for test setup)
    pub fn add_ip_allocation(&self, allocation: IpAllocation) {
        self.ip_allocations
            .lock()
            .unwrap()
            .insert(allocation.ip.clone(), allocation);
    }

    /// Make the next `compose_vm` call fail with `error`
    pub fn fail_next_compose(&self, error: MaasError) {
        self.failures.lock().unwrap().compose = Some(error);
    }

    /// Make the next `deploy` call fail with `error`
    pub fn fail_next_deploy(&self, error: MaasError) {
        self.failures.lock().unwrap().deploy = Some(error);
    }

    /// Make the next `allocate` call fail with `error`
    pub fn fail_next_allocate(&self, error: MaasError) {
        self.failures.lock().unwrap().allocate = Some(error);
    }

    /// Make the next `release_machine` call fail with `error`
    pub fn fail_next_release(&self, error: MaasError) {
        self.failures.lock().unwrap().release = Some(error);
    }

    /// Make the next `list_interfaces` call fail with `error`
    pub fn fail_next_list_interfaces(&self, error: MaasError) {
        self.failures.lock().unwrap().list_interfaces = Some(error);
    }

    /// Finish commissioning of a composed VM (Commissioning -> Ready)
    pub fn complete_commissioning(&self, system_id: &str) {
        self.set_machine_status(system_id, "Ready");
    }

    /// Finish a deployment (Deploying -> Deployed), power on and report addresses
    pub fn complete_deployment(&self, system_id: &str) {
        let addresses = self.linked_addresses(system_id);
        let mut machines = self.machines.lock().unwrap();
        if let Some(machine) = machines.get_mut(system_id) {
            machine.status_name = "Deployed".to_string();
            machine.power_state = "on".to_string();
            machine.ip_addresses = if addresses.is_empty() {
                vec![format!("10.99.0.{}", machine.system_id.len())]
            } else {
                addresses
            };
        }
    }

    /// Force a machine into a lifecycle state
    pub fn set_machine_status(&self, system_id: &str, status: &str) {
        if let Some(machine) = self.machines.lock().unwrap().get_mut(system_id) {
            machine.status_name = status.to_string();
        }
    }

    /// Force a machine's power state
    pub fn set_power_state(&self, system_id: &str, power_state: &str) {
        if let Some(machine) = self.machines.lock().unwrap().get_mut(system_id) {
            machine.power_state = power_state.to_string();
        }
    }

    /// Remove a machine as if it was deleted out of band
    pub fn remove_machine(&self, system_id: &str) {
        self.machines.lock().unwrap().remove(system_id);
        self.interfaces.lock().unwrap().remove(system_id);
    }

    /// Snapshot of a stored machine
    pub fn machine(&self, system_id: &str) -> Option<Machine> {
        self.machines.lock().unwrap().get(system_id).cloned()
    }

    /// Snapshot of all stored machines, ordered by system_id
    pub fn all_machines(&self) -> Vec<Machine> {
        let mut machines: Vec<Machine> = self.machines.lock().unwrap().values().cloned().collect();
        machines.sort_by(|a, b| a.system_id.cmp(&b.system_id));
        machines
    }

    /// Snapshot of a machine's interfaces
    pub fn interfaces_of(&self, system_id: &str) -> Vec<Interface> {
        self.interfaces
            .lock()
            .unwrap()
            .get(system_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of an IP allocation
    pub fn ip_allocation(&self, ip: &str) -> Option<IpAllocation> {
        self.ip_allocations.lock().unwrap().get(ip).cloned()
    }

    /// Call counters so far
    pub fn calls(&self) -> CallCounts {
        *self.calls.lock().unwrap()
    }

    pub fn compose_calls(&self) -> usize {
        self.calls().compose
    }

    pub fn allocate_calls(&self) -> usize {
        self.calls().allocate
    }

    pub fn release_calls(&self) -> usize {
        self.calls().release
    }

    pub fn link_calls(&self) -> usize {
        self.calls().link
    }

    /// Generate next ID
    pub(crate) fn next_id(&self) -> u64 {
        let mut id = self.next_id.lock().unwrap();
        let current = *id;
        *id += 1;
        current
    }

    pub(crate) fn count(&self, update: impl FnOnce(&mut CallCounts)) {
        update(&mut self.calls.lock().unwrap());
    }

    /// Machine with its interface set and boot interface filled in from the interface store
    pub(crate) fn hydrate(&self, mut machine: Machine) -> Machine {
        let interfaces = self.interfaces_of(&machine.system_id);
        let boot_id = self
            .boot_interfaces
            .lock()
            .unwrap()
            .get(&machine.system_id)
            .copied();
        machine.boot_interface = boot_id.and_then(|id| interfaces.iter().find(|i| i.id == id).cloned());
        machine.interface_set = interfaces;
        machine
    }

    fn linked_addresses(&self, system_id: &str) -> Vec<String> {
        self.interfaces_of(system_id)
            .iter()
            .flat_map(|i| i.links.iter())
            .filter_map(|l| l.ip_address.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl MaasConnection for MockMaasClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn validate_credentials(&self) -> Result<(), MaasError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl MachineRegistry for MockMaasClient {
    async fn allocate(&self, params: AllocateParams) -> Result<Machine, MaasError> {
        machines::allocate(self, params).await
    }

    async fn get_machine(&self, system_id: &str) -> Result<Machine, MaasError> {
        machines::get_machine(self, system_id).await
    }

    async fn list_machines(&self, filters: &[(&str, &str)]) -> Result<Vec<Machine>, MaasError> {
        machines::list_machines(self, filters).await
    }

    async fn release_machine(&self, system_id: &str, force: bool) -> Result<(), MaasError> {
        machines::release_machine(self, system_id, force).await
    }

    async fn set_swap_size(&self, system_id: &str, bytes: u64) -> Result<Machine, MaasError> {
        machines::set_swap_size(self, system_id, bytes).await
    }

    async fn set_hostname(&self, system_id: &str, hostname: &str) -> Result<Machine, MaasError> {
        machines::set_hostname(self, system_id, hostname).await
    }

    async fn deploy(&self, system_id: &str, params: DeployParams) -> Result<Machine, MaasError> {
        machines::deploy(self, system_id, params).await
    }

    async fn power_on(&self, system_id: &str) -> Result<Machine, MaasError> {
        machines::power_on(self, system_id).await
    }
}

#[async_trait::async_trait]
impl VmHostRegistry for MockMaasClient {
    async fn list_vm_hosts(&self) -> Result<Vec<VmHost>, MaasError> {
        vm_hosts::list_vm_hosts(self).await
    }

    async fn get_vm_host(&self, id: u64) -> Result<VmHost, MaasError> {
        vm_hosts::get_vm_host(self, id).await
    }

    async fn compose_vm(&self, host_id: u64, params: ComposeParams) -> Result<ComposedVm, MaasError> {
        vm_hosts::compose_vm(self, host_id, params).await
    }

    async fn list_host_vms(&self, host_id: u64) -> Result<Vec<Machine>, MaasError> {
        vm_hosts::list_host_vms(self, host_id).await
    }
}

#[async_trait::async_trait]
impl NetworkInterfaceRegistry for MockMaasClient {
    async fn list_interfaces(&self, system_id: &str) -> Result<Vec<Interface>, MaasError> {
        interfaces::list_interfaces(self, system_id).await
    }

    async fn get_interface(&self, system_id: &str, interface_id: u64) -> Result<Interface, MaasError> {
        interfaces::get_interface(self, system_id, interface_id).await
    }

    async fn link_subnet(
        &self,
        system_id: &str,
        interface_id: u64,
        params: LinkSubnetParams,
    ) -> Result<Interface, MaasError> {
        interfaces::link_subnet(self, system_id, interface_id, params).await
    }

    async fn unlink_subnet(
        &self,
        system_id: &str,
        interface_id: u64,
        link_id: u64,
    ) -> Result<Interface, MaasError> {
        interfaces::unlink_subnet(self, system_id, interface_id, link_id).await
    }

    async fn set_boot_interface_static_ip(
        &self,
        system_id: &str,
        params: LinkSubnetParams,
    ) -> Result<Interface, MaasError> {
        interfaces::set_boot_interface_static_ip(self, system_id, params).await
    }

    async fn create_bridge_on_boot_interface(
        &self,
        system_id: &str,
        params: BridgeParams,
    ) -> Result<Interface, MaasError> {
        interfaces::create_bridge_on_boot_interface(self, system_id, params).await
    }
}

#[async_trait::async_trait]
impl IpAddressRegistry for MockMaasClient {
    async fn get_ip_address(&self, ip: &str) -> Result<Option<IpAllocation>, MaasError> {
        ip_addresses::get_ip_address(self, ip).await
    }

    async fn release_ip_address(&self, ip: &str, force: bool) -> Result<(), MaasError> {
        ip_addresses::release_ip_address(self, ip, force).await
    }
}

#[async_trait::async_trait]
impl TagRegistry for MockMaasClient {
    async fn create_tag(&self, name: &str) -> Result<Tag, MaasError> {
        tags::create_tag(self, name).await
    }

    async fn assign_tag(&self, name: &str, system_id: &str) -> Result<(), MaasError> {
        tags::assign_tag(self, name, system_id).await
    }
}
