//! Test utilities for unit testing the provisioning engine
//!
//! This module provides helpers for creating test data and setting up test scenarios.

#[cfg(test)]
use crate::metrics::Metrics;
#[cfg(test)]
use crate::persister::{MachineKey, MemoryStatePersister};
#[cfg(test)]
use crate::reconciler::{EngineOptions, Reconciler};
#[cfg(test)]
use crds::*;
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use maas_client::mock::helpers::{machine, named, vm_host};
#[cfg(test)]
use maas_client::{Machine, MockMaasClient, VmHost};
#[cfg(test)]
use std::sync::Arc;

/// Engine wired to a mock MAAS and in-memory state
#[cfg(test)]
pub struct TestEnv {
    pub maas: MockMaasClient,
    pub persister: Arc<MemoryStatePersister>,
    pub metrics: Arc<Metrics>,
    pub reconciler: Reconciler,
}

#[cfg(test)]
impl TestEnv {
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        let maas = MockMaasClient::new("http://maas.test:5240/MAAS");
        let persister = Arc::new(MemoryStatePersister::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let reconciler = Reconciler::new(
            maas.clone(),
            persister.clone(),
            persister.clone(),
            options,
            metrics.clone(),
        );
        Self {
            maas,
            persister,
            metrics,
            reconciler,
        }
    }
}

/// Key of the MaasMachine under test
#[cfg(test)]
pub fn key() -> MachineKey {
    MachineKey::new("default", "worker-0")
}

#[cfg(test)]
pub fn bare_metal_spec() -> MaasMachineSpec {
    MaasMachineSpec {
        min_cpu: 2,
        min_memory_mib: 4096,
        image: None,
        failure_domain: Some("z1".to_string()),
        resource_pool: Some("p1".to_string()),
        tags: Vec::new(),
        provisioning_mode: ProvisioningMode::BareMetal,
        hostname: None,
        user_data: None,
        static_ip: None,
        bridge: None,
        virtualized: None,
    }
}

#[cfg(test)]
pub fn virtualized_spec(networks: &[&str]) -> MaasMachineSpec {
    MaasMachineSpec {
        min_cpu: 2,
        min_memory_mib: 4096,
        image: Some("noble".to_string()),
        failure_domain: Some("z1".to_string()),
        resource_pool: Some("p1".to_string()),
        tags: Vec::new(),
        provisioning_mode: ProvisioningMode::Virtualized,
        hostname: None,
        user_data: None,
        static_ip: None,
        bridge: None,
        virtualized: Some(VirtualizedSpec {
            storage_gib: Some(40),
            networks: networks.iter().map(|n| n.to_string()).collect(),
            vm_host: None,
        }),
    }
}

#[cfg(test)]
pub fn static_ip_spec(address: &str, gateway: &str, subnet: &str) -> StaticIpSpec {
    StaticIpSpec {
        address: address.to_string(),
        gateway: gateway.to_string(),
        subnet: subnet.to_string(),
        dns_servers: Vec::new(),
        interface: None,
    }
}

/// Ready machine in zone z1, pool p1
#[cfg(test)]
pub fn ready_machine(system_id: &str) -> Machine {
    let mut m = machine(system_id, system_id, "Ready");
    m.zone = Some(named(1, "z1"));
    m.pool = Some(named(1, "p1"));
    m
}

/// Healthy VM host in z1/p1 backed by a deployed, powered-on machine
#[cfg(test)]
pub fn add_healthy_vm_host(maas: &MockMaasClient, id: u64, name: &str) -> VmHost {
    let backing = format!("host{}", id);
    let mut m = machine(&backing, &backing, "Deployed");
    m.power_state = "on".to_string();
    maas.add_machine(m);
    let host = vm_host(id, name, named(1, "z1"), Some(named(1, "p1")), Some(&backing));
    maas.add_vm_host(host.clone());
    host
}

/// Helper to create test MaasMachine CRD
#[cfg(test)]
pub fn create_test_maas_machine(name: &str, namespace: &str, spec: MaasMachineSpec) -> MaasMachine {
    MaasMachine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}
