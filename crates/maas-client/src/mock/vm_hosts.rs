//! VM host operations for MockMaasClient
//!
//! Handles VM hosts and composition

use super::MockMaasClient;
use crate::error::MaasError;
use crate::models::*;

pub async fn list_vm_hosts(client: &MockMaasClient) -> Result<Vec<VmHost>, MaasError> {
    let mut hosts: Vec<VmHost> = client.vm_hosts.lock().unwrap().values().cloned().collect();
    hosts.sort_by_key(|h| h.id);
    Ok(hosts)
}

pub async fn get_vm_host(client: &MockMaasClient, id: u64) -> Result<VmHost, MaasError> {
    client
        .vm_hosts
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .ok_or_else(|| MaasError::NotFound(format!("VM host {} not found", id)))
}

/// Parse `eth0:subnet=mgmt;eth1:subnet=workload,ip=10.0.0.5` into (name, subnet, ip)
fn parse_interface_constraints(spec: &str) -> Vec<(String, String, Option<String>)> {
    spec.split(';')
        .filter_map(|entry| {
            let (name, attrs) = entry.split_once(':')?;
            let mut subnet = None;
            let mut ip = None;
            for attr in attrs.split(',') {
                match attr.split_once('=') {
                    Some(("subnet", v)) => subnet = Some(v.to_string()),
                    Some(("ip", v)) => ip = Some(v.to_string()),
                    _ => {}
                }
            }
            Some((name.to_string(), subnet?, ip))
        })
        .collect()
}

pub async fn compose_vm(
    client: &MockMaasClient,
    host_id: u64,
    params: ComposeParams,
) -> Result<ComposedVm, MaasError> {
    client.count(|c| c.compose += 1);
    if let Some(err) = client.failures.lock().unwrap().compose.take() {
        return Err(err);
    }

    let host = get_vm_host(client, host_id).await?;
    if client
        .machines
        .lock()
        .unwrap()
        .values()
        .any(|m| m.hostname == params.hostname)
    {
        return Err(MaasError::HostnameInUse(format!(
            "Node with this Hostname already exists: {}",
            params.hostname
        )));
    }

    let system_id = format!("vm{:04}", client.next_id() % 10_000);
    let machine = Machine {
        system_id: system_id.clone(),
        hostname: params.hostname.clone(),
        fqdn: format!("{}.maas", params.hostname),
        cpu_count: params.cores,
        memory: params.memory,
        status_name: "Commissioning".to_string(),
        power_state: "on".to_string(),
        zone: host.zone.clone(),
        pool: host.pool.clone(),
        pod: Some(NamedRef {
            id: host.id,
            name: host.name.clone(),
        }),
        ..Default::default()
    };
    client.add_machine(machine);

    let wiring = params
        .interfaces
        .as_deref()
        .map(parse_interface_constraints)
        .unwrap_or_default();
    if wiring.is_empty() {
        let id = client.next_id();
        client.add_interface(&system_id, super::helpers::interface(id, "eth0", Vec::new()));
    }
    for (name, subnet_spec, ip) in wiring {
        let id = client.next_id();
        let subnet = super::interfaces::resolve_subnet(client, &subnet_spec);
        let mode = if ip.is_some() { LinkMode::Static } else { LinkMode::Auto };
        let link_id = client.next_id();
        let links = vec![super::helpers::link(link_id, mode, subnet, ip.as_deref())];
        client.add_interface(&system_id, super::helpers::interface(id, &name, links));
    }

    Ok(ComposedVm {
        resource_uri: format!("/MAAS/api/2.0/machines/{}/", system_id),
        system_id,
    })
}

pub async fn list_host_vms(client: &MockMaasClient, host_id: u64) -> Result<Vec<Machine>, MaasError> {
    get_vm_host(client, host_id).await?;
    Ok(client
        .all_machines()
        .into_iter()
        .filter(|m| m.pod.as_ref().is_some_and(|p| p.id == host_id))
        .map(|m| client.hydrate(m))
        .collect())
}
