//! Interface operations for MockMaasClient
//!
//! Handles interface links and bridges

use super::MockMaasClient;
use crate::error::MaasError;
use crate::models::*;

/// Resolve a subnet specifier (`<id>`, `cidr:<cidr>` or `name:<name>`, bare names allowed)
pub(crate) fn resolve_subnet(client: &MockMaasClient, spec: &str) -> Option<Subnet> {
    let subnets = client.subnets.lock().unwrap();
    if let Some(cidr) = spec.strip_prefix("cidr:") {
        return subnets.values().find(|s| s.cidr == cidr).cloned();
    }
    let name = spec.strip_prefix("name:").unwrap_or(spec);
    if let Ok(id) = name.parse::<u64>()
        && let Some(subnet) = subnets.get(&id)
    {
        return Some(subnet.clone());
    }
    subnets
        .values()
        .find(|s| s.name == name || s.cidr == name)
        .cloned()
}

fn interface_not_found(system_id: &str, interface_id: u64) -> MaasError {
    MaasError::NotFound(format!(
        "No Interface matches the given query: {} on {}",
        interface_id, system_id
    ))
}

pub async fn list_interfaces(
    client: &MockMaasClient,
    system_id: &str,
) -> Result<Vec<Interface>, MaasError> {
    if let Some(err) = client.failures.lock().unwrap().list_interfaces.take() {
        return Err(err);
    }
    if !client.machines.lock().unwrap().contains_key(system_id) {
        return Err(MaasError::NotFound(format!("No Node matches the given query: {}", system_id)));
    }
    Ok(client.interfaces_of(system_id))
}

pub async fn get_interface(
    client: &MockMaasClient,
    system_id: &str,
    interface_id: u64,
) -> Result<Interface, MaasError> {
    client
        .interfaces_of(system_id)
        .into_iter()
        .find(|i| i.id == interface_id)
        .ok_or_else(|| interface_not_found(system_id, interface_id))
}

pub async fn link_subnet(
    client: &MockMaasClient,
    system_id: &str,
    interface_id: u64,
    params: LinkSubnetParams,
) -> Result<Interface, MaasError> {
    client.count(|c| c.link += 1);
    let subnet = resolve_subnet(client, &params.subnet).ok_or_else(|| {
        MaasError::InvalidRequest(format!("Unknown subnet: {}", params.subnet))
    })?;
    let link_id = client.next_id();

    let updated = {
        let mut interfaces = client.interfaces.lock().unwrap();
        let iface = interfaces
            .get_mut(system_id)
            .and_then(|list| list.iter_mut().find(|i| i.id == interface_id))
            .ok_or_else(|| interface_not_found(system_id, interface_id))?;
        iface.links.push(Link {
            id: link_id,
            mode: params.mode,
            subnet: Some(subnet),
            ip_address: params.ip_address.clone(),
        });
        iface.clone()
    };

    if let Some(ip) = params.ip_address {
        client.add_ip_allocation(IpAllocation {
            ip,
            alloc_type_name: "Sticky".to_string(),
            interface_set: vec![AllocationInterface {
                id: updated.id,
                name: updated.name.clone(),
                system_id: Some(system_id.to_string()),
            }],
        });
    }
    Ok(updated)
}

pub async fn unlink_subnet(
    client: &MockMaasClient,
    system_id: &str,
    interface_id: u64,
    link_id: u64,
) -> Result<Interface, MaasError> {
    client.count(|c| c.unlink += 1);
    let (updated, released_ip) = {
        let mut interfaces = client.interfaces.lock().unwrap();
        let iface = interfaces
            .get_mut(system_id)
            .and_then(|list| list.iter_mut().find(|i| i.id == interface_id))
            .ok_or_else(|| interface_not_found(system_id, interface_id))?;
        let position = iface
            .links
            .iter()
            .position(|l| l.id == link_id)
            .ok_or_else(|| MaasError::NotFound(format!("Link {} not found", link_id)))?;
        let removed = iface.links.remove(position);
        (iface.clone(), removed.ip_address)
    };
    if let Some(ip) = released_ip {
        client.ip_allocations.lock().unwrap().remove(&ip);
    }
    Ok(updated)
}

pub async fn set_boot_interface_static_ip(
    client: &MockMaasClient,
    system_id: &str,
    params: LinkSubnetParams,
) -> Result<Interface, MaasError> {
    let boot_id = client
        .boot_interfaces
        .lock()
        .unwrap()
        .get(system_id)
        .copied()
        .ok_or_else(|| {
            MaasError::InvalidState(format!("machine {} has no boot interface", system_id))
        })?;
    link_subnet(client, system_id, boot_id, params).await
}

pub async fn create_bridge_on_boot_interface(
    client: &MockMaasClient,
    system_id: &str,
    params: BridgeParams,
) -> Result<Interface, MaasError> {
    client.count(|c| c.bridge += 1);
    if client
        .interfaces_of(system_id)
        .iter()
        .any(|i| i.name == params.name)
    {
        return Err(MaasError::InvalidRequest(format!(
            "Interface with this name already exists: {}",
            params.name
        )));
    }
    if !client.boot_interfaces.lock().unwrap().contains_key(system_id) {
        return Err(MaasError::InvalidState(format!(
            "machine {} has no boot interface",
            system_id
        )));
    }

    let bridge = Interface {
        id: client.next_id(),
        name: params.name,
        interface_type: "bridge".to_string(),
        mac_address: None,
        enabled: true,
        links: Vec::new(),
    };
    client
        .interfaces
        .lock()
        .unwrap()
        .entry(system_id.to_string())
        .or_default()
        .push(bridge.clone());
    Ok(bridge)
}
