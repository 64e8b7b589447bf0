//! Machine operations for MockMaasClient
//!
//! Handles allocation, release, deploy and power

use super::MockMaasClient;
use crate::error::MaasError;
use crate::models::*;

fn not_found(system_id: &str) -> MaasError {
    MaasError::NotFound(format!("No Machine matches the given query: {}", system_id))
}

fn matches_constraints(machine: &Machine, params: &AllocateParams) -> bool {
    if machine.status_name != "Ready" {
        return false;
    }
    if let Some(cpu) = params.cpu_count
        && machine.cpu_count < cpu
    {
        return false;
    }
    if let Some(mem) = params.mem
        && machine.memory < mem
    {
        return false;
    }
    if let Some(zone) = &params.zone
        && machine.zone.as_ref().map(|z| &z.name) != Some(zone)
    {
        return false;
    }
    if let Some(pool) = &params.pool
        && machine.pool.as_ref().map(|p| &p.name) != Some(pool)
    {
        return false;
    }
    params.tags.iter().all(|t| machine.tag_names.contains(t))
}

pub async fn allocate(client: &MockMaasClient, params: AllocateParams) -> Result<Machine, MaasError> {
    client.count(|c| c.allocate += 1);
    if let Some(err) = client.failures.lock().unwrap().allocate.take() {
        return Err(err);
    }

    let allocated = {
        let mut machines = client.machines.lock().unwrap();
        let candidate = match &params.system_id {
            Some(system_id) => {
                let machine = machines.get(system_id).ok_or_else(|| not_found(system_id))?;
                if machine.status_name != "Ready" {
                    return Err(MaasError::InvalidState(format!(
                        "Machine {} is not available for allocation (status: {})",
                        system_id, machine.status_name
                    )));
                }
                system_id.clone()
            }
            None => {
                let mut ids: Vec<&String> = machines
                    .iter()
                    .filter(|(_, m)| matches_constraints(m, &params))
                    .map(|(id, _)| id)
                    .collect();
                ids.sort();
                ids.first().map(|id| (*id).clone()).ok_or_else(|| {
                    MaasError::InsufficientResources(
                        "No available machine matches constraints".to_string(),
                    )
                })?
            }
        };

        let machine = machines
            .get_mut(&candidate)
            .ok_or_else(|| not_found(&candidate))?;
        machine.status_name = "Allocated".to_string();
        machine.clone()
    };
    Ok(client.hydrate(allocated))
}

pub async fn get_machine(client: &MockMaasClient, system_id: &str) -> Result<Machine, MaasError> {
    let machine = client
        .machines
        .lock()
        .unwrap()
        .get(system_id)
        .cloned()
        .ok_or_else(|| not_found(system_id))?;
    Ok(client.hydrate(machine))
}

pub async fn list_machines(
    client: &MockMaasClient,
    filters: &[(&str, &str)],
) -> Result<Vec<Machine>, MaasError> {
    let machines = client.all_machines();
    Ok(machines
        .into_iter()
        .filter(|m| {
            filters.iter().all(|(key, value)| match *key {
                "hostname" => m.hostname == *value,
                "id" | "system_id" => m.system_id == *value,
                "zone" => m.zone.as_ref().is_some_and(|z| z.name == *value),
                "pool" => m.pool.as_ref().is_some_and(|p| p.name == *value),
                "pod" => m.pod.as_ref().is_some_and(|p| p.name == *value),
                "status" => m.status_name.eq_ignore_ascii_case(value),
                _ => true,
            })
        })
        .map(|m| client.hydrate(m))
        .collect())
}

pub async fn release_machine(
    client: &MockMaasClient,
    system_id: &str,
    force: bool,
) -> Result<(), MaasError> {
    client.count(|c| {
        c.release += 1;
        if force {
            c.forced_release += 1;
        }
    });
    if let Some(err) = client.failures.lock().unwrap().release.take() {
        return Err(err);
    }

    let mut machines = client.machines.lock().unwrap();
    let machine = machines.get_mut(system_id).ok_or_else(|| not_found(system_id))?;
    if machine.status_name == "Broken" && !force {
        return Err(MaasError::InvalidState(format!(
            "Cannot release machine {}: machine is Broken",
            system_id
        )));
    }
    machine.status_name = "Ready".to_string();
    machine.power_state = "off".to_string();
    machine.ip_addresses.clear();
    Ok(())
}

pub async fn set_swap_size(
    client: &MockMaasClient,
    system_id: &str,
    bytes: u64,
) -> Result<Machine, MaasError> {
    let updated = {
        let mut machines = client.machines.lock().unwrap();
        let machine = machines.get_mut(system_id).ok_or_else(|| not_found(system_id))?;
        machine.swap_size = Some(bytes);
        machine.clone()
    };
    Ok(client.hydrate(updated))
}

pub async fn set_hostname(
    client: &MockMaasClient,
    system_id: &str,
    hostname: &str,
) -> Result<Machine, MaasError> {
    let updated = {
        let mut machines = client.machines.lock().unwrap();
        if machines
            .values()
            .any(|m| m.system_id != system_id && m.hostname == hostname)
        {
            return Err(MaasError::HostnameInUse(format!(
                "Node with this Hostname already exists: {}",
                hostname
            )));
        }
        let machine = machines.get_mut(system_id).ok_or_else(|| not_found(system_id))?;
        machine.hostname = hostname.to_string();
        machine.fqdn = format!("{}.maas", hostname);
        machine.clone()
    };
    Ok(client.hydrate(updated))
}

pub async fn deploy(
    client: &MockMaasClient,
    system_id: &str,
    params: DeployParams,
) -> Result<Machine, MaasError> {
    client.count(|c| c.deploy += 1);
    if let Some(err) = client.failures.lock().unwrap().deploy.take() {
        return Err(err);
    }

    let updated = {
        let mut machines = client.machines.lock().unwrap();
        let machine = machines.get_mut(system_id).ok_or_else(|| not_found(system_id))?;
        if machine.status_name != "Allocated" {
            return Err(MaasError::InvalidState(format!(
                "Cannot deploy machine {} in state {}",
                system_id, machine.status_name
            )));
        }
        machine.status_name = "Deploying".to_string();
        if let Some(series) = params.distro_series {
            machine.distro_series = series;
        }
        machine.clone()
    };
    Ok(client.hydrate(updated))
}

pub async fn power_on(client: &MockMaasClient, system_id: &str) -> Result<Machine, MaasError> {
    client.count(|c| c.power_on += 1);
    let updated = {
        let mut machines = client.machines.lock().unwrap();
        let machine = machines.get_mut(system_id).ok_or_else(|| not_found(system_id))?;
        machine.power_state = "on".to_string();
        machine.clone()
    };
    Ok(client.hydrate(updated))
}
