//! IP address operations for MockMaasClient

use super::MockMaasClient;
use crate::error::MaasError;
use crate::models::*;

pub async fn get_ip_address(
    client: &MockMaasClient,
    ip: &str,
) -> Result<Option<IpAllocation>, MaasError> {
    Ok(client.ip_allocation(ip))
}

pub async fn release_ip_address(
    client: &MockMaasClient,
    ip: &str,
    force: bool,
) -> Result<(), MaasError> {
    client.count(|c| c.ip_release += 1);
    let mut allocations = client.ip_allocations.lock().unwrap();
    let allocation = allocations
        .get(ip)
        .ok_or_else(|| MaasError::NotFound(format!("IP address {} is not allocated", ip)))?;
    if !allocation.interface_set.is_empty() && !force {
        return Err(MaasError::InvalidState(format!(
            "IP address {} is in use by an interface",
            ip
        )));
    }
    allocations.remove(ip);
    Ok(())
}
