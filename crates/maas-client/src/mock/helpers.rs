//! Fixture builders for mock-backed tests

use crate::models::*;

/// Zone or pool reference
pub fn named(id: u64, name: &str) -> NamedRef {
    NamedRef {
        id,
        name: name.to_string(),
    }
}

/// Powered-off machine in the given lifecycle state
pub fn machine(system_id: &str, hostname: &str, status: &str) -> Machine {
    Machine {
        system_id: system_id.to_string(),
        hostname: hostname.to_string(),
        fqdn: format!("{}.maas", hostname),
        cpu_count: 4,
        memory: 8192,
        status_name: status.to_string(),
        power_state: "off".to_string(),
        ..Default::default()
    }
}

/// VM host; `host_system_id` of `None` models a host registered out of band
pub fn vm_host(
    id: u64,
    name: &str,
    zone: NamedRef,
    pool: Option<NamedRef>,
    host_system_id: Option<&str>,
) -> VmHost {
    VmHost {
        id,
        name: name.to_string(),
        host_type: "lxd".to_string(),
        zone: Some(zone),
        pool,
        host: host_system_id.map(|s| VmHostMachineRef {
            system_id: s.to_string(),
        }),
        available: VmHostResources {
            cores: 16,
            memory: 65536,
            local_storage: 500 * 1024 * 1024 * 1024,
        },
        tags: Vec::new(),
    }
}

pub fn subnet(id: u64, name: &str, cidr: &str) -> Subnet {
    Subnet {
        id,
        name: name.to_string(),
        cidr: cidr.to_string(),
        gateway_ip: None,
        vlan: None,
    }
}

pub fn link(id: u64, mode: LinkMode, subnet: Option<Subnet>, ip_address: Option<&str>) -> Link {
    Link {
        id,
        mode,
        subnet,
        ip_address: ip_address.map(str::to_string),
    }
}

/// Enabled physical interface
pub fn interface(id: u64, name: &str, links: Vec<Link>) -> Interface {
    Interface {
        id,
        name: name.to_string(),
        interface_type: "physical".to_string(),
        mac_address: Some(format!("52:54:00:00:{:02x}:{:02x}", (id >> 8) & 0xff, id & 0xff)),
        enabled: true,
        links,
    }
}

/// IP allocation held by the given interfaces
pub fn ip_allocation(ip: &str, interfaces: Vec<AllocationInterface>) -> IpAllocation {
    IpAllocation {
        ip: ip.to_string(),
        alloc_type_name: "User reserved".to_string(),
        interface_set: interfaces,
    }
}
