//! Static IP validation and binding.
//!
//! A declared static IP is validated in full before MAAS is touched. Binding
//! happens only while MAAS accepts interface edits; during commissioning, and
//! in any other locked state where the address is not yet bound, the pass is
//! reported as still provisioning instead of failing.

use crate::error::{ControllerError, ProvisioningError, ProvisioningErrorKind, StaticIpError};
use crate::persister::MachineKey;
use crate::reconciler::Reconciler;
use crate::reconciler::lifecycle::MachineState;
use crds::StaticIpSpec;
use ipnetwork::IpNetwork;
use maas_client::{Interface, LinkMode, LinkSubnetParams, MaasError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// A static IP declaration that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedStaticIp {
    pub address: IpAddr,
    pub gateway: IpAddr,
    /// Subnet with host bits cleared
    pub network: IpNetwork,
    /// The subnet was declared as a full CIDR rather than a mask or prefix length
    pub explicit_cidr: bool,
    pub dns_servers: Vec<IpAddr>,
    pub interface: Option<String>,
}

fn normalize(network: IpNetwork) -> Result<IpNetwork, StaticIpError> {
    IpNetwork::new(network.network(), network.prefix())
        .map_err(|e| StaticIpError::InvalidSubnet(e.to_string()))
}

fn max_prefix(address: IpAddr) -> u8 {
    if address.is_ipv4() { 32 } else { 128 }
}

/// Parse a dotted IPv4 mask into a prefix length, rejecting non-contiguous masks
fn mask_prefix(mask: Ipv4Addr) -> Result<u8, StaticIpError> {
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    if bits.checked_shl(ones).unwrap_or(0) != 0 {
        return Err(StaticIpError::NonContiguousMask(mask.to_string()));
    }
    u8::try_from(ones).map_err(|_| StaticIpError::InvalidSubnet(mask.to_string()))
}

/// Resolve the declared subnet against the address
fn parse_subnet(address: IpAddr, subnet: &str) -> Result<(IpNetwork, bool), StaticIpError> {
    let subnet = subnet.trim();
    let invalid = || StaticIpError::InvalidSubnet(subnet.to_string());

    if let Some((base, _)) = subnet.split_once('/')
        && !base.is_empty()
    {
        let network = IpNetwork::from_str(subnet).map_err(|_| invalid())?;
        if network.is_ipv4() != address.is_ipv4() {
            return Err(invalid());
        }
        return Ok((normalize(network)?, true));
    }

    let digits = subnet.strip_prefix('/').unwrap_or(subnet);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        let prefix: u8 = digits.parse().map_err(|_| invalid())?;
        if prefix > max_prefix(address) {
            return Err(invalid());
        }
        let network = IpNetwork::new(address, prefix).map_err(|_| invalid())?;
        return Ok((normalize(network)?, false));
    }

    let mask = Ipv4Addr::from_str(subnet).map_err(|_| invalid())?;
    if !address.is_ipv4() {
        return Err(invalid());
    }
    let network = IpNetwork::new(address, mask_prefix(mask)?).map_err(|_| invalid())?;
    Ok((normalize(network)?, false))
}

fn is_reserved_v4(ip: Ipv4Addr) -> bool {
    let first = ip.octets()[0];
    first == 0 || ip.is_loopback() || ip.is_link_local() || ip.is_multicast() || first >= 240
}

fn is_reserved_v6(ip: Ipv6Addr) -> bool {
    ip.is_unspecified()
        || ip.is_loopback()
        || (ip.segments()[0] & 0xffc0) == 0xfe80
        || ip.is_multicast()
}

pub fn is_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_reserved_v4(v4),
        IpAddr::V6(v6) => is_reserved_v6(v6),
    }
}

/// Validate a static IP declaration without talking to MAAS
pub fn validate(spec: &StaticIpSpec) -> Result<ValidatedStaticIp, StaticIpError> {
    let address = IpAddr::from_str(spec.address.trim())
        .map_err(|_| StaticIpError::InvalidAddress(spec.address.clone()))?;
    let gateway = IpAddr::from_str(spec.gateway.trim())
        .map_err(|_| StaticIpError::InvalidGateway(spec.gateway.clone()))?;
    if gateway.is_ipv4() != address.is_ipv4() {
        return Err(StaticIpError::InvalidGateway(format!(
            "{} is not in the address family of {}",
            spec.gateway, spec.address
        )));
    }

    let (network, explicit_cidr) = parse_subnet(address, &spec.subnet)?;
    if !network.contains(address) {
        return Err(StaticIpError::NotInSubnet {
            address: address.to_string(),
            subnet: network.to_string(),
        });
    }
    if is_reserved(address) {
        return Err(StaticIpError::ReservedRange(address.to_string()));
    }
    if address.is_ipv4() && !network.contains(gateway) {
        return Err(StaticIpError::GatewayNotInSubnet {
            gateway: gateway.to_string(),
            subnet: network.to_string(),
        });
    }

    let dns_servers = spec
        .dns_servers
        .iter()
        .map(|s| IpAddr::from_str(s.trim()).map_err(|_| StaticIpError::InvalidDnsServer(s.clone())))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ValidatedStaticIp {
        address,
        gateway,
        network,
        explicit_cidr,
        dns_servers,
        interface: spec.interface.clone(),
    })
}

fn subnet_network(cidr: &str) -> Option<IpNetwork> {
    IpNetwork::from_str(cidr.trim()).ok().and_then(|n| normalize(n).ok())
}

/// Interface links whose subnet contains the address
fn links_containing<'a>(
    iface: &'a Interface,
    address: IpAddr,
) -> impl Iterator<Item = &'a maas_client::Link> + 'a {
    iface.links.iter().filter(move |l| {
        l.subnet
            .as_ref()
            .and_then(|s| subnet_network(&s.cidr))
            .is_some_and(|n| n.contains(address))
    })
}

/// The interface already carries the address as a static link on the right subnet
pub fn is_bound(iface: &Interface, ip: &ValidatedStaticIp) -> bool {
    links_containing(iface, ip.address).any(|l| {
        let same_address = l
            .ip_address
            .as_deref()
            .and_then(|a| IpAddr::from_str(a).ok())
            == Some(ip.address);
        let same_subnet = !ip.explicit_cidr
            || l
                .subnet
                .as_ref()
                .and_then(|s| subnet_network(&s.cidr))
                == Some(ip.network);
        l.mode == LinkMode::Static && same_address && same_subnet
    })
}

/// Where the address should be bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindTarget<'a> {
    Interface(&'a Interface),
    /// Boot interface MAAS resolves server side
    BootInterface,
}

/// Pick the interface to bind: the named one, then the one whose subnet
/// contains the address, then the boot interface.
pub fn select_target<'a>(
    interfaces: &'a [Interface],
    boot_interface_id: Option<u64>,
    ip: &ValidatedStaticIp,
) -> Result<BindTarget<'a>, ProvisioningError> {
    if let Some(name) = &ip.interface {
        return interfaces
            .iter()
            .find(|i| &i.name == name)
            .map(BindTarget::Interface)
            .ok_or_else(|| {
                ProvisioningError::new(
                    ProvisioningErrorKind::NetworkConfiguration,
                    format!("interface {} not found for static IP {}", name, ip.address),
                )
            });
    }

    if let Some(iface) = interfaces
        .iter()
        .find(|i| links_containing(i, ip.address).next().is_some())
    {
        return Ok(BindTarget::Interface(iface));
    }

    match boot_interface_id.and_then(|id| interfaces.iter().find(|i| i.id == id)) {
        Some(iface) => Ok(BindTarget::Interface(iface)),
        None => Ok(BindTarget::BootInterface),
    }
}

/// Subnet specifier for `link_subnet`: a known subnet id, else the CIDR
fn subnet_specifier(interfaces: &[Interface], ip: &ValidatedStaticIp) -> String {
    interfaces
        .iter()
        .flat_map(|i| links_containing(i, ip.address))
        .find_map(|l| l.subnet.as_ref().map(|s| s.id.to_string()))
        .unwrap_or_else(|| format!("cidr:{}", ip.network))
}

impl Reconciler {
    /// Fail when another MaasMachine in the namespace declares the same address.
    /// A peer listing failure skips the check.
    pub(crate) async fn check_static_ip_conflict(
        &self,
        key: &MachineKey,
        address: IpAddr,
    ) -> Result<(), ControllerError> {
        let peers = match self.peers.list_static_ips(&key.namespace).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Could not list static IPs in {}, skipping conflict check: {}", key.namespace, e);
                return Ok(());
            }
        };
        for (name, declared) in peers {
            if name != key.name && IpAddr::from_str(declared.trim()).ok() == Some(address) {
                return Err(StaticIpError::Conflict {
                    address: address.to_string(),
                    owner: format!("{}/{}", key.namespace, name),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Validate the declaration and check it against peers
    pub(crate) async fn validate_static_ip(
        &self,
        key: &MachineKey,
        spec: &StaticIpSpec,
    ) -> Result<ValidatedStaticIp, ControllerError> {
        let validated = validate(spec)?;
        self.check_static_ip_conflict(key, validated.address).await?;
        Ok(validated)
    }

    /// Bind the declared static IP on the instance
    pub async fn apply_static_ip(
        &self,
        key: &MachineKey,
        system_id: &str,
        spec: &StaticIpSpec,
    ) -> Result<(), ControllerError> {
        let ip = self.validate_static_ip(key, spec).await?;

        let machine = self
            .maas
            .get_machine(system_id)
            .await
            .map_err(|e| ControllerError::backend(format!("get machine {}", system_id), e))?;
        let state = MachineState::parse(&machine.status_name);
        if state.is_commissioning() {
            return Err(ControllerError::still_provisioning(
                system_id,
                format!("static IP {} deferred until commissioning finishes", ip.address),
            ));
        }

        let interfaces = self
            .maas
            .list_interfaces(system_id)
            .await
            .map_err(|e| ControllerError::backend(format!("list interfaces of {}", system_id), e))?;

        if !state.allows_network_edits() {
            if interfaces.iter().any(|i| is_bound(i, &ip)) {
                debug!("Static IP {} already bound on {} ({})", ip.address, system_id, state);
                return Ok(());
            }
            return Err(ControllerError::still_provisioning(
                system_id,
                format!("static IP {} cannot be bound while machine is {}", ip.address, state),
            ));
        }

        let boot_id = machine.boot_interface.as_ref().map(|i| i.id);
        let target = select_target(&interfaces, boot_id, &ip).map_err(|e| e.with_host(system_id))?;
        if let BindTarget::Interface(iface) = target
            && is_bound(iface, &ip)
        {
            debug!("Static IP {} already bound on {} {}", ip.address, system_id, iface.name);
            return Ok(());
        }

        self.release_stale_address(system_id, &ip).await?;

        let subnet = subnet_specifier(&interfaces, &ip);
        let params = LinkSubnetParams {
            mode: LinkMode::Static,
            subnet,
            ip_address: Some(ip.address.to_string()),
            default_gateway: true,
        };

        let result = match target {
            BindTarget::Interface(iface) => {
                self.unlink_conflicting_links(system_id, iface, &ip).await?;
                info!(
                    "Binding static IP {} on {} {} (gateway {})",
                    ip.address, system_id, iface.name, ip.gateway
                );
                self.maas.link_subnet(system_id, iface.id, params).await
            }
            BindTarget::BootInterface => {
                info!(
                    "Binding static IP {} on boot interface of {} (gateway {})",
                    ip.address, system_id, ip.gateway
                );
                self.maas.set_boot_interface_static_ip(system_id, params).await
            }
        };

        result.map(|_| ()).map_err(|e| {
            ProvisioningError::new(
                ProvisioningErrorKind::NetworkConfiguration,
                format!("failed to bind static IP {}", ip.address),
            )
            .with_host(system_id)
            .with_source(e)
            .into()
        })
    }

    /// Release a registry entry for the address that no interface holds
    async fn release_stale_address(
        &self,
        system_id: &str,
        ip: &ValidatedStaticIp,
    ) -> Result<(), ControllerError> {
        let address = ip.address.to_string();
        let allocation = self
            .maas
            .get_ip_address(&address)
            .await
            .map_err(|e| ControllerError::backend(format!("look up IP {}", address), e))?;

        match allocation {
            Some(allocation) if allocation.interface_set.is_empty() => {
                info!("Releasing stale allocation of {} before binding on {}", address, system_id);
                match self.maas.release_ip_address(&address, true).await {
                    Ok(()) | Err(MaasError::NotFound(_)) => Ok(()),
                    Err(e) => Err(ControllerError::backend(format!("release IP {}", address), e)),
                }
            }
            Some(allocation) => {
                info!(
                    "IP {} is held by {} interface(s), leaving the allocation in place",
                    address,
                    allocation.interface_set.len()
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Remove links on the target subnet that do not carry the declared address
    async fn unlink_conflicting_links(
        &self,
        system_id: &str,
        iface: &Interface,
        ip: &ValidatedStaticIp,
    ) -> Result<(), ControllerError> {
        for link in links_containing(iface, ip.address) {
            let keeps_address = link.mode == LinkMode::Static
                && link.ip_address.as_deref().and_then(|a| IpAddr::from_str(a).ok())
                    == Some(ip.address);
            if keeps_address {
                continue;
            }
            debug!(
                "Unlinking {:?} link {} from {} {}",
                link.mode, link.id, system_id, iface.name
            );
            self.maas
                .unlink_subnet(system_id, iface.id, link.id)
                .await
                .map_err(|e| {
                    ControllerError::from(
                        ProvisioningError::new(
                            ProvisioningErrorKind::NetworkConfiguration,
                            format!("failed to unlink link {} on {}", link.id, iface.name),
                        )
                        .with_host(system_id)
                        .with_source(e),
                    )
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_prefix() {
        assert_eq!(mask_prefix(Ipv4Addr::new(255, 255, 255, 0)).unwrap(), 24);
        assert_eq!(mask_prefix(Ipv4Addr::new(255, 255, 255, 255)).unwrap(), 32);
        assert_eq!(mask_prefix(Ipv4Addr::new(0, 0, 0, 0)).unwrap(), 0);
        assert!(matches!(
            mask_prefix(Ipv4Addr::new(255, 0, 255, 0)),
            Err(StaticIpError::NonContiguousMask(_))
        ));
    }

    #[test]
    fn test_reserved_ranges() {
        for ip in ["0.1.2.3", "127.0.0.1", "169.254.1.1", "224.0.0.5", "240.0.0.1", "255.255.255.255"] {
            assert!(is_reserved(ip.parse().unwrap()), "{}", ip);
        }
        for ip in ["::", "::1", "fe80::1", "ff02::1"] {
            assert!(is_reserved(ip.parse().unwrap()), "{}", ip);
        }
        assert!(!is_reserved("10.0.0.5".parse().unwrap()));
        assert!(!is_reserved("2001:db8::5".parse().unwrap()));
    }

    #[test]
    fn test_subnet_forms_resolve_to_same_network() {
        let address: IpAddr = "10.0.0.5".parse().unwrap();
        let expected: IpNetwork = "10.0.0.0/24".parse().unwrap();
        assert_eq!(parse_subnet(address, "10.0.0.0/24").unwrap(), (expected, true));
        assert_eq!(parse_subnet(address, "10.0.0.7/24").unwrap(), (expected, true));
        assert_eq!(parse_subnet(address, "/24").unwrap(), (expected, false));
        assert_eq!(parse_subnet(address, "24").unwrap(), (expected, false));
        assert_eq!(parse_subnet(address, "255.255.255.0").unwrap(), (expected, false));
        assert!(parse_subnet(address, "/33").is_err());
        assert!(parse_subnet(address, "2001:db8::/64").is_err());
    }

    #[test]
    fn test_declared_cidr_selects_containing_interface() {
        use maas_client::mock::helpers::{interface, link, subnet};

        let interfaces = vec![
            interface(1, "eth0", vec![link(1, LinkMode::Auto, Some(subnet(1, "mgmt", "10.0.0.0/24")), None)]),
            interface(2, "eth1", vec![link(2, LinkMode::Auto, Some(subnet(2, "workload", " 10.20.0.0/24 ")), None)]),
        ];
        let ip = ValidatedStaticIp {
            address: "10.20.0.50".parse().unwrap(),
            gateway: "10.20.0.1".parse().unwrap(),
            network: "10.20.0.0/24".parse().unwrap(),
            explicit_cidr: true,
            dns_servers: Vec::new(),
            interface: None,
        };

        match select_target(&interfaces, Some(1), &ip).unwrap() {
            BindTarget::Interface(iface) => assert_eq!(iface.name, "eth1"),
            other => panic!("unexpected target: {:?}", other),
        }
    }
}
