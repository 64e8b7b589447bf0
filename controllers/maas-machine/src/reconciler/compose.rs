//! Virtualized provisioning.
//!
//! Composition is not idempotent in MAAS. A compose that collides on the
//! hostname means an earlier pass already created the VM, so the existing VM
//! is looked up by hostname and adopted instead of failing.

use crate::error::{ControllerError, ProvisioningError, ProvisioningErrorKind};
use crate::persister::{Checkpoint, MachineKey};
use crate::reconciler::lifecycle::{MachineState, ObservedInstance};
use crate::reconciler::placement::{PlacementResolver, RelaxationOrder};
use crate::reconciler::static_ip::ValidatedStaticIp;
use crate::reconciler::{Reconciler, VM_HOST_ANNOTATION};
use crds::{MaasMachineSpec, VirtualizedSpec};
use ipnetwork::IpNetwork;
use maas_client::{
    AllocateParams, ComposeParams, LinkMode, LinkSubnetParams, MaasError, Machine, Subnet,
    VmHost, VmHostResource,
};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Subnet specifier for a declared network: `cidr:` for CIDRs, the name otherwise
fn network_specifier(network: &str) -> String {
    let network = network.trim();
    match IpNetwork::from_str(network) {
        Ok(_) => format!("cidr:{}", network),
        Err(_) => network.to_string(),
    }
}

/// `eth0:subnet=<mgmt>;eth1:subnet=<workload>[,ip=<address>]`, only for two networks
pub fn interface_constraints(
    networks: &[String],
    static_ip: Option<&ValidatedStaticIp>,
) -> Option<String> {
    let [management, workload] = networks else {
        return None;
    };
    let inline_on = static_ip.map(|ip| (ip.interface.as_deref().unwrap_or("eth1"), ip.address));

    let entries: Vec<String> = [management, workload]
        .iter()
        .enumerate()
        .map(|(index, network)| {
            let name = format!("eth{}", index);
            let mut entry = format!("{}:subnet={}", name, network_specifier(network));
            if let Some((target, address)) = inline_on
                && target == name
            {
                entry.push_str(&format!(",ip={}", address));
            }
            entry
        })
        .collect();
    Some(entries.join(";"))
}

/// Same name, or same short name before the first dot of hostname or FQDN
pub fn hostname_matches(machine: &Machine, hostname: &str) -> bool {
    let short = |s: &str| s.split('.').next().unwrap_or_default().to_string();
    machine.hostname == hostname
        || short(&machine.hostname) == hostname
        || (!machine.fqdn.is_empty() && short(&machine.fqdn) == hostname)
}

/// The subnet is the declared network, by name, CIDR or VLAN name
pub fn subnet_matches(subnet: &Subnet, network: &str) -> bool {
    let network = network.trim();
    if subnet.name == network || subnet.cidr == network {
        return true;
    }
    if let (Ok(a), Ok(b)) = (IpNetwork::from_str(subnet.cidr.trim()), IpNetwork::from_str(network))
        && a.network() == b.network()
        && a.prefix() == b.prefix()
    {
        return true;
    }
    subnet.vlan.as_ref().is_some_and(|v| !v.name.is_empty() && v.name == network)
}

fn compose_failure(host: &VmHost, err: MaasError) -> ControllerError {
    let kind = match &err {
        MaasError::InsufficientResources(_) => ProvisioningErrorKind::InsufficientResources,
        MaasError::VmHostResource { resource, .. } => match resource {
            VmHostResource::Profile => ProvisioningErrorKind::ProfileNotFound,
            VmHostResource::Project => ProvisioningErrorKind::ProjectNotFound,
            VmHostResource::Storage => ProvisioningErrorKind::StorageConfiguration,
        },
        _ => ProvisioningErrorKind::VmCreationFailed,
    };
    ProvisioningError::new(kind, format!("compose on VM host {} failed", host.name))
        .with_host(&host.name)
        .with_detail("vm_host_id", host.id.to_string())
        .with_source(err)
        .into()
}

impl Reconciler {
    pub(crate) async fn compose_virtualized(
        &self,
        key: &MachineKey,
        spec: &MaasMachineSpec,
    ) -> Result<ObservedInstance, ControllerError> {
        let virt = spec.virtualized.clone().unwrap_or_default();
        let static_ip = match &spec.static_ip {
            Some(declared) => Some(self.validate_static_ip(key, declared).await?),
            None => None,
        };

        let hosts = self
            .maas
            .list_vm_hosts()
            .await
            .map_err(|e| ControllerError::backend("list VM hosts", e))?;
        let host = self.place(spec, &virt, &hosts).await?;
        let Some(pool) = host.pool.clone() else {
            return Err(ControllerError::Configuration(format!(
                "failed to select host: no resource pool (VM host {})",
                host.name
            )));
        };
        self.persister
            .set_annotation(key, VM_HOST_ANNOTATION, &host.id.to_string())
            .await?;

        let hostname = spec.hostname.clone().unwrap_or_else(|| key.name.clone());
        let params = ComposeParams {
            cores: spec.min_cpu,
            memory: spec.min_memory_mib,
            storage: virt.storage_gib.map(|gib| format!("root:{}", gib)),
            hostname: hostname.clone(),
            zone: host.zone.as_ref().map(|z| z.id),
            pool: Some(pool.id),
            interfaces: interface_constraints(&virt.networks, static_ip.as_ref()),
        };
        info!(
            "Composing VM {} for {} on VM host {} ({} cores, {} MiB)",
            hostname, key, host.name, spec.min_cpu, spec.min_memory_mib
        );

        let (system_id, composed) = match self.maas.compose_vm(host.id, params).await {
            Ok(vm) => (vm.system_id, true),
            Err(e @ MaasError::HostnameInUse(_)) => match self.find_by_hostname(&hostname, &host).await? {
                Some(existing) => {
                    info!(
                        "Hostname {} already in use by {}, adopting it for {}",
                        hostname, existing.system_id, key
                    );
                    (existing.system_id, false)
                }
                None => return Err(ControllerError::backend(format!("compose VM {}", hostname), e)),
            },
            Err(MaasError::NetworkMismatch(message)) => {
                return Err(ControllerError::Configuration(format!(
                    "VM host {} (zone {}, pool {}) cannot attach networks [{}]: {}",
                    host.name,
                    host.zone.as_ref().map(|z| z.name.as_str()).unwrap_or("<none>"),
                    pool.name,
                    virt.networks.join(", "),
                    message
                )));
            }
            Err(e @ MaasError::BrokenMachine { .. }) => {
                return Err(self
                    .handle_maas_failure(key, format!("compose VM {}", hostname), None, e)
                    .await);
            }
            Err(e) => return Err(compose_failure(&host, e)),
        };

        let zone = host.zone.as_ref().map(|z| z.name.as_str());
        let checkpoint = Checkpoint::new(&system_id, zone, Some(&hostname));
        self.persister.record_instance(key, &checkpoint).await?;
        info!("Recorded VM {} for {} ({})", system_id, key, checkpoint.provider_id);
        if composed {
            self.metrics.record_allocation("virtualized");
        }

        let mut machine = self
            .maas
            .get_machine(&system_id)
            .await
            .map_err(|e| ControllerError::backend(format!("get machine {}", system_id), e))?;
        self.ensure_tags(&mut machine, &spec.tags).await?;

        self.continue_virtualized(key, spec, machine).await
    }

    async fn place(
        &self,
        spec: &MaasMachineSpec,
        virt: &VirtualizedSpec,
        hosts: &[VmHost],
    ) -> Result<VmHost, ControllerError> {
        let resolver = PlacementResolver::new(&*self.maas, &self.options.placement);
        let host = match &virt.vm_host {
            Some(pinned) => {
                let candidates: Vec<VmHost> =
                    hosts.iter().filter(|h| &h.name == pinned).cloned().collect();
                if candidates.is_empty() {
                    return Err(ProvisioningError::new(
                        ProvisioningErrorKind::HostUnavailable,
                        format!("pinned VM host {} not found", pinned),
                    )
                    .with_host(pinned)
                    .into());
                }
                resolver
                    .select_with(RelaxationOrder::Strict, &candidates, None, None)
                    .await?
            }
            None => {
                resolver
                    .select(
                        hosts,
                        spec.failure_domain.as_deref(),
                        spec.resource_pool.as_deref(),
                    )
                    .await?
            }
        };
        Ok(host)
    }

    /// Existing instance with this hostname: the global list first, then the host's VMs
    pub(crate) async fn find_by_hostname(
        &self,
        hostname: &str,
        host: &VmHost,
    ) -> Result<Option<Machine>, ControllerError> {
        let global = self
            .maas
            .list_machines(&[("hostname", hostname)])
            .await
            .map_err(|e| ControllerError::backend(format!("list machines named {}", hostname), e))?;
        if let Some(machine) = global.into_iter().find(|m| hostname_matches(m, hostname)) {
            return Ok(Some(machine));
        }

        debug!("Hostname {} not in global machine list, checking VM host {}", hostname, host.name);
        let local = self
            .maas
            .list_host_vms(host.id)
            .await
            .map_err(|e| ControllerError::backend(format!("list VMs on host {}", host.name), e))?;
        Ok(local.into_iter().find(|m| hostname_matches(m, hostname)))
    }

    /// Create and assign missing tags; `machine.tag_names` is kept current
    async fn ensure_tags(&self, machine: &mut Machine, tags: &[String]) -> Result<(), ControllerError> {
        for tag in tags {
            if machine.tag_names.contains(tag) {
                continue;
            }
            self.maas
                .create_tag(tag)
                .await
                .map_err(|e| ControllerError::backend(format!("create tag {}", tag), e))?;
            self.maas
                .assign_tag(tag, &machine.system_id)
                .await
                .map_err(|e| {
                    ControllerError::backend(format!("tag {} with {}", machine.system_id, tag), e)
                })?;
            info!("Tagged {} with {}", machine.system_id, tag);
            machine.tag_names.push(tag.clone());
        }
        Ok(())
    }

    pub(crate) async fn continue_virtualized(
        &self,
        key: &MachineKey,
        spec: &MaasMachineSpec,
        mut machine: Machine,
    ) -> Result<ObservedInstance, ControllerError> {
        let state = MachineState::parse(&machine.status_name);
        let system_id = machine.system_id.clone();
        match &state {
            s if s.is_commissioning() => Err(ControllerError::still_provisioning(
                system_id,
                "VM composed, commissioning not finished",
            )),
            MachineState::New => Err(ControllerError::still_provisioning(
                system_id,
                "VM composed, commissioning not started",
            )),
            MachineState::Ready | MachineState::Allocated => {
                let networks = spec
                    .virtualized
                    .as_ref()
                    .map(|v| v.networks.as_slice())
                    .unwrap_or_default();
                self.ensure_tags(&mut machine, &spec.tags).await?;
                self.verify_network(&system_id, networks).await?;
                if let Some(static_ip) = &spec.static_ip {
                    self.apply_static_ip(key, &system_id, static_ip).await?;
                }
                if state == MachineState::Ready {
                    let params = AllocateParams {
                        system_id: Some(system_id.clone()),
                        ..Default::default()
                    };
                    if let Err(e) = self.maas.allocate(params).await {
                        let context = format!("allocate {}", system_id);
                        return Err(self
                            .handle_maas_failure(key, context, Some(system_id.as_str()), e)
                            .await);
                    }
                    info!("Allocated composed VM {} for {}", system_id, key);
                }
                let deployed = self.deploy(key, spec, &system_id).await?;
                Ok(ObservedInstance::from(&deployed))
            }
            MachineState::Deploying => {
                debug!("VM {} of {} is deploying", system_id, key);
                Ok(ObservedInstance::from(&machine))
            }
            MachineState::Deployed => {
                let machine = self.ensure_powered_on(machine).await?;
                Ok(ObservedInstance::from(&machine))
            }
            MachineState::Broken => {
                let host_id = machine.pod.as_ref().map(|p| p.id.to_string());
                Err(self.recover_broken(key, &system_id, host_id.as_deref()).await)
            }
            MachineState::FailedDeployment => Err(self
                .release_failed_instance(key, &machine, ProvisioningErrorKind::VmDeploymentFailed)
                .await),
            s if s.is_failed() => Err(self
                .release_failed_instance(key, &machine, ProvisioningErrorKind::VmCreationFailed)
                .await),
            other => Err(ControllerError::still_provisioning(
                system_id,
                format!("VM is {}", other),
            )),
        }
    }

    /// Check that eth0/eth1 sit on the declared management and workload
    /// networks and relink them with automatic addressing when they do not.
    pub async fn verify_network(
        &self,
        system_id: &str,
        networks: &[String],
    ) -> Result<(), ControllerError> {
        if networks.len() != 2 {
            return Ok(());
        }

        let machine = self
            .maas
            .get_machine(system_id)
            .await
            .map_err(|e| ControllerError::backend(format!("get machine {}", system_id), e))?;
        let state = MachineState::parse(&machine.status_name);
        if !state.allows_network_edits() {
            return Err(ControllerError::still_provisioning(
                system_id,
                format!("network verification deferred while VM is {}", state),
            ));
        }

        let interfaces = self
            .maas
            .list_interfaces(system_id)
            .await
            .map_err(|e| ControllerError::backend(format!("list interfaces of {}", system_id), e))?;

        for (index, wanted) in networks.iter().enumerate() {
            let name = format!("eth{}", index);
            let Some(listed) = interfaces.iter().find(|i| i.name == name) else {
                return Err(ProvisioningError::new(
                    ProvisioningErrorKind::NetworkConfiguration,
                    format!("interface {} for network {} not found", name, wanted),
                )
                .with_host(system_id)
                .into());
            };

            let mut iface = listed.clone();
            if iface.links.iter().all(|l| l.subnet.is_none()) {
                debug!("No subnet data on {} {} yet, fetching it again", system_id, name);
                iface = self
                    .maas
                    .get_interface(system_id, iface.id)
                    .await
                    .map_err(|e| {
                        ControllerError::backend(format!("get interface {} of {}", name, system_id), e)
                    })?;
            }

            if iface
                .links
                .iter()
                .any(|l| l.subnet.as_ref().is_some_and(|s| subnet_matches(s, wanted)))
            {
                debug!("{} {} is on {}", system_id, name, wanted);
                continue;
            }

            warn!("{} {} is not on network {}, relinking", system_id, name, wanted);
            for link in &iface.links {
                self.maas
                    .unlink_subnet(system_id, iface.id, link.id)
                    .await
                    .map_err(|e| network_error(system_id, &name, wanted, e))?;
            }
            let params = LinkSubnetParams {
                mode: LinkMode::Auto,
                subnet: network_specifier(wanted),
                ip_address: None,
                default_gateway: false,
            };
            self.maas
                .link_subnet(system_id, iface.id, params)
                .await
                .map_err(|e| network_error(system_id, &name, wanted, e))?;
            info!("Relinked {} {} to {}", system_id, name, wanted);
        }
        Ok(())
    }
}

fn network_error(system_id: &str, interface: &str, network: &str, err: MaasError) -> ControllerError {
    ProvisioningError::new(
        ProvisioningErrorKind::NetworkConfiguration,
        format!("failed to relink {} to network {}", interface, network),
    )
    .with_host(system_id)
    .with_source(err)
    .into()
}
