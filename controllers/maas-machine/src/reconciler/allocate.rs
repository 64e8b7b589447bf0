//! Bare-metal provisioning.
//!
//! Allocate by constraints, record the checkpoint, then hostname, swap,
//! bridge and static IP before deploying. Each step checks the live machine
//! first, so a resumed pass repeats only what is missing.

use crate::error::{ControllerError, ProvisioningError, ProvisioningErrorKind};
use crate::persister::MachineKey;
use crate::reconciler::Reconciler;
use crate::reconciler::lifecycle::{MachineState, ObservedInstance};
use crds::{BridgeSpec, MaasMachineSpec};
use maas_client::{AllocateParams, BridgeParams, MaasError, Machine};
use tracing::{debug, error, info, warn};

impl Reconciler {
    pub(crate) async fn allocate_bare_metal(
        &self,
        key: &MachineKey,
        spec: &MaasMachineSpec,
    ) -> Result<ObservedInstance, ControllerError> {
        if let Some(static_ip) = &spec.static_ip {
            self.validate_static_ip(key, static_ip).await?;
        }

        let params = AllocateParams {
            system_id: None,
            cpu_count: Some(spec.min_cpu),
            mem: Some(spec.min_memory_mib),
            zone: spec.failure_domain.clone(),
            pool: spec.resource_pool.clone(),
            tags: spec.tags.clone(),
        };
        info!(
            "Allocating bare-metal machine for {} ({} cores, {} MiB, zone {}, pool {})",
            key,
            spec.min_cpu,
            spec.min_memory_mib,
            spec.failure_domain.as_deref().unwrap_or("<any>"),
            spec.resource_pool.as_deref().unwrap_or("<any>")
        );

        let machine = match self.maas.allocate(params).await {
            Ok(machine) => machine,
            Err(e @ MaasError::InsufficientResources(_)) => {
                return Err(ProvisioningError::new(
                    ProvisioningErrorKind::InsufficientResources,
                    format!(
                        "no machine with {} cores and {} MiB available",
                        spec.min_cpu, spec.min_memory_mib
                    ),
                )
                .with_detail("zone", spec.failure_domain.clone().unwrap_or_default())
                .with_detail("pool", spec.resource_pool.clone().unwrap_or_default())
                .with_source(e)
                .into());
            }
            Err(e) => return Err(self.handle_maas_failure(key, "allocate machine", None, e).await),
        };

        let zone = machine
            .zone
            .as_ref()
            .map(|z| z.name.clone())
            .or_else(|| spec.failure_domain.clone());
        if let Err(e) = self.record_checkpoint(key, &machine, zone.as_deref()).await {
            // Nothing else identifies this allocation as ours
            error!(
                "Failed to record machine {} for {}, releasing it: {}",
                machine.system_id, key, e
            );
            if let Err(release_err) = self.maas.release_machine(&machine.system_id, false).await {
                warn!("Release of unrecorded machine {} failed: {}", machine.system_id, release_err);
            }
            return Err(e);
        }
        self.metrics.record_allocation("bare-metal");

        self.continue_bare_metal(key, spec, machine).await
    }

    pub(crate) async fn continue_bare_metal(
        &self,
        key: &MachineKey,
        spec: &MaasMachineSpec,
        machine: Machine,
    ) -> Result<ObservedInstance, ControllerError> {
        let state = MachineState::parse(&machine.status_name);
        match &state {
            MachineState::Allocated => self.configure_and_deploy(key, spec, machine).await,
            MachineState::Ready => {
                info!("Machine {} of {} is Ready again, re-allocating it", machine.system_id, key);
                let params = AllocateParams {
                    system_id: Some(machine.system_id.clone()),
                    ..Default::default()
                };
                let machine = match self.maas.allocate(params).await {
                    Ok(machine) => machine,
                    Err(e) => {
                        let context = format!("allocate {}", machine.system_id);
                        return Err(self
                            .handle_maas_failure(key, context, Some(machine.system_id.as_str()), e)
                            .await);
                    }
                };
                self.configure_and_deploy(key, spec, machine).await
            }
            MachineState::Deploying => {
                debug!("Machine {} of {} is deploying", machine.system_id, key);
                Ok(ObservedInstance::from(&machine))
            }
            MachineState::Deployed => {
                let machine = self.ensure_powered_on(machine).await?;
                Ok(ObservedInstance::from(&machine))
            }
            MachineState::Broken => Err(self.recover_broken(key, &machine.system_id, None).await),
            s if s.is_failed() => Err(self
                .release_failed_instance(key, &machine, ProvisioningErrorKind::VmDeploymentFailed)
                .await),
            other => Err(ControllerError::still_provisioning(
                &machine.system_id,
                format!("machine is {}", other),
            )),
        }
    }

    /// Hostname, swap, bridge and static IP, then deploy
    async fn configure_and_deploy(
        &self,
        key: &MachineKey,
        spec: &MaasMachineSpec,
        machine: Machine,
    ) -> Result<ObservedInstance, ControllerError> {
        let system_id = machine.system_id.clone();

        let hostname = spec.hostname.clone().unwrap_or_else(|| key.name.clone());
        if machine.hostname != hostname {
            match self.maas.set_hostname(&system_id, &hostname).await {
                Ok(_) => info!("Set hostname of {} to {}", system_id, hostname),
                Err(e @ MaasError::HostnameInUse(_)) => {
                    return Err(ControllerError::Configuration(format!(
                        "hostname {} is used by another MAAS node: {}",
                        hostname, e
                    )));
                }
                Err(e) => {
                    let context = format!("set hostname of {}", system_id);
                    return Err(self
                        .handle_maas_failure(key, context, Some(system_id.as_str()), e)
                        .await);
                }
            }
        }

        if machine.swap_size != Some(0) {
            self.maas
                .set_swap_size(&system_id, 0)
                .await
                .map_err(|e| ControllerError::backend(format!("disable swap on {}", system_id), e))?;
            info!("Disabled swap on {}", system_id);
        }

        if let Some(bridge) = &spec.bridge {
            self.ensure_bridge(&system_id, bridge).await?;
        }

        if let Some(static_ip) = &spec.static_ip {
            self.apply_static_ip(key, &system_id, static_ip).await?;
        }

        let deployed = self.deploy(key, spec, &system_id).await?;
        Ok(ObservedInstance::from(&deployed))
    }

    async fn ensure_bridge(&self, system_id: &str, bridge: &BridgeSpec) -> Result<(), ControllerError> {
        let interfaces = self
            .maas
            .list_interfaces(system_id)
            .await
            .map_err(|e| ControllerError::backend(format!("list interfaces of {}", system_id), e))?;
        if interfaces.iter().any(|i| i.name == bridge.name) {
            debug!("Bridge {} already present on {}", bridge.name, system_id);
            return Ok(());
        }

        let params = BridgeParams {
            name: bridge.name.clone(),
            stp: bridge.stp,
            forward_delay: bridge.forward_delay,
        };
        self.maas
            .create_bridge_on_boot_interface(system_id, params)
            .await
            .map_err(|e| {
                ProvisioningError::new(
                    ProvisioningErrorKind::NetworkConfiguration,
                    format!("failed to create bridge {}", bridge.name),
                )
                .with_host(system_id)
                .with_source(e)
            })?;
        info!("Created bridge {} on boot interface of {}", bridge.name, system_id);
        Ok(())
    }
}
