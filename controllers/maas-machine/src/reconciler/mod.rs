//! Provisioning engine for MaasMachine resources.
//!
//! This module is organized by provisioning path:
//! - `allocate`: bare-metal allocation, swap, hostname, bridge and deploy
//! - `compose`: VM placement, composition, adoption by hostname and network verification
//! - `static_ip`: static address validation and binding
//! - `placement`: VM host selection
//! - `lifecycle`: MAAS lifecycle states and derived status
//!
//! Every pass starts from the persisted checkpoint. With no checkpoint the
//! engine allocates or composes a new instance and records its system_id
//! before any further mutating call; with a checkpoint it reads the live
//! instance and continues from whatever state MAAS reports.

pub mod allocate;
pub mod compose;
pub mod lifecycle;
pub mod placement;
pub mod static_ip;

#[cfg(test)]
mod compose_test;
#[cfg(test)]
mod placement_test;

use crate::backoff::RetryState;
use crate::error::{
    ControllerError, ProvisioningError, ProvisioningErrorKind, RELEASED_DETAIL,
    STILL_PROVISIONING_REQUEUE, TERMINAL_REQUEUE, is_retryable,
};
use crate::metrics::Metrics;
use crate::persister::{
    Checkpoint, MachineKey, PeerDirectory, PersistedState, StatePersister, provider_id,
};
use crds::{MaasMachine, MaasMachineSpec, ProvisioningMode};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use lifecycle::{ObservedInstance, PowerState, error_status, observed_status};
use maas_client::{DeployParams, MaasClientTrait, MaasError, Machine};
use placement::PlacementPolicy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Annotation recording the VM host a machine was composed on
pub const VM_HOST_ANNOTATION: &str = "dcops.microscaler.io/vm-host";

/// Requeue delay once the instance is deployed and ready
const READY_REQUEUE: Duration = Duration::from_secs(300);

/// Engine settings taken from the controller configuration
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub placement: PlacementPolicy,
    /// Distro series deployed when the MaasMachine names no image
    pub default_distro_series: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            placement: PlacementPolicy::default(),
            default_distro_series: "jammy".to_string(),
        }
    }
}

/// Reconciles MaasMachine resources against MAAS.
pub struct Reconciler {
    pub(crate) maas: Box<dyn MaasClientTrait>,
    pub(crate) persister: Arc<dyn StatePersister>,
    pub(crate) peers: Arc<dyn PeerDirectory>,
    pub(crate) options: EngineOptions,
    pub(crate) metrics: Arc<Metrics>,
    /// Consecutive failure tracking per resource (namespace/name -> RetryState)
    retry_states: Arc<Mutex<HashMap<String, RetryState>>>,
}

impl Reconciler {
    pub fn new(
        maas: impl MaasClientTrait + 'static,
        persister: Arc<dyn StatePersister>,
        peers: Arc<dyn PeerDirectory>,
        options: EngineOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            maas: Box::new(maas),
            persister,
            peers,
            options,
            metrics,
            retry_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Drive the declared machine one step closer to a deployed instance.
    ///
    /// Safe to call any number of times: at most one instance is ever
    /// allocated or composed per checkpoint.
    pub async fn provision(
        &self,
        key: &MachineKey,
        spec: &MaasMachineSpec,
    ) -> Result<ObservedInstance, ControllerError> {
        let state = self.persister.load(key).await?;
        self.provision_from(key, spec, &state).await
    }

    async fn provision_from(
        &self,
        key: &MachineKey,
        spec: &MaasMachineSpec,
        state: &PersistedState,
    ) -> Result<ObservedInstance, ControllerError> {
        if let Some(checkpoint) = &state.checkpoint {
            return self.resume(key, spec, checkpoint).await;
        }
        match spec.provisioning_mode {
            ProvisioningMode::BareMetal => self.allocate_bare_metal(key, spec).await,
            ProvisioningMode::Virtualized => self.compose_virtualized(key, spec).await,
        }
    }

    async fn resume(
        &self,
        key: &MachineKey,
        spec: &MaasMachineSpec,
        checkpoint: &Checkpoint,
    ) -> Result<ObservedInstance, ControllerError> {
        debug!("Resuming {} from recorded instance {}", key, checkpoint.instance_id);
        let machine = match self.maas.get_machine(&checkpoint.instance_id).await {
            Ok(machine) => machine,
            Err(MaasError::NotFound(_)) => {
                warn!(
                    "Recorded instance {} of {} no longer exists in MAAS, clearing checkpoint",
                    checkpoint.instance_id, key
                );
                self.persister.clear_instance(key).await?;
                return Err(ControllerError::InstanceGone(checkpoint.instance_id.clone()));
            }
            Err(e) => {
                return Err(ControllerError::backend(
                    format!("get machine {}", checkpoint.instance_id),
                    e,
                ));
            }
        };

        match spec.provisioning_mode {
            ProvisioningMode::BareMetal => self.continue_bare_metal(key, spec, machine).await,
            ProvisioningMode::Virtualized => self.continue_virtualized(key, spec, machine).await,
        }
    }

    /// Release an instance and clear the checkpoint.
    ///
    /// Graceful release is tried first and escalated to a forced release when
    /// MAAS refuses it. An instance MAAS no longer knows counts as released.
    pub async fn release(&self, key: &MachineKey, system_id: &str) -> Result<(), ControllerError> {
        info!("Releasing instance {} of {}", system_id, key);
        match self.maas.release_machine(system_id, false).await {
            Ok(()) => {}
            Err(MaasError::NotFound(_)) => debug!("Instance {} already gone from MAAS", system_id),
            Err(e @ (MaasError::InvalidState(_) | MaasError::BrokenMachine { .. })) => {
                warn!("Graceful release of {} refused ({}), forcing", system_id, e);
                self.force_release(system_id).await?;
            }
            Err(e) => return Err(ControllerError::backend(format!("release {}", system_id), e)),
        }
        self.persister.clear_instance(key).await
    }

    async fn force_release(&self, system_id: &str) -> Result<(), ControllerError> {
        match self.maas.release_machine(system_id, true).await {
            Ok(()) => {
                self.metrics.forced_releases.inc();
                info!("Force released instance {}", system_id);
                Ok(())
            }
            Err(MaasError::NotFound(_)) => Ok(()),
            Err(e) => Err(ControllerError::backend(format!("force release {}", system_id), e)),
        }
    }

    /// Force release a broken instance so the next pass starts fresh.
    ///
    /// Always yields an error to return from the pass: the broken-instance
    /// signal on success, or whatever stopped the recovery.
    pub(crate) async fn recover_broken(
        &self,
        key: &MachineKey,
        system_id: &str,
        host_id: Option<&str>,
    ) -> ControllerError {
        warn!("Instance {} of {} is broken, force releasing", system_id, key);
        if let Err(e) = self.force_release(system_id).await {
            return e;
        }

        match self.persister.load(key).await {
            Ok(state)
                if state
                    .checkpoint
                    .as_ref()
                    .is_some_and(|c| c.instance_id == system_id) =>
            {
                if let Err(e) = self.persister.clear_instance(key).await {
                    return e;
                }
            }
            Ok(_) => {}
            Err(e) => return e,
        }

        if let Some(host_id) = host_id {
            self.log_host_diagnostics(host_id).await;
        }

        ControllerError::BrokenInstanceEncountered {
            system_id: system_id.to_string(),
        }
    }

    async fn log_host_diagnostics(&self, host_id: &str) {
        let Ok(id) = host_id.parse::<u64>() else {
            debug!("VM host reference {} is not numeric, skipping diagnostics", host_id);
            return;
        };
        match self.maas.get_vm_host(id).await {
            Ok(host) => warn!(
                "VM host {} ({}, {}) involved in broken instance: {} cores, {} MiB available",
                host.id, host.name, host.host_type, host.available.cores, host.available.memory
            ),
            Err(e) => warn!("Could not read VM host {} for diagnostics: {}", host_id, e),
        }
    }

    /// Broken machines trigger recovery; anything else is wrapped with its step.
    ///
    /// The machine to recover is the one MAAS named, when MAAS knows it, and
    /// otherwise `target`, the machine the failed operation addressed.
    pub(crate) async fn handle_maas_failure(
        &self,
        key: &MachineKey,
        context: impl Into<String>,
        target: Option<&str>,
        err: MaasError,
    ) -> ControllerError {
        let (system_id, host_id, message) = match err {
            MaasError::BrokenMachine {
                system_id,
                host_id,
                message,
            } => (system_id, host_id, message),
            other => return ControllerError::backend(context, other),
        };

        let named = match system_id.as_deref() {
            Some(id) => match self.maas.get_machine(id).await {
                Ok(_) => Some(id),
                Err(e) => {
                    debug!("Broken machine {} named by MAAS is not readable: {}", id, e);
                    None
                }
            },
            None => None,
        };
        if let Some(id) = named.or(target) {
            return self.recover_broken(key, id, host_id.as_deref()).await;
        }
        warn!("MAAS reported a broken machine for {} without naming one", key);
        ControllerError::backend(
            context,
            MaasError::BrokenMachine {
                system_id,
                host_id,
                message,
            },
        )
    }

    pub(crate) async fn record_checkpoint(
        &self,
        key: &MachineKey,
        machine: &Machine,
        zone: Option<&str>,
    ) -> Result<(), ControllerError> {
        let checkpoint = Checkpoint::new(&machine.system_id, zone, Some(&machine.hostname));
        self.persister.record_instance(key, &checkpoint).await?;
        info!(
            "Recorded instance {} for {} ({})",
            machine.system_id, key, checkpoint.provider_id
        );
        Ok(())
    }

    /// Deploy an allocated instance. A rejected deploy is retried on the same instance.
    pub(crate) async fn deploy(
        &self,
        key: &MachineKey,
        spec: &MaasMachineSpec,
        system_id: &str,
    ) -> Result<Machine, ControllerError> {
        let distro_series = spec
            .image
            .clone()
            .unwrap_or_else(|| self.options.default_distro_series.clone());
        let params = DeployParams {
            distro_series: Some(distro_series.clone()),
            user_data: spec.user_data.clone(),
        };

        match self.maas.deploy(system_id, params).await {
            Ok(machine) => {
                info!("Deploying {} on instance {} ({})", key, system_id, distro_series);
                Ok(machine)
            }
            Err(e @ MaasError::BrokenMachine { .. }) => {
                Err(self
                .handle_maas_failure(key, format!("deploy {}", system_id), Some(system_id), e)
                .await)
            }
            Err(e) => {
                error!("Deploy of instance {} for {} failed: {}", system_id, key, e);
                Err(ProvisioningError::new(
                    ProvisioningErrorKind::VmDeploymentFailed,
                    format!("deploy of instance {} was rejected", system_id),
                )
                .with_host(system_id)
                .with_source(e)
                .into())
            }
        }
    }

    pub(crate) async fn ensure_powered_on(&self, machine: Machine) -> Result<Machine, ControllerError> {
        if PowerState::parse(&machine.power_state) == PowerState::On {
            debug!("Instance {} already powered on", machine.system_id);
            return Ok(machine);
        }
        info!(
            "Instance {} is deployed but powered {}, powering on",
            machine.system_id, machine.power_state
        );
        self.maas
            .power_on(&machine.system_id)
            .await
            .map_err(|e| ControllerError::backend(format!("power on {}", machine.system_id), e))
    }

    /// Release an instance that ended in a failed state and report why
    pub(crate) async fn release_failed_instance(
        &self,
        key: &MachineKey,
        machine: &Machine,
        kind: ProvisioningErrorKind,
    ) -> ControllerError {
        warn!(
            "Instance {} of {} is in {}, releasing it so the next pass starts fresh",
            machine.system_id, key, machine.status_name
        );
        if let Err(e) = self.release(key, &machine.system_id).await {
            return e;
        }
        ProvisioningError::new(
            kind,
            format!(
                "instance {} ended in {} and was released",
                machine.system_id, machine.status_name
            ),
        )
        .with_host(&machine.system_id)
        .with_detail(RELEASED_DETAIL, &machine.system_id)
        .into()
    }

    /// One reconciliation pass for a MaasMachine: provision, then publish status
    pub async fn reconcile_maas_machine(&self, obj: &MaasMachine) -> Result<Action, ControllerError> {
        let key = machine_key(obj);
        let timer = self.metrics.reconcile_duration.start_timer();

        let state = match self.persister.load(&key).await {
            Ok(state) => state,
            Err(e) => {
                timer.observe_duration();
                self.metrics.record_reconcile(outcome(&e));
                return Err(e);
            }
        };
        let result = self.provision_from(&key, &obj.spec, &state).await;
        timer.observe_duration();

        match result {
            Ok(instance) => {
                let provider = provider_id(instance.zone.as_deref(), &instance.system_id);
                let status = observed_status(state.status.as_ref(), &instance, &provider);
                if state.status.as_ref() != Some(&status) {
                    self.persister.publish_status(&key, &status).await?;
                }
                self.reset_retry(&key);
                self.metrics.record_reconcile("success");

                if status.ready && status.running {
                    debug!("{} is ready on {}", key, instance.system_id);
                    Ok(Action::requeue(READY_REQUEUE))
                } else {
                    debug!("{} is {} on {}", key, instance.state, instance.system_id);
                    Ok(Action::requeue(STILL_PROVISIONING_REQUEUE))
                }
            }
            Err(e) => {
                self.metrics.record_reconcile(outcome(&e));
                let status = error_status(state.status.as_ref(), &e);
                if state.status.as_ref() == Some(&status) {
                    debug!("Status of {} unchanged by failed pass", key);
                } else if let Err(publish_err) = self.persister.publish_status(&key, &status).await
                {
                    warn!("Failed to publish error status of {}: {}", key, publish_err);
                }
                Err(e)
            }
        }
    }

    /// Finalizer cleanup: release the recorded instance, if any
    pub async fn cleanup_maas_machine(&self, obj: &MaasMachine) -> Result<Action, ControllerError> {
        let key = machine_key(obj);
        let state = self.persister.load(&key).await?;
        match &state.checkpoint {
            Some(checkpoint) => self.release(&key, &checkpoint.instance_id).await?,
            None => debug!("{} has no recorded instance, nothing to release", key),
        }
        self.forget_retry(&key);
        info!("Cleaned up {}", key);
        Ok(Action::await_change())
    }

    /// Requeue decision for a failed pass
    pub fn error_action(&self, key: &MachineKey, err: &ControllerError) -> Action {
        match err {
            ControllerError::StillProvisioning { reason, .. } => {
                debug!("{} still provisioning: {}", key, reason);
                Action::requeue(STILL_PROVISIONING_REQUEUE)
            }
            e if e.is_retryable() => {
                let mut states = self
                    .retry_states
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let state = states.entry(key.to_string()).or_default();
                let delay = state.record_failure();
                warn!(
                    "Retryable error for {} (attempt {}), retrying in {}s: {}",
                    key,
                    state.error_count(),
                    delay.as_secs(),
                    e
                );
                Action::requeue(delay)
            }
            e => {
                error!("Terminal error for {}: {}", key, e);
                Action::requeue(TERMINAL_REQUEUE)
            }
        }
    }

    fn reset_retry(&self, key: &MachineKey) {
        let mut states = self
            .retry_states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(state) = states.get_mut(&key.to_string()) {
            state.reset();
        }
    }

    fn forget_retry(&self, key: &MachineKey) {
        self.retry_states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&key.to_string());
    }
}

/// Namespaced key of a MaasMachine object
pub fn machine_key(obj: &MaasMachine) -> MachineKey {
    MachineKey::new(
        obj.namespace().unwrap_or_else(|| "default".to_string()),
        obj.name_any(),
    )
}

/// Metric label for the result of a failed pass
fn outcome(err: &ControllerError) -> &'static str {
    match err {
        ControllerError::StillProvisioning { .. } => "requeue",
        e if is_retryable(e) => "retryable",
        _ => "terminal",
    }
}
