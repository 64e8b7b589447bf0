//! Machine lifecycle tracking.
//!
//! Maps MAAS lifecycle strings into [`MachineState`] and derives the observed
//! status fields (`running`, `operational`, `knownState`, `ready`, `phase`).

use crate::error::ControllerError;
use crds::{MaasMachineStatus, MachineCondition, MachinePhase};
use maas_client::Machine;

/// MAAS node lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    New,
    Commissioning,
    FailedCommissioning,
    Testing,
    FailedTesting,
    Ready,
    Allocated,
    Deploying,
    Deployed,
    FailedDeployment,
    Releasing,
    FailedReleasing,
    DiskErasing,
    FailedDiskErasing,
    Broken,
    Missing,
    Retired,
    RescueMode,
    EnteringRescueMode,
    ExitingRescueMode,
    FailedEnteringRescueMode,
    FailedExitingRescueMode,
    /// A state this controller has never seen
    Unknown(String),
}

impl MachineState {
    pub fn parse(status_name: &str) -> Self {
        match status_name.trim().to_ascii_lowercase().as_str() {
            "new" => MachineState::New,
            "commissioning" => MachineState::Commissioning,
            "failed commissioning" => MachineState::FailedCommissioning,
            "testing" => MachineState::Testing,
            "failed testing" => MachineState::FailedTesting,
            "ready" => MachineState::Ready,
            "allocated" => MachineState::Allocated,
            "deploying" => MachineState::Deploying,
            "deployed" => MachineState::Deployed,
            "failed deployment" => MachineState::FailedDeployment,
            "releasing" => MachineState::Releasing,
            "failed releasing" => MachineState::FailedReleasing,
            "disk erasing" => MachineState::DiskErasing,
            "failed disk erasing" => MachineState::FailedDiskErasing,
            "broken" => MachineState::Broken,
            "missing" => MachineState::Missing,
            "retired" => MachineState::Retired,
            "rescue mode" => MachineState::RescueMode,
            "entering rescue mode" => MachineState::EnteringRescueMode,
            "exiting rescue mode" => MachineState::ExitingRescueMode,
            "failed to enter rescue mode" => MachineState::FailedEnteringRescueMode,
            "failed to exit rescue mode" => MachineState::FailedExitingRescueMode,
            _ => MachineState::Unknown(status_name.to_string()),
        }
    }

    /// Steady running states
    pub fn is_running(&self) -> bool {
        matches!(self, MachineState::Deployed | MachineState::RescueMode)
    }

    /// Running plus the intermediate states of a healthy lifecycle
    pub fn is_operational(&self) -> bool {
        self.is_running()
            || matches!(
                self,
                MachineState::New
                    | MachineState::Commissioning
                    | MachineState::Testing
                    | MachineState::Ready
                    | MachineState::Allocated
                    | MachineState::Deploying
                    | MachineState::EnteringRescueMode
                    | MachineState::ExitingRescueMode
            )
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, MachineState::Unknown(_))
    }

    /// MAAS accepts interface edits only in these states
    pub fn allows_network_edits(&self) -> bool {
        matches!(
            self,
            MachineState::New | MachineState::Ready | MachineState::Allocated | MachineState::Broken
        )
    }

    pub fn is_commissioning(&self) -> bool {
        matches!(self, MachineState::Commissioning | MachineState::Testing)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            MachineState::FailedCommissioning
                | MachineState::FailedTesting
                | MachineState::FailedDeployment
                | MachineState::FailedReleasing
                | MachineState::FailedDiskErasing
                | MachineState::FailedEnteringRescueMode
                | MachineState::FailedExitingRescueMode
        )
    }

    pub fn phase(&self) -> MachinePhase {
        match self {
            MachineState::New | MachineState::Commissioning | MachineState::Testing => {
                MachinePhase::Commissioning
            }
            MachineState::Ready | MachineState::Allocated => MachinePhase::Allocated,
            MachineState::Deploying => MachinePhase::Deploying,
            MachineState::Deployed => MachinePhase::Deployed,
            MachineState::Releasing | MachineState::DiskErasing => MachinePhase::Releasing,
            MachineState::Broken | MachineState::Missing | MachineState::Retired => {
                MachinePhase::Failed
            }
            state if state.is_failed() => MachinePhase::Failed,
            _ => MachinePhase::Pending,
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachineState::New => "New",
            MachineState::Commissioning => "Commissioning",
            MachineState::FailedCommissioning => "Failed commissioning",
            MachineState::Testing => "Testing",
            MachineState::FailedTesting => "Failed testing",
            MachineState::Ready => "Ready",
            MachineState::Allocated => "Allocated",
            MachineState::Deploying => "Deploying",
            MachineState::Deployed => "Deployed",
            MachineState::FailedDeployment => "Failed deployment",
            MachineState::Releasing => "Releasing",
            MachineState::FailedReleasing => "Failed releasing",
            MachineState::DiskErasing => "Disk erasing",
            MachineState::FailedDiskErasing => "Failed disk erasing",
            MachineState::Broken => "Broken",
            MachineState::Missing => "Missing",
            MachineState::Retired => "Retired",
            MachineState::RescueMode => "Rescue mode",
            MachineState::EnteringRescueMode => "Entering rescue mode",
            MachineState::ExitingRescueMode => "Exiting rescue mode",
            MachineState::FailedEnteringRescueMode => "Failed to enter rescue mode",
            MachineState::FailedExitingRescueMode => "Failed to exit rescue mode",
            MachineState::Unknown(s) => s.as_str(),
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Error,
    Unknown,
}

impl PowerState {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => PowerState::On,
            "off" => PowerState::Off,
            "error" => PowerState::Error,
            _ => PowerState::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Error => "error",
            PowerState::Unknown => "unknown",
        }
    }
}

/// Backend view of the instance backing a MaasMachine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedInstance {
    pub system_id: String,
    pub hostname: String,
    pub state: MachineState,
    pub power: PowerState,
    pub addresses: Vec<String>,
    pub zone: Option<String>,
    /// VM host the instance was composed on
    pub vm_host: Option<String>,
}

impl From<&Machine> for ObservedInstance {
    fn from(machine: &Machine) -> Self {
        Self {
            system_id: machine.system_id.clone(),
            hostname: machine.hostname.clone(),
            state: MachineState::parse(&machine.status_name),
            power: PowerState::parse(&machine.power_state),
            addresses: machine.ip_addresses.clone(),
            zone: machine.zone.as_ref().map(|z| z.name.clone()),
            vm_host: machine.pod.as_ref().map(|p| p.name.clone()),
        }
    }
}

/// Readiness is sticky for one instance: once deploy was accepted and
/// addresses were seen it stays set until the instance changes.
pub fn derive_ready(previous: Option<&MaasMachineStatus>, instance: &ObservedInstance) -> bool {
    let sticky = previous.is_some_and(|p| {
        p.ready && p.instance_id.as_deref() == Some(instance.system_id.as_str())
    });
    let deploy_accepted = matches!(
        instance.state,
        MachineState::Deploying | MachineState::Deployed
    );
    sticky || (deploy_accepted && !instance.addresses.is_empty())
}

/// Status for a pass that observed the instance
pub fn observed_status(
    previous: Option<&MaasMachineStatus>,
    instance: &ObservedInstance,
    provider_id: &str,
) -> MaasMachineStatus {
    let ready = derive_ready(previous, instance);
    let phase = instance.state.phase();
    let status = MaasMachineStatus {
        instance_id: Some(instance.system_id.clone()),
        provider_id: Some(provider_id.to_string()),
        failure_domain: instance.zone.clone(),
        hostname: Some(instance.hostname.clone()),
        machine_state: Some(instance.state.to_string()),
        power_state: Some(instance.power.as_str().to_string()),
        addresses: instance.addresses.clone(),
        running: instance.state.is_running(),
        operational: instance.state.is_operational(),
        known_state: instance.state.is_known(),
        ready,
        phase,
        conditions: vec![ready_condition(
            previous,
            ready,
            &phase.to_string(),
            &format!("MAAS reports {}", instance.state),
        )],
        error: None,
        last_reconciled: None,
    };
    stamp(previous, status)
}

/// Status for a pass that ended in an error.
///
/// Observed fields are kept unless the pass released or lost the instance,
/// in which case nothing about it is reported any more.
pub fn error_status(previous: Option<&MaasMachineStatus>, err: &ControllerError) -> MaasMachineStatus {
    let mut status = previous.cloned().unwrap_or_default();
    if err.released_instance() {
        status.instance_id = None;
        status.provider_id = None;
        status.machine_state = None;
        status.power_state = None;
        status.addresses.clear();
        status.ready = false;
        status.running = false;
        status.operational = false;
        status.known_state = false;
    }
    status.phase = match err {
        ControllerError::StillProvisioning { .. } => match status.phase {
            MachinePhase::Pending => MachinePhase::Commissioning,
            phase => phase,
        },
        e if e.released_instance() => MachinePhase::Pending,
        e if e.is_retryable() => status.phase,
        _ => MachinePhase::Failed,
    };
    status.error = Some(err.to_string());
    status.conditions = vec![ready_condition(
        previous,
        status.ready,
        err.reason(),
        &err.to_string(),
    )];
    stamp(previous, status)
}

/// Set `last_reconciled` only when something else changed, so a pass that
/// observes nothing new publishes exactly the previous status.
fn stamp(previous: Option<&MaasMachineStatus>, mut status: MaasMachineStatus) -> MaasMachineStatus {
    status.last_reconciled = previous.and_then(|p| p.last_reconciled);
    if previous != Some(&status) {
        status.last_reconciled = Some(chrono::Utc::now());
    }
    status
}

fn ready_condition(
    previous: Option<&MaasMachineStatus>,
    ready: bool,
    reason: &str,
    message: &str,
) -> MachineCondition {
    let status = if ready { "True" } else { "False" };
    let last_transition_time = previous
        .and_then(|p| p.conditions.iter().find(|c| c.type_ == "Ready"))
        .filter(|c| c.status == status)
        .and_then(|c| c.last_transition_time)
        .or_else(|| Some(chrono::Utc::now()));
    MachineCondition {
        type_: "Ready".to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_transition_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(state: &str, addresses: &[&str]) -> ObservedInstance {
        ObservedInstance {
            system_id: "abc123".to_string(),
            hostname: "worker-0".to_string(),
            state: MachineState::parse(state),
            power: PowerState::On,
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            zone: Some("z1".to_string()),
            vm_host: None,
        }
    }

    #[test]
    fn test_parse_round_trips_display() {
        for name in [
            "New",
            "Commissioning",
            "Failed commissioning",
            "Ready",
            "Allocated",
            "Deploying",
            "Deployed",
            "Failed deployment",
            "Broken",
            "Rescue mode",
            "Failed to exit rescue mode",
        ] {
            assert_eq!(MachineState::parse(name).to_string(), name);
        }
    }

    #[test]
    fn test_predicates() {
        assert!(MachineState::Deployed.is_running());
        assert!(MachineState::RescueMode.is_running());
        assert!(!MachineState::Deploying.is_running());

        assert!(MachineState::Deploying.is_operational());
        assert!(MachineState::Commissioning.is_operational());
        assert!(!MachineState::Broken.is_operational());
        assert!(!MachineState::FailedDeployment.is_operational());

        let unknown = MachineState::parse("Quantum flux");
        assert!(!unknown.is_known());
        assert!(!unknown.is_operational());
        assert_eq!(unknown.to_string(), "Quantum flux");
    }

    #[test]
    fn test_network_edit_gating() {
        for state in ["New", "Ready", "Allocated", "Broken"] {
            assert!(MachineState::parse(state).allows_network_edits(), "{}", state);
        }
        for state in ["Commissioning", "Deploying", "Deployed", "Testing"] {
            assert!(!MachineState::parse(state).allows_network_edits(), "{}", state);
        }
    }

    #[test]
    fn test_ready_requires_deploy_and_addresses() {
        assert!(!derive_ready(None, &instance("Allocated", &["10.0.0.5"])));
        assert!(!derive_ready(None, &instance("Deploying", &[])));
        assert!(derive_ready(None, &instance("Deploying", &["10.0.0.5"])));
        assert!(derive_ready(None, &instance("Deployed", &["10.0.0.5"])));
    }

    #[test]
    fn test_ready_is_sticky_for_same_instance() {
        let previous = MaasMachineStatus {
            instance_id: Some("abc123".to_string()),
            ready: true,
            ..Default::default()
        };
        assert!(derive_ready(Some(&previous), &instance("Deployed", &[])));

        let other = MaasMachineStatus {
            instance_id: Some("def456".to_string()),
            ready: true,
            ..Default::default()
        };
        assert!(!derive_ready(Some(&other), &instance("Deployed", &[])));
    }

    #[test]
    fn test_observed_status_fields() {
        let status = observed_status(None, &instance("Deployed", &["10.0.0.5"]), "maas:///z1/abc123");
        assert_eq!(status.instance_id.as_deref(), Some("abc123"));
        assert_eq!(status.machine_state.as_deref(), Some("Deployed"));
        assert_eq!(status.power_state.as_deref(), Some("on"));
        assert_eq!(status.phase, MachinePhase::Deployed);
        assert!(status.running && status.operational && status.known_state && status.ready);
        assert_eq!(status.conditions[0].status, "True");
    }

    #[test]
    fn test_error_status_marks_terminal_errors_failed() {
        let status = error_status(None, &ControllerError::Configuration("no pool".to_string()));
        assert_eq!(status.phase, MachinePhase::Failed);
        assert!(status.error.unwrap().contains("no pool"));

        let status = error_status(
            None,
            &ControllerError::still_provisioning("abc123", "VM composed, commissioning not finished"),
        );
        assert_eq!(status.phase, MachinePhase::Commissioning);
        assert_eq!(status.conditions[0].reason.as_deref(), Some("StillProvisioning"));
    }

    #[test]
    fn test_error_status_forgets_released_instance() {
        let deployed = observed_status(None, &instance("Deployed", &["10.0.0.5"]), "maas:///z1/abc123");
        assert!(deployed.ready);

        let err = ControllerError::BrokenInstanceEncountered {
            system_id: "abc123".to_string(),
        };
        let status = error_status(Some(&deployed), &err);

        assert!(!status.ready && !status.running && !status.operational);
        assert!(status.instance_id.is_none());
        assert!(status.machine_state.is_none());
        assert!(status.addresses.is_empty());
        assert_eq!(status.phase, MachinePhase::Pending);
        assert_eq!(status.conditions[0].status, "False");
    }

    #[test]
    fn test_error_status_keeps_instance_for_other_errors() {
        let deployed = observed_status(None, &instance("Deployed", &["10.0.0.5"]), "maas:///z1/abc123");
        let err = ControllerError::Persist("conflict".to_string());

        let status = error_status(Some(&deployed), &err);

        assert!(status.ready);
        assert_eq!(status.machine_state.as_deref(), Some("Deployed"));
        assert_eq!(status.phase, MachinePhase::Deployed);
    }

    #[test]
    fn test_unchanged_pass_reproduces_previous_status() {
        let observed = instance("Deployed", &["10.0.0.5"]);
        let first = observed_status(None, &observed, "maas:///z1/abc123");
        assert!(first.last_reconciled.is_some());
        assert_eq!(observed_status(Some(&first), &observed, "maas:///z1/abc123"), first);

        let err = ControllerError::Persist("conflict".to_string());
        let failed = error_status(Some(&first), &err);
        assert_ne!(failed, first);
        assert_eq!(error_status(Some(&failed), &err), failed);
    }
}
