//! VM host placement.
//!
//! Hosts are filtered by zone and pool in tiers. Within a tier a host whose
//! backing machine is deployed and powered on wins over a host registered out
//! of band; hosts under maintenance or with an unhealthy backing machine are
//! never chosen. Health is read from MAAS on every call.

use crate::error::{ProvisioningError, ProvisioningErrorKind};
use crate::reconciler::lifecycle::{MachineState, PowerState};
use maas_client::{MaasError, MachineRegistry, VmHost};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Which constraint is dropped first when no host matches both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelaxationOrder {
    /// Zone and pool must both match
    Strict,
    /// Relax the pool, then the zone
    #[default]
    PoolThenZone,
    /// Relax the zone, then the pool
    ZoneThenPool,
}

impl FromStr for RelaxationOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(RelaxationOrder::Strict),
            "pool-then-zone" => Ok(RelaxationOrder::PoolThenZone),
            "zone-then-pool" => Ok(RelaxationOrder::ZoneThenPool),
            other => Err(format!(
                "unknown relaxation order '{}' (expected strict, pool-then-zone or zone-then-pool)",
                other
            )),
        }
    }
}

impl std::fmt::Display for RelaxationOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelaxationOrder::Strict => write!(f, "strict"),
            RelaxationOrder::PoolThenZone => write!(f, "pool-then-zone"),
            RelaxationOrder::ZoneThenPool => write!(f, "zone-then-pool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementPolicy {
    pub relaxation: RelaxationOrder,
    pub maintenance_tags: Vec<String>,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            relaxation: RelaxationOrder::default(),
            maintenance_tags: crate::config::DEFAULT_MAINTENANCE_TAGS
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }
}

/// Zone/pool filter of one tier; `None` matches anything
type Tier<'a> = (Option<&'a str>, Option<&'a str>);

/// Tiers to try, most specific first
pub fn tiers<'a>(
    order: RelaxationOrder,
    zone: Option<&'a str>,
    pool: Option<&'a str>,
) -> Vec<Tier<'a>> {
    let mut tiers = vec![(zone, pool)];
    match order {
        RelaxationOrder::Strict => {}
        RelaxationOrder::PoolThenZone => {
            tiers.push((zone, None));
            tiers.push((None, None));
        }
        RelaxationOrder::ZoneThenPool => {
            tiers.push((None, pool));
            tiers.push((None, None));
        }
    }
    tiers.dedup();
    tiers
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Assessment {
    /// Backing machine deployed and powered on
    Healthy,
    /// No backing machine known to MAAS
    OutOfBand,
    /// Backing machine readable but not deployed and powered on
    Degraded(String),
    Excluded(String),
}

impl Assessment {
    fn rank(&self) -> Option<u8> {
        match self {
            Assessment::Healthy => Some(0),
            Assessment::OutOfBand => Some(1),
            Assessment::Degraded(_) => Some(2),
            Assessment::Excluded(_) => None,
        }
    }
}

fn matches_tier(host: &VmHost, (zone, pool): Tier<'_>) -> bool {
    let zone_ok = zone.is_none_or(|z| host.zone.as_ref().is_some_and(|hz| hz.name == z));
    let pool_ok = pool.is_none_or(|p| host.pool.as_ref().is_some_and(|hp| hp.name == p));
    zone_ok && pool_ok
}

/// Picks a VM host for a composition request
pub struct PlacementResolver<'a, M: ?Sized> {
    machines: &'a M,
    policy: &'a PlacementPolicy,
}

impl<'a, M: MachineRegistry + ?Sized> PlacementResolver<'a, M> {
    pub fn new(machines: &'a M, policy: &'a PlacementPolicy) -> Self {
        Self { machines, policy }
    }

    fn under_maintenance(&self, tags: &[String]) -> Option<String> {
        tags.iter()
            .find(|t| self.policy.maintenance_tags.iter().any(|m| m == *t))
            .cloned()
    }

    async fn assess(&self, host: &VmHost) -> Assessment {
        if let Some(tag) = self.under_maintenance(&host.tags) {
            return Assessment::Excluded(format!("host tagged {}", tag));
        }
        let Some(system_id) = host.host_system_id() else {
            return Assessment::OutOfBand;
        };
        match self.machines.get_machine(system_id).await {
            Ok(machine) => {
                if let Some(tag) = self.under_maintenance(&machine.tag_names) {
                    return Assessment::Excluded(format!("backing machine tagged {}", tag));
                }
                let state = MachineState::parse(&machine.status_name);
                let power = PowerState::parse(&machine.power_state);
                if state == MachineState::Deployed && power == PowerState::On {
                    Assessment::Healthy
                } else {
                    Assessment::Degraded(format!(
                        "backing machine {} is {} and powered {}",
                        system_id,
                        state,
                        power.as_str()
                    ))
                }
            }
            Err(MaasError::NotFound(_)) => Assessment::OutOfBand,
            Err(e) => {
                warn!("Could not read backing machine {} of VM host {}: {}", system_id, host.name, e);
                Assessment::Excluded(format!("backing machine unreadable: {}", e))
            }
        }
    }

    /// Select one host from `hosts` for the given zone and pool
    pub async fn select(
        &self,
        hosts: &[VmHost],
        zone: Option<&str>,
        pool: Option<&str>,
    ) -> Result<VmHost, ProvisioningError> {
        self.select_with(self.policy.relaxation, hosts, zone, pool).await
    }

    pub async fn select_with(
        &self,
        order: RelaxationOrder,
        hosts: &[VmHost],
        zone: Option<&str>,
        pool: Option<&str>,
    ) -> Result<VmHost, ProvisioningError> {
        let mut assessed: HashMap<u64, Assessment> = HashMap::new();

        for (index, tier) in tiers(order, zone, pool).into_iter().enumerate() {
            let mut best: Option<(u8, &VmHost)> = None;
            for host in hosts.iter().filter(|h| matches_tier(h, tier)) {
                let assessment = match assessed.get(&host.id) {
                    Some(a) => a.clone(),
                    None => {
                        let a = self.assess(host).await;
                        assessed.insert(host.id, a.clone());
                        a
                    }
                };
                match (&assessment, assessment.rank()) {
                    (Assessment::Excluded(reason), _) => {
                        debug!("Skipping VM host {}: {}", host.name, reason);
                    }
                    (_, Some(rank)) if best.is_none_or(|(b, _)| rank < b) => {
                        if let Assessment::Degraded(reason) = &assessment {
                            debug!("VM host {} is a fallback: {}", host.name, reason);
                        }
                        best = Some((rank, host));
                    }
                    _ => {}
                }
            }
            if let Some((rank, host)) = best {
                info!(
                    "Selected VM host {} (id {}, tier {}, {})",
                    host.name,
                    host.id,
                    index + 1,
                    match rank {
                        0 => "healthy",
                        1 => "out-of-band",
                        _ => "unhealthy backing machine",
                    }
                );
                return Ok(host.clone());
            }
        }

        Err(ProvisioningError::new(
            ProvisioningErrorKind::HostUnavailable,
            format!(
                "no eligible VM host in zone {} pool {} ({} hosts considered, relaxation {})",
                zone.unwrap_or("<any>"),
                pool.unwrap_or("<any>"),
                hosts.len(),
                order
            ),
        )
        .with_detail("zone", zone.unwrap_or_default())
        .with_detail("pool", pool.unwrap_or_default()))
    }
}
