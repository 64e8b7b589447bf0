//! Unit tests for VM host placement

#[cfg(test)]
mod tests {
    use crate::error::ProvisioningErrorKind;
    use crate::reconciler::placement::*;
    use maas_client::mock::helpers::{machine, named, vm_host};
    use maas_client::{MockMaasClient, VmHost};

    fn deployed_backing(mock: &MockMaasClient, system_id: &str, tags: &[&str]) {
        let mut m = machine(system_id, system_id, "Deployed");
        m.power_state = "on".to_string();
        m.tag_names = tags.iter().map(|t| t.to_string()).collect();
        mock.add_machine(m);
    }

    /// lxd-host-a is backed by a healthy machine, oob-host-b has no backing machine
    fn scenario(maintenance_on_a: bool) -> (MockMaasClient, Vec<VmHost>) {
        let mock = MockMaasClient::new("http://maas.test/MAAS");
        let tags: &[&str] = if maintenance_on_a { &["maintenance"] } else { &[] };
        deployed_backing(&mock, "hosta1", tags);
        let hosts = vec![
            vm_host(2, "oob-host-b", named(1, "z1"), Some(named(1, "p1")), None),
            vm_host(1, "lxd-host-a", named(1, "z1"), Some(named(1, "p1")), Some("hosta1")),
        ];
        (mock, hosts)
    }

    #[tokio::test]
    async fn test_scenario_prefers_healthy_backed_host() {
        let (mock, hosts) = scenario(false);
        let policy = PlacementPolicy::default();
        let resolver = PlacementResolver::new(&mock, &policy);

        let host = resolver.select(&hosts, Some("z1"), Some("p1")).await.unwrap();
        assert_eq!(host.name, "lxd-host-a");
    }

    #[tokio::test]
    async fn test_scenario_falls_back_to_out_of_band_host_under_maintenance() {
        let (mock, hosts) = scenario(true);
        let policy = PlacementPolicy::default();
        let resolver = PlacementResolver::new(&mock, &policy);

        let host = resolver.select(&hosts, Some("z1"), Some("p1")).await.unwrap();
        assert_eq!(host.name, "oob-host-b");
    }

    #[tokio::test]
    async fn test_only_maintained_host_is_unavailable() {
        let mock = MockMaasClient::new("http://maas.test/MAAS");
        deployed_backing(&mock, "hosta1", &["no-schedule"]);
        let hosts = vec![vm_host(1, "lxd-host-a", named(1, "z1"), Some(named(1, "p1")), Some("hosta1"))];
        let policy = PlacementPolicy::default();
        let resolver = PlacementResolver::new(&mock, &policy);

        let err = resolver.select(&hosts, Some("z1"), Some("p1")).await.unwrap_err();
        assert_eq!(err.kind, ProvisioningErrorKind::HostUnavailable);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_maintenance_applies_at_every_tier() {
        let mock = MockMaasClient::new("http://maas.test/MAAS");
        deployed_backing(&mock, "hosta1", &["maintenance"]);
        // Only a host outside the declared pool exists, and it is under maintenance
        let hosts = vec![vm_host(1, "lxd-host-a", named(1, "z1"), Some(named(2, "p2")), Some("hosta1"))];
        let policy = PlacementPolicy::default();
        let resolver = PlacementResolver::new(&mock, &policy);

        assert!(resolver.select(&hosts, Some("z1"), Some("p1")).await.is_err());
    }

    #[tokio::test]
    async fn test_host_tags_also_exclude() {
        let mock = MockMaasClient::new("http://maas.test/MAAS");
        let mut host = vm_host(1, "oob-host-b", named(1, "z1"), Some(named(1, "p1")), None);
        host.tags = vec!["maintenance".to_string()];
        let policy = PlacementPolicy::default();
        let resolver = PlacementResolver::new(&mock, &policy);

        assert!(resolver.select(&[host], Some("z1"), Some("p1")).await.is_err());
    }

    #[tokio::test]
    async fn test_unhealthy_backing_machine_ranks_below_out_of_band() {
        let mock = MockMaasClient::new("http://maas.test/MAAS");
        mock.add_machine(machine("hosta1", "hosta1", "Deployed")); // powered off
        let hosts = vec![
            vm_host(1, "lxd-host-a", named(1, "z1"), Some(named(1, "p1")), Some("hosta1")),
            vm_host(2, "oob-host-b", named(1, "z1"), Some(named(1, "p1")), None),
        ];
        let policy = PlacementPolicy::default();
        let resolver = PlacementResolver::new(&mock, &policy);

        let host = resolver.select(&hosts, Some("z1"), Some("p1")).await.unwrap();
        assert_eq!(host.name, "oob-host-b");
    }

    #[tokio::test]
    async fn test_unhealthy_backing_machine_is_still_eligible_alone() {
        let mock = MockMaasClient::new("http://maas.test/MAAS");
        let mut backing = machine("hosta1", "hosta1", "Deployed");
        backing.power_state = "unknown".to_string();
        mock.add_machine(backing);
        let hosts = vec![vm_host(1, "lxd-host-a", named(1, "z1"), Some(named(1, "p1")), Some("hosta1"))];
        let policy = PlacementPolicy::default();
        let resolver = PlacementResolver::new(&mock, &policy);

        let host = resolver.select(&hosts, Some("z1"), Some("p1")).await.unwrap();
        assert_eq!(host.name, "lxd-host-a");
    }

    #[tokio::test]
    async fn test_healthy_host_beats_unhealthy_one() {
        let mock = MockMaasClient::new("http://maas.test/MAAS");
        mock.add_machine(machine("hosta1", "hosta1", "Allocated"));
        deployed_backing(&mock, "hostc1", &[]);
        let hosts = vec![
            vm_host(1, "lxd-host-a", named(1, "z1"), Some(named(1, "p1")), Some("hosta1")),
            vm_host(3, "lxd-host-c", named(1, "z1"), Some(named(1, "p1")), Some("hostc1")),
        ];
        let policy = PlacementPolicy::default();
        let resolver = PlacementResolver::new(&mock, &policy);

        let host = resolver.select(&hosts, Some("z1"), Some("p1")).await.unwrap();
        assert_eq!(host.name, "lxd-host-c");
    }

    #[tokio::test]
    async fn test_missing_backing_machine_counts_as_out_of_band() {
        let mock = MockMaasClient::new("http://maas.test/MAAS");
        let hosts = vec![vm_host(1, "lxd-host-a", named(1, "z1"), Some(named(1, "p1")), Some("gone01"))];
        let policy = PlacementPolicy::default();
        let resolver = PlacementResolver::new(&mock, &policy);

        let host = resolver.select(&hosts, Some("z1"), Some("p1")).await.unwrap();
        assert_eq!(host.name, "lxd-host-a");
    }

    #[tokio::test]
    async fn test_strict_never_leaves_declared_zone_and_pool() {
        let mock = MockMaasClient::new("http://maas.test/MAAS");
        let hosts = vec![vm_host(1, "other-pool", named(1, "z1"), Some(named(2, "p2")), None)];
        let policy = PlacementPolicy {
            relaxation: RelaxationOrder::Strict,
            ..Default::default()
        };
        let resolver = PlacementResolver::new(&mock, &policy);

        let err = resolver.select(&hosts, Some("z1"), Some("p1")).await.unwrap_err();
        assert_eq!(err.kind, ProvisioningErrorKind::HostUnavailable);
    }

    #[tokio::test]
    async fn test_pool_then_zone_relaxes_pool_first() {
        let mock = MockMaasClient::new("http://maas.test/MAAS");
        let hosts = vec![
            vm_host(1, "same-pool-other-zone", named(2, "z2"), Some(named(1, "p1")), None),
            vm_host(2, "same-zone-other-pool", named(1, "z1"), Some(named(2, "p2")), None),
        ];
        let policy = PlacementPolicy::default();
        let resolver = PlacementResolver::new(&mock, &policy);

        let host = resolver.select(&hosts, Some("z1"), Some("p1")).await.unwrap();
        assert_eq!(host.name, "same-zone-other-pool");

        let host = resolver
            .select_with(RelaxationOrder::ZoneThenPool, &hosts, Some("z1"), Some("p1"))
            .await
            .unwrap();
        assert_eq!(host.name, "same-pool-other-zone");
    }

    #[tokio::test]
    async fn test_relaxation_reaches_any_host() {
        let mock = MockMaasClient::new("http://maas.test/MAAS");
        let hosts = vec![vm_host(1, "elsewhere", named(3, "z3"), Some(named(3, "p3")), None)];
        let policy = PlacementPolicy::default();
        let resolver = PlacementResolver::new(&mock, &policy);

        let host = resolver.select(&hosts, Some("z1"), Some("p1")).await.unwrap();
        assert_eq!(host.name, "elsewhere");
    }

    #[test]
    fn test_tiers_deduplicate_when_unconstrained() {
        assert_eq!(tiers(RelaxationOrder::PoolThenZone, None, None), vec![(None, None)]);
        assert_eq!(
            tiers(RelaxationOrder::PoolThenZone, Some("z1"), None),
            vec![(Some("z1"), None), (None, None)]
        );
        assert_eq!(
            tiers(RelaxationOrder::ZoneThenPool, Some("z1"), Some("p1")),
            vec![(Some("z1"), Some("p1")), (None, Some("p1")), (None, None)]
        );
    }

    #[test]
    fn test_relaxation_order_parses() {
        assert_eq!("strict".parse::<RelaxationOrder>().unwrap(), RelaxationOrder::Strict);
        assert_eq!(
            "Pool-Then-Zone".parse::<RelaxationOrder>().unwrap(),
            RelaxationOrder::PoolThenZone
        );
        assert!("sideways".parse::<RelaxationOrder>().is_err());
    }
}
