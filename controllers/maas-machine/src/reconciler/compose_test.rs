//! Unit tests for virtualized provisioning

#[cfg(test)]
mod tests {
    use crate::error::{ControllerError, ProvisioningErrorKind};
    use crate::reconciler::VM_HOST_ANNOTATION;
    use crate::reconciler::lifecycle::MachineState;
    use crate::test_utils::*;
    use maas_client::mock::helpers::{interface, link, machine, named, subnet, vm_host};
    use maas_client::{LinkMode, MaasError, VmHostResource};

    /// Healthy host lxd-a (id 1) in z1/p1 and the mgmt and workload subnets
    fn env_with_host() -> TestEnv {
        let env = TestEnv::new();
        add_healthy_vm_host(&env.maas, 1, "lxd-a");
        env.maas.add_subnet(subnet(1, "mgmt", "10.0.0.0/24"));
        env.maas.add_subnet(subnet(2, "workload", "10.20.0.0/24"));
        env.maas.add_subnet(subnet(3, "storage", "192.168.50.0/24"));
        env
    }

    fn recorded_instance(env: &TestEnv) -> String {
        env.persister.checkpoint(&key()).unwrap().instance_id
    }

    fn vms_named(env: &TestEnv, hostname: &str) -> usize {
        env.maas
            .all_machines()
            .iter()
            .filter(|m| m.hostname == hostname)
            .count()
    }

    /// VM already on lxd-a, as left behind by an earlier compose
    fn existing_vm(system_id: &str, hostname: &str, status: &str) -> maas_client::Machine {
        let mut vm = machine(system_id, hostname, status);
        vm.zone = Some(named(1, "z1"));
        vm.pool = Some(named(1, "p1"));
        vm.pod = Some(named(1, "lxd-a"));
        vm
    }

    #[tokio::test]
    async fn test_composes_then_deploys_after_commissioning() {
        let env = env_with_host();
        let mut spec = virtualized_spec(&["mgmt", "10.20.0.0/24"]);
        spec.tags = vec!["k8s".to_string()];

        let err = env.reconciler.provision(&key(), &spec).await.unwrap_err();
        assert!(matches!(err, ControllerError::StillProvisioning { .. }));

        let system_id = recorded_instance(&env);
        assert_eq!(
            env.persister.annotation(&key(), VM_HOST_ANNOTATION).as_deref(),
            Some("1")
        );
        let vm = env.maas.machine(&system_id).unwrap();
        assert_eq!(vm.hostname, "worker-0");
        assert_eq!(vm.cpu_count, 2);
        assert_eq!(vm.memory, 4096);
        assert_eq!(vm.pod.as_ref().map(|p| p.name.as_str()), Some("lxd-a"));
        assert_eq!(vm.tag_names, vec!["k8s".to_string()]);

        let interfaces = env.maas.interfaces_of(&system_id);
        let subnet_of = |name: &str| {
            interfaces
                .iter()
                .find(|i| i.name == name)
                .and_then(|i| i.links.first())
                .and_then(|l| l.subnet.as_ref())
                .map(|s| s.name.clone())
        };
        assert_eq!(subnet_of("eth0").as_deref(), Some("mgmt"));
        assert_eq!(subnet_of("eth1").as_deref(), Some("workload"));

        env.maas.complete_commissioning(&system_id);
        let instance = env.reconciler.provision(&key(), &spec).await.unwrap();
        assert_eq!(instance.state, MachineState::Deploying);
        assert_eq!(instance.vm_host.as_deref(), Some("lxd-a"));
        assert_eq!(env.maas.machine(&system_id).unwrap().distro_series, "noble");

        assert_eq!(env.maas.compose_calls(), 1);
        assert_eq!(env.maas.link_calls(), 0);
        assert_eq!(
            env.metrics
                .instances_allocated
                .with_label_values(&["virtualized"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_static_ip_is_requested_inline_on_workload_interface() {
        let env = env_with_host();
        let mut spec = virtualized_spec(&["mgmt", "workload"]);
        spec.static_ip = Some(static_ip_spec("10.20.0.50", "10.20.0.1", "/24"));

        env.reconciler.provision(&key(), &spec).await.unwrap_err();
        let system_id = recorded_instance(&env);
        let eth1 = env
            .maas
            .interfaces_of(&system_id)
            .into_iter()
            .find(|i| i.name == "eth1")
            .unwrap();
        assert_eq!(eth1.links[0].mode, LinkMode::Static);
        assert_eq!(eth1.links[0].ip_address.as_deref(), Some("10.20.0.50"));

        env.maas.complete_commissioning(&system_id);
        env.reconciler.provision(&key(), &spec).await.unwrap();
        // Already bound by composition
        assert_eq!(env.maas.link_calls(), 0);
    }

    #[tokio::test]
    async fn test_hostname_collision_adopts_existing_vm() {
        let env = env_with_host();
        env.maas.add_machine(existing_vm("vm0042", "worker-0", "Ready"));

        let instance = env
            .reconciler
            .provision(&key(), &virtualized_spec(&[]))
            .await
            .unwrap();

        assert_eq!(instance.system_id, "vm0042");
        assert_eq!(instance.state, MachineState::Deploying);
        assert_eq!(recorded_instance(&env), "vm0042");
        assert_eq!(vms_named(&env, "worker-0"), 1);
        assert_eq!(
            env.metrics
                .instances_allocated
                .with_label_values(&["virtualized"])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn test_adopted_ready_vm_is_tagged_once() {
        let env = env_with_host();
        env.maas.add_machine(existing_vm("vm0042", "worker-0", "Ready"));
        let mut spec = virtualized_spec(&[]);
        spec.tags = vec!["k8s".to_string(), "gpu".to_string()];

        env.reconciler.provision(&key(), &spec).await.unwrap();

        assert_eq!(env.maas.calls().tag, 2);
        let vm = env.maas.machine("vm0042").unwrap();
        assert_eq!(vm.tag_names, vec!["k8s".to_string(), "gpu".to_string()]);
    }

    #[tokio::test]
    async fn test_hostname_collision_falls_back_to_host_vm_list() {
        let env = env_with_host();
        env.maas.add_machine(existing_vm("vm0042", "worker-0.lab", "Commissioning"));
        env.maas
            .fail_next_compose(MaasError::HostnameInUse("worker-0".to_string()));

        let err = env
            .reconciler
            .provision(&key(), &virtualized_spec(&[]))
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::StillProvisioning { .. }));
        assert_eq!(recorded_instance(&env), "vm0042");
    }

    #[tokio::test]
    async fn test_hostname_collision_without_match_is_retryable() {
        let env = env_with_host();
        env.maas
            .fail_next_compose(MaasError::HostnameInUse("worker-0".to_string()));

        let err = env
            .reconciler
            .provision(&key(), &virtualized_spec(&[]))
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::Backend { .. }));
        assert!(err.is_retryable());
        assert!(env.persister.checkpoint(&key()).is_none());
    }

    #[tokio::test]
    async fn test_lost_checkpoint_write_recovers_by_hostname() {
        let env = env_with_host();
        let spec = virtualized_spec(&["mgmt", "workload"]);
        env.persister.fail_next_record();

        let err = env.reconciler.provision(&key(), &spec).await.unwrap_err();
        assert!(matches!(err, ControllerError::Persist(_)));
        assert!(env.persister.checkpoint(&key()).is_none());

        let err = env.reconciler.provision(&key(), &spec).await.unwrap_err();
        assert!(matches!(err, ControllerError::StillProvisioning { .. }));

        assert_eq!(env.maas.compose_calls(), 2);
        assert_eq!(vms_named(&env, "worker-0"), 1);
        let adopted = recorded_instance(&env);
        assert_eq!(env.maas.machine(&adopted).unwrap().hostname, "worker-0");
    }

    #[tokio::test]
    async fn test_network_mismatch_is_configuration_error() {
        let env = env_with_host();
        env.maas.fail_next_compose(MaasError::NetworkMismatch(
            "subnet workload not available on host".to_string(),
        ));

        let err = env
            .reconciler
            .provision(&key(), &virtualized_spec(&["mgmt", "workload"]))
            .await
            .unwrap_err();

        match &err {
            ControllerError::Configuration(message) => {
                assert!(message.contains("lxd-a"));
                assert!(message.contains("workload"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_profile_is_terminal() {
        let env = env_with_host();
        env.maas.fail_next_compose(MaasError::VmHostResource {
            resource: VmHostResource::Profile,
            message: "Profile not found: maas".to_string(),
        });

        let err = env
            .reconciler
            .provision(&key(), &virtualized_spec(&[]))
            .await
            .unwrap_err();

        match &err {
            ControllerError::Provisioning(e) => {
                assert_eq!(e.kind, ProvisioningErrorKind::ProfileNotFound);
                assert_eq!(e.host.as_deref(), Some("lxd-a"));
                assert_eq!(e.details.get("vm_host_id").map(String::as_str), Some("1"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_host_capacity_exhausted_is_retryable() {
        let env = env_with_host();
        env.maas.fail_next_compose(MaasError::InsufficientResources(
            "not enough cores".to_string(),
        ));

        let err = env
            .reconciler
            .provision(&key(), &virtualized_spec(&[]))
            .await
            .unwrap_err();

        match &err {
            ControllerError::Provisioning(e) => {
                assert_eq!(e.kind, ProvisioningErrorKind::InsufficientResources)
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_host_without_pool_is_rejected() {
        let env = TestEnv::new();
        let mut backing = machine("host9", "host9", "Deployed");
        backing.power_state = "on".to_string();
        env.maas.add_machine(backing);
        env.maas
            .add_vm_host(vm_host(9, "lxd-nopool", named(1, "z1"), None, Some("host9")));
        let mut spec = virtualized_spec(&[]);
        spec.resource_pool = None;

        let err = env.reconciler.provision(&key(), &spec).await.unwrap_err();

        match &err {
            ControllerError::Configuration(message) => {
                assert!(message.contains("no resource pool"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(env.maas.compose_calls(), 0);
    }

    #[tokio::test]
    async fn test_pinned_host_is_used() {
        let env = env_with_host();
        add_healthy_vm_host(&env.maas, 2, "lxd-b");
        let mut spec = virtualized_spec(&[]);
        spec.virtualized.as_mut().unwrap().vm_host = Some("lxd-b".to_string());

        env.reconciler.provision(&key(), &spec).await.unwrap_err();

        assert_eq!(
            env.persister.annotation(&key(), VM_HOST_ANNOTATION).as_deref(),
            Some("2")
        );
        let vm = env.maas.machine(&recorded_instance(&env)).unwrap();
        assert_eq!(vm.pod.map(|p| p.name), Some("lxd-b".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_pinned_host_is_unavailable() {
        let env = env_with_host();
        let mut spec = virtualized_spec(&[]);
        spec.virtualized.as_mut().unwrap().vm_host = Some("lxd-x".to_string());

        let err = env.reconciler.provision(&key(), &spec).await.unwrap_err();

        match err {
            ControllerError::Provisioning(e) => {
                assert_eq!(e.kind, ProvisioningErrorKind::HostUnavailable)
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(env.maas.compose_calls(), 0);
    }

    #[tokio::test]
    async fn test_verify_network_relinks_wrong_subnet() {
        let env = env_with_host();
        env.maas.add_machine(existing_vm("vm0042", "worker-0", "Ready"));
        env.maas.add_interface(
            "vm0042",
            interface(
                10,
                "eth0",
                vec![link(100, LinkMode::Auto, Some(subnet(1, "mgmt", "10.0.0.0/24")), None)],
            ),
        );
        env.maas.add_interface(
            "vm0042",
            interface(
                11,
                "eth1",
                vec![link(
                    110,
                    LinkMode::Auto,
                    Some(subnet(3, "storage", "192.168.50.0/24")),
                    None,
                )],
            ),
        );

        let networks = vec!["mgmt".to_string(), "10.20.0.0/24".to_string()];
        env.reconciler.verify_network("vm0042", &networks).await.unwrap();

        let calls = env.maas.calls();
        assert_eq!(calls.unlink, 1);
        assert_eq!(calls.link, 1);
        let eth1 = env
            .maas
            .interfaces_of("vm0042")
            .into_iter()
            .find(|i| i.name == "eth1")
            .unwrap();
        assert_eq!(eth1.links.len(), 1);
        assert_eq!(eth1.links[0].mode, LinkMode::Auto);
        assert_eq!(
            eth1.links[0].subnet.as_ref().map(|s| s.name.as_str()),
            Some("workload")
        );

        // Second check finds everything in place
        env.reconciler.verify_network("vm0042", &networks).await.unwrap();
        assert_eq!(env.maas.calls().link, 1);
    }

    #[tokio::test]
    async fn test_verify_network_links_interface_without_subnet() {
        let env = env_with_host();
        env.maas.add_machine(existing_vm("vm0042", "worker-0", "Allocated"));
        env.maas.add_interface(
            "vm0042",
            interface(
                10,
                "eth0",
                vec![link(100, LinkMode::Auto, Some(subnet(1, "mgmt", "10.0.0.0/24")), None)],
            ),
        );
        env.maas.add_interface("vm0042", interface(11, "eth1", Vec::new()));

        env.reconciler
            .verify_network("vm0042", &["mgmt".to_string(), "workload".to_string()])
            .await
            .unwrap();

        assert_eq!(env.maas.calls().unlink, 0);
        assert_eq!(env.maas.link_calls(), 1);
    }

    #[tokio::test]
    async fn test_verify_network_requires_both_interfaces() {
        let env = env_with_host();
        env.maas.add_machine(existing_vm("vm0042", "worker-0", "Ready"));
        env.maas.add_interface("vm0042", interface(10, "eth0", Vec::new()));

        let err = env
            .reconciler
            .verify_network("vm0042", &["mgmt".to_string(), "workload".to_string()])
            .await
            .unwrap_err();

        match err {
            ControllerError::Provisioning(e) => {
                assert_eq!(e.kind, ProvisioningErrorKind::NetworkConfiguration)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_verify_network_waits_for_editable_state() {
        let env = env_with_host();
        env.maas.add_machine(existing_vm("vm0042", "worker-0", "Deploying"));

        let err = env
            .reconciler
            .verify_network("vm0042", &["mgmt".to_string(), "workload".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::StillProvisioning { .. }));

        // Fewer than two networks: nothing to verify
        env.reconciler
            .verify_network("vm0042", &["mgmt".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_broken_vm_is_released_and_forgotten() {
        let env = env_with_host();
        let spec = virtualized_spec(&[]);
        env.reconciler.provision(&key(), &spec).await.unwrap_err();
        let system_id = recorded_instance(&env);
        env.maas.set_machine_status(&system_id, "Broken");

        let err = env.reconciler.provision(&key(), &spec).await.unwrap_err();

        assert!(matches!(err, ControllerError::BrokenInstanceEncountered { .. }));
        assert!(err.is_retryable());
        assert!(env.persister.checkpoint(&key()).is_none());
        assert_eq!(env.maas.calls().forced_release, 1);
        assert_eq!(env.metrics.forced_releases.get(), 1);
    }
}
