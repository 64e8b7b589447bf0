//! MAAS API client
//!
//! Implements the capability traits against the MAAS 2.0 REST API:
//! `/api/2.0/machines/`, `/api/2.0/vm-hosts/`, `/api/2.0/nodes/{id}/interfaces/`,
//! `/api/2.0/ipaddresses/` and `/api/2.0/tags/`.
//! Mutating operations are form-encoded `?op=` calls.

use crate::common::auth::ApiKey;
use crate::common::{Form, HttpClient};
use crate::error::MaasError;
use crate::maas_trait::*;
use crate::models::*;
use base64::Engine;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

/// MAAS API client
#[derive(Debug)]
pub struct MaasClient {
    http: HttpClient,
}

impl MaasClient {
    /// Create a new MAAS client
    ///
    /// # Arguments
    /// * `base_url` - MAAS URL including the `/MAAS` suffix (e.g., "http://maas:5240/MAAS")
    /// * `api_key` - API key in the form `consumer:token:secret`
    pub fn new(base_url: String, api_key: &str) -> Result<Self, MaasError> {
        let api_key = ApiKey::parse(api_key)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(MaasError::Http)?;

        Ok(Self {
            http: HttpClient::new(client, base_url, api_key),
        })
    }

    fn machine_path(system_id: &str) -> String {
        format!("/machines/{}/", urlencoding::encode(system_id))
    }

    fn interfaces_path(system_id: &str) -> String {
        format!("/nodes/{}/interfaces/", urlencoding::encode(system_id))
    }

    fn interface_path(system_id: &str, interface_id: u64) -> String {
        format!("{}{}/", Self::interfaces_path(system_id), interface_id)
    }

    fn link_form(params: &LinkSubnetParams) -> Form {
        let mut form: Form = vec![
            ("mode", params.mode.as_param().to_string()),
            ("subnet", params.subnet.clone()),
        ];
        if let Some(ip) = &params.ip_address {
            form.push(("ip_address", ip.clone()));
        }
        if params.default_gateway {
            form.push(("default_gateway", "true".to_string()));
        }
        form
    }

    async fn boot_interface_id(&self, system_id: &str) -> Result<u64, MaasError> {
        let machine = self.get_machine(system_id).await?;
        machine.boot_interface.map(|i| i.id).ok_or_else(|| {
            MaasError::InvalidState(format!("machine {} has no boot interface", system_id))
        })
    }

    async fn get_tag(&self, name: &str) -> Result<Tag, MaasError> {
        self.http
            .get(&format!("/tags/{}/", urlencoding::encode(name)), &[])
            .await
    }
}

#[async_trait::async_trait]
impl MaasConnection for MaasClient {
    fn base_url(&self) -> &str {
        self.http.base_url()
    }

    async fn validate_credentials(&self) -> Result<(), MaasError> {
        debug!("Validating MAAS API key and connectivity");
        let _: serde_json::Value = self.http.get("/users/?op=whoami", &[]).await?;
        debug!("MAAS API key validated successfully");
        Ok(())
    }
}

#[async_trait::async_trait]
impl MachineRegistry for MaasClient {
    async fn allocate(&self, params: AllocateParams) -> Result<Machine, MaasError> {
        let mut form: Form = Vec::new();
        if let Some(system_id) = params.system_id {
            form.push(("system_id", system_id));
        }
        if let Some(cpu) = params.cpu_count {
            form.push(("cpu_count", cpu.to_string()));
        }
        if let Some(mem) = params.mem {
            form.push(("mem", mem.to_string()));
        }
        if let Some(zone) = params.zone {
            form.push(("zone", zone));
        }
        if let Some(pool) = params.pool {
            form.push(("pool", pool));
        }
        for tag in params.tags {
            form.push(("tags", tag));
        }

        let machine: Machine = self.http.post_form("/machines/?op=allocate", &form).await?;
        info!("Allocated machine {} ({})", machine.system_id, machine.hostname);
        Ok(machine)
    }

    async fn get_machine(&self, system_id: &str) -> Result<Machine, MaasError> {
        self.http.get(&Self::machine_path(system_id), &[]).await
    }

    async fn list_machines(&self, filters: &[(&str, &str)]) -> Result<Vec<Machine>, MaasError> {
        self.http.get("/machines/", filters).await
    }

    async fn release_machine(&self, system_id: &str, force: bool) -> Result<(), MaasError> {
        let mut form: Form = Vec::new();
        if force {
            form.push(("force", "true".to_string()));
        }
        self.http
            .post_form_raw(&format!("{}?op=release", Self::machine_path(system_id)), &form)
            .await?;
        info!("Released machine {} (force: {})", system_id, force);
        Ok(())
    }

    async fn set_swap_size(&self, system_id: &str, bytes: u64) -> Result<Machine, MaasError> {
        let form: Form = vec![("swap_size", bytes.to_string())];
        self.http.put_form(&Self::machine_path(system_id), &form).await
    }

    async fn set_hostname(&self, system_id: &str, hostname: &str) -> Result<Machine, MaasError> {
        let form: Form = vec![("hostname", hostname.to_string())];
        self.http.put_form(&Self::machine_path(system_id), &form).await
    }

    async fn deploy(&self, system_id: &str, params: DeployParams) -> Result<Machine, MaasError> {
        let mut form: Form = Vec::new();
        if let Some(series) = params.distro_series {
            form.push(("distro_series", series));
        }
        if let Some(user_data) = params.user_data {
            form.push((
                "user_data",
                base64::engine::general_purpose::STANDARD.encode(user_data.as_bytes()),
            ));
        }
        let machine: Machine = self
            .http
            .post_form(&format!("{}?op=deploy", Self::machine_path(system_id)), &form)
            .await?;
        info!("Deploy started for machine {}", system_id);
        Ok(machine)
    }

    async fn power_on(&self, system_id: &str) -> Result<Machine, MaasError> {
        self.http
            .post_form(&format!("{}?op=power_on", Self::machine_path(system_id)), &Vec::new())
            .await
    }
}

#[async_trait::async_trait]
impl VmHostRegistry for MaasClient {
    async fn list_vm_hosts(&self) -> Result<Vec<VmHost>, MaasError> {
        self.http.get("/vm-hosts/", &[]).await
    }

    async fn get_vm_host(&self, id: u64) -> Result<VmHost, MaasError> {
        self.http.get(&format!("/vm-hosts/{}/", id), &[]).await
    }

    async fn compose_vm(&self, host_id: u64, params: ComposeParams) -> Result<ComposedVm, MaasError> {
        let mut form: Form = vec![
            ("cores", params.cores.to_string()),
            ("memory", params.memory.to_string()),
            ("hostname", params.hostname.clone()),
        ];
        if let Some(storage) = params.storage {
            form.push(("storage", storage));
        }
        if let Some(zone) = params.zone {
            form.push(("zone", zone.to_string()));
        }
        if let Some(pool) = params.pool {
            form.push(("pool", pool.to_string()));
        }
        if let Some(interfaces) = params.interfaces {
            form.push(("interfaces", interfaces));
        }

        let composed: ComposedVm = self
            .http
            .post_form(&format!("/vm-hosts/{}/?op=compose", host_id), &form)
            .await?;
        info!(
            "Composed VM {} ({}) on VM host {}",
            composed.system_id, params.hostname, host_id
        );
        Ok(composed)
    }

    async fn list_host_vms(&self, host_id: u64) -> Result<Vec<Machine>, MaasError> {
        let host = self.get_vm_host(host_id).await?;
        self.list_machines(&[("pod", host.name.as_str())]).await
    }
}

#[async_trait::async_trait]
impl NetworkInterfaceRegistry for MaasClient {
    async fn list_interfaces(&self, system_id: &str) -> Result<Vec<Interface>, MaasError> {
        self.http.get(&Self::interfaces_path(system_id), &[]).await
    }

    async fn get_interface(&self, system_id: &str, interface_id: u64) -> Result<Interface, MaasError> {
        self.http
            .get(&Self::interface_path(system_id, interface_id), &[])
            .await
    }

    async fn link_subnet(
        &self,
        system_id: &str,
        interface_id: u64,
        params: LinkSubnetParams,
    ) -> Result<Interface, MaasError> {
        let form = Self::link_form(&params);
        let iface: Interface = self
            .http
            .post_form(
                &format!("{}?op=link_subnet", Self::interface_path(system_id, interface_id)),
                &form,
            )
            .await?;
        info!(
            "Linked interface {} of {} to subnet {} ({})",
            iface.name,
            system_id,
            params.subnet,
            params.mode.as_param()
        );
        Ok(iface)
    }

    async fn unlink_subnet(
        &self,
        system_id: &str,
        interface_id: u64,
        link_id: u64,
    ) -> Result<Interface, MaasError> {
        let form: Form = vec![("id", link_id.to_string())];
        self.http
            .post_form(
                &format!("{}?op=unlink_subnet", Self::interface_path(system_id, interface_id)),
                &form,
            )
            .await
    }

    async fn set_boot_interface_static_ip(
        &self,
        system_id: &str,
        params: LinkSubnetParams,
    ) -> Result<Interface, MaasError> {
        let interface_id = self.boot_interface_id(system_id).await?;
        self.link_subnet(system_id, interface_id, params).await
    }

    async fn create_bridge_on_boot_interface(
        &self,
        system_id: &str,
        params: BridgeParams,
    ) -> Result<Interface, MaasError> {
        let parent = self.boot_interface_id(system_id).await?;
        let form: Form = vec![
            ("name", params.name.clone()),
            ("parent", parent.to_string()),
            ("bridge_stp", params.stp.to_string()),
            ("bridge_fd", params.forward_delay.to_string()),
        ];
        let bridge: Interface = self
            .http
            .post_form(
                &format!("{}?op=create_bridge", Self::interfaces_path(system_id)),
                &form,
            )
            .await?;
        info!("Created bridge {} on machine {}", bridge.name, system_id);
        Ok(bridge)
    }
}

#[async_trait::async_trait]
impl IpAddressRegistry for MaasClient {
    async fn get_ip_address(&self, ip: &str) -> Result<Option<IpAllocation>, MaasError> {
        let allocations: Vec<IpAllocation> = self
            .http
            .get("/ipaddresses/", &[("ip", ip), ("all", "true")])
            .await?;
        Ok(allocations.into_iter().find(|a| a.ip == ip))
    }

    async fn release_ip_address(&self, ip: &str, force: bool) -> Result<(), MaasError> {
        let mut form: Form = vec![("ip", ip.to_string())];
        if force {
            form.push(("force", "true".to_string()));
        }
        self.http.post_form_raw("/ipaddresses/?op=release", &form).await?;
        info!("Released IP address {} (force: {})", ip, force);
        Ok(())
    }
}

#[async_trait::async_trait]
impl TagRegistry for MaasClient {
    async fn create_tag(&self, name: &str) -> Result<Tag, MaasError> {
        match self.get_tag(name).await {
            Ok(tag) => {
                debug!("Tag {} already exists", name);
                return Ok(tag);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let form: Form = vec![("name", name.to_string())];
        match self.http.post_form::<Tag>("/tags/", &form).await {
            Ok(tag) => {
                info!("Created tag {}", name);
                Ok(tag)
            }
            // Lost a race with another creator
            Err(create_err) => self.get_tag(name).await.map_err(|_| create_err),
        }
    }

    async fn assign_tag(&self, name: &str, system_id: &str) -> Result<(), MaasError> {
        let form: Form = vec![("add", system_id.to_string())];
        self.http
            .post_form_raw(
                &format!("/tags/{}/?op=update_nodes", urlencoding::encode(name)),
                &form,
            )
            .await?;
        debug!("Assigned tag {} to {}", name, system_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_malformed_key() {
        let err = MaasClient::new("http://maas:5240/MAAS".to_string(), "not-a-key").unwrap_err();
        assert!(matches!(err, MaasError::Authentication(_)));
    }

    #[test]
    fn test_base_url_trimmed() {
        let client = MaasClient::new("http://maas:5240/MAAS/".to_string(), "a:b:c").unwrap();
        assert_eq!(client.base_url(), "http://maas:5240/MAAS");
    }

    #[test]
    fn test_link_form() {
        let params = LinkSubnetParams {
            mode: LinkMode::Static,
            subnet: "cidr:10.0.0.0/24".to_string(),
            ip_address: Some("10.0.0.5".to_string()),
            default_gateway: true,
        };
        let form = MaasClient::link_form(&params);
        assert_eq!(
            form,
            vec![
                ("mode", "STATIC".to_string()),
                ("subnet", "cidr:10.0.0.0/24".to_string()),
                ("ip_address", "10.0.0.5".to_string()),
                ("default_gateway", "true".to_string()),
            ]
        );
    }

    #[test]
    fn test_paths_are_encoded() {
        assert_eq!(MaasClient::machine_path("abc123"), "/machines/abc123/");
        assert_eq!(MaasClient::interface_path("abc123", 7), "/nodes/abc123/interfaces/7/");
    }
}
