//! Durable provisioning state.
//!
//! The checkpoint (the MAAS system_id recorded in `status.instanceId`) is the
//! only thing the engine treats as "an instance already exists". Writes go
//! through [`StatePersister`], which the Kubernetes implementation backs with
//! resourceVersion-guarded merge patches retried on conflict.

use crate::error::ControllerError;
use crds::{MaasMachine, MaasMachineStatus};
use kube::Api;
use kube::api::{ListParams, Patch, PatchParams};
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, warn};

/// Attempts for a conflicting write before giving up
pub const CONFLICT_RETRY_ATTEMPTS: usize = 5;

/// Namespaced name of a MaasMachine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineKey {
    pub namespace: String,
    pub name: String,
}

impl MachineKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for MachineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identifiers recorded once an instance exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub instance_id: String,
    /// `maas:///<zone>/<system_id>`
    pub provider_id: String,
    pub failure_domain: Option<String>,
    pub hostname: Option<String>,
}

impl Checkpoint {
    pub fn new(instance_id: &str, zone: Option<&str>, hostname: Option<&str>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            provider_id: provider_id(zone, instance_id),
            failure_domain: zone.map(str::to_string),
            hostname: hostname.map(str::to_string),
        }
    }
}

pub fn provider_id(zone: Option<&str>, system_id: &str) -> String {
    format!("maas:///{}/{}", zone.unwrap_or("default"), system_id)
}

/// What a pass starts from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub checkpoint: Option<Checkpoint>,
    pub annotations: BTreeMap<String, String>,
    /// Last published status, used for sticky readiness
    pub status: Option<MaasMachineStatus>,
}

/// Read and write the durable state of one MaasMachine
#[async_trait::async_trait]
pub trait StatePersister: Send + Sync {
    async fn load(&self, key: &MachineKey) -> Result<PersistedState, ControllerError>;
    async fn record_instance(
        &self,
        key: &MachineKey,
        checkpoint: &Checkpoint,
    ) -> Result<(), ControllerError>;
    async fn clear_instance(&self, key: &MachineKey) -> Result<(), ControllerError>;
    async fn set_annotation(
        &self,
        key: &MachineKey,
        name: &str,
        value: &str,
    ) -> Result<(), ControllerError>;
    /// Publish observed fields. Never touches the checkpoint.
    async fn publish_status(
        &self,
        key: &MachineKey,
        status: &MaasMachineStatus,
    ) -> Result<(), ControllerError>;
}

/// Static IPs declared by the MaasMachines of a namespace
#[async_trait::async_trait]
pub trait PeerDirectory: Send + Sync {
    /// `(name, address)` pairs
    async fn list_static_ips(
        &self,
        namespace: &str,
    ) -> Result<Vec<(String, String)>, ControllerError>;
}

/// Run `op`, retrying while the API server answers 409 Conflict
pub async fn retry_on_conflict<T, F, Fut>(attempts: usize, mut op: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < attempts => {
                debug!("Write conflict (attempt {}/{}), retrying with fresh read", attempt, attempts);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// StatePersister and PeerDirectory backed by the MaasMachine objects
#[derive(Clone)]
pub struct KubeStatePersister {
    client: kube::Client,
}

impl KubeStatePersister {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<MaasMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Merge-patch the status guarded by the live resourceVersion
    async fn guarded_status_patch(
        &self,
        key: &MachineKey,
        status: serde_json::Value,
    ) -> Result<(), ControllerError> {
        let api = self.api(&key.namespace);
        retry_on_conflict(CONFLICT_RETRY_ATTEMPTS, || {
            let api = api.clone();
            let status = status.clone();
            async move {
                let live = api.get(&key.name).await?;
                let patch = serde_json::json!({
                    "metadata": { "resourceVersion": live.metadata.resource_version },
                    "status": status,
                });
                api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
            }
        })
        .await
        .map(|_| ())
        .map_err(|e| ControllerError::Persist(format!("status of {}: {}", key, e)))
    }
}

#[async_trait::async_trait]
impl StatePersister for KubeStatePersister {
    async fn load(&self, key: &MachineKey) -> Result<PersistedState, ControllerError> {
        let machine = match self.api(&key.namespace).get(&key.name).await {
            Ok(m) => m,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(PersistedState::default()),
            Err(e) => return Err(ControllerError::Persist(format!("load {}: {}", key, e))),
        };
        let checkpoint = machine.status.as_ref().and_then(|s| {
            s.instance_id.as_ref().map(|id| Checkpoint {
                instance_id: id.clone(),
                provider_id: s
                    .provider_id
                    .clone()
                    .unwrap_or_else(|| provider_id(s.failure_domain.as_deref(), id)),
                failure_domain: s.failure_domain.clone(),
                hostname: s.hostname.clone(),
            })
        });
        Ok(PersistedState {
            checkpoint,
            annotations: machine.metadata.annotations.clone().unwrap_or_default(),
            status: machine.status,
        })
    }

    async fn record_instance(
        &self,
        key: &MachineKey,
        checkpoint: &Checkpoint,
    ) -> Result<(), ControllerError> {
        self.guarded_status_patch(
            key,
            serde_json::json!({
                "instanceId": checkpoint.instance_id,
                "providerId": checkpoint.provider_id,
                "failureDomain": checkpoint.failure_domain,
                "hostname": checkpoint.hostname,
            }),
        )
        .await
    }

    async fn clear_instance(&self, key: &MachineKey) -> Result<(), ControllerError> {
        self.guarded_status_patch(
            key,
            serde_json::json!({
                "instanceId": null,
                "providerId": null,
            }),
        )
        .await
    }

    async fn set_annotation(
        &self,
        key: &MachineKey,
        name: &str,
        value: &str,
    ) -> Result<(), ControllerError> {
        let api = self.api(&key.namespace);
        retry_on_conflict(CONFLICT_RETRY_ATTEMPTS, || {
            let api = api.clone();
            async move {
                let live = api.get(&key.name).await?;
                let patch = serde_json::json!({
                    "metadata": {
                        "resourceVersion": live.metadata.resource_version,
                        "annotations": { name: value },
                    }
                });
                api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
            }
        })
        .await
        .map(|_| ())
        .map_err(|e| ControllerError::Persist(format!("annotate {}: {}", key, e)))
    }

    async fn publish_status(
        &self,
        key: &MachineKey,
        status: &MaasMachineStatus,
    ) -> Result<(), ControllerError> {
        let mut value = serde_json::to_value(status)
            .map_err(|e| ControllerError::Persist(format!("encode status: {}", e)))?;
        if let Some(fields) = value.as_object_mut() {
            fields.remove("instanceId");
            fields.remove("providerId");
            fields.insert("error".to_string(), serde_json::json!(status.error));
            fields.insert("addresses".to_string(), serde_json::json!(status.addresses));
        }
        let patch = serde_json::json!({ "status": value });
        self.api(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| ControllerError::Persist(format!("publish status of {}: {}", key, e)))
    }
}

#[async_trait::async_trait]
impl PeerDirectory for KubeStatePersister {
    async fn list_static_ips(
        &self,
        namespace: &str,
    ) -> Result<Vec<(String, String)>, ControllerError> {
        let machines = self
            .api(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| ControllerError::Persist(format!("list MaasMachines: {}", e)))?;
        Ok(machines
            .items
            .into_iter()
            .filter_map(|m| {
                let address = m.spec.static_ip.as_ref()?.address.clone();
                Some((m.metadata.name.unwrap_or_default(), address))
            })
            .collect())
    }
}

#[cfg(test)]
pub use memory::MemoryStatePersister;

#[cfg(test)]
mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default, Clone)]
    struct MemoryRecord {
        checkpoint: Option<Checkpoint>,
        annotations: BTreeMap<String, String>,
        status: Option<MaasMachineStatus>,
        static_ip: Option<String>,
    }

    /// In-memory StatePersister and PeerDirectory
    #[derive(Debug, Default)]
    pub struct MemoryStatePersister {
        records: Mutex<HashMap<MachineKey, MemoryRecord>>,
        fail_next_record: Mutex<bool>,
        fail_peer_listing: Mutex<bool>,
        status_writes: Mutex<usize>,
    }

    impl MemoryStatePersister {
        pub fn new() -> Self {
            Self::default()
        }

        fn with_record<T>(&self, key: &MachineKey, f: impl FnOnce(&mut MemoryRecord) -> T) -> T {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            f(records.entry(key.clone()).or_default())
        }

        /// Declare a static IP for a peer machine
        pub fn declare_static_ip(&self, key: &MachineKey, address: &str) {
            self.with_record(key, |r| r.static_ip = Some(address.to_string()));
        }

        /// Make the next `record_instance` fail as if the write was lost
        pub fn fail_next_record(&self) {
            *self.fail_next_record.lock().unwrap_or_else(|e| e.into_inner()) = true;
        }

        pub fn fail_peer_listing(&self) {
            *self.fail_peer_listing.lock().unwrap_or_else(|e| e.into_inner()) = true;
        }

        pub fn checkpoint(&self, key: &MachineKey) -> Option<Checkpoint> {
            self.with_record(key, |r| r.checkpoint.clone())
        }

        pub fn annotation(&self, key: &MachineKey, name: &str) -> Option<String> {
            self.with_record(key, |r| r.annotations.get(name).cloned())
        }

        pub fn status(&self, key: &MachineKey) -> Option<MaasMachineStatus> {
            self.with_record(key, |r| r.status.clone())
        }

        /// Number of `publish_status` calls so far
        pub fn status_writes(&self) -> usize {
            *self.status_writes.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    #[async_trait::async_trait]
    impl StatePersister for MemoryStatePersister {
        async fn load(&self, key: &MachineKey) -> Result<PersistedState, ControllerError> {
            Ok(self.with_record(key, |r| PersistedState {
                checkpoint: r.checkpoint.clone(),
                annotations: r.annotations.clone(),
                status: r.status.clone(),
            }))
        }

        async fn record_instance(
            &self,
            key: &MachineKey,
            checkpoint: &Checkpoint,
        ) -> Result<(), ControllerError> {
            {
                let mut fail = self.fail_next_record.lock().unwrap_or_else(|e| e.into_inner());
                if *fail {
                    *fail = false;
                    return Err(ControllerError::Persist(format!("status of {}: conflict", key)));
                }
            }
            self.with_record(key, |r| r.checkpoint = Some(checkpoint.clone()));
            Ok(())
        }

        async fn clear_instance(&self, key: &MachineKey) -> Result<(), ControllerError> {
            self.with_record(key, |r| r.checkpoint = None);
            Ok(())
        }

        async fn set_annotation(
            &self,
            key: &MachineKey,
            name: &str,
            value: &str,
        ) -> Result<(), ControllerError> {
            self.with_record(key, |r| {
                r.annotations.insert(name.to_string(), value.to_string())
            });
            Ok(())
        }

        async fn publish_status(
            &self,
            key: &MachineKey,
            status: &MaasMachineStatus,
        ) -> Result<(), ControllerError> {
            self.with_record(key, |r| r.status = Some(status.clone()));
            *self.status_writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl PeerDirectory for MemoryStatePersister {
        async fn list_static_ips(
            &self,
            namespace: &str,
        ) -> Result<Vec<(String, String)>, ControllerError> {
            if *self.fail_peer_listing.lock().unwrap_or_else(|e| e.into_inner()) {
                warn!("Peer listing unavailable");
                return Err(ControllerError::Persist("list MaasMachines: unavailable".to_string()));
            }
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let mut peers: Vec<(String, String)> = records
                .iter()
                .filter(|(k, _)| k.namespace == namespace)
                .filter_map(|(k, r)| r.static_ip.clone().map(|ip| (k.name.clone(), ip)))
                .collect();
            peers.sort();
            Ok(peers)
        }
    }
}
