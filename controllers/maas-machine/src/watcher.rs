//! Kubernetes resource watcher.
//!
//! Watches MaasMachine resources with kube_runtime::Controller and runs each
//! event through the finalizer, so deletion releases the MAAS instance before
//! the object goes away.

use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::{Reconciler, machine_key};
use crds::MaasMachine;
use futures::StreamExt;
use kube::{Api, Client, ResourceExt};
use kube_runtime::finalizer::{Error as FinalizerError, Event, finalizer};
use kube_runtime::{
    Controller, watcher,
    controller::{Action, Config as ControllerConfig},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Finalizer guarding release of the MAAS instance
pub const FINALIZER: &str = "dcops.microscaler.io/maas-machine-finalizer";

/// Shared state handed to every reconcile call
struct WatchContext {
    reconciler: Arc<Reconciler>,
    client: Client,
}

/// Watches MaasMachine resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: Client,
    maas_machine_api: Api<MaasMachine>,
    metrics: Arc<Metrics>,
}

impl Watcher {
    pub fn new(
        reconciler: Arc<Reconciler>,
        client: Client,
        maas_machine_api: Api<MaasMachine>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            reconciler,
            client,
            maas_machine_api,
            metrics,
        }
    }

    /// Watch MaasMachine resources until the stream ends
    pub async fn watch_maas_machines(&self) -> Result<(), ControllerError> {
        info!("Starting MaasMachine watcher");
        let ctx = Arc::new(WatchContext {
            reconciler: self.reconciler.clone(),
            client: self.client.clone(),
        });

        // Debounce batches status writes from our own passes
        let controller_config = ControllerConfig::default()
            .debounce(Duration::from_secs(5))
            .concurrency(3);

        self.metrics.set_ready(true);
        Controller::new(self.maas_machine_api.clone(), watcher::Config::default())
            .with_config(controller_config)
            .run(reconcile, error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled MaasMachine {}", obj),
                    Err(e) => error!("Controller error for MaasMachine: {}", e),
                }
            })
            .await;
        self.metrics.set_ready(false);

        Err(ControllerError::Watch(
            "MaasMachine watch stream ended".to_string(),
        ))
    }
}

async fn reconcile(
    obj: Arc<MaasMachine>,
    ctx: Arc<WatchContext>,
) -> Result<Action, FinalizerError<ControllerError>> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    debug!("Reconciling MaasMachine {}/{}", namespace, obj.name_any());
    let api: Api<MaasMachine> = Api::namespaced(ctx.client.clone(), &namespace);
    let reconciler = ctx.reconciler.clone();

    finalizer(&api, FINALIZER, obj, |event| async move {
        match event {
            Event::Apply(machine) => reconciler.reconcile_maas_machine(&machine).await,
            Event::Cleanup(machine) => {
                info!("MaasMachine {} deleted, releasing its instance", machine.name_any());
                reconciler.cleanup_maas_machine(&machine).await
            }
        }
    })
    .await
}

fn error_policy(
    obj: Arc<MaasMachine>,
    error: &FinalizerError<ControllerError>,
    ctx: Arc<WatchContext>,
) -> Action {
    let key = machine_key(&obj);
    match error {
        FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => {
            ctx.reconciler.error_action(&key, e)
        }
        other => {
            error!("Finalizer error for MaasMachine {}: {}", key, other);
            Action::requeue(Duration::from_secs(60))
        }
    }
}
