//! Controller orchestration.
//!
//! Spawns one `kube_runtime::Controller` watch loop per CRD kind plus
//! a periodic garbage-collection sweep, and runs until the first loop
//! exits. The in-memory resource caches are primed once at startup by
//! [`SubnetService::init`]; after that every reconcile works against
//! the cached backend state.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::service::SubnetService;
use crds::{ChildSubnet, SubnetBinding, VirtualNetwork};
use futures::StreamExt;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use kube_runtime::{
    controller::{Action, Config as ControllerConfig},
    watcher, Controller as ResourceController,
};
use policy_client::{PolicyClient, PolicyClientTrait};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Interval between garbage-collection sweeps of backend resource
/// families whose owning ChildSubnet no longer exists.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Runtime configuration, read from the environment by `main`.
pub struct Config {
    /// Base URL of the policy API
    pub policy_url: String,
    /// Policy API token
    pub policy_token: String,
    /// Cluster identity stamped onto every backend resource tag
    pub cluster: String,
    /// Namespace to watch, or all namespaces when unset
    pub namespace: Option<String>,
    /// Whether IP blocks are resolved per project rather than shared
    pub project_scoped_blocks: bool,
}

/// Generic watch loop for one CRD kind.
///
/// `kube_runtime::Controller` handles reconnection and backoff; the
/// error policy requeues failed objects after a minute.
async fn watch_resource<K, F>(
    api: Api<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    resource_name: &str,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    F: Fn(
            Arc<Reconciler>,
            Arc<K>,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<Action, ControllerError>> + Send>,
        > + Send
        + Sync
        + Clone
        + 'static,
{
    info!("Starting {} watcher", resource_name);

    let error_policy = |obj: Arc<K>, error: &ControllerError, _ctx: Arc<Reconciler>| {
        error!(
            "Reconciliation error for {} {}: {}",
            resource_name,
            obj.name_any(),
            error
        );
        Action::requeue(Duration::from_secs(60))
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        let resource_name = resource_name.to_string();
        async move {
            debug!("Reconciling {} {}", resource_name, obj.name_any());
            reconcile_fn(ctx, obj).await
        }
    };

    // Debounce batches bursts of status updates; concurrency bounds
    // the number of in-flight backend sagas per kind.
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(5))
        .concurrency(3);

    ResourceController::new(api, watcher::Config::default())
        .with_config(controller_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            if let Err(e) = res {
                error!("Controller error for {}: {}", resource_name, e);
            }
        })
        .await;

    Ok(())
}

/// Lists the live UIDs of one CRD kind, or `None` when the listing
/// fails and the sweep should skip that kind for this cycle.
async fn live_uids<K>(api: &Api<K>, resource_name: &str) -> Option<HashSet<String>>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    match api.list(&ListParams::default()).await {
        Ok(list) => Some(list.items.iter().filter_map(|cr| cr.uid()).collect()),
        Err(e) => {
            error!("Stale sweep: failed to list {}: {}", resource_name, e);
            None
        }
    }
}

/// Periodic sweep: list the live UIDs per CRD kind and tear down any
/// cached backend family without an owner. Catches deletions missed
/// while the controller was down, since the CRDs carry no finalizers.
async fn sweep_loop(
    service: Arc<SubnetService>,
    child_subnet_api: Api<ChildSubnet>,
    subnet_binding_api: Api<SubnetBinding>,
    virtual_network_api: Api<VirtualNetwork>,
) -> Result<(), ControllerError> {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Some(live) = live_uids(&child_subnet_api, "ChildSubnets").await {
            debug!(live = live.len(), "Sweeping stale child subnet families");
            service.sweep_stale_child_subnets(&live).await;
        }
        if let Some(live) = live_uids(&subnet_binding_api, "SubnetBindings").await {
            debug!(live = live.len(), "Sweeping stale subnet binding maps");
            service.sweep_stale_subnet_bindings(&live).await;
        }
        if let Some(live) = live_uids(&virtual_network_api, "VirtualNetworks").await {
            debug!(live = live.len(), "Sweeping stale parent configurations");
            service.sweep_stale_virtual_networks(&live);
        }
    }
}

/// Main controller for the vnetops subnet operator.
pub struct VnetController {
    child_subnet_watcher: JoinHandle<Result<(), ControllerError>>,
    subnet_binding_watcher: JoinHandle<Result<(), ControllerError>>,
    virtual_network_watcher: JoinHandle<Result<(), ControllerError>>,
    sweeper: JoinHandle<Result<(), ControllerError>>,
}

impl VnetController {
    /// Creates a new controller instance: validates backend
    /// connectivity, primes the resource caches, and spawns the watch
    /// loops.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing vnetops subnet controller");

        let kube_client = Client::try_default().await.map_err(ControllerError::Kube)?;

        let policy_client =
            PolicyClient::new(config.policy_url.clone(), config.policy_token)?;
        info!("Validating policy API token and connectivity...");
        policy_client.validate_token().await.map_err(|e| {
            error!(
                "Failed to validate policy API token against {}: {}",
                config.policy_url, e
            );
            ControllerError::Policy(e)
        })?;
        info!("Policy API token validated and connectivity established");

        let service = Arc::new(SubnetService::new(
            Arc::new(policy_client),
            config.cluster,
            config.project_scoped_blocks,
        ));
        info!("Priming resource caches from the policy API...");
        service.init().await?;
        info!("Resource caches primed");

        let (child_subnet_api, subnet_binding_api, virtual_network_api) =
            match config.namespace.as_deref() {
                Some(ns) => (
                    Api::<ChildSubnet>::namespaced(kube_client.clone(), ns),
                    Api::<SubnetBinding>::namespaced(kube_client.clone(), ns),
                    Api::<VirtualNetwork>::namespaced(kube_client.clone(), ns),
                ),
                None => (
                    Api::<ChildSubnet>::all(kube_client.clone()),
                    Api::<SubnetBinding>::all(kube_client.clone()),
                    Api::<VirtualNetwork>::all(kube_client.clone()),
                ),
            };

        let reconciler = Arc::new(Reconciler::new(
            service.clone(),
            child_subnet_api.clone(),
            subnet_binding_api.clone(),
            virtual_network_api.clone(),
        ));

        let child_subnet_watcher = {
            let reconciler = reconciler.clone();
            let api = child_subnet_api.clone();
            tokio::spawn(async move {
                watch_resource(
                    api,
                    reconciler,
                    |reconciler, resource| {
                        Box::pin(async move { reconciler.reconcile_child_subnet(resource).await })
                    },
                    "ChildSubnet",
                )
                .await
            })
        };

        let subnet_binding_watcher = {
            let reconciler = reconciler.clone();
            let api = subnet_binding_api.clone();
            tokio::spawn(async move {
                watch_resource(
                    api,
                    reconciler,
                    |reconciler, resource| {
                        Box::pin(
                            async move { reconciler.reconcile_subnet_binding(resource).await },
                        )
                    },
                    "SubnetBinding",
                )
                .await
            })
        };

        let virtual_network_watcher = {
            let reconciler = reconciler.clone();
            let api = virtual_network_api.clone();
            tokio::spawn(async move {
                watch_resource(
                    api,
                    reconciler,
                    |reconciler, resource| {
                        Box::pin(
                            async move { reconciler.reconcile_virtual_network(resource).await },
                        )
                    },
                    "VirtualNetwork",
                )
                .await
            })
        };

        let sweeper = tokio::spawn(sweep_loop(
            service,
            child_subnet_api,
            subnet_binding_api,
            virtual_network_api,
        ));

        Ok(Self {
            child_subnet_watcher,
            subnet_binding_watcher,
            virtual_network_watcher,
            sweeper,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("vnetops subnet controller running");

        // Wait for any loop to exit (they should run forever)
        tokio::select! {
            result = &mut self.child_subnet_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("ChildSubnet watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("ChildSubnet watcher error: {}", e)))?;
            }
            result = &mut self.subnet_binding_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("SubnetBinding watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("SubnetBinding watcher error: {}", e)))?;
            }
            result = &mut self.virtual_network_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("VirtualNetwork watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("VirtualNetwork watcher error: {}", e)))?;
            }
            result = &mut self.sweeper => {
                result.map_err(|e| ControllerError::Watch(format!("sweep loop panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("sweep loop error: {}", e)))?;
            }
        }

        Ok(())
    }
}
