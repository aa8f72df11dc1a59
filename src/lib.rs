pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod webhooks;

pub use config::{LEADER_LEASE_NAME, OperatorConfig};
pub use controller::{BackoffConfig, Context, Error, Result, ZK_FINALIZER, error_policy, reconcile};
pub use crd::{BookkeeperCluster, BookkeeperClusterSpec, BookkeeperClusterStatus};
pub use health::{HealthState, Metrics};
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::controller::{self as kube_controller, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

/// Namespace a watch is limited to; `None` watches every namespace
#[derive(Clone, Copy, Debug)]
struct WatchScope<'a>(Option<&'a str>);

impl WatchScope<'_> {
    fn api<K>(&self, client: &Client) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
        K::DynamicType: Default,
    {
        match self.0 {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        }
    }
}

/// Run the BookkeeperCluster controller until its watch stream ends.
///
/// Changes to the owned StatefulSet, ConfigMap, headless Service and
/// PodDisruptionBudget requeue their cluster, so drift in any child is
/// repaired on the next pass.
pub async fn run_controller(
    client: Client,
    config: Arc<OperatorConfig>,
    health_state: Option<Arc<HealthState>>,
) {
    let scope = WatchScope(config.watch_namespace.as_deref());
    info!(scope = scope.0.unwrap_or("cluster-wide"), "starting BookkeeperCluster controller");

    let watch = watcher::Config::default().any_semantic();
    let clusters: Api<BookkeeperCluster> = scope.api(&client);
    let controller = Controller::new(clusters, watch.clone())
        .owns(scope.api::<StatefulSet>(&client), watch.clone())
        .owns(scope.api::<ConfigMap>(&client), watch.clone())
        .owns(scope.api::<Service>(&client), watch.clone())
        .owns(scope.api::<PodDisruptionBudget>(&client), watch);

    if let Some(state) = &health_state {
        state.set_ready(true);
    }
    let ctx = Arc::new(Context::new(client, config.clone(), health_state));

    controller
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((cluster, _)) => debug!(cluster = %cluster.name, "reconciled"),
                // Events from children can arrive after their cluster is gone
                Err(kube_controller::Error::ReconcilerFailed(err, cluster)) if err.is_not_found() => {
                    debug!(cluster = %cluster.name, "cluster no longer exists");
                }
                Err(kube_controller::Error::ReconcilerFailed(err, cluster)) => {
                    warn!(cluster = %cluster.name, error = %err, "reconcile failed");
                }
                Err(e) => error!(error = %e, "controller error"),
            }
        })
        .await;

    error!("controller stream ended");
}
