//! Reconciliation logic for BookkeeperCluster resources
//!
//! Every pass runs the same fixed pipeline and stops at the first error; the
//! controller retries the whole pass later:
//!
//! 1. fetch the cluster (gone means nothing to do)
//! 2. apply spec defaults, persisting and stopping if anything changed
//! 3. finalizer membership and, on deletion, metadata cleanup
//! 4. ConfigMap, PodDisruptionBudget and headless Service
//! 5. the bookie StatefulSet, restarting bookies left on an older template
//! 6. replica count and orphan pruning
//! 7. rollout forward step
//! 8. rollback trigger
//! 9. status, written once
//!
//! Status changes from steps 7 to 9 accumulate in memory and are persisted
//! together at the end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::cleanup::{
    self, PRAVEGA_CLUSTER_ANNOTATION, PRAVEGA_CLUSTER_NAME_KEY, TERMINATION_POLL_INTERVAL,
    TERMINATION_TIMEOUT,
};
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::restart::restart_cluster_pods;
use crate::controller::rollout::{self, is_pod_ready};
use crate::controller::status::{StatusManager, status_changed};
use crate::controller::validation::same_version;
use crate::controller::wait::Poller;
use crate::crd::{BookkeeperCluster, BookkeeperClusterStatus};
use crate::resources::common::{
    FIELD_MANAGER, bookie_selector_labels, config_map_name, headless_service_name, is_orphan,
    pdb_name, selector_string, statefulset_name,
};
use crate::resources::statefulset::recorded_template_hash;
use crate::resources::{configmap, pdb, service, statefulset};

/// Re-poll interval after a successful pass
pub const REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<BookkeeperCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    let result = run(&name, &ns, &ctx).await;

    if let Some(health) = &ctx.health_state {
        match &result {
            Ok(_) => health
                .metrics
                .record_reconcile(&ns, &name, start.elapsed().as_secs_f64()),
            Err(_) => health.metrics.record_error(&ns, &name),
        }
    }

    match result {
        Ok(action) => {
            debug!("Reconciliation completed successfully");
            Ok(action)
        }
        Err(e) => {
            error!("Reconciliation failed: {}", e);
            Err(e)
        }
    }
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<BookkeeperCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    let key = format!("{}/{}", cluster.namespace().unwrap_or_default(), name);
    let attempt = ctx.retries.record_failure(&key);
    let delay = BackoffConfig::default().delay_for_error(error, attempt);

    let class = error.class();
    if error.is_conflict() {
        // A stale read; the next pass starts from the current object
        debug!(%name, ?delay, "write conflict, retrying");
    } else if error.is_retryable() {
        warn!(%name, ?class, %error, ?delay, attempt, "reconcile failed, retrying");
    } else {
        error!(%name, ?class, %error, ?delay, "reconcile failed, waiting for the object to change");
    }

    Action::requeue(delay)
}

async fn run(name: &str, ns: &str, ctx: &Context) -> Result<Action> {
    let api: Api<BookkeeperCluster> = Api::namespaced(ctx.client.clone(), ns);

    // 1. The object may be gone already
    let Some(cluster) = api.get_opt(name).await? else {
        debug!("BookkeeperCluster not found, nothing to do");
        return Ok(Action::await_change());
    };

    // 2. Defaults first, so nothing below sees a partial spec
    let mut spec = cluster.spec.clone();
    if spec.with_defaults(ctx.config.test_mode) {
        info!("Applying spec defaults");
        let patch = serde_json::json!({ "spec": spec });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // 3. Finalizer
    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, ctx, ns).await;
    }
    if !ctx.config.disable_finalizer && cleanup::find_finalizer(cluster.finalizers()).is_none() {
        add_cleanup_finalizer(&cluster, ctx, ns).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // 4. Child resources
    reconcile_config_map(&cluster, ctx, ns).await?;
    reconcile_pdb(&cluster, ctx, ns).await?;
    reconcile_service(&cluster, ctx, ns).await?;

    // 5 and 6. Workload
    reconcile_statefulset(&cluster, ctx, ns).await?;
    sync_replicas(&cluster, ctx, ns).await?;

    // 7 and 8. Rollout
    let mut status = cluster.status.clone().unwrap_or_default();
    status.init();
    rollout::sync_cluster_version(&cluster, &mut status, ctx).await?;
    rollout::rollback_failed_upgrade(&cluster, &mut status, ctx).await?;

    // 9. Status last
    refresh_members(&cluster, &mut status, ctx, ns).await?;
    if status_changed(&cluster, &status) {
        StatusManager::new(&cluster, ctx, ns).update(&status).await?;
    }
    if let Some(health) = &ctx.health_state {
        health.metrics.set_cluster_replicas(
            ns,
            name,
            i64::from(cluster.spec.replicas),
            i64::from(status.ready_replicas),
        );
    }

    ctx.retries.reset(&format!("{}/{}", ns, name));
    Ok(Action::requeue(REQUEUE_INTERVAL))
}

/// The pod template belongs to the rollout engine.
///
/// True while a version change is pending or in flight, and after a failed
/// rollout until a rollback has brought the cluster back.
fn rollout_pending(cluster: &BookkeeperCluster) -> bool {
    cluster.status.as_ref().is_some_and(|s| {
        !s.target_version.is_empty()
            || s.is_cluster_in_upgrading_state()
            || s.is_cluster_in_rollback_state()
            || s.is_cluster_in_error_state()
            || (!s.current_version.is_empty() && !same_version(&s.current_version, &cluster.spec.version))
    })
}

/// Pravega cluster named in the user's environment ConfigMap, if any
async fn pravega_cluster_from_env_vars(
    cluster: &BookkeeperCluster,
    ctx: &Context,
    ns: &str,
) -> Result<Option<String>> {
    let Some(env_vars) = cluster.spec.env_vars_config_map() else {
        return Ok(None);
    };
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), ns);
    let cm = api.get(env_vars).await?;
    Ok(cm
        .data
        .and_then(|mut data| data.remove(PRAVEGA_CLUSTER_NAME_KEY))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty()))
}

async fn add_cleanup_finalizer(cluster: &BookkeeperCluster, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<BookkeeperCluster> = Api::namespaced(ctx.client.clone(), ns);
    let name = cluster.name_any();

    let pravega_cluster = pravega_cluster_from_env_vars(cluster, ctx, ns).await?;
    let finalizer = cleanup::finalizer_name(pravega_cluster.as_deref());
    cleanup::add_finalizer(&api, &name, &finalizer).await?;

    let annotation = pravega_cluster.unwrap_or_else(|| cleanup::DEFAULT_PRAVEGA_CLUSTER_NAME.to_string());
    let patch = serde_json::json!({
        "metadata": { "annotations": { (PRAVEGA_CLUSTER_ANNOTATION): annotation } }
    });
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    info!(finalizer = %finalizer, "Added finalizer");
    Ok(())
}

/// Tear down bookies, remove coordination metadata, then release the object
async fn handle_deletion(cluster: &BookkeeperCluster, ctx: &Context, ns: &str) -> Result<Action> {
    let name = cluster.name_any();
    let Some(finalizer) = cleanup::find_finalizer(cluster.finalizers()).map(String::from) else {
        return Ok(Action::await_change());
    };
    let api: Api<BookkeeperCluster> = Api::namespaced(ctx.client.clone(), ns);
    if ctx.config.disable_finalizer {
        // Added before finalizer handling was turned off; release it without cleanup
        cleanup::remove_finalizer(&api, &name, &finalizer).await?;
        info!(finalizer = %finalizer, "Finalizer handling disabled, removed finalizer without cleanup");
        return Ok(Action::await_change());
    }
    info!("Handling deletion of {}", name);

    // Dependents are only collected once the owner is gone, so stop the bookies here
    let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), ns);
    match sts_api
        .delete(&statefulset_name(&name), &DeleteParams::background())
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let poller = Poller::new(TERMINATION_POLL_INTERVAL, TERMINATION_TIMEOUT);
    cleanup::wait_for_cluster_to_terminate(&pods, cluster, &poller).await?;

    let pravega_cluster = cleanup::resolve_pravega_cluster(cluster);
    if let Err(e) = ctx
        .metadata_cleanup
        .cleanup(&cluster.spec.zookeeper_uri, ns, &pravega_cluster)
        .await
    {
        let message = format!(
            "failed to cleanup {} metadata from zookeeper (znode path: {}): {}",
            name,
            cleanup::pravega_znode_path(&pravega_cluster),
            e
        );
        ctx.publish_warning_event(cluster, "ZkMetaCleanupFailed", "Cleanup", Some(message.clone()))
            .await;
        return Err(Error::CleanupError(message));
    }

    cleanup::remove_finalizer(&api, &name, &finalizer).await?;
    info!("Removed finalizer from {}", name);

    Ok(Action::await_change())
}

async fn reconcile_config_map(cluster: &BookkeeperCluster, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), ns);
    let desired = configmap::generate_config_map(cluster);
    let cm_name = config_map_name(&cluster.name_any());

    let Some(mut live) = api.get_opt(&cm_name).await? else {
        create_if_absent(&api, &desired).await?;
        info!(configmap = %cm_name, "Created ConfigMap");
        return Ok(());
    };

    if !configmap::config_map_changed(&live, &desired) {
        return Ok(());
    }

    // Bookies pick this up when the template hash change restarts them
    live.data = desired.data;
    api.replace(&cm_name, &PostParams::default(), &live).await?;
    info!(configmap = %cm_name, "Updated ConfigMap");
    Ok(())
}

async fn reconcile_pdb(cluster: &BookkeeperCluster, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<PodDisruptionBudget> = Api::namespaced(ctx.client.clone(), ns);
    let desired = pdb::generate_pdb(cluster);
    let pdb_name = pdb_name(&cluster.name_any());

    let Some(live) = api.get_opt(&pdb_name).await? else {
        create_if_absent(&api, &desired).await?;
        return Ok(());
    };

    if let Some(max_unavailable) = pdb::max_unavailable_update(&live, &desired) {
        let patch = serde_json::json!({ "spec": { "maxUnavailable": max_unavailable } });
        api.patch(&pdb_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        info!(pdb = %pdb_name, "Updated PodDisruptionBudget maxUnavailable");
    }
    Ok(())
}

async fn reconcile_service(cluster: &BookkeeperCluster, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), ns);
    if api
        .get_opt(&headless_service_name(&cluster.name_any()))
        .await?
        .is_none()
    {
        create_if_absent(&api, &service::generate_headless_service(cluster)).await?;
    }
    Ok(())
}

async fn reconcile_statefulset(cluster: &BookkeeperCluster, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), ns);
    let desired = statefulset::generate_statefulset(cluster);
    let sts_name = statefulset_name(&cluster.name_any());

    let Some(live) = api.get_opt(&sts_name).await? else {
        create_if_absent(&api, &desired).await?;
        info!(statefulset = %sts_name, "Created StatefulSet");
        return Ok(());
    };

    if rollout_pending(cluster) {
        debug!("Rollout pending, leaving the pod template to the rollout");
        return Ok(());
    }

    let (Some(live_spec), Some(desired_spec)) = (live.spec.clone(), desired.spec) else {
        return Err(Error::MissingObjectKey(".spec"));
    };
    let desired_hash = desired_spec
        .template
        .metadata
        .as_ref()
        .and_then(recorded_template_hash)
        .map(String::from)
        .ok_or(Error::MissingObjectKey(".spec.template.metadata.annotations"))?;

    let live_hash = live_spec.template.metadata.as_ref().and_then(recorded_template_hash);
    if live_hash != Some(desired_hash.as_str()) {
        let mut updated = live;
        updated.spec = Some(StatefulSetSpec {
            template: desired_spec.template,
            ..live_spec
        });
        api.replace(&sts_name, &PostParams::default(), &updated).await?;
        info!(statefulset = %sts_name, "Pod template changed");
    }

    // Also finishes a sweep an earlier pass could not complete
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let restarted = restart_cluster_pods(&pods, &cluster.name_any(), &desired_hash).await?;
    if restarted > 0 {
        info!(restarted, "Bookies restarted on the current template");
    }
    Ok(())
}

async fn sync_replicas(cluster: &BookkeeperCluster, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), ns);
    let cluster_name = cluster.name_any();
    let sts_name = statefulset_name(&cluster_name);
    let sts = api.get(&sts_name).await?;

    let current = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let desired = cluster.spec.replicas;
    if current == desired {
        return Ok(());
    }

    let patch = serde_json::json!({ "spec": { "replicas": desired } });
    api.patch(&sts_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    info!(from = current, to = desired, "Scaled StatefulSet");

    let params = ListParams::default().labels(&selector_string(&bookie_selector_labels(&cluster_name)));

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), ns);
    for pvc in pvcs.list(&params).await?.items {
        let pvc_name = pvc.name_any();
        if is_orphan(&pvc_name, desired) {
            delete_ignoring_missing(&pvcs, &pvc_name).await?;
            info!(pvc = %pvc_name, "Deleted orphan PersistentVolumeClaim");
        }
    }

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), ns);
    for svc in services.list(&params).await?.items {
        let svc_name = svc.name_any();
        if is_orphan(&svc_name, desired) {
            delete_ignoring_missing(&services, &svc_name).await?;
            info!(service = %svc_name, "Deleted orphan Service");
        }
    }
    Ok(())
}

/// Record member readiness and replica counters in `status`
async fn refresh_members(
    cluster: &BookkeeperCluster,
    status: &mut BookkeeperClusterStatus,
    ctx: &Context,
    ns: &str,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let params = ListParams::default().labels(&selector_string(&bookie_selector_labels(&cluster.name_any())));

    let (ready, unready): (Vec<Pod>, Vec<Pod>) = pods
        .list(&params)
        .await?
        .items
        .into_iter()
        .partition(is_pod_ready);
    let ready: Vec<String> = ready.iter().map(|p| p.name_any()).collect();
    let unready: Vec<String> = unready.iter().map(|p| p.name_any()).collect();

    let expected = cluster.expected_size();
    if i32::try_from(ready.len()).unwrap_or(i32::MAX) == expected {
        status.set_pods_ready_condition_true();
    } else {
        status.set_pods_ready_condition_false();
    }
    status.set_members(ready, unready);
    status.replicas = expected;
    Ok(())
}

async fn create_if_absent<T>(api: &Api<T>, resource: &T) -> Result<()>
where
    T: kube::Resource + serde::Serialize + serde::de::DeserializeOwned + Clone + std::fmt::Debug,
{
    match api.create(&PostParams::default(), resource).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!("{} already exists", resource.name_any());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn delete_ignoring_missing<T>(api: &Api<T>, name: &str) -> Result<()>
where
    T: kube::Resource + serde::de::DeserializeOwned + Clone + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
