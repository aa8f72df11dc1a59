//! Version rollout engine
//!
//! Moves the bookies from `status.currentVersion` to `status.targetVersion`
//! one pod per reconcile pass. Each pass observes the workload, plans exactly
//! one action with [`plan_version_sync`] or [`plan_rollback`], and the
//! executor carries it out. Readiness of a replaced pod is checked on the
//! next pass, which paces the rollout without holding a worker.
//!
//! ```text
//!            spec != current                    all pods on target
//!   Stable ─────────────────▶ RollingForward ─────────────────────▶ Stable
//!     ▲                            │ pod faulty
//!     │                            ▼
//!     │   all pods on target    Failed (UpgradeFailed) ◀── only exit: spec == last version
//!     └──────────────────── RollingBack ◀──────────────────────────────┘
//!                                  │ pod faulty
//!                                  ▼
//!                           Failed (RollbackFailed)
//! ```

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::{debug, info, warn};

use crate::controller::Context;
use crate::controller::error::{Error, Result};
use crate::controller::status::reasons;
use crate::controller::validation::same_version;
use crate::crd::{BookkeeperCluster, BookkeeperClusterStatus};
use crate::resources::common::{FIELD_MANAGER, bookie_selector_labels, selector_string, statefulset_name};
use crate::resources::statefulset::{pod_template, recorded_version};

/// Container waiting reasons that mean a pod will not come up without intervention
pub const FAULT_REASONS: [&str; 2] = ["ImagePullBackOff", "CrashLoopBackOff"];

/// Where a cluster is in its version lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutState {
    Stable,
    RollingForward,
    RollingBack,
    Failed,
}

impl RolloutState {
    pub fn of(status: &BookkeeperClusterStatus) -> Self {
        if status.is_cluster_in_upgrading_state() {
            RolloutState::RollingForward
        } else if status.is_cluster_in_rollback_state() {
            RolloutState::RollingBack
        } else if status.is_cluster_in_error_state() {
            RolloutState::Failed
        } else {
            RolloutState::Stable
        }
    }
}

impl std::fmt::Display for RolloutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RolloutState::Stable => write!(f, "Stable"),
            RolloutState::RollingForward => write!(f, "RollingForward"),
            RolloutState::RollingBack => write!(f, "RollingBack"),
            RolloutState::Failed => write!(f, "Failed"),
        }
    }
}

/// What the rollout needs to know about one bookie pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberPod {
    pub name: String,
    /// Version recorded on the pod at creation
    pub version: Option<String>,
    pub ready: bool,
    pub terminating: bool,
    /// Waiting reason of the bookie container when it is one of [`FAULT_REASONS`]
    pub fault: Option<String>,
}

impl MemberPod {
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            name: pod.name_any(),
            version: recorded_version(&pod.metadata).map(String::from),
            ready: is_pod_ready(pod),
            terminating: pod.metadata.deletion_timestamp.is_some(),
            fault: pod_fault(pod),
        }
    }

    fn is_on(&self, version: &str) -> bool {
        self.version.as_deref() == Some(version)
    }
}

/// True when the pod's Ready condition is True
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Fault reason of the first container, if it is stuck pulling or crash looping
pub fn pod_fault(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .and_then(|cs| cs.state.as_ref())
        .and_then(|state| state.waiting.as_ref())
        .and_then(|waiting| waiting.reason.clone())
        .filter(|reason| FAULT_REASONS.contains(&reason.as_str()))
}

/// Observed state of the bookie workload
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Workload {
    /// Version recorded on the StatefulSet pod template
    pub template_version: Option<String>,
    /// Desired member count
    pub replicas: i32,
    /// Member pods sorted by name
    pub pods: Vec<MemberPod>,
}

impl Workload {
    pub fn new(template_version: Option<String>, replicas: i32, mut pods: Vec<MemberPod>) -> Self {
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            template_version,
            replicas,
            pods,
        }
    }
}

/// The single change to make to the workload this pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolloutAction {
    None,
    /// Point the StatefulSet pod template at a version
    ApplyTemplate { version: String },
    /// Delete one pod so the StatefulSet recreates it from the template
    DeletePod { name: String },
}

/// A pod that stopped the rollout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RolloutFault {
    pub pod: String,
    pub reason: String,
    /// Error condition reason recorded in status
    pub condition_reason: &'static str,
}

impl RolloutFault {
    pub fn message(&self) -> String {
        Error::RolloutFault {
            pod: self.pod.clone(),
            reason: self.reason.clone(),
        }
        .to_string()
    }
}

/// Result of planning one pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RolloutPlan {
    pub action: RolloutAction,
    pub fault: Option<RolloutFault>,
    /// Version that became current during this pass
    pub completed: Option<String>,
}

impl RolloutPlan {
    fn idle() -> Self {
        Self::act(RolloutAction::None)
    }

    fn act(action: RolloutAction) -> Self {
        Self {
            action,
            fault: None,
            completed: None,
        }
    }
}

/// Plan the forward step of a pass and apply it to `status`.
///
/// Starts an upgrade when the cluster is stable and the spec asks for another
/// version, otherwise advances whichever rollout is in flight.
pub fn plan_version_sync(
    spec_version: &str,
    status: &mut BookkeeperClusterStatus,
    workload: &Workload,
) -> RolloutPlan {
    match RolloutState::of(status) {
        RolloutState::Failed => RolloutPlan::idle(),
        RolloutState::RollingForward | RolloutState::RollingBack => advance(status, workload),
        RolloutState::Stable => {
            if !status.target_version.is_empty() {
                debug!(target = %status.target_version, "clearing target without an active rollout");
                status.target_version.clear();
            }
            if spec_version.is_empty() || same_version(spec_version, &status.current_version) {
                return RolloutPlan::idle();
            }
            if status.current_version.is_empty() {
                // First deploy: the StatefulSet was created at the spec version
                status.current_version = spec_version.to_string();
                status.add_to_version_history(spec_version);
                return RolloutPlan::idle();
            }
            let current = status.current_version.clone();
            status.add_to_version_history(&current);
            status.target_version = spec_version.to_string();
            status.set_upgrading_condition_true(reasons::UPDATING_BOOKKEEPER, "0");
            info!(from = %current, to = %spec_version, "starting upgrade");
            RolloutPlan::act(RolloutAction::ApplyTemplate {
                version: spec_version.to_string(),
            })
        }
    }
}

/// True when the user resubmitted the last good version after a failed upgrade
pub fn is_rollback_triggered(spec_version: &str, status: &BookkeeperClusterStatus) -> bool {
    status.is_cluster_in_upgrade_failed_state()
        && status
            .get_last_version()
            .is_some_and(|last| same_version(last, spec_version))
}

/// Start a rollback if one was requested and apply it to `status`
pub fn plan_rollback(spec_version: &str, status: &mut BookkeeperClusterStatus) -> RolloutPlan {
    if !is_rollback_triggered(spec_version, status) {
        return RolloutPlan::idle();
    }
    let Some(previous) = status.get_last_version().map(String::from) else {
        return RolloutPlan::idle();
    };
    info!(to = %previous, "rolling back to last cluster version");
    status.target_version = previous.clone();
    status.set_rollback_condition_true(reasons::UPDATING_BOOKKEEPER, "0");
    RolloutPlan::act(RolloutAction::ApplyTemplate { version: previous })
}

fn advance(status: &mut BookkeeperClusterStatus, workload: &Workload) -> RolloutPlan {
    let rolling_back = status.is_cluster_in_rollback_state();
    let target = status.target_version.clone();

    if target.is_empty() {
        warn!("rollout condition set without a target version, clearing it");
        clear_active_condition(status, rolling_back);
        return RolloutPlan::idle();
    }

    if workload.template_version.as_deref() != Some(target.as_str()) {
        return RolloutPlan::act(RolloutAction::ApplyTemplate { version: target });
    }

    let (updated, outdated): (Vec<&MemberPod>, Vec<&MemberPod>) =
        workload.pods.iter().partition(|p| p.is_on(&target));
    let progress = updated.len().to_string();

    if let Some(faulty) = updated.iter().find(|p| p.fault.is_some()) {
        return abort(status, faulty, rolling_back);
    }

    let settling = updated.iter().any(|p| !p.ready) || workload.pods.iter().any(|p| p.terminating);
    if settling {
        status.update_progress(reasons::UPDATING_BOOKKEEPER, &progress);
        return RolloutPlan::idle();
    }

    if let Some(next) = outdated.first() {
        // Outdated pods run the version a rollback is fleeing from; their faults are expected
        if !rolling_back && next.fault.is_some() {
            return abort(status, next, rolling_back);
        }
        status.update_progress(reasons::UPDATING_BOOKKEEPER, &progress);
        return RolloutPlan::act(RolloutAction::DeletePod {
            name: next.name.clone(),
        });
    }

    if i32::try_from(updated.len()).unwrap_or(i32::MAX) < workload.replicas {
        status.update_progress(reasons::UPDATING_BOOKKEEPER, &progress);
        return RolloutPlan::idle();
    }

    status.current_version = target.clone();
    status.target_version.clear();
    if rolling_back {
        status.version_history.pop();
        status.set_rollback_condition_false();
        status.set_error_condition_false();
    } else {
        status.set_upgrading_condition_false();
    }
    info!(version = %target, rolled_back = rolling_back, "rollout complete");
    RolloutPlan {
        action: RolloutAction::None,
        fault: None,
        completed: Some(target),
    }
}

fn clear_active_condition(status: &mut BookkeeperClusterStatus, rolling_back: bool) {
    if rolling_back {
        status.set_rollback_condition_false();
    } else {
        status.set_upgrading_condition_false();
    }
}

fn abort(status: &mut BookkeeperClusterStatus, pod: &MemberPod, rolling_back: bool) -> RolloutPlan {
    let fault = RolloutFault {
        pod: pod.name.clone(),
        reason: pod.fault.clone().unwrap_or_default(),
        condition_reason: if rolling_back {
            reasons::ROLLBACK_FAILED
        } else {
            reasons::UPGRADE_FAILED
        },
    };
    warn!(pod = %fault.pod, reason = %fault.reason, "rollout aborted");

    // Error is exclusive with Upgrading and Rollback, so this also ends the rollout
    status.set_error_condition_true(fault.condition_reason, &fault.message());
    status.target_version.clear();

    RolloutPlan {
        action: RolloutAction::None,
        fault: Some(fault),
        completed: None,
    }
}

/// Read the bookie workload from the API server
pub async fn observe_workload(cluster: &BookkeeperCluster, ctx: &Context) -> Result<Workload> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);
    let template_version = sts_api
        .get_opt(&statefulset_name(&name))
        .await?
        .and_then(|sts| sts.spec)
        .and_then(|spec| spec.template.metadata)
        .and_then(|meta| recorded_version(&meta).map(String::from));

    let pod_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
    let params = ListParams::default().labels(&selector_string(&bookie_selector_labels(&name)));
    let pods = pod_api
        .list(&params)
        .await?
        .items
        .iter()
        .map(MemberPod::from_pod)
        .collect();

    Ok(Workload::new(template_version, cluster.spec.replicas, pods))
}

/// Carry out a planned action against the cluster
pub async fn execute(cluster: &BookkeeperCluster, ctx: &Context, plan: &RolloutPlan) -> Result<()> {
    let ns = cluster.namespace().unwrap_or_default();

    match &plan.action {
        RolloutAction::None => {}
        RolloutAction::ApplyTemplate { version } => {
            let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);
            let patch = serde_json::json!({
                "spec": { "template": pod_template(cluster, version) }
            });
            sts_api
                .patch(
                    &statefulset_name(&cluster.name_any()),
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&patch),
                )
                .await?;
            info!(version = %version, "updated bookie pod template");
        }
        RolloutAction::DeletePod { name } => {
            let pod_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
            match pod_api.delete(name, &DeleteParams::default()).await {
                Ok(_) => info!(pod = %name, "deleted outdated bookie"),
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    debug!(pod = %name, "outdated bookie already gone")
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    if let Some(fault) = &plan.fault {
        ctx.publish_warning_event(
            cluster,
            fault.condition_reason,
            "Rollout",
            Some(fault.message()),
        )
        .await;
        if let Some(health) = &ctx.health_state {
            health.metrics.record_rollout_fault(&ns, &cluster.name_any(), fault.condition_reason);
        }
    }

    if let Some(version) = &plan.completed {
        ctx.publish_normal_event(
            cluster,
            "RolloutComplete",
            "Rollout",
            Some(format!("all bookies run version {}", version)),
        )
        .await;
    }

    Ok(())
}

/// Forward step of the pipeline: start or advance a rollout
pub async fn sync_cluster_version(
    cluster: &BookkeeperCluster,
    status: &mut BookkeeperClusterStatus,
    ctx: &Context,
) -> Result<()> {
    let workload = observe_workload(cluster, ctx).await?;
    let plan = plan_version_sync(&cluster.spec.version, status, &workload);
    execute(cluster, ctx, &plan).await
}

/// Rollback step of the pipeline: start a rollback after a failed upgrade
pub async fn rollback_failed_upgrade(
    cluster: &BookkeeperCluster,
    status: &mut BookkeeperClusterStatus,
    ctx: &Context,
) -> Result<()> {
    let plan = plan_rollback(&cluster.spec.version, status);
    execute(cluster, ctx, &plan).await
}
