//! Restart sweep for configuration-only changes
//!
//! When the bookie ConfigMap or server template changes outside a version
//! rollout, every member pod not yet built from the current template is
//! recycled one at a time in name order. Each pod must be torn down and then
//! ready again before the next one goes.
//!
//! Pods carry the hash of the template they were created from, so a sweep
//! that stops halfway (timeout, API error, operator restart) picks up on the
//! next pass with the members it had not reached.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams};
use kube::{Api, ResourceExt};
use tracing::{debug, info, instrument};

use crate::controller::error::Result;
use crate::controller::rollout::is_pod_ready;
use crate::controller::wait::{Clock, Poller};
use crate::resources::common::{bookie_selector_labels, selector_string};
use crate::resources::statefulset::recorded_template_hash;

/// Per-phase bound for each pod in the sweep
pub const RESTART_TIMEOUT: Duration = Duration::from_secs(600);

/// How often a restarting pod is checked
pub const RESTART_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// True once the pod with `original_uid` no longer serves.
///
/// That is the case when it is gone, has been replaced by a pod with a new
/// UID, or is no longer ready.
pub fn is_torn_down(original_uid: Option<&str>, current: Option<&Pod>) -> bool {
    match current {
        None => true,
        Some(pod) => pod.metadata.uid.as_deref() != original_uid || !is_pod_ready(pod),
    }
}

/// True once a replacement pod exists and is ready
pub fn is_back(original_uid: Option<&str>, current: Option<&Pod>) -> bool {
    current.is_some_and(|pod| pod.metadata.uid.as_deref() != original_uid && is_pod_ready(pod))
}

/// Members not created from the template with `template_hash`, in name order
pub fn stale_members(mut members: Vec<Pod>, template_hash: &str) -> Vec<Pod> {
    members.retain(|p| recorded_template_hash(&p.metadata) != Some(template_hash));
    members.sort_by_key(|p| p.name_any());
    members
}

/// Recycle every bookie of a cluster still running an older template, one pod at a time.
///
/// Returns how many pods were restarted.
#[instrument(skip(pods, poller), fields(cluster = %cluster_name))]
pub async fn restart_sweep<C: Clock>(
    pods: &Api<Pod>,
    cluster_name: &str,
    template_hash: &str,
    poller: &Poller<C>,
) -> Result<usize> {
    let params = ListParams::default().labels(&selector_string(&bookie_selector_labels(cluster_name)));
    let stale = stale_members(pods.list(&params).await?.items, template_hash);

    for member in &stale {
        let name = member.name_any();
        let uid = member.metadata.uid.clone();

        match pods.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!(pod = %name, "restarting bookie"),
            // Already gone and being recreated from the current template
            Err(kube::Error::Api(e)) if e.code == 404 => debug!(pod = %name, "bookie already deleted"),
            Err(e) => return Err(e.into()),
        }

        poller
            .poll_until(
                format!("failed to delete Bookkeeper pod ({}) for 10 mins", name),
                || {
                    let (name, uid) = (name.clone(), uid.clone());
                    async move {
                        let current = pods.get_opt(&name).await?;
                        Ok(is_torn_down(uid.as_deref(), current.as_ref()))
                    }
                },
            )
            .await?;

        poller
            .poll_until(
                format!("failed to get Bookkeeper pod ({}) as ready for 10 mins", name),
                || {
                    let (name, uid) = (name.clone(), uid.clone());
                    async move {
                        let current = pods.get_opt(&name).await?;
                        Ok(is_back(uid.as_deref(), current.as_ref()))
                    }
                },
            )
            .await?;

        info!(pod = %name, "bookie restarted");
    }
    Ok(stale.len())
}

/// Restart sweep with the production timing
pub async fn restart_cluster_pods(pods: &Api<Pod>, cluster_name: &str, template_hash: &str) -> Result<usize> {
    let poller = Poller::new(RESTART_POLL_INTERVAL, RESTART_TIMEOUT);
    restart_sweep(pods, cluster_name, template_hash, &poller).await
}
