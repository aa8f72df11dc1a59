//! PodDisruptionBudget for bookie pods
//!
//! Caps voluntary disruptions (node drains, evictions) at
//! `maxUnavailableBookkeeperReplicas` so ledgers keep their write quorum.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::BookkeeperCluster;
use crate::resources::common::{
    bookie_selector_labels, cluster_labels, owner_reference, pdb_name,
};

/// Generate the PodDisruptionBudget for the bookies
pub fn generate_pdb(cluster: &BookkeeperCluster) -> PodDisruptionBudget {
    let cluster_name = cluster.name_any();

    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(pdb_name(&cluster_name)),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(&cluster_name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(
                cluster.spec.max_unavailable_bookkeeper_replicas,
            )),
            selector: Some(LabelSelector {
                match_labels: Some(bookie_selector_labels(&cluster_name)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `maxUnavailable` of a live PDB, if it needs to change to match `desired`
pub fn max_unavailable_update(
    live: &PodDisruptionBudget,
    desired: &PodDisruptionBudget,
) -> Option<IntOrString> {
    let current = live.spec.as_ref().and_then(|s| s.max_unavailable.clone());
    let wanted = desired.spec.as_ref().and_then(|s| s.max_unavailable.clone());
    if current == wanted { None } else { wanted }
}
