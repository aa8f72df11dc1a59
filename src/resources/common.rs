//! Common utilities for Kubernetes resource generation
//!
//! Names, labels and owner references shared by every builder, so the
//! reconciler, the rollout engine and the admission webhook all agree on
//! which objects belong to a cluster.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::BookkeeperCluster;

/// API version for BookkeeperCluster CRD
pub const API_VERSION: &str = "bookkeeper.pravega.io/v1alpha1";

/// Kind for BookkeeperCluster CRD
pub const KIND: &str = "BookkeeperCluster";

/// Operator field manager name
pub const FIELD_MANAGER: &str = "bookkeeper-operator";

/// Pod template annotation recording the BookKeeper version a pod was created with
pub const VERSION_ANNOTATION: &str = "bookkeeper.version";

/// Pod template annotation identifying the template and bookie configuration a pod was created from
pub const TEMPLATE_HASH_ANNOTATION: &str = "bookkeeper.pravega.io/template-hash";

/// Port bookies listen on
pub const BOOKIE_PORT: i32 = 3181;

pub const APP_LABEL_VALUE: &str = "bookkeeper-cluster";
pub const CLUSTER_LABEL: &str = "bookkeeper_cluster";
pub const COMPONENT_LABEL: &str = "component";
pub const BOOKIE_COMPONENT: &str = "bookie";

/// Name shared by the bookie ConfigMap, StatefulSet and PodDisruptionBudget
pub fn bookie_name(cluster_name: &str) -> String {
    format!("{}-bookie", cluster_name)
}

pub fn config_map_name(cluster_name: &str) -> String {
    bookie_name(cluster_name)
}

pub fn statefulset_name(cluster_name: &str) -> String {
    bookie_name(cluster_name)
}

pub fn pdb_name(cluster_name: &str) -> String {
    bookie_name(cluster_name)
}

pub fn headless_service_name(cluster_name: &str) -> String {
    format!("{}-bookie-headless", cluster_name)
}

/// Generate an owner reference for a BookkeeperCluster
///
/// Child resources are garbage collected with the cluster. `blockOwnerDeletion`
/// follows the spec so users can opt out of foreground deletion blocking.
pub fn owner_reference(cluster: &BookkeeperCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(cluster.spec.block_owner_deletion.unwrap_or(true)),
    }
}

/// Labels carried by every resource of a cluster
pub fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_LABEL_VALUE.to_string()),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Labels selecting bookie pods; used as the StatefulSet and PDB selector
pub fn bookie_selector_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster_name);
    labels.insert(COMPONENT_LABEL.to_string(), BOOKIE_COMPONENT.to_string());
    labels
}

/// Labels applied to bookie pods: cluster labels, user labels, then the component.
///
/// User labels cannot override the cluster identifier or the component, or
/// the pods would fall out of their own selector.
pub fn bookie_labels(cluster: &BookkeeperCluster) -> BTreeMap<String, String> {
    let name = cluster.name_any();
    let mut labels = cluster_labels(&name);
    for (key, value) in &cluster.spec.labels {
        labels.insert(key.clone(), value.clone());
    }
    labels.extend(bookie_selector_labels(&name));
    labels
}

/// Render labels as a label selector string (`k=v,k=v`)
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// True when `name` ends in an ordinal at or beyond `replicas`.
///
/// Used to find PVCs and Services left behind by a scale-down:
/// `ledger-bk-bookie-4` is an orphan with 3 replicas, `bk-bookie-2` is not.
/// Names without a numeric suffix are never orphans.
pub fn is_orphan(name: &str, replicas: i32) -> bool {
    let Some((_, suffix)) = name.rsplit_once('-') else {
        return false;
    };
    match suffix.parse::<i64>() {
        Ok(ordinal) => ordinal >= i64::from(replicas),
        Err(_) => false,
    }
}
