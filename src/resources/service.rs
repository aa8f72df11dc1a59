//! Headless Service for bookie pods
//!
//! Gives every bookie a stable DNS name
//! (`<pod>.<cluster>-bookie-headless.<ns>.svc`), which is what bookies
//! register in ZooKeeper when hostnames are used as bookie IDs.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::BookkeeperCluster;
use crate::resources::common::{
    BOOKIE_PORT, bookie_labels, bookie_selector_labels, headless_service_name, owner_reference,
};

/// Generate the headless service fronting the bookie StatefulSet
pub fn generate_headless_service(cluster: &BookkeeperCluster) -> Service {
    let cluster_name = cluster.name_any();

    Service {
        metadata: ObjectMeta {
            name: Some(headless_service_name(&cluster_name)),
            namespace: cluster.namespace(),
            labels: Some(bookie_labels(cluster)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(bookie_selector_labels(&cluster_name)),
            ports: Some(vec![ServicePort {
                name: Some("bookie".to_string()),
                port: BOOKIE_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
