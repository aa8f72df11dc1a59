//! Finalizer handling and external metadata cleanup
//!
//! Bookies register themselves in ZooKeeper under `/pravega/<pravega cluster>`.
//! A finalizer on the BookkeeperCluster defers deletion until that subtree is
//! gone. The Pravega cluster name travels with the object in two places: the
//! structured annotation [`PRAVEGA_CLUSTER_ANNOTATION`] and, for compatibility
//! with existing objects, the suffix of the finalizer itself
//! (`cleanUpZookeeper_<name>`).

use std::collections::VecDeque;
use std::time::Duration;

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::controller::wait::{Clock, Poller};
use crate::crd::BookkeeperCluster;
use crate::resources::common::{cluster_labels, selector_string};

/// Finalizer prefix guarding ZooKeeper metadata cleanup
pub const ZK_FINALIZER: &str = "cleanUpZookeeper";

/// Annotation recording the Pravega cluster whose metadata the bookies use
pub const PRAVEGA_CLUSTER_ANNOTATION: &str = "bookkeeper.pravega.io/pravega-cluster-name";

/// Key in the user's environment ConfigMap naming the Pravega cluster
pub const PRAVEGA_CLUSTER_NAME_KEY: &str = "PRAVEGA_CLUSTER_NAME";

/// Pravega cluster name assumed when none is configured
pub const DEFAULT_PRAVEGA_CLUSTER_NAME: &str = "pravega-cluster";

/// Root znode shared by all Pravega clusters
pub const PRAVEGA_ZNODE_ROOT: &str = "pravega";

/// How often member pods are checked while waiting for them to terminate
pub const TERMINATION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on waiting for member pods to terminate
pub const TERMINATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Finalizer name for a Pravega cluster, if one is known
pub fn finalizer_name(pravega_cluster: Option<&str>) -> String {
    match pravega_cluster {
        Some(name) => format!("{}_{}", ZK_FINALIZER, name),
        None => ZK_FINALIZER.to_string(),
    }
}

/// The cleanup finalizer present on the object, if any
pub fn find_finalizer(finalizers: &[String]) -> Option<&str> {
    finalizers
        .iter()
        .map(String::as_str)
        .find(|f| f.starts_with(ZK_FINALIZER))
}

/// Pravega cluster name encoded in a finalizer (`cleanUpZookeeper_<name>`)
pub fn pravega_cluster_from_finalizer(finalizer: &str) -> Option<&str> {
    finalizer
        .strip_prefix(ZK_FINALIZER)
        .and_then(|rest| rest.strip_prefix('_'))
        .filter(|name| !name.is_empty())
}

/// Pravega cluster whose metadata must be removed when `cluster` goes away.
///
/// The annotation wins over the finalizer suffix; both missing means the default.
pub fn resolve_pravega_cluster(cluster: &BookkeeperCluster) -> String {
    if let Some(name) = cluster
        .annotations()
        .get(PRAVEGA_CLUSTER_ANNOTATION)
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
    {
        return name.to_string();
    }

    find_finalizer(cluster.finalizers())
        .and_then(pravega_cluster_from_finalizer)
        .unwrap_or(DEFAULT_PRAVEGA_CLUSTER_NAME)
        .to_string()
}

/// ZooKeeper host for a `service:port` URI, qualified with the namespace
pub fn zookeeper_host(uri: &str, namespace: &str) -> String {
    let (service, port) = match uri.split_once(':') {
        Some((service, port)) if !port.is_empty() => (service, port),
        Some((service, _)) => (service, "2181"),
        None => (uri, "2181"),
    };
    format!("{}.{}.svc.cluster.local:{}", service, namespace, port)
}

/// Path of the znode subtree owned by a Pravega cluster
pub fn pravega_znode_path(pravega_cluster: &str) -> String {
    format!("/{}/{}", PRAVEGA_ZNODE_ROOT, pravega_cluster)
}

/// Removes external coordination metadata for a deleted cluster
pub trait MetadataCleanup: Send + Sync {
    fn cleanup<'a>(
        &'a self,
        zookeeper_uri: &'a str,
        namespace: &'a str,
        pravega_cluster: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Deletes the Pravega znode subtree from ZooKeeper
#[derive(Clone, Debug)]
pub struct ZookeeperCleanup {
    connect_timeout: Duration,
}

impl Default for ZookeeperCleanup {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ZookeeperCleanup {
    async fn delete_all_znodes(
        &self,
        zookeeper_uri: &str,
        namespace: &str,
        pravega_cluster: &str,
    ) -> Result<()> {
        let host = zookeeper_host(zookeeper_uri, namespace);
        let client = tokio::time::timeout(self.connect_timeout, zookeeper_client::Client::connect(&host))
            .await
            .map_err(|_| {
                Error::CleanupError(format!("failed to connect to zookeeper ({}): timed out", host))
            })?
            .map_err(|e| Error::CleanupError(format!("failed to connect to zookeeper ({}): {}", host, e)))?;

        let root = pravega_znode_path(pravega_cluster);
        let exists = client.check_stat(&root).await.map_err(|e| {
            Error::CleanupError(format!("failed to check if zookeeper path exists: {}", e))
        })?;
        if exists.is_none() {
            info!(path = %root, "zookeeper metadata not found");
            return Ok(());
        }

        // Children before parents: walk breadth first, delete in reverse
        let mut tree = vec![root.clone()];
        let mut queue = VecDeque::from([root]);
        while let Some(node) = queue.pop_front() {
            let children = client.list_children(&node).await.map_err(|e| {
                Error::CleanupError(format!("failed to construct BFS tree: {}", e))
            })?;
            for child in children {
                let path = format!("{}/{}", node, child);
                tree.push(path.clone());
                queue.push_back(path);
            }
        }

        for path in tree.iter().rev() {
            debug!(path = %path, "deleting znode");
            client.delete(path, None).await.map_err(|e| {
                Error::CleanupError(format!("failed to delete znode ({}): {}", path, e))
            })?;
        }
        info!(nodes = tree.len(), "zookeeper metadata deleted");
        Ok(())
    }
}

impl MetadataCleanup for ZookeeperCleanup {
    fn cleanup<'a>(
        &'a self,
        zookeeper_uri: &'a str,
        namespace: &'a str,
        pravega_cluster: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.delete_all_znodes(zookeeper_uri, namespace, pravega_cluster))
    }
}

/// Add a finalizer to a resource.
pub async fn add_finalizer<T>(api: &Api<T>, name: &str, finalizer: &str) -> Result<()>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let resource = api.get(name).await?;
    let mut finalizers = resource.finalizers().to_vec();

    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    Ok(())
}

/// Remove a specific finalizer from a resource.
pub async fn remove_finalizer<T>(api: &Api<T>, name: &str, finalizer: &str) -> Result<()>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let resource = match api.get(name).await {
        Ok(r) => r,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut finalizers = resource.finalizers().to_vec();
    if let Some(pos) = finalizers.iter().position(|f| f == finalizer) {
        finalizers.remove(pos);

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    Ok(())
}

/// Block until no member pod of the cluster is left
pub async fn wait_for_cluster_to_terminate<C: Clock>(
    pods: &Api<Pod>,
    cluster: &BookkeeperCluster,
    poller: &Poller<C>,
) -> Result<()> {
    let selector = selector_string(&cluster_labels(&cluster.name_any()));
    let params = ListParams::default().labels(&selector);
    poller
        .poll_until(
            format!(
                "failed to wait for cluster pods termination ({})",
                cluster.name_any()
            ),
            || {
                let params = params.clone();
                async move {
                    let remaining = pods.list(&params).await?;
                    debug!(remaining = remaining.items.len(), "waiting for bookies to terminate");
                    Ok(remaining.items.is_empty())
                }
            },
        )
        .await
}
