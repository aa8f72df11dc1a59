//! Unit tests for finalizer naming and metadata cleanup

use std::sync::Mutex;

use bookkeeper_operator::controller::cleanup::{
    PRAVEGA_CLUSTER_ANNOTATION, find_finalizer, finalizer_name, resolve_pravega_cluster,
};
use bookkeeper_operator::controller::{Error, MetadataCleanup, Result, ZK_FINALIZER};
use futures::future::BoxFuture;
use kube::ResourceExt;

use crate::common::BookkeeperClusterBuilder;

/// Records cleanup calls instead of talking to ZooKeeper
#[derive(Default)]
struct RecordingCleanup {
    calls: Mutex<Vec<(String, String, String)>>,
    fail: bool,
}

impl MetadataCleanup for RecordingCleanup {
    fn cleanup<'a>(
        &'a self,
        zookeeper_uri: &'a str,
        namespace: &'a str,
        pravega_cluster: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push((
                zookeeper_uri.to_string(),
                namespace.to_string(),
                pravega_cluster.to_string(),
            ));
            if self.fail {
                Err(Error::CleanupError("connection refused".to_string()))
            } else {
                Ok(())
            }
        })
    }
}

#[test]
fn test_finalizer_round_trip() {
    let cluster = BookkeeperClusterBuilder::new("bk", "default")
        .with_finalizer("foregroundDeletion")
        .with_finalizer(&finalizer_name(Some("pravega-prod")))
        .build();

    assert_eq!(
        find_finalizer(cluster.finalizers()),
        Some("cleanUpZookeeper_pravega-prod")
    );
    assert_eq!(resolve_pravega_cluster(&cluster), "pravega-prod");
}

#[test]
fn test_plain_finalizer_uses_default_cluster() {
    let cluster = BookkeeperClusterBuilder::new("bk", "default")
        .with_finalizer(ZK_FINALIZER)
        .build();
    assert_eq!(resolve_pravega_cluster(&cluster), "pravega-cluster");
}

#[test]
fn test_blank_annotation_is_ignored() {
    let cluster = BookkeeperClusterBuilder::new("bk", "default")
        .with_annotation(PRAVEGA_CLUSTER_ANNOTATION, "  ")
        .with_finalizer("cleanUpZookeeper_from-finalizer")
        .build();
    assert_eq!(resolve_pravega_cluster(&cluster), "from-finalizer");
}

#[test]
fn test_no_finalizer() {
    let cluster = BookkeeperClusterBuilder::new("bk", "default").build();
    assert_eq!(find_finalizer(cluster.finalizers()), None);
}

#[tokio::test]
async fn test_cleanup_seam() {
    let cleanup = RecordingCleanup::default();
    let cluster = BookkeeperClusterBuilder::new("bk", "prod")
        .with_annotation(PRAVEGA_CLUSTER_ANNOTATION, "pravega-prod")
        .build();
    let pravega_cluster = resolve_pravega_cluster(&cluster);

    cleanup
        .cleanup(&cluster.spec.zookeeper_uri, "prod", &pravega_cluster)
        .await
        .unwrap();

    let calls = cleanup.calls.lock().unwrap();
    assert_eq!(
        calls[0],
        (
            "zookeeper-client:2181".to_string(),
            "prod".to_string(),
            "pravega-prod".to_string()
        )
    );
}

#[tokio::test]
async fn test_cleanup_failure_is_retryable() {
    let cleanup = RecordingCleanup {
        fail: true,
        ..Default::default()
    };
    let err = cleanup
        .cleanup("zk:2181", "default", "pravega-cluster")
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.to_string(), "metadata cleanup failed: connection refused");
}
