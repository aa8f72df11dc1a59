//! Shared context for the controller.
//!
//! Holds what every reconcile pass needs: the Kubernetes client, operator
//! configuration, the metadata cleanup collaborator and the event reporter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::config::OperatorConfig;
use crate::controller::cleanup::{MetadataCleanup, ZookeeperCleanup};
use crate::crd::BookkeeperCluster;
use crate::health::HealthState;
use crate::resources::common::FIELD_MANAGER;

/// Consecutive failed passes per `namespace/name`, feeding the backoff
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    /// Count a failure and return how many came before it
    pub fn record_failure(&self, key: &str) -> u32 {
        let Ok(mut attempts) = self.attempts.lock() else {
            return 0;
        };
        let count = attempts.entry(key.to_string()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    /// Forget failures after a successful pass
    pub fn reset(&self, key: &str) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.remove(key);
        }
    }
}

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Process-wide settings read at startup
    pub config: Arc<OperatorConfig>,
    /// Removes coordination metadata when a cluster is deleted
    pub metadata_cleanup: Arc<dyn MetadataCleanup>,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Failure counts for the error policy
    pub retries: Arc<RetryTracker>,
}

impl Context {
    /// Create a context that cleans up metadata in ZooKeeper
    pub fn new(
        client: Client,
        config: Arc<OperatorConfig>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self::with_cleanup(client, config, Arc::new(ZookeeperCleanup::default()), health_state)
    }

    /// Create a context with a specific cleanup implementation
    pub fn with_cleanup(
        client: Client,
        config: Arc<OperatorConfig>,
        metadata_cleanup: Arc<dyn MetadataCleanup>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: config.pod_name.clone(),
        };
        Self {
            client,
            config,
            metadata_cleanup,
            reporter,
            health_state,
            retries: Arc::new(RetryTracker::default()),
        }
    }

    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    async fn publish(
        &self,
        resource: &BookkeeperCluster,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let object_ref = resource.object_ref(&());
        if let Err(e) = self
            .recorder()
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a normal event for a cluster
    pub async fn publish_normal_event(
        &self,
        resource: &BookkeeperCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource, EventType::Normal, reason, action, note)
            .await
    }

    /// Publish a warning event for a cluster
    pub async fn publish_warning_event(
        &self,
        resource: &BookkeeperCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource, EventType::Warning, reason, action, note)
            .await
    }
}
