//! Status and conditions management for BookkeeperCluster resources
//!
//! The condition store lives on [`BookkeeperClusterStatus`] itself: every
//! component mutates the in-memory status through the setters below and the
//! reconciler persists the result once per pass with [`StatusManager`].
//!
//! Upgrading, Rollback and Error are mutually exclusive. Setting one of them
//! True flips whichever other one is True back to False, so the invariant is
//! enforced in [`BookkeeperClusterStatus::set_condition_at`] and nowhere else.

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::controller::Context;
use crate::controller::error::{Error, Result};
use crate::crd::{
    BookkeeperCluster, BookkeeperClusterStatus, ClusterCondition, ConditionStatus, ConditionType,
};
use crate::resources::common::FIELD_MANAGER;

/// Condition reasons written by the operator
pub mod reasons {
    /// Error reason recorded when a member fails during an upgrade
    pub const UPGRADE_FAILED: &str = "UpgradeFailed";
    /// Error reason recorded when a member fails during a rollback
    pub const ROLLBACK_FAILED: &str = "RollbackFailed";
    /// Progress reason while members are being replaced
    pub const UPDATING_BOOKKEEPER: &str = "UpdatingBookkeeper";
}

/// Current time in the format used for condition timestamps
pub fn now() -> String {
    Utc::now().to_rfc3339()
}

impl BookkeeperClusterStatus {
    /// Create any missing condition as False. Safe to call on every pass.
    pub fn init(&mut self) {
        let now = now();
        for type_ in ConditionType::ALL {
            if !self.conditions.contains(type_) {
                self.conditions.insert(ClusterCondition::new(
                    type_,
                    ConditionStatus::False,
                    &now,
                ));
            }
        }
    }

    /// Write a condition at the given time.
    ///
    /// `last_update_time` always moves to `now`; `last_transition_time` moves
    /// only when the status value flips.
    pub fn set_condition_at(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: &str,
    ) {
        if status == ConditionStatus::True && type_.is_exclusive() {
            let others: Vec<ConditionType> = ConditionType::ALL
                .into_iter()
                .filter(|t| *t != type_ && t.is_exclusive() && self.conditions.is_true(*t))
                .collect();
            for other in others {
                debug!(condition = %other, replaced_by = %type_, "clearing exclusive condition");
                self.write_condition(other, ConditionStatus::False, "", "", now);
            }
        }
        self.write_condition(type_, status, reason, message, now);
    }

    fn write_condition(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: &str,
    ) {
        match self.conditions.get_mut(type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.status = status;
                    existing.last_transition_time = now.to_string();
                }
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                existing.last_update_time = now.to_string();
            }
            None => {
                let mut condition = ClusterCondition::new(type_, status, now);
                condition.reason = reason.to_string();
                condition.message = message.to_string();
                self.conditions.insert(condition);
            }
        }
    }

    fn set_condition(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        self.set_condition_at(type_, status, reason, message, &now());
    }

    pub fn set_pods_ready_condition_true(&mut self) {
        self.set_condition(ConditionType::PodsReady, ConditionStatus::True, "", "");
    }

    pub fn set_pods_ready_condition_false(&mut self) {
        self.set_condition(ConditionType::PodsReady, ConditionStatus::False, "", "");
    }

    pub fn set_upgrading_condition_true(&mut self, reason: &str, message: &str) {
        self.set_condition(ConditionType::Upgrading, ConditionStatus::True, reason, message);
    }

    pub fn set_upgrading_condition_false(&mut self) {
        self.set_condition(ConditionType::Upgrading, ConditionStatus::False, "", "");
    }

    pub fn set_rollback_condition_true(&mut self, reason: &str, message: &str) {
        self.set_condition(ConditionType::Rollback, ConditionStatus::True, reason, message);
    }

    pub fn set_rollback_condition_false(&mut self) {
        self.set_condition(ConditionType::Rollback, ConditionStatus::False, "", "");
    }

    pub fn set_error_condition_true(&mut self, reason: &str, message: &str) {
        self.set_condition(ConditionType::Error, ConditionStatus::True, reason, message);
    }

    pub fn set_error_condition_false(&mut self) {
        self.set_condition(ConditionType::Error, ConditionStatus::False, "", "");
    }

    /// Rewrite reason and message of the active rollout condition.
    ///
    /// Status and transition time are left alone. Does nothing when neither
    /// Upgrading nor Rollback is active.
    pub fn update_progress(&mut self, reason: &str, message: &str) {
        let now = now();
        if let Some(active) = self.get_last_condition().map(|c| c.type_)
            && let Some(condition) = self.conditions.get_mut(active)
        {
            condition.reason = reason.to_string();
            condition.message = message.to_string();
            condition.last_update_time = now;
        }
    }

    pub fn get_cluster_condition(&self, type_: ConditionType) -> Option<&ClusterCondition> {
        self.conditions.get(type_)
    }

    /// The active rollout condition, Upgrading or Rollback, if any
    pub fn get_last_condition(&self) -> Option<&ClusterCondition> {
        [ConditionType::Upgrading, ConditionType::Rollback]
            .into_iter()
            .filter_map(|t| self.conditions.get(t))
            .find(|c| c.is_true())
    }

    pub fn add_to_version_history(&mut self, version: &str) {
        self.version_history.push(version);
    }

    /// Top of the version history stack
    pub fn get_last_version(&self) -> Option<&str> {
        self.version_history.peek()
    }

    pub fn is_cluster_in_ready_state(&self) -> bool {
        self.conditions.is_true(ConditionType::PodsReady)
    }

    pub fn is_cluster_in_upgrading_state(&self) -> bool {
        self.conditions.is_true(ConditionType::Upgrading)
    }

    pub fn is_cluster_in_rollback_state(&self) -> bool {
        self.conditions.is_true(ConditionType::Rollback)
    }

    pub fn is_cluster_in_error_state(&self) -> bool {
        self.conditions.is_true(ConditionType::Error)
    }

    pub fn is_cluster_in_upgrade_failed_state(&self) -> bool {
        self.error_reason() == Some(reasons::UPGRADE_FAILED)
    }

    pub fn is_cluster_in_rollback_failed_state(&self) -> bool {
        self.error_reason() == Some(reasons::ROLLBACK_FAILED)
    }

    /// True when the cluster either failed an upgrade or is rolling back from one
    pub fn is_cluster_in_upgrade_failed_or_rollback_state(&self) -> bool {
        self.is_cluster_in_upgrade_failed_state() || self.is_cluster_in_rollback_state()
    }

    fn error_reason(&self) -> Option<&str> {
        self.conditions
            .get(ConditionType::Error)
            .filter(|c| c.is_true())
            .map(|c| c.reason.as_str())
    }

    /// Record the ready and unready member pods
    pub fn set_members(&mut self, mut ready: Vec<String>, mut unready: Vec<String>) {
        ready.sort();
        unready.sort();
        self.ready_replicas = i32::try_from(ready.len()).unwrap_or(i32::MAX);
        self.current_replicas =
            i32::try_from(ready.len() + unready.len()).unwrap_or(i32::MAX);
        self.members.ready = ready;
        self.members.unready = unready;
    }
}

/// Persists the status sub-document of a BookkeeperCluster
pub struct StatusManager<'a> {
    cluster: &'a BookkeeperCluster,
    ctx: &'a Context,
    ns: &'a str,
}

impl<'a> StatusManager<'a> {
    /// Create a new status manager
    pub fn new(cluster: &'a BookkeeperCluster, ctx: &'a Context, ns: &'a str) -> Self {
        Self { cluster, ctx, ns }
    }

    /// Write the whole status in one merge patch.
    ///
    /// The resourceVersion of the fetched object is sent along so the API
    /// server rejects the write with 409 if someone else changed the object
    /// in the meantime; the error is retryable and the next pass recomputes.
    pub async fn update(&self, status: &BookkeeperClusterStatus) -> Result<()> {
        let api: Api<BookkeeperCluster> = Api::namespaced(self.ctx.client.clone(), self.ns);
        let name = self.cluster.name_any();
        let resource_version = self
            .cluster
            .resource_version()
            .ok_or(Error::MissingObjectKey(".metadata.resourceVersion"))?;

        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });

        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        Ok(())
    }
}

/// True when persisting `next` would change the stored status.
///
/// Condition timestamps are left out: rewriting a condition with the value
/// it already has bumps `lastUpdateTime` but is not worth a write.
pub fn status_changed(cluster: &BookkeeperCluster, next: &BookkeeperClusterStatus) -> bool {
    cluster
        .status
        .as_ref()
        .is_none_or(|stored| without_timestamps(stored) != without_timestamps(next))
}

fn without_timestamps(status: &BookkeeperClusterStatus) -> BookkeeperClusterStatus {
    let mut status = status.clone();
    for type_ in ConditionType::ALL {
        if let Some(condition) = status.conditions.get_mut(type_) {
            condition.last_update_time.clear();
            condition.last_transition_time.clear();
        }
    }
    status
}
