use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaimSpec, ResourceRequirements, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::controller::error::{Error, Result};

/// Default ZooKeeper client service created by the Pravega ZooKeeper operator
pub const DEFAULT_ZOOKEEPER_URI: &str = "zookeeper-client:2181";
/// Version deployed when the user does not ask for one
pub const DEFAULT_BOOKKEEPER_VERSION: &str = "0.7.0";
pub const DEFAULT_IMAGE_REPOSITORY: &str = "pravega/bookkeeper";
pub const DEFAULT_IMAGE_PULL_POLICY: &str = "Always";
pub const DEFAULT_VOLUME_SIZE: &str = "10Gi";
pub const DEFAULT_REQUEST_CPU: &str = "500m";
pub const DEFAULT_REQUEST_MEMORY: &str = "1Gi";
pub const DEFAULT_LIMIT_CPU: &str = "1";
pub const DEFAULT_LIMIT_MEMORY: &str = "2Gi";

/// Minimum bookie count outside of test mode (one write quorum plus a spare)
pub const MIN_BOOKKEEPER_REPLICAS: i32 = 3;

/// BookkeeperCluster is the Schema for the bookkeeperclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "bookkeeper.pravega.io",
    version = "v1alpha1",
    kind = "BookkeeperCluster",
    plural = "bookkeeperclusters",
    shortname = "bk",
    namespaced,
    status = "BookkeeperClusterStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.currentVersion"}"#,
    printcolumn = r#"{"name":"Desired Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Desired Members", "type":"integer", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready Members", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BookkeeperClusterSpec {
    /// ZooKeeper address in "hostname:port" form
    #[serde(default)]
    pub zookeeper_uri: String,

    /// Container image for the bookies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSpec>,

    /// Number of bookies. Minimum is 3 unless the operator runs in test mode.
    #[serde(default)]
    pub replicas: i32,

    /// Maximum number of bookies the disruption budget allows to be down
    #[serde(default)]
    pub max_unavailable_bookkeeper_replicas: i32,

    /// Volume claim templates for ledger, journal and index data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Whether the BookKeeper auto recovery daemon runs inside each bookie
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_recovery: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Readiness and liveness probe timings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<Probes>,

    /// Resource requests and limits for the bookie container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Overrides for bk_server.conf, exported to the bookie as `BK_<key>`
    #[serde(default)]
    pub options: BTreeMap<String, String>,

    /// JVM flags passed to the bookie process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jvm_options: Option<JvmOptions>,

    /// Name of a user-provided ConfigMap exported into the bookie environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<String>,

    /// Desired BookKeeper version (semver, e.g. "0.7.0")
    #[serde(default)]
    pub version: String,

    /// Value of `blockOwnerDeletion` on owner references of child resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,

    /// Extra labels applied to the bookie pods
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Container image repository and pull policy
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    #[serde(default)]
    pub repository: String,

    /// One of Always, Never, IfNotPresent
    #[serde(default)]
    pub pull_policy: String,
}

/// Storage configuration for the three bookie volumes
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_volume_claim_template: Option<PersistentVolumeClaimSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal_volume_claim_template: Option<PersistentVolumeClaimSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_volume_claim_template: Option<PersistentVolumeClaimSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Probes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    #[serde(default)]
    pub initial_delay_seconds: i32,
    #[serde(default)]
    pub period_seconds: i32,
    #[serde(default)]
    pub failure_threshold: i32,
    #[serde(default)]
    pub success_threshold: i32,
    #[serde(default)]
    pub timeout_seconds: i32,
}

impl Probe {
    /// Bookies should become ready within about a minute and a half
    pub fn default_readiness() -> Self {
        Self {
            initial_delay_seconds: 20,
            period_seconds: 10,
            failure_threshold: 9,
            success_threshold: 1,
            timeout_seconds: 5,
        }
    }

    /// Starts once the pod could have become ready and restarts after a minute of failures
    pub fn default_liveness() -> Self {
        Self {
            initial_delay_seconds: 60,
            period_seconds: 15,
            failure_threshold: 4,
            success_threshold: 1,
            timeout_seconds: 5,
        }
    }
}

/// JVM flags grouped the way the bookie entrypoint consumes them
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JvmOptions {
    #[serde(default)]
    pub memory_opts: Vec<String>,
    #[serde(default)]
    pub gc_opts: Vec<String>,
    #[serde(default)]
    pub gc_logging_opts: Vec<String>,
    #[serde(default)]
    pub extra_opts: Vec<String>,
}

/// Status of the BookkeeperCluster
///
/// Every field is always serialized so that a merge patch of the whole
/// document also clears values (an empty `targetVersion` must overwrite
/// the previous target).
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookkeeperClusterStatus {
    /// Lifecycle conditions, one entry per condition type
    #[serde(default)]
    #[schemars(with = "Vec<ClusterCondition>")]
    pub conditions: Conditions,

    /// Version every member is known to run
    #[serde(default)]
    pub current_version: String,

    /// Version being rolled out; empty unless an upgrade or rollback is in flight
    #[serde(default)]
    pub target_version: String,

    /// Previously stable versions, most recent first
    #[serde(default)]
    pub version_history: VersionHistory,

    /// Desired number of members
    #[serde(default)]
    pub replicas: i32,

    /// Number of member pods that exist
    #[serde(default)]
    pub current_replicas: i32,

    /// Number of member pods that are ready
    #[serde(default)]
    pub ready_replicas: i32,

    #[serde(default)]
    pub members: MembersStatus,
}

/// Names of ready and unready member pods
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct MembersStatus {
    #[serde(default)]
    pub ready: Vec<String>,
    #[serde(default)]
    pub unready: Vec<String>,
}

/// The four lifecycle condition types
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum ConditionType {
    PodsReady,
    Upgrading,
    Rollback,
    Error,
}

impl ConditionType {
    pub const ALL: [ConditionType; 4] = [
        ConditionType::PodsReady,
        ConditionType::Upgrading,
        ConditionType::Rollback,
        ConditionType::Error,
    ];

    /// Upgrading, Rollback and Error are mutually exclusive; PodsReady is not
    pub fn is_exclusive(self) -> bool {
        !matches!(self, ConditionType::PodsReady)
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::PodsReady => write!(f, "PodsReady"),
            ConditionType::Upgrading => write!(f, "Upgrading"),
            ConditionType::Rollback => write!(f, "Rollback"),
            ConditionType::Error => write!(f, "Error"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    #[default]
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Kubernetes-style condition; timestamps are RFC 3339 strings
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    /// Changes on every write to this condition
    #[serde(default)]
    pub last_update_time: String,

    /// Changes only when `status` flips
    #[serde(default)]
    pub last_transition_time: String,
}

impl ClusterCondition {
    pub fn new(type_: ConditionType, status: ConditionStatus, now: &str) -> Self {
        Self {
            type_,
            status,
            reason: String::new(),
            message: String::new(),
            last_update_time: now.to_string(),
            last_transition_time: now.to_string(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Conditions keyed by type
///
/// Persisted as a list so the wire shape follows Kubernetes conventions.
/// A duplicated type in the persisted list keeps its last occurrence.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(from = "Vec<ClusterCondition>", into = "Vec<ClusterCondition>")]
pub struct Conditions(BTreeMap<ConditionType, ClusterCondition>);

impl Conditions {
    pub fn get(&self, type_: ConditionType) -> Option<&ClusterCondition> {
        self.0.get(&type_)
    }

    pub fn get_mut(&mut self, type_: ConditionType) -> Option<&mut ClusterCondition> {
        self.0.get_mut(&type_)
    }

    pub fn insert(&mut self, condition: ClusterCondition) {
        self.0.insert(condition.type_, condition);
    }

    pub fn contains(&self, type_: ConditionType) -> bool {
        self.0.contains_key(&type_)
    }

    /// True when the condition exists and its status is True
    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.get(type_).is_some_and(ClusterCondition::is_true)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterCondition> {
        self.0.values()
    }
}

impl From<Vec<ClusterCondition>> for Conditions {
    fn from(list: Vec<ClusterCondition>) -> Self {
        Self(list.into_iter().map(|c| (c.type_, c)).collect())
    }
}

impl From<Conditions> for Vec<ClusterCondition> {
    fn from(conditions: Conditions) -> Self {
        conditions.0.into_values().collect()
    }
}

/// Previously stable versions used as a one-entry-deep undo stack
///
/// Index 0 is the top of the stack. Only the top is ever consulted for a
/// rollback; deeper entries are history for humans.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct VersionHistory(Vec<String>);

impl VersionHistory {
    /// Push a version unless it is empty or already on top
    pub fn push(&mut self, version: &str) {
        if version.is_empty() || self.peek() == Some(version) {
            return;
        }
        self.0.insert(0, version.to_string());
    }

    pub fn peek(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn pop(&mut self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for VersionHistory {
    fn from(versions: Vec<String>) -> Self {
        Self(versions)
    }
}

fn volume_claim_template(size: &str) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(size.to_string()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn default_resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(DEFAULT_REQUEST_CPU.to_string())),
            (
                "memory".to_string(),
                Quantity(DEFAULT_REQUEST_MEMORY.to_string()),
            ),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(DEFAULT_LIMIT_CPU.to_string())),
            (
                "memory".to_string(),
                Quantity(DEFAULT_LIMIT_MEMORY.to_string()),
            ),
        ])),
        ..Default::default()
    }
}

impl ImageSpec {
    fn with_defaults(&mut self) -> bool {
        let mut changed = false;
        if self.repository.is_empty() {
            self.repository = DEFAULT_IMAGE_REPOSITORY.to_string();
            changed = true;
        }
        if self.pull_policy.is_empty() {
            self.pull_policy = DEFAULT_IMAGE_PULL_POLICY.to_string();
            changed = true;
        }
        changed
    }
}

impl StorageSpec {
    fn with_defaults(&mut self) -> bool {
        let mut changed = false;
        for template in [
            &mut self.ledger_volume_claim_template,
            &mut self.journal_volume_claim_template,
            &mut self.index_volume_claim_template,
        ] {
            if template.is_none() {
                *template = Some(volume_claim_template(DEFAULT_VOLUME_SIZE));
                changed = true;
            }
        }
        changed
    }
}

impl Probes {
    fn with_defaults(&mut self) -> bool {
        let mut changed = false;
        if self.readiness_probe.is_none() {
            self.readiness_probe = Some(Probe::default_readiness());
            changed = true;
        }
        if self.liveness_probe.is_none() {
            self.liveness_probe = Some(Probe::default_liveness());
            changed = true;
        }
        changed
    }
}

impl BookkeeperClusterSpec {
    /// Fill unset fields with their defaults.
    ///
    /// Returns true if anything was changed, in which case the caller must
    /// persist the spec before doing anything else with it. Empty option and
    /// label maps are normalized but do not count as a change.
    pub fn with_defaults(&mut self, test_mode: bool) -> bool {
        let mut changed = false;

        if self.zookeeper_uri.is_empty() {
            self.zookeeper_uri = DEFAULT_ZOOKEEPER_URI.to_string();
            changed = true;
        }

        changed |= self.image.get_or_insert_with(Default::default).with_defaults();

        if !test_mode && self.replicas < MIN_BOOKKEEPER_REPLICAS {
            self.replicas = MIN_BOOKKEEPER_REPLICAS;
            changed = true;
        }

        if !test_mode && self.max_unavailable_bookkeeper_replicas < 1 {
            self.max_unavailable_bookkeeper_replicas = 1;
            changed = true;
        }

        changed |= self
            .storage
            .get_or_insert_with(Default::default)
            .with_defaults();

        if self.auto_recovery.is_none() {
            self.auto_recovery = Some(true);
            changed = true;
        }

        changed |= self.probes.get_or_insert_with(Default::default).with_defaults();

        if self.resources.is_none() {
            self.resources = Some(default_resources());
            changed = true;
        }

        if self.jvm_options.is_none() {
            self.jvm_options = Some(JvmOptions::default());
            changed = true;
        }

        if self.version.is_empty() {
            self.version = DEFAULT_BOOKKEEPER_VERSION.to_string();
            changed = true;
        }

        if self.block_owner_deletion.is_none() {
            self.block_owner_deletion = Some(true);
            changed = true;
        }

        changed
    }

    pub fn image_repository(&self) -> &str {
        self.image
            .as_ref()
            .map(|i| i.repository.as_str())
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_IMAGE_REPOSITORY)
    }

    /// Name of the user's environment ConfigMap, if one is configured
    pub fn env_vars_config_map(&self) -> Option<&str> {
        self.env_vars
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }
}

impl BookkeeperCluster {
    /// Image for the version requested in the spec
    pub fn bookkeeper_image(&self) -> String {
        image_for(self.spec.image_repository(), &self.spec.version)
    }

    /// Image for the version currently being rolled out
    pub fn bookkeeper_target_image(&self) -> Result<String> {
        let target = self
            .status
            .as_ref()
            .map(|s| s.target_version.as_str())
            .unwrap_or_default();
        if target.is_empty() {
            return Err(Error::InvalidConfig("target version is not set".to_string()));
        }
        Ok(image_for(self.spec.image_repository(), target))
    }

    /// Number of members the cluster should have
    pub fn expected_size(&self) -> i32 {
        self.spec.replicas
    }
}

/// Image reference for a repository and version
pub fn image_for(repository: &str, version: &str) -> String {
    format!("{}:{}", repository, version)
}
