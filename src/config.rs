//! Operator configuration read from the process environment

use std::path::PathBuf;

use crate::controller::validation::DEFAULT_SUPPORTED_VERSIONS_PATH;

/// Name of the Lease used for leader election
pub const LEADER_LEASE_NAME: &str = "bookkeeper-operator-leader";

/// Runtime settings for the operator
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Relaxes minimum replica counts so a cluster fits on a laptop
    pub test_mode: bool,
    /// Skip adding the metadata cleanup finalizer
    pub disable_finalizer: bool,
    /// File holding the supported-version graph
    pub supported_versions_path: PathBuf,
    /// Namespace to watch; `None` watches the whole cluster
    pub watch_namespace: Option<String>,
    /// Name of this operator pod, used as leader election identity
    pub pod_name: Option<String>,
    /// Namespace this operator runs in, where the leader Lease lives
    pub pod_namespace: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            test_mode: false,
            disable_finalizer: false,
            supported_versions_path: PathBuf::from(DEFAULT_SUPPORTED_VERSIONS_PATH),
            watch_namespace: None,
            pod_name: None,
            pod_namespace: "default".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Read configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            test_mode: non_empty("TEST_MODE").is_some_and(|v| parse_bool(&v)),
            disable_finalizer: non_empty("DISABLE_FINALIZER").is_some_and(|v| parse_bool(&v)),
            supported_versions_path: non_empty("SUPPORTED_VERSIONS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.supported_versions_path),
            watch_namespace: non_empty("WATCH_NAMESPACE"),
            pod_name: non_empty("POD_NAME"),
            pod_namespace: non_empty("POD_NAMESPACE").unwrap_or(defaults.pod_namespace),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
