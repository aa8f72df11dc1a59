//! Validation of BookkeeperCluster mutations
//!
//! This module provides the checks run before a change to a cluster is
//! persisted:
//! - Version changes against the supported upgrade graph and the rollout state
//! - Data directory paths must be absolute
//! - Data directory layout is frozen after first deploy
//!
//! Every function here is pure. Loading the upgrade graph and fetching the
//! live ConfigMap is left to the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use k8s_openapi::api::core::v1::ConfigMap;
use semver::Version;

use crate::controller::error::{Error, Result};
use crate::crd::{BookkeeperClusterSpec, BookkeeperClusterStatus};

/// Where the supported-version graph is mounted by default
pub const DEFAULT_SUPPORTED_VERSIONS_PATH: &str = "/tmp/config/keys";

/// Bookie options holding data directory lists
pub const DIRECTORY_OPTIONS: [(&str, &str); 3] = [
    ("journalDirectories", "journal"),
    ("ledgerDirectories", "ledger"),
    ("indexDirectories", "index"),
];

/// Bookie option choosing hostnames over IP addresses as bookie identity
pub const BOOKIE_ID_OPTION: &str = "useHostNameAsBookieID";

/// Graph of supported versions and the versions each can be upgraded to directly
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SupportedVersions {
    graph: BTreeMap<String, BTreeSet<String>>,
}

impl SupportedVersions {
    /// Parse the `version:target,target` line format.
    ///
    /// Blank lines are skipped. Versions are normalized so that `0.7` and
    /// `0.7.0` name the same node.
    pub fn parse(text: &str) -> Result<Self> {
        let mut graph = BTreeMap::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (version, targets) = line.split_once(':').ok_or_else(|| {
                Error::ValidationError(format!(
                    "supported versions entry ({}) is not in version:targets form",
                    line
                ))
            })?;
            let version = normalize_version(version.trim())?;
            let targets = targets
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(normalize_version)
                .collect::<Result<BTreeSet<_>>>()?;
            graph.insert(version, targets);
        }
        Ok(Self { graph })
    }

    /// Load the graph from a file. A missing file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|_| {
            Error::ValidationError(format!("Version map {} not found", path.display()))
        })?;
        Self::parse(&text)
    }

    /// True if `version` (normalized) is a node of the graph
    pub fn is_supported(&self, version: &str) -> bool {
        self.graph.contains_key(version)
    }

    /// Versions directly reachable from `version`
    pub fn upgrade_targets(&self, version: &str) -> Option<&BTreeSet<String>> {
        self.graph.get(version)
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.graph.keys().map(String::as_str)
    }
}

impl<const N: usize> From<[(&str, &[&str]); N]> for SupportedVersions {
    fn from(entries: [(&str, &[&str]); N]) -> Self {
        let graph = entries
            .into_iter()
            .map(|(v, targets)| {
                (
                    v.to_string(),
                    targets.iter().map(|t| t.to_string()).collect(),
                )
            })
            .collect();
        Self { graph }
    }
}

/// Normalize a version string to `major.minor.patch`.
///
/// Accepts a leading `v`, missing minor or patch components, and drops any
/// pre-release or build suffix (`0.7.0-1` becomes `0.7.0`).
pub fn normalize_version(version: &str) -> Result<String> {
    let invalid = || Error::InvalidVersionFormat(version.to_string());

    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let core = trimmed
        .split(['-', '+'])
        .next()
        .filter(|c| !c.is_empty())
        .ok_or_else(invalid)?;

    let mut parts = core
        .split('.')
        .map(|p| {
            if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                Err(invalid())
            } else {
                p.parse::<u64>().map_err(|_| invalid())
            }
        })
        .collect::<Result<Vec<_>>>()?;
    if parts.len() > 3 {
        return Err(invalid());
    }
    parts.resize(3, 0);

    let parsed = match parts.as_slice() {
        [major, minor, patch] => Version::new(*major, *minor, *patch),
        _ => return Err(invalid()),
    };
    Ok(parsed.to_string())
}

/// True when two version strings name the same release.
///
/// Strings that do not parse are compared as written.
pub fn same_version(a: &str, b: &str) -> bool {
    match (normalize_version(a), normalize_version(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Decide whether `requested` may be written as the cluster's version.
///
/// The first matching rule wins:
/// 1. while upgrading only the current target may be requested
/// 2. while rolling back only the top of the version history may be requested
/// 3. after a failed upgrade only the top of the version history may be
///    requested, which starts a rollback
/// 4. any other error state refuses all version changes
/// 5. the request must be a well-formed, supported version
/// 6. first deploy and no-op requests are accepted
/// 7. otherwise it is an upgrade: no downgrades, and the graph must allow
///    the direct edge from current to requested
pub fn validate_version(
    requested: &str,
    status: Option<&BookkeeperClusterStatus>,
    versions: &SupportedVersions,
) -> Result<()> {
    let default_status = BookkeeperClusterStatus::default();
    let status = status.unwrap_or(&default_status);
    let last_version = status.get_last_version().unwrap_or_default();

    if status.is_cluster_in_upgrading_state() && !same_version(requested, &status.target_version) {
        return Err(Error::ValidationError(
            "failed to process the request, cluster is upgrading".to_string(),
        ));
    }

    if status.is_cluster_in_rollback_state() && !same_version(requested, &last_version) {
        return Err(Error::ValidationError(
            "failed to process the request, rollback in progress.".to_string(),
        ));
    }

    if status.is_cluster_in_upgrade_failed_state() {
        if !same_version(requested, &last_version) {
            return Err(Error::ValidationError(format!(
                "Rollback to version {} not supported. Only rollback to version {} is supported.",
                requested, last_version
            )));
        }
        return Ok(());
    }

    if status.is_cluster_in_error_state() {
        return Err(Error::ValidationError(
            "failed to process the request, cluster is in error state.".to_string(),
        ));
    }

    let requested = normalize_version(requested)?;
    if !versions.is_supported(&requested) {
        return Err(Error::ValidationError(format!(
            "unsupported Bookkeeper cluster version {}",
            requested
        )));
    }

    if status.current_version.is_empty() {
        return Ok(());
    }

    let current = normalize_version(&status.current_version)?;
    if requested == current {
        return Ok(());
    }

    let targets = versions.upgrade_targets(&current).ok_or_else(|| {
        Error::ValidationError(
            "failed to find current cluster version in the supported versions".to_string(),
        )
    })?;

    if is_downgrade(&current, &requested)? {
        return Err(Error::ValidationError(format!(
            "downgrading the cluster from version {} to {} is not supported",
            current, requested
        )));
    }

    if !targets.contains(&requested) {
        return Err(Error::ValidationError(format!(
            "unsupported upgrade from version {} to {}",
            current, requested
        )));
    }

    Ok(())
}

fn is_downgrade(current: &str, requested: &str) -> Result<bool> {
    let current =
        Version::parse(current).map_err(|_| Error::InvalidVersionFormat(current.to_string()))?;
    let requested = Version::parse(requested)
        .map_err(|_| Error::InvalidVersionFormat(requested.to_string()))?;
    Ok(requested < current)
}

/// Every configured data directory must be an absolute path
pub fn validate_absolute_paths(spec: &BookkeeperClusterSpec) -> Result<()> {
    for (option, _) in DIRECTORY_OPTIONS {
        let Some(value) = spec.options.get(option) else {
            continue;
        };
        for path in value.split(',') {
            if !path.starts_with('/') {
                return Err(Error::ValidationError(format!(
                    "path ({}) of {} should start with /",
                    path, option
                )));
            }
        }
    }
    Ok(())
}

/// Bookie identity and data directory options must match what the running
/// bookies were started with.
///
/// `live` is the bookie ConfigMap as currently stored; when it does not exist
/// yet there is nothing to compare against. Options left unset are not checked.
pub fn validate_config_immutability(
    spec: &BookkeeperClusterSpec,
    live: Option<&ConfigMap>,
) -> Result<()> {
    let Some(live) = live else {
        return Ok(());
    };
    let data = live.data.clone().unwrap_or_default();
    let unchanged = |option: &str| {
        spec.options
            .get(option)
            .is_none_or(|requested| data.get(&format!("BK_{}", option)) == Some(requested))
    };

    // Bookie identities registered in ledger metadata derive from this
    if !unchanged(BOOKIE_ID_OPTION) {
        return Err(Error::ConfigImmutable(format!(
            "value of {} should not be changed",
            BOOKIE_ID_OPTION
        )));
    }
    for (option, label) in DIRECTORY_OPTIONS {
        if !unchanged(option) {
            return Err(Error::ConfigImmutable(format!(
                "path of {} directories should not be changed",
                label
            )));
        }
    }
    Ok(())
}
