//! Admission webhook policies
//!
//! Each policy module exports a `validate` function that checks one rule
//! against a [`ValidationContext`]. Which policies run depends on the
//! operation: creates check the version and directory paths, updates check
//! the version and the frozen directory layout, deletes always pass.

pub mod immutability;
pub mod paths;
pub mod version;

pub use immutability::validate_immutability;
pub use paths::validate_paths;
pub use version::validate_version;

use k8s_openapi::api::core::v1::ConfigMap;

use crate::controller::error::Error;
use crate::controller::validation::SupportedVersions;
use crate::crd::BookkeeperCluster;

/// Result of a policy validation
#[derive(Debug)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }

    /// Deny with the message of a validation error
    pub fn from_error(reason: &str, error: &Error) -> Self {
        Self::denied(reason, &error.to_string())
    }
}

/// Everything a policy may look at
pub struct ValidationContext<'a> {
    pub cluster: &'a BookkeeperCluster,
    pub supported_versions: &'a SupportedVersions,
    /// The bookie ConfigMap as stored, for updates
    pub live_config_map: Option<&'a ConfigMap>,
}

impl<'a> ValidationContext<'a> {
    pub fn new(
        cluster: &'a BookkeeperCluster,
        supported_versions: &'a SupportedVersions,
        live_config_map: Option<&'a ConfigMap>,
    ) -> Self {
        Self {
            cluster,
            supported_versions,
            live_config_map,
        }
    }
}

type Policy = fn(&ValidationContext) -> ValidationResult;

fn first_denial(ctx: &ValidationContext, policies: &[Policy]) -> ValidationResult {
    policies
        .iter()
        .map(|policy| policy(ctx))
        .find(|result| !result.allowed)
        .unwrap_or_else(ValidationResult::allowed)
}

/// Policies for a new cluster
pub fn validate_create(ctx: &ValidationContext) -> ValidationResult {
    first_denial(ctx, &[validate_version, validate_paths])
}

/// Policies for a changed cluster
pub fn validate_update(ctx: &ValidationContext) -> ValidationResult {
    first_denial(ctx, &[validate_version, validate_immutability])
}
