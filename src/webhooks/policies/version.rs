//! Version policy
//!
//! The requested version must be reachable from the cluster's current state.

use super::{ValidationContext, ValidationResult};
use crate::controller::error::Error;
use crate::controller::validation;
use crate::crd::DEFAULT_BOOKKEEPER_VERSION;

/// Validate `spec.version` against the cluster status and the supported-version graph
pub fn validate_version(ctx: &ValidationContext) -> ValidationResult {
    let requested = match ctx.cluster.spec.version.trim() {
        "" => DEFAULT_BOOKKEEPER_VERSION,
        v => v,
    };

    match validation::validate_version(
        requested,
        ctx.cluster.status.as_ref(),
        ctx.supported_versions,
    ) {
        Ok(()) => ValidationResult::allowed(),
        Err(e @ Error::InvalidVersionFormat(_)) => {
            ValidationResult::from_error("InvalidVersionFormat", &e)
        }
        Err(e) => ValidationResult::from_error("VersionNotAllowed", &e),
    }
}
