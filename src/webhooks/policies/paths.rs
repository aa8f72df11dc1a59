//! Directory path policy

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::validate_absolute_paths;

/// Journal, ledger and index directories must be absolute paths
pub fn validate_paths(ctx: &ValidationContext) -> ValidationResult {
    match validate_absolute_paths(&ctx.cluster.spec) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::from_error("InvalidDirectoryPath", &e),
    }
}
