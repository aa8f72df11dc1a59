//! Immutability policy
//!
//! Bookies keep their data under the journal, ledger and index directories
//! they were started with. Moving them would orphan the data, so once the
//! bookie ConfigMap exists those options are frozen.

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::validate_config_immutability;

/// Validate that data directory options still match the live ConfigMap
pub fn validate_immutability(ctx: &ValidationContext) -> ValidationResult {
    match validate_config_immutability(&ctx.cluster.spec, ctx.live_config_map) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::from_error("ConfigImmutable", &e),
    }
}
