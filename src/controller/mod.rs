pub mod cleanup;
pub mod context;
pub mod error;
pub mod reconciler;
pub mod restart;
pub mod rollout;
pub mod status;
#[cfg(test)]
pub(crate) mod testing;
pub mod validation;
pub mod wait;

pub use cleanup::{MetadataCleanup, ZK_FINALIZER, ZookeeperCleanup};
pub use context::{Context, RetryTracker};
pub use error::{BackoffConfig, Error, ErrorClass, Result};
pub use reconciler::{REQUEUE_INTERVAL, error_policy, reconcile};
pub use rollout::{RolloutAction, RolloutPlan, RolloutState, Workload, plan_rollback, plan_version_sync};
pub use status::{StatusManager, status_changed};
pub use validation::{SupportedVersions, normalize_version, same_version, validate_version};
pub use wait::{Clock, Poller, TokioClock};
