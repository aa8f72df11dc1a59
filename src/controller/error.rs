//! Error types for the BookkeeperCluster controller

use std::time::Duration;

use thiserror::Error;

/// Variants keep the `Error` suffix used throughout the operator
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A mutation request was refused; the message is shown to the user verbatim
    #[error("{0}")]
    ValidationError(String),

    #[error("request version is not in valid format: {0}")]
    InvalidVersionFormat(String),

    /// A field frozen after first deploy was changed
    #[error("{0}")]
    ConfigImmutable(String),

    /// A member pod failed to come up on its new template
    #[error("pod {pod} update failed because of {reason}")]
    RolloutFault { pod: String, reason: String },

    #[error("{what}")]
    Timeout { what: String, elapsed: Duration },

    #[error("metadata cleanup failed: {0}")]
    CleanupError(String),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),
}

/// How the operator reacts to an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Refused before persistence; the user must change the request
    Validation,
    /// Aborts the pass; the next pass retries with backoff
    Transient,
    /// Recorded in status; only a rollback request clears it
    RolloutFault,
    /// Needs a fix to the object or the operator before a retry can succeed
    Permanent,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ValidationError(_) | Error::InvalidVersionFormat(_) | Error::ConfigImmutable(_) => {
                ErrorClass::Validation
            }
            Error::RolloutFault { .. } => ErrorClass::RolloutFault,
            // 4xx are caller mistakes, except Conflict and TooManyRequests
            Error::KubeError(kube::Error::Api(e)) if (400..500).contains(&e.code) => {
                if e.code == 409 || e.code == 429 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            Error::KubeError(_)
            | Error::TransientError(_)
            | Error::Timeout { .. }
            | Error::CleanupError(_) => ErrorClass::Transient,
            Error::InvalidConfig(_) | Error::SerializationError(_) | Error::MissingObjectKey(_) => {
                ErrorClass::Permanent
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// True for a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }

    /// True for a 409 from the API server, e.g. a stale resourceVersion on write
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }

    pub fn is_validation(&self) -> bool {
        self.class() == ErrorClass::Validation
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Requeue delays after a failed pass
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (0-based), jittered and capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let max = self.max_delay.as_secs_f64();
        let base = (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent)).min(max);
        let spread = base * self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64((base + spread).clamp(0.0, max))
    }

    /// Errors a retry cannot fix wait the maximum delay
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}
