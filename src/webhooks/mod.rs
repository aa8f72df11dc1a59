//! Admission webhooks for BookkeeperCluster validation
//!
//! This module implements a ValidatingAdmissionWebhook that rejects version
//! changes the cluster cannot make, relative data directory paths and
//! changes to directories the bookies already store data in, before the
//! object is persisted.

pub mod policies;
mod server;

pub use policies::{ValidationContext, ValidationResult, validate_create, validate_update};
pub use server::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server};
