// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the BookKeeper Operator
//!
//! This module contains unit tests for:
//! - Resource generators (StatefulSet, Service, ConfigMap, PDB)
//! - Version and configuration validation
//! - Condition store and status management
//! - Rollout planning
//! - Finalizer and metadata cleanup helpers
//! - Admission webhook policies

#[path = "../common/mod.rs"]
mod common;

mod cleanup;
mod status;
