// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Functional tests for version rollouts
//!
//! These tests run whole upgrade and rollback lifecycles against a simulated
//! workload, one reconcile pass at a time, without a Kubernetes cluster.
//! User edits go through the same version validation the admission webhook
//! applies.

#[path = "../common/mod.rs"]
mod common;

mod mock_cluster;
mod scenario_tests;
