//! Upgrade and rollback lifecycles, one reconcile pass at a time

use bookkeeper_operator::controller::status::reasons;
use bookkeeper_operator::controller::{Error, RolloutAction, validate_version};
use bookkeeper_operator::crd::ConditionType;

use crate::common::supported_versions;
use crate::mock_cluster::{PassReport, SimulatedCluster};

/// Change `spec.version` the way a user would, through admission validation
fn edit_version(cluster: &mut SimulatedCluster, version: &str) -> Result<(), Error> {
    validate_version(version, Some(&cluster.status), &supported_versions())?;
    cluster.spec_version = version.to_string();
    Ok(())
}

/// A cluster that finished its first deploy at `version`
fn deployed(version: &str, replicas: usize) -> SimulatedCluster {
    let mut cluster = SimulatedCluster::create("bk", version, replicas);
    cluster.run_until(5, |c| c.status.is_cluster_in_ready_state());
    cluster
}

fn all_idle(reports: &[PassReport]) -> bool {
    reports
        .iter()
        .flat_map(|r| &r.actions)
        .all(|a| *a == RolloutAction::None)
}

fn deleted(reports: &[PassReport]) -> usize {
    reports.iter().map(PassReport::deleted_pods).sum()
}

fn error_message(cluster: &SimulatedCluster) -> String {
    cluster
        .status
        .get_cluster_condition(ConditionType::Error)
        .unwrap()
        .message
        .clone()
}

mod first_deploy_tests {
    use super::*;

    #[test]
    fn test_first_deploy_adopts_version() {
        let mut cluster = SimulatedCluster::create("bk", "0.6.0", 3);
        let reports = cluster.run_until(5, |c| c.status.is_cluster_in_ready_state());

        assert!(all_idle(&reports));
        assert_eq!(cluster.status.current_version, "0.6.0");
        assert_eq!(cluster.status.get_last_version(), Some("0.6.0"));
        assert!(cluster.status.target_version.is_empty());
        assert_eq!(cluster.status.ready_replicas, 3);
        assert_eq!(
            cluster.status.members.ready,
            ["bk-bookie-0", "bk-bookie-1", "bk-bookie-2"]
        );
    }

    #[test]
    fn test_steady_state_is_quiet() {
        let mut cluster = deployed("0.6.0", 3);
        let reports: Vec<_> = (0..5).map(|_| cluster.tick()).collect();
        assert!(all_idle(&reports));
        assert_eq!(cluster.status.current_version, "0.6.0");
    }
}

mod upgrade_tests {
    use super::*;

    #[test]
    fn test_upgrade_replaces_one_bookie_at_a_time() {
        let mut cluster = deployed("0.6.0", 3);
        edit_version(&mut cluster, "0.7.0").unwrap();

        let mut reports = Vec::new();
        let mut progress = Vec::new();
        let mut max_unavailable = 0;
        while cluster.status.current_version != "0.7.0" {
            assert!(reports.len() < 20, "upgrade did not finish");
            let report = cluster.tick();
            cluster.check_invariants(&report);
            max_unavailable = max_unavailable.max(cluster.unavailable_pods());
            if let Some(upgrading) = cluster.status.get_last_condition() {
                progress.push(upgrading.message.parse::<usize>().unwrap());
            }
            reports.push(report);
        }

        assert_eq!(
            reports[0].actions[0],
            RolloutAction::ApplyTemplate {
                version: "0.7.0".to_string()
            }
        );
        assert_eq!(reports.len(), 8);
        assert_eq!(deleted(&reports), 3);
        assert_eq!(max_unavailable, 1);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
        assert_eq!(reports.last().unwrap().completed.as_deref(), Some("0.7.0"));

        assert_eq!(cluster.pods_on("0.7.0"), 3);
        assert!(cluster.status.target_version.is_empty());
        assert!(!cluster.status.is_cluster_in_upgrading_state());
        assert_eq!(cluster.status.get_last_version(), Some("0.6.0"));
    }

    #[test]
    fn test_version_is_locked_while_upgrading() {
        let mut cluster = deployed("0.6.0", 3);
        edit_version(&mut cluster, "0.7.0").unwrap();
        cluster.tick();
        cluster.tick();
        assert!(cluster.status.is_cluster_in_upgrading_state());

        let err = edit_version(&mut cluster, "0.6.1").unwrap_err();
        assert_eq!(err.to_string(), "failed to process the request, cluster is upgrading");
        assert_eq!(cluster.spec_version, "0.7.0");

        edit_version(&mut cluster, "0.7.0").unwrap();
        cluster.run_until(20, |c| c.status.current_version == "0.7.0");
    }

    #[test]
    fn test_graph_limits_upgrades() {
        let mut cluster = deployed("0.5.0", 3);
        let err = edit_version(&mut cluster, "0.7.0").unwrap_err();
        assert_eq!(err.to_string(), "unsupported upgrade from version 0.5.0 to 0.7.0");

        edit_version(&mut cluster, "0.6.0").unwrap();
        cluster.run_until(20, |c| c.status.current_version == "0.6.0");
        edit_version(&mut cluster, "0.7.0").unwrap();
        cluster.run_until(20, |c| c.status.current_version == "0.7.0");

        let err = edit_version(&mut cluster, "0.6.0").unwrap_err();
        assert_eq!(
            err.to_string(),
            "downgrading the cluster from version 0.7.0 to 0.6.0 is not supported"
        );
        assert_eq!(cluster.status.get_last_version(), Some("0.6.0"));
    }

    #[test]
    fn test_scale_up_during_upgrade_uses_target() {
        let mut cluster = deployed("0.6.0", 3);
        edit_version(&mut cluster, "0.7.0").unwrap();
        cluster.tick();
        cluster.replicas = 4;
        cluster.run_until(30, |c| c.status.current_version == "0.7.0");
        assert_eq!(cluster.pods_on("0.7.0"), 4);
    }
}

mod failure_tests {
    use super::*;

    /// Upgrade to a version whose image cannot be pulled
    fn failed_upgrade() -> SimulatedCluster {
        let mut cluster = deployed("0.6.0", 3);
        cluster.break_version("0.7.0");
        edit_version(&mut cluster, "0.7.0").unwrap();
        let reports = cluster.run_until(20, |c| c.status.is_cluster_in_error_state());

        let faults: Vec<_> = reports.iter().flat_map(|r| &r.faults).collect();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].pod, "bk-bookie-0");
        assert_eq!(faults[0].condition_reason, reasons::UPGRADE_FAILED);
        assert_eq!(deleted(&reports), 1);
        cluster
    }

    #[test]
    fn test_image_pull_failure_stops_upgrade() {
        let cluster = failed_upgrade();
        assert!(cluster.status.is_cluster_in_upgrade_failed_state());
        assert_eq!(
            error_message(&cluster),
            "pod bk-bookie-0 update failed because of ImagePullBackOff"
        );
        assert_eq!(cluster.status.current_version, "0.6.0");
        assert!(cluster.status.target_version.is_empty());
        assert_eq!(cluster.pods_on("0.7.0"), 1);
        assert_eq!(cluster.pods_on("0.6.0"), 2);
    }

    #[test]
    fn test_failed_cluster_waits_for_rollback() {
        let mut cluster = failed_upgrade();
        let reports: Vec<_> = (0..3).map(|_| cluster.tick()).collect();
        assert!(all_idle(&reports));
        assert!(cluster.status.is_cluster_in_upgrade_failed_state());

        let err = edit_version(&mut cluster, "0.6.1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Rollback to version 0.6.1 not supported. Only rollback to version 0.6.0 is supported."
        );
        assert!(edit_version(&mut cluster, "0.7.0").is_err());
    }

    #[test]
    fn test_rollback_restores_last_version() {
        let mut cluster = failed_upgrade();
        edit_version(&mut cluster, "0.6.0").unwrap();

        let first = cluster.tick();
        cluster.check_invariants(&first);
        assert_eq!(
            first.actions[1],
            RolloutAction::ApplyTemplate {
                version: "0.6.0".to_string()
            }
        );
        assert!(cluster.status.is_cluster_in_rollback_state());
        assert!(!cluster.status.is_cluster_in_error_state());

        let reports = cluster.run_until(20, |c| !c.status.is_cluster_in_rollback_state());
        assert_eq!(deleted(&reports), 1);
        assert_eq!(reports.last().unwrap().completed.as_deref(), Some("0.6.0"));

        assert_eq!(cluster.pods_on("0.6.0"), 3);
        assert_eq!(cluster.status.current_version, "0.6.0");
        assert!(!cluster.status.is_cluster_in_error_state());
        assert!(cluster.status.is_cluster_in_ready_state());
        assert!(cluster.status.target_version.is_empty());
    }

    #[test]
    fn test_recovered_cluster_can_upgrade_again() {
        let mut cluster = failed_upgrade();
        edit_version(&mut cluster, "0.6.0").unwrap();
        cluster.run_until(20, |c| {
            !c.status.is_cluster_in_rollback_state() && !c.status.is_cluster_in_error_state()
        });

        cluster.broken_versions.clear();
        edit_version(&mut cluster, "0.7.0").unwrap();
        cluster.run_until(20, |c| c.status.current_version == "0.7.0");
        assert_eq!(cluster.pods_on("0.7.0"), 3);
    }

    #[test]
    fn test_rollback_failure_freezes_cluster() {
        let mut cluster = failed_upgrade();
        cluster.break_version("0.6.0");
        edit_version(&mut cluster, "0.6.0").unwrap();

        let reports = cluster.run_until(20, |c| c.status.is_cluster_in_error_state());
        let fault = reports.iter().flat_map(|r| &r.faults).next().unwrap();
        assert_eq!(fault.condition_reason, reasons::ROLLBACK_FAILED);

        assert!(cluster.status.is_cluster_in_rollback_failed_state());
        assert!(!cluster.status.is_cluster_in_rollback_state());
        assert!(cluster.status.target_version.is_empty());

        let err = edit_version(&mut cluster, "0.6.0").unwrap_err();
        assert_eq!(err.to_string(), "failed to process the request, cluster is in error state.");

        let idle: Vec<_> = (0..3).map(|_| cluster.tick()).collect();
        assert!(all_idle(&idle));
    }

    #[test]
    fn test_crashing_bookie_blocks_upgrade() {
        let mut cluster = deployed("0.6.0", 3);
        cluster.crash(0, "CrashLoopBackOff");
        edit_version(&mut cluster, "0.7.0").unwrap();

        let reports = cluster.run_until(10, |c| c.status.is_cluster_in_error_state());
        assert_eq!(deleted(&reports), 0);
        assert!(cluster.status.is_cluster_in_upgrade_failed_state());
        assert_eq!(
            error_message(&cluster),
            "pod bk-bookie-0 update failed because of CrashLoopBackOff"
        );
        assert_eq!(cluster.pods_on("0.6.0"), 3);
    }
}
