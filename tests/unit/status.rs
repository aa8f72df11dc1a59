//! Unit tests for the condition store and status management

use bookkeeper_operator::controller::status::reasons;
use bookkeeper_operator::controller::status_changed;
use bookkeeper_operator::crd::{
    BookkeeperClusterStatus, ClusterCondition, ConditionStatus, ConditionType, Conditions,
};

use crate::common::{BookkeeperClusterBuilder, StatusBuilder};

const T0: &str = "2024-01-01T00:00:00+00:00";
const T1: &str = "2024-01-01T00:05:00+00:00";
const T2: &str = "2024-01-01T00:10:00+00:00";

fn exclusive_true(status: &BookkeeperClusterStatus) -> Vec<ConditionType> {
    ConditionType::ALL
        .into_iter()
        .filter(|t| t.is_exclusive() && status.conditions.is_true(*t))
        .collect()
}

mod condition_store_tests {
    use super::*;

    #[test]
    fn test_default_status_has_no_conditions() {
        let status = BookkeeperClusterStatus::default();
        assert!(status.conditions.is_empty());
        assert!(!status.is_cluster_in_ready_state());
        assert!(status.get_last_condition().is_none());
    }

    #[test]
    fn test_init_fills_missing_conditions_only() {
        let mut status = BookkeeperClusterStatus::default();
        status.set_condition_at(ConditionType::Error, ConditionStatus::True, "Boom", "m", T0);
        status.init();

        assert_eq!(status.conditions.len(), 4);
        let error = status.get_cluster_condition(ConditionType::Error).unwrap();
        assert_eq!(error.status, ConditionStatus::True);
        assert_eq!(error.reason, "Boom");
        assert_eq!(error.last_transition_time, T0);
    }

    #[test]
    fn test_setting_same_status_keeps_transition_time() {
        let mut status = BookkeeperClusterStatus::default();
        status.set_condition_at(ConditionType::PodsReady, ConditionStatus::False, "", "", T0);
        status.set_condition_at(ConditionType::PodsReady, ConditionStatus::False, "", "", T1);

        let c = status.get_cluster_condition(ConditionType::PodsReady).unwrap();
        assert_eq!(c.last_transition_time, T0);
        assert_eq!(c.last_update_time, T1);
    }

    #[test]
    fn test_flip_moves_transition_time() {
        let mut status = BookkeeperClusterStatus::default();
        status.set_condition_at(ConditionType::PodsReady, ConditionStatus::False, "", "", T0);
        status.set_condition_at(ConditionType::PodsReady, ConditionStatus::True, "", "", T1);
        status.set_condition_at(ConditionType::PodsReady, ConditionStatus::True, "", "", T2);

        let c = status.get_cluster_condition(ConditionType::PodsReady).unwrap();
        assert_eq!(c.last_transition_time, T1);
        assert_eq!(c.last_update_time, T2);
    }

    #[test]
    fn test_clearing_exclusive_condition_resets_reason() {
        let mut status = StatusBuilder::fresh().build();
        status.set_condition_at(
            ConditionType::Upgrading,
            ConditionStatus::True,
            reasons::UPDATING_BOOKKEEPER,
            "2",
            T0,
        );
        status.set_condition_at(
            ConditionType::Error,
            ConditionStatus::True,
            reasons::UPGRADE_FAILED,
            "pod failed",
            T1,
        );

        let upgrading = status.get_cluster_condition(ConditionType::Upgrading).unwrap();
        assert_eq!(upgrading.status, ConditionStatus::False);
        assert_eq!(upgrading.reason, "");
        assert_eq!(upgrading.message, "");
        assert_eq!(upgrading.last_transition_time, T1);
    }

    #[test]
    fn test_at_most_one_exclusive_condition() {
        let mut status = StatusBuilder::fresh().build();
        let sequence = [
            ConditionType::Upgrading,
            ConditionType::Error,
            ConditionType::Rollback,
            ConditionType::Upgrading,
            ConditionType::Rollback,
            ConditionType::Error,
        ];
        for type_ in sequence {
            status.set_condition_at(type_, ConditionStatus::True, "", "", T0);
            assert_eq!(exclusive_true(&status), vec![type_]);
        }
    }

    #[test]
    fn test_pods_ready_is_independent() {
        let mut status = StatusBuilder::fresh().build();
        status.set_pods_ready_condition_true();
        status.set_upgrading_condition_true(reasons::UPDATING_BOOKKEEPER, "0");
        status.set_error_condition_true(reasons::UPGRADE_FAILED, "m");

        assert!(status.is_cluster_in_ready_state());
        assert!(status.is_cluster_in_error_state());

        status.set_pods_ready_condition_false();
        assert!(!status.is_cluster_in_ready_state());
        assert!(status.is_cluster_in_error_state());
    }
}

mod predicate_tests {
    use super::*;

    #[test]
    fn test_upgrade_failed_or_rollback() {
        assert!(
            StatusBuilder::upgrade_failed("0.6.0")
                .build()
                .is_cluster_in_upgrade_failed_or_rollback_state()
        );
        assert!(
            StatusBuilder::rolling_back("0.6.0")
                .build()
                .is_cluster_in_upgrade_failed_or_rollback_state()
        );
        assert!(
            !StatusBuilder::upgrading("0.6.0", "0.7.0")
                .build()
                .is_cluster_in_upgrade_failed_or_rollback_state()
        );
        assert!(
            !StatusBuilder::stable("0.6.0")
                .with_error(reasons::ROLLBACK_FAILED, "m")
                .build()
                .is_cluster_in_upgrade_failed_or_rollback_state()
        );
    }

    #[test]
    fn test_error_reason_is_only_read_while_true() {
        let mut status = StatusBuilder::upgrade_failed("0.6.0").build();
        assert!(status.is_cluster_in_upgrade_failed_state());
        status.set_rollback_condition_true(reasons::UPDATING_BOOKKEEPER, "0");
        assert!(!status.is_cluster_in_upgrade_failed_state());
        assert!(!status.is_cluster_in_error_state());
    }

    #[test]
    fn test_last_condition_prefers_active_rollout() {
        let status = StatusBuilder::rolling_back("0.6.0").build();
        let last = status.get_last_condition().unwrap();
        assert_eq!(last.type_, ConditionType::Rollback);

        let status = StatusBuilder::upgrade_failed("0.6.0").build();
        assert!(status.get_last_condition().is_none());
    }

    #[test]
    fn test_version_history_top() {
        let mut status = StatusBuilder::stable("0.5.0").build();
        status.add_to_version_history("0.6.0");
        status.add_to_version_history("0.6.0");
        assert_eq!(status.get_last_version(), Some("0.6.0"));
        assert_eq!(status.version_history.len(), 2);

        let status = StatusBuilder::fresh().build();
        assert_eq!(status.get_last_version(), None);
    }
}

mod persistence_tests {
    use super::*;

    #[test]
    fn test_status_wire_shape() {
        let mut status = StatusBuilder::upgrading("0.6.0", "0.7.0").build();
        status.set_members(vec!["bk-bookie-0".into()], vec!["bk-bookie-1".into()]);
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["currentVersion"], "0.6.0");
        assert_eq!(json["targetVersion"], "0.7.0");
        assert_eq!(json["versionHistory"], serde_json::json!(["0.6.0"]));
        assert_eq!(json["readyReplicas"], 1);
        assert_eq!(json["currentReplicas"], 2);
        assert_eq!(json["members"]["ready"], serde_json::json!(["bk-bookie-0"]));
        assert_eq!(json["conditions"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_duplicate_condition_keeps_last() {
        let mut first = ClusterCondition::new(ConditionType::Error, ConditionStatus::True, T0);
        first.reason = "First".to_string();
        let mut second = ClusterCondition::new(ConditionType::Error, ConditionStatus::False, T1);
        second.reason = "Second".to_string();

        let conditions = Conditions::from(vec![first, second]);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions.get(ConditionType::Error).unwrap().reason, "Second");
    }

    #[test]
    fn test_status_round_trips() {
        let status = StatusBuilder::rolling_back("0.6.0")
            .with_history(&["0.6.0", "0.5.0"])
            .build();
        let json = serde_json::to_string(&status).unwrap();
        let back: BookkeeperClusterStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_status_changed() {
        let status = StatusBuilder::stable("0.6.0").build();
        let cluster = BookkeeperClusterBuilder::new("bk", "default")
            .with_status(status.clone())
            .build();
        assert!(!status_changed(&cluster, &status));

        let mut next = status.clone();
        next.replicas = 5;
        assert!(status_changed(&cluster, &next));

        let unsaved = BookkeeperClusterBuilder::new("bk", "default").build();
        assert!(status_changed(&unsaved, &status));
    }

    #[test]
    fn test_rewriting_same_condition_is_not_a_change() {
        let mut status = StatusBuilder::stable("0.6.0").build();
        status.set_condition_at(ConditionType::PodsReady, ConditionStatus::True, "", "", T0);
        let cluster = BookkeeperClusterBuilder::new("bk", "default")
            .with_status(status.clone())
            .build();

        let mut next = status.clone();
        next.set_condition_at(ConditionType::PodsReady, ConditionStatus::True, "", "", T1);
        assert_ne!(next, status);
        assert!(!status_changed(&cluster, &next));

        next.set_condition_at(ConditionType::PodsReady, ConditionStatus::False, "", "", T2);
        assert!(status_changed(&cluster, &next));
    }
}
