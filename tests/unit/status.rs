//! Unit tests for cluster conditions and status helpers

use dbcluster_operator::controller::error::Error;
use dbcluster_operator::controller::status::{
    all_replicas_ready, apply_resources, cluster_ready, components_not_ready, condition_changed,
    condition_status, condition_types, find_condition, new_condition, provisioning_started, reasons,
    replicas_not_ready, spec_changed, system_account_provision, upsert_condition,
};
use dbcluster_operator::crd::{ClusterPhase, ClusterStatus, Condition};

use crate::common::*;

fn stamped(condition: Condition, time: &str) -> Condition {
    Condition {
        last_transition_time: time.to_string(),
        ..condition
    }
}

mod helper_tests {
    use super::*;

    #[test]
    fn test_provisioning_started() {
        let ok = provisioning_started(Some(2), None);
        assert_eq!(ok.type_, condition_types::PROVISIONING_STARTED);
        assert_eq!(ok.status, condition_status::TRUE);
        assert_eq!(ok.reason, reasons::PRE_CHECK_SUCCEED);
        assert_eq!(ok.message, "The operator has started the provisioning of Cluster");
        assert_eq!(ok.observed_generation, Some(2));

        let err = Error::ValidationError("bad topology".to_string());
        let failed = provisioning_started(Some(2), Some(&err));
        assert_eq!(failed.status, condition_status::FALSE);
        assert_eq!(failed.reason, reasons::PRE_CHECK_FAILED);
        assert_eq!(failed.message, "Validation error: bad topology");
    }

    #[test]
    fn test_apply_resources() {
        let ok = apply_resources(None, None);
        assert_eq!(ok.reason, reasons::APPLY_RESOURCES_SUCCEED);

        let err = Error::GraphCycle("Secret/default/a".to_string());
        let failed = apply_resources(None, Some(&err));
        assert_eq!(failed.status, condition_status::FALSE);
        assert_eq!(failed.reason, reasons::APPLY_RESOURCES_FAILED);
        assert!(failed.message.contains("Secret/default/a"));
    }

    #[test]
    fn test_replica_conditions() {
        assert_eq!(all_replicas_ready(None).status, condition_status::TRUE);

        let names = vec!["a".to_string(), "b".to_string()];
        let not_ready = replicas_not_ready(None, &names);
        assert_eq!(not_ready.type_, condition_types::REPLICAS_READY);
        assert_eq!(
            not_ready.message,
            "pods are not ready in Components: [a,b], refer to related component message in Cluster.status.components"
        );
    }

    #[test]
    fn test_ready_conditions() {
        let ready = cluster_ready(Some(1), "mycluster");
        assert_eq!(ready.type_, condition_types::READY);
        assert_eq!(ready.reason, reasons::CLUSTER_READY);
        assert_eq!(ready.message, "Cluster: mycluster is ready, current phase is Running");

        let not_ready = components_not_ready(Some(1), &["c".to_string()]);
        assert_eq!(not_ready.status, condition_status::FALSE);
        assert_eq!(
            not_ready.message,
            "pods are unavailable in Components: [c], refer to related component message in Cluster.status.components"
        );
    }

    #[test]
    fn test_account_condition() {
        let done = system_account_provision(Some(3), "root:abc", true);
        assert_eq!(done.type_, condition_types::SYSTEM_ACCOUNT_PROVISION);
        assert_eq!(done.reason, reasons::ALL_ACCOUNTS_PROVISIONED);
        assert_eq!(done.message, "root:abc");

        let pending = system_account_provision(Some(3), "", false);
        assert_eq!(pending.status, condition_status::FALSE);
        assert_eq!(pending.reason, reasons::ACCOUNTS_IN_PROGRESS);
    }
}

mod upsert_tests {
    use super::*;

    #[test]
    fn test_insert_new_type() {
        let mut conditions = Vec::new();
        assert!(upsert_condition(&mut conditions, cluster_ready(None, "c")));
        assert!(upsert_condition(&mut conditions, all_replicas_ready(None)));
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn test_replace_keeps_one_per_type() {
        let mut conditions = vec![cluster_ready(None, "c")];
        assert!(upsert_condition(&mut conditions, components_not_ready(None, &["a".to_string()])));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, condition_status::FALSE);
    }

    #[test]
    fn test_identical_condition_keeps_transition_time() {
        let mut conditions = vec![stamped(cluster_ready(Some(1), "c"), "2024-01-01T00:00:00Z")];
        assert!(!upsert_condition(&mut conditions, cluster_ready(Some(1), "c")));
        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_new_generation_is_recorded_without_moving_time() {
        let mut conditions = vec![stamped(cluster_ready(Some(1), "c"), "2024-01-01T00:00:00Z")];
        assert!(upsert_condition(&mut conditions, cluster_ready(Some(2), "c")));
        assert_eq!(conditions[0].observed_generation, Some(2));
        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_status_change_moves_time() {
        let mut conditions = vec![stamped(cluster_ready(Some(1), "c"), "2024-01-01T00:00:00Z")];
        upsert_condition(&mut conditions, components_not_ready(Some(1), &["a".to_string()]));
        assert_ne!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_changed_compares_messages() {
        let conditions = vec![new_condition("Ready", "True", "ClusterReady", "ok", None)];
        assert!(!condition_changed(
            &conditions,
            &new_condition("Ready", "False", "Other", "ok", None)
        ));
        assert!(condition_changed(
            &conditions,
            &new_condition("Ready", "True", "ClusterReady", "different", None)
        ));
        assert!(condition_changed(
            &conditions,
            &new_condition("ReplicasReady", "True", "AllReplicasReady", "ok", None)
        ));
    }

    #[test]
    fn test_find_condition() {
        let conditions = vec![cluster_ready(None, "c"), all_replicas_ready(None)];
        assert!(find_condition(&conditions, condition_types::REPLICAS_READY).is_some());
        assert!(find_condition(&conditions, condition_types::APPLY_RESOURCES).is_none());
    }
}

mod spec_changed_tests {
    use super::*;

    #[test]
    fn test_no_status() {
        let cluster = ClusterBuilder::new("c", "default").build();
        assert!(spec_changed(&cluster));
    }

    #[test]
    fn test_generation_observed() {
        let mut cluster = ClusterBuilder::new("c", "default").with_generation(3).build();
        cluster.status = Some(ClusterStatus {
            observed_generation: Some(3),
            phase: Some(ClusterPhase::Running),
            ..Default::default()
        });
        assert!(!spec_changed(&cluster));
    }

    #[test]
    fn test_generation_increased() {
        let mut cluster = ClusterBuilder::new("c", "default").with_generation(4).build();
        cluster.status = Some(ClusterStatus {
            observed_generation: Some(3),
            ..Default::default()
        });
        assert!(spec_changed(&cluster));
    }
}
