//! Unit tests for the horizontal-scale data-clone orchestrator

use std::collections::BTreeMap;
use std::sync::Arc;

use dbcluster_operator::controller::error::Error;
use dbcluster_operator::controller::events::{PendingEvent, reasons};
use dbcluster_operator::crd::{
    Backup, BackupMethod, BackupPhase, Cluster, ClusterComponentSpec, Component, ComponentDefinition,
    ComponentPhase, Restore, RestorePhase,
};
use dbcluster_operator::graph::{GraphAction, MutationGraph, ObjectKey, Vertex};
use dbcluster_operator::hscale::{
    BackupDataClone, BackupState, DataClone, RestoreState, ScaleReport, ScaleTarget,
    reconcile_horizontal_scale,
};
use dbcluster_operator::resources::common::{
    APP_INSTANCE_LABEL, BACKUP_POLICY_TEMPLATE_ANNOTATION, COMP_DEF_LABEL,
};
use dbcluster_operator::resources::dataprotection::build_backup;

use crate::common::*;

const NS: &str = "default";

fn cluster(spec: &ClusterComponentSpec) -> Cluster {
    ClusterBuilder::new("mycluster", NS).with_component(spec.clone()).build()
}

fn mysql_spec(replicas: i32, vcts: &[&str]) -> ClusterComponentSpec {
    let mut spec = component_spec("mysql", "mysql-8.0", replicas);
    spec.volume_claim_templates = vcts.iter().map(|v| vct(v)).collect();
    spec
}

fn comp_key() -> ObjectKey {
    ObjectKey::new(kind_of::<Component>(), Some(NS.to_string()), "mycluster-mysql")
}

fn backup_key() -> ObjectKey {
    ObjectKey::new(kind_of::<Backup>(), Some(NS.to_string()), "mycluster-mysql-scaling")
}

/// A graph holding the desired Component vertex, as the pipeline leaves it
fn graph_with_component(replicas: i32) -> MutationGraph {
    let mut comp = component("mycluster", NS, "mysql", "mysql-8.0", ComponentPhase::Running);
    comp.spec.replicas = replicas;
    let mut graph = MutationGraph::new();
    graph.add_vertex(Vertex::patch(&comp).unwrap());
    graph
}

fn desired_replicas(graph: &MutationGraph) -> i64 {
    graph.vertex(&comp_key()).unwrap().object.data["spec"]["replicas"]
        .as_i64()
        .unwrap()
}

fn scaling_policy(methods: Vec<BackupMethod>) -> dbcluster_operator::crd::BackupPolicy {
    let labels = BTreeMap::from([
        (APP_INSTANCE_LABEL.to_string(), "mycluster".to_string()),
        (COMP_DEF_LABEL.to_string(), "mysql-8.0".to_string()),
    ]);
    let mut policy = backup_policy("mycluster-mysql-backup-policy", NS, labels, methods);
    policy.metadata.annotations = Some(BTreeMap::from([(
        BACKUP_POLICY_TEMPLATE_ANNOTATION.to_string(),
        "mysql-backup-policy".to_string(),
    )]));
    policy
}

/// Platform with a one-replica workload and a clone-volume definition
fn clone_platform(methods: Vec<BackupMethod>) -> Arc<FakeCluster> {
    Arc::new(
        FakeCluster::new()
            .with_statefulset(NS, "mycluster-mysql", 1)
            .with_pvc(NS, "data-mycluster-mysql-0", true)
            .with_backup_policy(scaling_policy(methods)),
    )
}

struct Scale {
    graph: MutationGraph,
    events: Vec<PendingEvent>,
    report: Result<ScaleReport, Error>,
}

async fn scale(platform: &Arc<FakeCluster>, spec: &ClusterComponentSpec, def: &ComponentDefinition) -> Scale {
    let mut graph = graph_with_component(spec.replicas);
    let mut events = Vec::new();
    let report = reconcile_horizontal_scale(
        platform.clone(),
        &cluster(spec),
        &[(spec.clone(), def.clone())],
        &mut graph,
        &mut events,
    )
    .await;
    Scale { graph, events, report }
}

fn has_event(events: &[PendingEvent], reason: &str) -> bool {
    events.iter().any(|e| e.reason == reason)
}

mod no_policy_tests {
    use super::*;

    #[tokio::test]
    async fn test_no_templates_needs_no_clone() {
        let platform = Arc::new(FakeCluster::new().with_statefulset(NS, "mycluster-mysql", 1));
        let spec = mysql_spec(3, &[]);

        let out = scale(&platform, &spec, &comp_def("mysql-8.0", "8.0.30")).await;
        assert!(!out.report.unwrap().requeue());
        assert_eq!(desired_replicas(&out.graph), 3);
        assert!(out.events.iter().any(|e| e.reason == reasons::HORIZONTAL_SCALE
            && e.note == "no VolumeClaimTemplates, no need to do data clone."));
    }

    #[tokio::test]
    async fn test_empty_claims_are_created_first() {
        let platform = Arc::new(FakeCluster::new().with_statefulset(NS, "mycluster-mysql", 1));
        let spec = mysql_spec(3, &["data", "log"]);
        let def = comp_def("mysql-8.0", "8.0.30");

        let out = scale(&platform, &spec, &def).await;
        let report = out.report.unwrap();
        assert_eq!(report.in_progress, ["mysql"]);
        assert_eq!(desired_replicas(&out.graph), 1);

        let created: Vec<String> = out
            .graph
            .vertices_with(GraphAction::Create)
            .map(|v| v.key.name.clone())
            .collect();
        assert_eq!(
            created,
            [
                "data-mycluster-mysql-1",
                "data-mycluster-mysql-2",
                "log-mycluster-mysql-1",
                "log-mycluster-mysql-2"
            ]
        );

        // Claims are applied before the Component
        let order: Vec<_> = out.graph.walk_order().unwrap().iter().map(|v| v.key.clone()).collect();
        assert_eq!(order.last(), Some(&comp_key()));

        platform.apply(&out.graph);
        let out = scale(&platform, &spec, &def).await;
        assert!(!out.report.unwrap().requeue());
        assert_eq!(desired_replicas(&out.graph), 3);
    }

    #[tokio::test]
    async fn test_missing_workload_is_left_alone() {
        let platform = Arc::new(FakeCluster::new());
        let spec = mysql_spec(3, &["data"]);

        let out = scale(&platform, &spec, &comp_def("mysql-8.0", "8.0.30")).await;
        assert!(!out.report.unwrap().requeue());
        assert_eq!(desired_replicas(&out.graph), 3);
        assert_eq!(out.graph.len(), 1);
    }

    #[tokio::test]
    async fn test_scale_in_is_not_held() {
        let platform = Arc::new(FakeCluster::new().with_statefulset(NS, "mycluster-mysql", 3));
        let spec = mysql_spec(1, &["data"]);

        let out = scale(&platform, &spec, &comp_def("mysql-8.0", "8.0.30")).await;
        assert!(!out.report.unwrap().requeue());
        assert_eq!(desired_replicas(&out.graph), 1);
    }
}

mod backup_tests {
    use super::*;

    #[tokio::test]
    async fn test_backup_then_restore_sequence() {
        let platform = clone_platform(vec![backup_method("xtrabackup", false)]);
        let spec = mysql_spec(3, &["data"]);
        let def = clone_volume_comp_def("mysql-8.0");

        // Backup not created yet
        let out = scale(&platform, &spec, &def).await;
        assert!(out.report.unwrap().requeue());
        assert_eq!(desired_replicas(&out.graph), 1);
        let backup: Backup = out.graph.vertex(&backup_key()).unwrap().typed().unwrap();
        assert_eq!(backup.spec.backup_method, "xtrabackup");
        assert_eq!(backup.spec.backup_policy_name, "mycluster-mysql-backup-policy");
        assert!(has_event(&out.events, reasons::BACKUP_CREATED));
        assert!(out.graph.vertices_with(GraphAction::Create).all(|v| v.key.kind == "Backup"));
        platform.apply(&out.graph);

        // Backup processing: nothing new to create
        let out = scale(&platform, &spec, &def).await;
        assert!(out.report.unwrap().requeue());
        assert_eq!(desired_replicas(&out.graph), 1);
        assert_eq!(out.graph.vertices_with(GraphAction::Create).count(), 0);

        // Backup ready: one restore per new replica
        platform.set_backup_phase(NS, "mycluster-mysql-scaling", BackupPhase::Completed);
        let out = scale(&platform, &spec, &def).await;
        assert!(out.report.unwrap().requeue());
        let restores: Vec<String> = out
            .graph
            .vertices_with(GraphAction::Create)
            .map(|v| v.key.name.clone())
            .collect();
        assert_eq!(restores, ["mycluster-mysql-scaling-1", "mycluster-mysql-scaling-2"]);
        let restore: Restore = out
            .graph
            .vertices_with(GraphAction::Create)
            .next()
            .unwrap()
            .typed()
            .unwrap();
        assert_eq!(restore.spec.backup.name, "mycluster-mysql-scaling");
        let claims = restore.spec.prepare_data_config.unwrap().volume_claims;
        assert_eq!(claims[0].name, "data-mycluster-mysql-1");
        platform.apply(&out.graph);

        // Restores in flight are never created twice
        let out = scale(&platform, &spec, &def).await;
        assert!(out.report.unwrap().requeue());
        assert_eq!(out.graph.vertices_with(GraphAction::Create).count(), 0);
        assert_eq!(platform.restore_names().len(), 2);

        // Restores done and claims present: the scale-out goes through
        for replica in ["1", "2"] {
            platform.set_restore_phase(NS, &format!("mycluster-mysql-scaling-{replica}"), RestorePhase::Completed);
            platform.put_pvc(NS, &format!("data-mycluster-mysql-{replica}"), false);
        }
        let out = scale(&platform, &spec, &def).await;
        assert!(!out.report.unwrap().requeue());
        assert_eq!(desired_replicas(&out.graph), 3);
    }

    #[tokio::test]
    async fn test_snapshot_method_preferred_when_supported() {
        let methods = vec![backup_method("xtrabackup", false), backup_method("volume-snapshot", true)];
        let platform = Arc::new(
            FakeCluster::new()
                .with_statefulset(NS, "mycluster-mysql", 1)
                .with_backup_policy(scaling_policy(methods.clone()))
                .with_volume_snapshot(true),
        );
        let spec = mysql_spec(2, &["data"]);

        let out = scale(&platform, &spec, &clone_volume_comp_def("mysql-8.0")).await;
        let backup: Backup = out.graph.vertex(&backup_key()).unwrap().typed().unwrap();
        assert_eq!(backup.spec.backup_method, "volume-snapshot");

        let without = clone_platform(methods);
        let out = scale(&without, &spec, &clone_volume_comp_def("mysql-8.0")).await;
        let backup: Backup = out.graph.vertex(&backup_key()).unwrap().typed().unwrap();
        assert_eq!(backup.spec.backup_method, "xtrabackup");
    }

    #[tokio::test]
    async fn test_snapshot_capability_requires_snapshot_method() {
        let platform = Arc::new(
            FakeCluster::new()
                .with_statefulset(NS, "mycluster-mysql", 1)
                .with_backup_policy(scaling_policy(vec![backup_method("xtrabackup", false)]))
                .with_volume_snapshot(true),
        );
        let spec = mysql_spec(2, &["data"]);

        let out = scale(&platform, &spec, &clone_volume_comp_def("mysql-8.0")).await;
        assert!(matches!(
            out.report.unwrap_err(),
            Error::AmbiguousBackupMethod { count: 0, .. }
        ));
        assert!(out.graph.vertex(&backup_key()).is_none());
        assert!(has_event(&out.events, reasons::BACKUP_METHOD_AMBIGUOUS));
        assert!(platform.backup_names().is_empty());
    }

    #[tokio::test]
    async fn test_ambiguous_methods_are_rejected() {
        let platform = clone_platform(vec![backup_method("xtrabackup", false), backup_method("mysqldump", false)]);
        let spec = mysql_spec(2, &["data"]);

        let out = scale(&platform, &spec, &clone_volume_comp_def("mysql-8.0")).await;
        let err = out.report.unwrap_err();
        assert!(matches!(err, Error::AmbiguousBackupMethod { count: 2, .. }));
        assert!(!err.is_retryable());
        assert!(has_event(&out.events, reasons::BACKUP_METHOD_AMBIGUOUS));
        assert!(platform.backup_names().is_empty());
    }

    #[tokio::test]
    async fn test_missing_policy_is_not_found() {
        let platform = Arc::new(FakeCluster::new().with_statefulset(NS, "mycluster-mysql", 1));
        let spec = mysql_spec(2, &["data"]);

        let out = scale(&platform, &spec, &clone_volume_comp_def("mysql-8.0")).await;
        assert!(out.report.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_backup_is_reported_and_retried() {
        let platform = clone_platform(vec![backup_method("xtrabackup", false)]);
        let spec = mysql_spec(2, &["data"]);
        let def = clone_volume_comp_def("mysql-8.0");

        let out = scale(&platform, &spec, &def).await;
        platform.apply(&out.graph);
        platform.set_backup_phase(NS, "mycluster-mysql-scaling", BackupPhase::Failed);

        let out = scale(&platform, &spec, &def).await;
        assert!(out.report.unwrap().requeue());
        assert_eq!(desired_replicas(&out.graph), 1);
        assert!(has_event(&out.events, reasons::BACKUP_FAILED));
    }

    #[tokio::test]
    async fn test_failed_restore_is_waited_on() {
        let platform = clone_platform(vec![backup_method("xtrabackup", false)]);
        let spec = mysql_spec(2, &["data"]);
        let def = clone_volume_comp_def("mysql-8.0");

        let out = scale(&platform, &spec, &def).await;
        platform.apply(&out.graph);
        platform.set_backup_phase(NS, "mycluster-mysql-scaling", BackupPhase::Completed);
        let out = scale(&platform, &spec, &def).await;
        platform.apply(&out.graph);
        platform.set_restore_phase(NS, "mycluster-mysql-scaling-1", RestorePhase::Failed);

        let out = scale(&platform, &spec, &def).await;
        assert!(out.report.unwrap().requeue());
        assert_eq!(desired_replicas(&out.graph), 1);
        assert_eq!(out.graph.vertices_with(GraphAction::Create).count(), 0);
        assert!(has_event(&out.events, reasons::RESTORE_FAILED));

        // The failed restore never counts as done, even with its claim present
        platform.set_restore_phase(NS, "mycluster-mysql-scaling-2", RestorePhase::Completed);
        platform.put_pvc(NS, "data-mycluster-mysql-1", false);
        platform.put_pvc(NS, "data-mycluster-mysql-2", false);
        let out = scale(&platform, &spec, &def).await;
        assert!(out.report.unwrap().requeue());
        assert_eq!(desired_replicas(&out.graph), 1);
    }

    #[tokio::test]
    async fn test_states_follow_object_phases() {
        let platform = clone_platform(vec![backup_method("xtrabackup", false)]);
        let spec = mysql_spec(2, &["data"]);
        let target = ScaleTarget {
            cluster: cluster(&spec),
            spec: spec.clone(),
            comp_def: clone_volume_comp_def("mysql-8.0"),
            current: 1,
        };
        let clone = BackupDataClone::new(platform.clone(), target);
        assert_eq!(clone.backup_state().await.unwrap(), BackupState::NotCreated);
        assert_eq!(clone.restore_state("mycluster-mysql-1").await.unwrap(), RestoreState::NotCreated);

        let mut events = Vec::new();
        let mut graph = MutationGraph::new();
        for vertex in clone.clone_data(&mut events).await.unwrap() {
            graph.add_vertex(vertex);
        }
        platform.apply(&graph);
        assert_eq!(clone.backup_state().await.unwrap(), BackupState::Processing);

        platform.set_backup_phase(NS, "mycluster-mysql-scaling", BackupPhase::Completed);
        assert_eq!(clone.backup_state().await.unwrap(), BackupState::ReadyToUse);
    }

    #[tokio::test]
    async fn test_succeed_is_stable_for_fixed_state() {
        let platform = clone_platform(vec![backup_method("xtrabackup", false)]);
        let spec = mysql_spec(2, &["data"]);
        let target = ScaleTarget {
            cluster: cluster(&spec),
            spec: spec.clone(),
            comp_def: clone_volume_comp_def("mysql-8.0"),
            current: 1,
        };
        let clone = BackupDataClone::new(platform.clone(), target);
        let mut events = Vec::new();
        assert!(!clone.succeed(&mut events).await.unwrap());

        let mut graph = MutationGraph::new();
        graph.add_vertex(Vertex::create(&build_backup(
            &cluster(&spec),
            "mysql",
            "mycluster-mysql-scaling",
            "mycluster-mysql-backup-policy",
            "xtrabackup",
        ))
        .unwrap());
        platform.apply(&graph);
        platform.set_backup_phase(NS, "mycluster-mysql-scaling", BackupPhase::Completed);
        let mut graph = MutationGraph::new();
        for vertex in clone.clone_data(&mut events).await.unwrap() {
            graph.add_vertex(vertex);
        }
        platform.apply(&graph);
        platform.set_restore_phase(NS, "mycluster-mysql-scaling-1", RestorePhase::Completed);
        platform.put_pvc(NS, "data-mycluster-mysql-1", true);

        assert!(clone.succeed(&mut events).await.unwrap());
        assert!(clone.succeed(&mut events).await.unwrap());
    }
}

mod cleanup_tests {
    use super::*;

    /// A finished scale-out: three replicas and the leftover backup
    fn finished(bound: &[bool; 3]) -> Arc<FakeCluster> {
        let spec = mysql_spec(3, &["data"]);
        let mut platform = FakeCluster::new().with_statefulset(NS, "mycluster-mysql", 3);
        for (i, bound) in bound.iter().enumerate() {
            platform = platform.with_pvc(NS, &format!("data-mycluster-mysql-{i}"), *bound);
        }
        let mut graph = MutationGraph::new();
        graph.add_vertex(Vertex::create(&build_backup(
            &cluster(&spec),
            "mysql",
            "mycluster-mysql-scaling",
            "mycluster-mysql-backup-policy",
            "xtrabackup",
        ))
        .unwrap());
        platform.apply(&graph);
        Arc::new(platform)
    }

    #[tokio::test]
    async fn test_clone_objects_removed_once_bound() {
        let platform = finished(&[true, true, true]);
        let spec = mysql_spec(3, &["data"]);

        let out = scale(&platform, &spec, &clone_volume_comp_def("mysql-8.0")).await;
        assert!(!out.report.unwrap().requeue());
        let deleted: Vec<_> = out.graph.vertices_with(GraphAction::Delete).map(|v| v.key.clone()).collect();
        assert_eq!(deleted, [backup_key()]);

        platform.apply(&out.graph);
        assert!(platform.backup_names().is_empty());
    }

    #[tokio::test]
    async fn test_clone_objects_kept_until_bound() {
        let platform = finished(&[true, true, false]);
        let spec = mysql_spec(3, &["data"]);

        let out = scale(&platform, &spec, &clone_volume_comp_def("mysql-8.0")).await;
        assert!(!out.report.unwrap().requeue());
        assert_eq!(out.graph.vertices_with(GraphAction::Delete).count(), 0);
        assert_eq!(platform.backup_names(), ["mycluster-mysql-scaling"]);
    }

    #[tokio::test]
    async fn test_no_policy_components_have_nothing_to_clean() {
        let platform = finished(&[true, true, true]);
        let spec = mysql_spec(3, &["data"]);

        let out = scale(&platform, &spec, &comp_def("mysql-8.0", "8.0.30")).await;
        assert_eq!(out.graph.vertices_with(GraphAction::Delete).count(), 0);
    }
}
