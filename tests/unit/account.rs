//! Unit tests for system account provisioning

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::core::ObjectMeta;

use dbcluster_operator::controller::client::ClusterReader;
use dbcluster_operator::controller::error::Error;
use dbcluster_operator::controller::events::reasons as event_reasons;
use dbcluster_operator::controller::status::{
    condition_status, condition_types, find_condition, new_condition, reasons,
};
use dbcluster_operator::controller::store::SecretStore;
use dbcluster_operator::crd::{
    AccountStatements, Cluster, ComponentDefinition, ComponentPhase, ComponentSystemAccount,
    ExecAction, LifecycleActions, SystemAccount,
};
use dbcluster_operator::graph::{MutationGraph, ObjectKey, Vertex};
use dbcluster_operator::resources::common::RESTORE_FROM_BACKUP_ANNOTATION;
use dbcluster_operator::transformer::{Pipeline, PipelineOutcome, TransformContext};

use crate::common::*;

fn account(name: &str) -> SystemAccount {
    SystemAccount {
        name: name.to_string(),
        init_account: false,
        statement: Some(AccountStatements {
            create: Some(format!("CREATE USER {name}")),
            update: Some(format!("ALTER USER {name}")),
            delete: Some(format!("DROP USER {name}")),
        }),
        password_generation_policy: Default::default(),
    }
}

fn mysql_def(accounts: &[&str]) -> ComponentDefinition {
    let mut def = comp_def("mysql-8.0", "8.0.30");
    def.spec.system_accounts = accounts.iter().map(|a| account(a)).collect();
    def.spec.lifecycle_actions = Some(LifecycleActions {
        account_provision: Some(ExecAction {
            command: vec!["/scripts/account.sh".to_string()],
            container: None,
        }),
    });
    def
}

/// A running Component that already provisioned the given `name:hash` accounts
fn running_mysql(provisioned: Option<&str>) -> dbcluster_operator::crd::Component {
    let mut comp = component("mycluster", "default", "mysql", "mysql-8.0", ComponentPhase::Running);
    if let Some(encoded) = provisioned {
        comp.status.as_mut().unwrap().conditions.push(new_condition(
            condition_types::SYSTEM_ACCOUNT_PROVISION,
            condition_status::FALSE,
            reasons::ACCOUNTS_IN_PROGRESS,
            encoded,
            Some(1),
        ));
    }
    comp
}

fn password_secret(name: &str, password: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "password".to_string(),
            ByteString(password.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

fn cluster_with(spec: dbcluster_operator::crd::ClusterComponentSpec) -> Cluster {
    ClusterBuilder::new("mycluster", "default").with_component(spec).build()
}

async fn provision(
    platform: Arc<FakeCluster>,
    runner: Arc<RecordingActionRunner>,
    secrets: SecretStore,
    cluster: Cluster,
) -> (TransformContext, MutationGraph, Result<(), Error>) {
    let observed = platform.list_components("default", "mycluster").await.unwrap();
    let pipeline = Pipeline::for_cluster(platform, runner, secrets);
    let mut ctx = TransformContext::new(Arc::new(cluster), observed);
    let mut graph = MutationGraph::new();
    let result = pipeline
        .run(&mut ctx, &mut graph)
        .await
        .and_then(PipelineOutcome::into_result)
        .map(|_| ());
    (ctx, graph, result)
}

/// The account condition the stage wants written on the Component
fn written_accounts(graph: &MutationGraph) -> Option<dbcluster_operator::crd::Condition> {
    let key = ObjectKey::new(
        kind_of::<dbcluster_operator::crd::Component>(),
        Some("default".to_string()),
        "mycluster-mysql",
    )
    .status();
    let comp: dbcluster_operator::crd::Component = graph.vertex(&key)?.typed().unwrap();
    find_condition(comp.conditions(), condition_types::SYSTEM_ACCOUNT_PROVISION).cloned()
}

#[tokio::test]
async fn test_create_delete_and_keep() {
    let hash_b = sha256::digest("b-password");
    let platform = Arc::new(
        FakeCluster::new()
            .with_comp_def(mysql_def(&["A", "B", "C"]))
            .with_component(running_mysql(Some(&format!("B:{hash_b},C:stale"))))
            .with_secret(password_secret("mycluster-mysql-account-B", "b-password")),
    );
    let runner = Arc::new(RecordingActionRunner::new());
    let mut spec = component_spec("mysql", "mysql-8.0", 1);
    spec.system_accounts = vec![ComponentSystemAccount {
        name: "C".to_string(),
        disabled: Some(true),
        ..Default::default()
    }];

    let (_, graph, result) = provision(platform, runner.clone(), SecretStore::new(), cluster_with(spec)).await;
    result.unwrap();

    assert_eq!(runner.accounts(), ["A", "C"]);
    assert_eq!(runner.statements(), ["CREATE USER A", "DROP USER C"]);

    let cond = written_accounts(&graph).unwrap();
    assert_eq!(cond.status, condition_status::TRUE);
    assert_eq!(cond.reason, reasons::ALL_ACCOUNTS_PROVISIONED);
    let names: Vec<&str> = cond.message.split(',').map(|t| t.split(':').next().unwrap()).collect();
    assert_eq!(names, ["A", "B"]);
    assert!(cond.message.contains(&format!("B:{hash_b}")));
}

#[tokio::test]
async fn test_changed_password_runs_update() {
    let platform = Arc::new(
        FakeCluster::new()
            .with_comp_def(mysql_def(&["B"]))
            .with_component(running_mysql(Some("B:old-hash")))
            .with_secret(password_secret("mycluster-mysql-account-B", "rotated")),
    );
    let runner = Arc::new(RecordingActionRunner::new());

    let (_, graph, result) = provision(
        platform,
        runner.clone(),
        SecretStore::new(),
        cluster_with(component_spec("mysql", "mysql-8.0", 1)),
    )
    .await;
    result.unwrap();

    assert_eq!(runner.statements(), ["ALTER USER B"]);
    let cond = written_accounts(&graph).unwrap();
    assert_eq!(cond.message, format!("B:{}", sha256::digest("rotated")));
}

#[tokio::test]
async fn test_failing_account_does_not_stop_others() {
    let platform = Arc::new(
        FakeCluster::new()
            .with_comp_def(mysql_def(&["A", "B"]))
            .with_component(running_mysql(None)),
    );
    let runner = Arc::new(RecordingActionRunner::failing(&["A"]));

    let (ctx, graph, result) = provision(
        platform,
        runner.clone(),
        SecretStore::new(),
        cluster_with(component_spec("mysql", "mysql-8.0", 1)),
    )
    .await;

    let err = result.unwrap_err();
    assert!(matches!(err, Error::ActionFailed { action: "accountProvision", .. }));
    assert_eq!(runner.accounts(), ["A", "B"]);

    // Progress made before the error is still recorded
    let cond = written_accounts(&graph).unwrap();
    assert_eq!(cond.status, condition_status::FALSE);
    assert_eq!(cond.reason, reasons::ACCOUNTS_IN_PROGRESS);
    assert!(cond.message.starts_with("B:"));

    assert!(ctx
        .events
        .iter()
        .any(|e| e.reason == event_reasons::ACCOUNT_PROVISION_FAILED && e.note.contains("account A")));
}

#[tokio::test]
async fn test_missing_statement_is_an_error() {
    let mut def = mysql_def(&["A"]);
    def.spec.system_accounts[0].statement = None;
    let platform = Arc::new(FakeCluster::new().with_comp_def(def).with_component(running_mysql(None)));
    let runner = Arc::new(RecordingActionRunner::new());

    let (_, _, result) = provision(
        platform,
        runner.clone(),
        SecretStore::new(),
        cluster_with(component_spec("mysql", "mysql-8.0", 1)),
    )
    .await;
    assert!(matches!(result.unwrap_err(), Error::ValidationError(_)));
    assert!(runner.accounts().is_empty());
}

#[tokio::test]
async fn test_init_accounts_are_recorded_without_statements() {
    let mut def = mysql_def(&["root"]);
    def.spec.system_accounts[0].init_account = true;
    let platform = Arc::new(FakeCluster::new().with_comp_def(def).with_component(running_mysql(None)));
    let runner = Arc::new(RecordingActionRunner::new());

    let (_, graph, result) = provision(
        platform,
        runner.clone(),
        SecretStore::new(),
        cluster_with(component_spec("mysql", "mysql-8.0", 1)),
    )
    .await;
    result.unwrap();
    assert!(runner.accounts().is_empty());
    assert!(written_accounts(&graph).unwrap().message.starts_with("root:"));
}

#[tokio::test]
async fn test_restoring_component_skips_creation() {
    let platform = Arc::new(
        FakeCluster::new()
            .with_comp_def(mysql_def(&["A"]))
            .with_component(running_mysql(None)),
    );
    let runner = Arc::new(RecordingActionRunner::new());
    let cluster = ClusterBuilder::new("mycluster", "default")
        .with_component(component_spec("mysql", "mysql-8.0", 1))
        .with_annotation(RESTORE_FROM_BACKUP_ANNOTATION, r#"{"mysql":{"name":"backup-1"}}"#)
        .build();

    let (_, graph, result) = provision(platform, runner.clone(), SecretStore::new(), cluster).await;
    result.unwrap();
    assert!(runner.accounts().is_empty());
    assert_eq!(written_accounts(&graph).unwrap().status, condition_status::FALSE);
}

#[tokio::test]
async fn test_components_not_running_are_skipped() {
    let platform = Arc::new(
        FakeCluster::new()
            .with_comp_def(mysql_def(&["A"]))
            .with_component(component("mycluster", "default", "mysql", "mysql-8.0", ComponentPhase::Creating)),
    );
    let runner = Arc::new(RecordingActionRunner::new());

    let (_, graph, result) = provision(
        platform,
        runner.clone(),
        SecretStore::new(),
        cluster_with(component_spec("mysql", "mysql-8.0", 1)),
    )
    .await;
    result.unwrap();
    assert!(runner.accounts().is_empty());
    assert!(written_accounts(&graph).is_none());
}

#[tokio::test]
async fn test_generated_password_is_stable_until_persisted() {
    let platform = Arc::new(
        FakeCluster::new()
            .with_comp_def(mysql_def(&["A"]))
            .with_component(running_mysql(None)),
    );
    let runner = Arc::new(RecordingActionRunner::new());
    let secrets = SecretStore::new();
    let cluster = cluster_with(component_spec("mysql", "mysql-8.0", 1));

    // The Component status is never written back, so A is created on every run
    let (_, first_graph, result) = provision(platform.clone(), runner.clone(), secrets.clone(), cluster.clone()).await;
    result.unwrap();
    assert_eq!(secrets.list("default", "mycluster").await.len(), 1);

    let (_, _, result) = provision(platform.clone(), runner.clone(), secrets.clone(), cluster.clone()).await;
    result.unwrap();

    // Once the secret is visible the store lets go of it, and the written
    // status marks A as provisioned with the same password
    platform.apply(&first_graph);
    let (_, _, result) = provision(platform.clone(), runner.clone(), secrets.clone(), cluster).await;
    result.unwrap();
    assert!(secrets.list("default", "mycluster").await.is_empty());

    let calls = runner.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert!(!calls[0].1.password.is_empty());
    assert!(calls.iter().all(|(_, s)| s.password == calls[0].1.password));
}

#[tokio::test]
async fn test_partial_failure_is_not_repeated_on_next_reconcile() {
    let platform = Arc::new(
        FakeCluster::new()
            .with_comp_def(mysql_def(&["A", "B"]))
            .with_component(running_mysql(None)),
    );
    let runner = Arc::new(RecordingActionRunner::failing(&["B"]));
    let secrets = SecretStore::new();
    let cluster = cluster_with(component_spec("mysql", "mysql-8.0", 1));

    let (_, graph, result) = provision(platform.clone(), runner.clone(), secrets.clone(), cluster.clone()).await;
    assert!(matches!(result, Err(Error::ActionFailed { .. })));
    platform.apply(&graph);

    // A's secret and its provisioned record were both written despite B failing
    assert!(platform
        .get_secret("default", "mycluster-mysql-account-A")
        .await
        .unwrap()
        .is_some());
    assert!(written_accounts(&graph).unwrap().message.starts_with("A:"));

    let (_, _, result) = provision(platform.clone(), runner.clone(), secrets, cluster).await;
    assert!(matches!(result, Err(Error::ActionFailed { .. })));

    assert_eq!(
        runner.statements(),
        ["CREATE USER A", "CREATE USER B", "CREATE USER B"]
    );
}

#[tokio::test]
async fn test_account_secret_is_applied_before_status() {
    let platform = Arc::new(
        FakeCluster::new()
            .with_comp_def(mysql_def(&["A"]))
            .with_component(running_mysql(None)),
    );
    let runner = Arc::new(RecordingActionRunner::new());
    let cluster = cluster_with(component_spec("mysql", "mysql-8.0", 1));

    let observed = platform.list_components("default", "mycluster").await.unwrap();
    let pipeline = Pipeline::for_cluster(platform, runner, SecretStore::new());
    let mut graph = MutationGraph::new();
    graph.set_root(Vertex::status(&cluster).unwrap());
    let mut ctx = TransformContext::new(Arc::new(cluster), observed);
    pipeline.run(&mut ctx, &mut graph).await.unwrap().into_result().unwrap();

    let secret = ObjectKey::new(kind_of::<Secret>(), Some("default".to_string()), "mycluster-mysql-account-A");
    let comp_status = ObjectKey::new(
        kind_of::<dbcluster_operator::crd::Component>(),
        Some("default".to_string()),
        "mycluster-mysql",
    )
    .status();
    let root = graph.root().unwrap().key.clone();

    assert!(graph.has_edge(&secret, &comp_status));
    assert!(graph.has_edge(&secret, &root));

    let order: Vec<_> = graph.walk_order().unwrap().into_iter().map(|v| v.key.clone()).collect();
    let pos = |key: &ObjectKey| order.iter().position(|k| k == key).unwrap();
    assert!(pos(&secret) < pos(&comp_status));
    assert!(pos(&secret) < pos(&root));
}

#[tokio::test]
async fn test_account_failure_is_deferred_past_the_graph() {
    let platform = Arc::new(
        FakeCluster::new()
            .with_comp_def(mysql_def(&["A"]))
            .with_component(running_mysql(None)),
    );
    let runner = Arc::new(RecordingActionRunner::failing(&["A"]));
    let cluster = cluster_with(component_spec("mysql", "mysql-8.0", 1));

    let observed = platform.list_components("default", "mycluster").await.unwrap();
    let pipeline = Pipeline::for_cluster(platform, runner, SecretStore::new());
    let mut ctx = TransformContext::new(Arc::new(cluster), observed);
    let mut graph = MutationGraph::new();
    let outcome = pipeline.run(&mut ctx, &mut graph).await.unwrap();

    assert!(matches!(outcome.deferred, Some(Error::ActionFailed { .. })));
    // Earlier stages' work and the account record are still in the graph
    let comp_key = ObjectKey::new(
        kind_of::<dbcluster_operator::crd::Component>(),
        Some("default".to_string()),
        "mycluster-mysql",
    );
    assert!(graph.contains(&comp_key));
    assert!(written_accounts(&graph).is_some());
    assert!(outcome.into_result().is_err());
}
