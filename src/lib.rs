pub mod config;
pub mod controller;
pub mod crd;
pub mod graph;
pub mod health;
pub mod hscale;
pub mod resources;
pub mod transformer;

pub use config::OperatorConfig;
pub use controller::{BackoffConfig, Context, Error, FINALIZER, Result, error_policy, reconcile};
pub use crd::{Backup, Cluster, Component, Restore};
pub use health::{HealthState, Metrics};

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::Controller;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use crate::crd::ClusterPhase;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Run the Cluster controller.
///
/// Watches Cluster resources in `config.watch_namespace`, or cluster-wide when
/// unset, and every object kind the reconcile creates on their behalf. It can
/// be called from main.rs or spawned as a background task.
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controller(client: Client, config: OperatorConfig, health_state: Option<Arc<HealthState>>) {
    let namespace = config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    tracing::info!(
        "Starting controller for Cluster resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(client.clone(), config, health_state.clone()));

    let clusters: Api<Cluster> = scoped_api(client.clone(), namespace);
    let components: Api<Component> = scoped_api(client.clone(), namespace);
    let statefulsets: Api<StatefulSet> = scoped_api(client.clone(), namespace);
    let pvcs: Api<PersistentVolumeClaim> = scoped_api(client.clone(), namespace);
    let backups: Api<Backup> = scoped_api(client.clone(), namespace);
    let restores: Api<Restore> = scoped_api(client.clone(), namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    let controller = Controller::new(clusters, watcher_config.clone())
        .owns(components, watcher_config.clone())
        .owns(statefulsets, watcher_config.clone())
        .owns(pvcs, watcher_config.clone())
        .owns(backups, watcher_config.clone())
        .owns(restores, watcher_config);
    let store = controller.store();

    controller
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            let store = store.clone();
            let health_state = health_state.clone();
            async move {
                match result {
                    Ok((obj, _action)) => {
                        tracing::debug!("Reconciled: {}", obj.name);
                    }
                    Err(e) => {
                        // Watch events for owned objects may still arrive after the cluster is gone
                        let is_not_found = matches!(
                            &e,
                            kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                        );
                        if is_not_found {
                            tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                        } else {
                            tracing::error!("Reconciliation error: {:?}", e);
                        }
                    }
                }
                if let Some(state) = health_state {
                    record_fleet(&store, &state);
                }
            }
        })
        .await;

    tracing::error!("Controller stream ended unexpectedly");
}

/// Refresh the clusters-by-phase gauge from the controller's cache
fn record_fleet(store: &Store<Cluster>, health_state: &HealthState) {
    let mut counts: BTreeMap<String, i64> = ClusterPhase::ALL
        .iter()
        .map(|phase| (phase.to_string(), 0))
        .collect();
    for cluster in store.state() {
        if let Some(phase) = cluster.phase() {
            *counts.entry(phase.to_string()).or_insert(0) += 1;
        }
    }
    for (phase, count) in counts {
        health_state.metrics.set_clusters_by_phase(&phase, count);
    }
}
