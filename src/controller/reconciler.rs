//! Reconciliation logic for Cluster resources
//!
//! One reconcile runs the transformer pipeline over a fresh mutation graph,
//! lets the data-clone orchestrator hold back scale-outs, applies the graph
//! and finally writes the cluster status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::apply::apply_graph;
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::events::{PendingEvent, actions as event_actions, reasons as event_reasons};
use crate::controller::status::{StatusManager, apply_resources, condition_changed, upsert_condition};
use crate::crd::{Cluster, ClusterComponentSpec, ClusterStatus, ComponentDefinition};
use crate::graph::{MutationGraph, Vertex};
use crate::hscale::{ScaleReport, reconcile_horizontal_scale};
use crate::resources::common::FIELD_MANAGER;
use crate::transformer::TransformContext;

/// Finalizer name for cleanup
pub const FINALIZER: &str = "apps.dbcluster.io/finalizer";

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &ns);
    let start = Instant::now();

    debug!("Reconciling Cluster");

    if cluster.is_deleting() {
        return handle_deletion(&cluster, &ctx, &api).await;
    }

    if !has_finalizer(&cluster) {
        add_finalizer(&cluster, &api).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let result = reconcile_cluster(cluster.clone(), &ctx, &api).await;

    if let Some(health) = &ctx.health_state {
        match &result {
            Ok(_) => health
                .metrics
                .record_reconcile(&ns, &name, start.elapsed().as_secs_f64()),
            Err(e) => health.metrics.record_failure(&ns, &name, e.reason()),
        }
    }

    match result {
        Ok(scale) => {
            if let Some(health) = &ctx.health_state {
                health
                    .metrics
                    .set_scale_out_waiting(&ns, &name, scale.in_progress.len() as i64);
            }
            if scale.requeue() {
                debug!(components = ?scale.in_progress, "Data clone in progress");
                Ok(Action::requeue(ctx.config.data_clone_requeue))
            } else {
                Ok(Action::requeue(ctx.config.requeue_interval))
            }
        }
        Err(e) => {
            error!("Reconciliation failed: {}", e);
            Err(e)
        }
    }
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    let delay = BackoffConfig::default().delay_for_error(error, 0);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} until the spec changes",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

async fn reconcile_cluster(cluster: Arc<Cluster>, ctx: &Context, api: &Api<Cluster>) -> Result<ScaleReport> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let status_manager = StatusManager::new(api.clone(), &cluster);

    let observed = ctx.reader.list_components(&ns, &name).await?;
    let mut tctx = TransformContext::new(cluster.clone(), observed);
    let mut graph = MutationGraph::new();
    graph.set_root(Vertex::status(cluster.as_ref())?);

    let outcome = match ctx.pipeline().run(&mut tctx, &mut graph).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // Conditions describing the failure are still reported
            if let Err(write_err) = status_manager.write(&tctx.cluster).await {
                warn!(error = %write_err, "Failed to write status after pipeline failure");
            }
            publish_events(ctx, &cluster, &tctx.events).await;
            return Err(e);
        }
    };

    let components = resolved_components(&tctx);
    let mut events = std::mem::take(&mut tctx.events);
    let scale = reconcile_horizontal_scale(
        ctx.reader.clone(),
        &tctx.cluster,
        &components,
        &mut graph,
        &mut events,
    )
    .await;
    let scale = match scale {
        Ok(scale) => scale,
        Err(e) => {
            publish_events(ctx, &cluster, &events).await;
            return Err(e);
        }
    };

    let applied = apply_graph(&ctx.client, &graph).await;
    let generation = cluster.metadata.generation;
    let status = tctx.cluster.status.get_or_insert_with(ClusterStatus::default);
    let condition = apply_resources(generation, applied.as_ref().err());
    if condition_changed(&status.conditions, &condition) {
        upsert_condition(&mut status.conditions, condition);
    }
    match &applied {
        Ok(count) => {
            debug!(applied = count, "Mutation graph applied");
            status.observed_generation = generation;
        }
        Err(e) => {
            warn!(error = %e, "Failed to apply mutation graph");
            events.push(PendingEvent::warning(
                event_reasons::APPLY_RESOURCES_FAILED,
                event_actions::RECONCILE,
                e.to_string(),
            ));
        }
    }

    let written = status_manager.write(&tctx.cluster).await;
    publish_events(ctx, &cluster, &events).await;
    applied?;
    written?;
    // Partial account provisioning is persisted above before it is reported
    outcome.into_result()?;

    if let Some(phase) = tctx.cluster.phase()
        && cluster.phase() != Some(phase)
    {
        info!(phase = %phase, "Cluster phase updated");
    }
    if let Some(health) = &ctx.health_state
        && let Some(status) = &tctx.cluster.status
    {
        let ready = status
            .components
            .values()
            .filter(|c| c.pods_ready == Some(true))
            .count();
        health
            .metrics
            .set_component_readiness(&ns, &name, status.components.len() as i64, ready as i64);
    }
    Ok(scale)
}

/// Resolved component specs paired with their definitions, shards included
fn resolved_components(tctx: &TransformContext) -> Vec<(ClusterComponentSpec, ComponentDefinition)> {
    tctx.all_components()
        .filter_map(|spec| {
            tctx.component_defs
                .get(&spec.name)
                .map(|def| (spec.clone(), def.clone()))
        })
        .collect()
}

async fn publish_events(ctx: &Context, cluster: &Cluster, events: &[PendingEvent]) {
    let reference = cluster.object_ref(&());
    for event in events {
        ctx.events.publish(&reference, event).await;
    }
}

/// Check if the finalizer is present
fn has_finalizer(cluster: &Cluster) -> bool {
    cluster.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add the finalizer to the resource
async fn add_finalizer(cluster: &Cluster, api: &Api<Cluster>) -> Result<()> {
    let name = cluster.name_any();
    let mut finalizers = cluster.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });

    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    info!("Added finalizer to {}", name);
    Ok(())
}

/// Handle deletion of the Cluster
async fn handle_deletion(cluster: &Cluster, ctx: &Context, api: &Api<Cluster>) -> Result<Action> {
    let name = cluster.name_any();
    info!("Handling deletion of {}", name);

    let status_manager = StatusManager::new(api.clone(), cluster);
    if let Err(e) = status_manager.set_deleting().await {
        warn!(error = %e, "Failed to report Deleting phase");
    }

    // Owned objects are garbage collected through owner references
    let namespace = cluster.namespace().unwrap_or_default();
    ctx.secrets.delete_cluster(&namespace, &name).await;
    if let Some(health) = &ctx.health_state {
        health.metrics.forget_cluster(&namespace, &name);
    }

    if has_finalizer(cluster) {
        let finalizers: Vec<String> = cluster
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });

        match api
            .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!("Removed finalizer from {}", name),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(Error::FinalizerError(e.to_string())),
        }
    }

    Ok(Action::await_change())
}
