//! Status stage
//!
//! Rebuilds `status.components` from the observed Component objects and
//! derives the cluster phase and readiness conditions from it. Conditions go
//! through the delta so unchanged messages never cause a write.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use super::{StageResult, TransformContext, TransformDelta, Transformer};
use crate::controller::events::{PendingEvent, actions, reasons};
use crate::controller::state_machine::{compose_phase, matching_rule};
use crate::controller::status::{
    all_replicas_ready, cluster_ready, components_not_ready, replicas_not_ready,
};
use crate::crd::{ClusterComponentStatus, ClusterPhase, ComponentPhase};
use crate::graph::MutationGraph;
use crate::resources::common::RESTORE_FROM_BACKUP_ANNOTATION;

pub struct StatusTransformer;

/// Component names whose pods are not all ready, and those that are not ready
/// at all (pods not ready, Abnormal or Failed); both sorted
pub fn not_ready_components(components: &BTreeMap<String, ClusterComponentStatus>) -> (Vec<String>, Vec<String>) {
    let mut replicas_not_ready = BTreeSet::new();
    let mut not_ready = BTreeSet::new();
    for (name, status) in components {
        if status.pods_ready != Some(true) {
            replicas_not_ready.insert(name.clone());
            not_ready.insert(name.clone());
        }
        if matches!(status.phase, Some(ComponentPhase::Abnormal | ComponentPhase::Failed)) {
            not_ready.insert(name.clone());
        }
    }
    (
        replicas_not_ready.into_iter().collect(),
        not_ready.into_iter().collect(),
    )
}

#[async_trait]
impl Transformer for StatusTransformer {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn transform(&self, ctx: &TransformContext, _graph: &MutationGraph) -> StageResult {
        let generation = ctx.generation();
        let cluster_name = ctx.cluster_name();
        let mut status = ctx.cluster.status.clone().unwrap_or_default();
        let previous_phase = status.phase;

        // Entries for components that are no longer part of the cluster are dropped
        let desired: BTreeSet<&str> = ctx.all_components().map(|c| c.name.as_str()).collect();
        status.components.retain(|name, _| desired.contains(name.as_str()));

        for name in &desired {
            let entry = match ctx.observed_components.get(*name) {
                Some(comp) => {
                    let observed = comp.status.as_ref();
                    ClusterComponentStatus {
                        phase: Some(comp.phase().unwrap_or(ComponentPhase::Creating)),
                        pods_ready: observed.and_then(|s| s.pods_ready),
                        message: observed.map(|s| s.message.clone()).unwrap_or_default(),
                    }
                }
                // Not created yet
                None => ClusterComponentStatus {
                    phase: Some(ComponentPhase::Creating),
                    ..Default::default()
                },
            };
            status.components.insert(name.to_string(), entry);
        }

        let phases: Vec<ComponentPhase> = status.components.values().filter_map(|c| c.phase).collect();
        // Unset until some rule matches
        let phase = compose_phase(&phases).or(previous_phase);
        if previous_phase != phase {
            let rule = matching_rule(&phases).map(|r| r.description).unwrap_or("no rule matched");
            debug!(cluster = %cluster_name, from = ?previous_phase, to = ?phase, rule, "Cluster phase changed");
        }
        status.phase = phase;

        let (replicas_not_ready_names, not_ready_names) = not_ready_components(&status.components);
        let mut delta = TransformDelta::new();

        delta = if replicas_not_ready_names.is_empty() {
            delta.with_condition(all_replicas_ready(generation))
        } else {
            delta.with_condition(replicas_not_ready(generation, &replicas_not_ready_names))
        };

        if !not_ready_names.is_empty() {
            delta = delta.with_condition(components_not_ready(generation, &not_ready_names));
        } else if phase == Some(ClusterPhase::Running) {
            delta = delta.with_condition(cluster_ready(generation, &cluster_name));
        }

        if phase == Some(ClusterPhase::Running) && previous_phase != phase {
            info!(cluster = %cluster_name, "Cluster is ready");
            delta.events.push(PendingEvent::normal(
                reasons::CLUSTER_READY,
                actions::RECONCILE,
                format!("Cluster: {cluster_name} is ready, current phase is Running"),
            ));
        }

        if phase.is_some_and(|p| p.is_terminal()) && ctx.cluster.annotations().contains_key(RESTORE_FROM_BACKUP_ANNOTATION) {
            delta.annotations_removed.push(RESTORE_FROM_BACKUP_ANNOTATION.to_string());
        }

        delta.status = Some(status);
        Ok(delta)
    }
}
