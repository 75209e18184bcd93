//! Horizontal-scale data clone
//!
//! A scale-out must not raise a component's replica count before the new
//! replicas have their volumes. While the data clone is in progress the
//! Component vertex keeps the current replica count and the objects moving
//! the clone forward are applied before it. Once every new replica has its
//! data the desired count goes through unchanged.

mod data_clone;

pub use data_clone::{BackupDataClone, BackupState, DataClone, NoPolicyDataClone, RestoreState};

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::controller::client::ClusterReader;
use crate::controller::error::Result;
use crate::controller::events::PendingEvent;
use crate::crd::{
    Cluster, ClusterComponentSpec, Component, ComponentDefinition, HScaleDataClonePolicy,
    VolumeClaimTemplate,
};
use crate::graph::{MutationGraph, ObjectKey};
use crate::resources::common::{component_object_name, data_clone_labels, pvc_name, replica_name, workload_name};
use crate::resources::dataprotection::{backup_name, restore_name};

/// A component whose replica count is changing
#[derive(Debug, Clone)]
pub struct ScaleTarget {
    pub cluster: Cluster,
    pub spec: ClusterComponentSpec,
    pub comp_def: ComponentDefinition,
    /// Replicas currently run by the workload
    pub current: i32,
}

impl ScaleTarget {
    pub fn namespace(&self) -> String {
        self.cluster.namespace().unwrap_or_default()
    }

    pub fn workload(&self) -> String {
        workload_name(&self.cluster.name_any(), &self.spec.name)
    }

    pub fn replica(&self, ordinal: i32) -> String {
        replica_name(&self.workload(), ordinal)
    }

    /// Replicas that exist only once the scale-out completes
    pub fn new_replicas(&self) -> Vec<String> {
        (self.current..self.spec.replicas).map(|i| self.replica(i)).collect()
    }

    pub fn all_replicas(&self) -> Vec<String> {
        (0..self.spec.replicas).map(|i| self.replica(i)).collect()
    }

    pub fn pvc_name(&self, vct: &VolumeClaimTemplate, replica: &str) -> String {
        pvc_name(&vct.name, replica)
    }

    pub fn backup_name(&self) -> String {
        backup_name(&self.cluster.name_any(), &self.spec.name)
    }

    pub fn restore_name(&self, replica: &str) -> String {
        restore_name(&self.backup_name(), &self.workload(), replica)
    }

    pub fn data_clone_labels(&self) -> BTreeMap<String, String> {
        data_clone_labels(&self.cluster.name_any(), &self.spec.name)
    }

    /// Template whose data is cloned: the one named by the scale policy, then
    /// the definition's data volume, then the first template
    pub fn backup_vct(&self) -> Option<&VolumeClaimTemplate> {
        let vcts = &self.spec.volume_claim_templates;
        let named = self
            .comp_def
            .spec
            .horizontal_scale_policy
            .as_ref()
            .and_then(|p| p.volume_mounts_name.as_deref())
            .or_else(|| self.comp_def.data_volume_name());
        named
            .and_then(|name| vcts.iter().find(|v| v.name == name))
            .or_else(|| vcts.first())
    }

    pub fn policy(&self) -> HScaleDataClonePolicy {
        self.comp_def
            .spec
            .horizontal_scale_policy
            .as_ref()
            .map(|p| p.type_)
            .unwrap_or_default()
    }
}

/// Data-clone strategy for a component's scale policy
pub fn new_data_clone(reader: Arc<dyn ClusterReader>, target: ScaleTarget) -> Box<dyn DataClone> {
    match target.policy() {
        HScaleDataClonePolicy::CloneVolume => Box::new(BackupDataClone::new(reader, target)),
        HScaleDataClonePolicy::None => Box::new(NoPolicyDataClone::new(reader, target)),
    }
}

/// What the orchestrator did in one reconcile
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScaleReport {
    /// Components still waiting for their data clone
    pub in_progress: Vec<String>,
}

impl ScaleReport {
    pub fn requeue(&self) -> bool {
        !self.in_progress.is_empty()
    }
}

/// Hold back or release scale-outs in the graph
///
/// Runs after the pipeline built the Component vertices. Components whose
/// workload does not exist yet are left alone: there is nothing to clone from.
#[instrument(skip_all, fields(cluster = %cluster.name_any()))]
pub async fn reconcile_horizontal_scale(
    reader: Arc<dyn ClusterReader>,
    cluster: &Cluster,
    components: &[(ClusterComponentSpec, ComponentDefinition)],
    graph: &mut MutationGraph,
    events: &mut Vec<PendingEvent>,
) -> Result<ScaleReport> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let mut report = ScaleReport::default();

    for (spec, comp_def) in components {
        let workload = workload_name(&cluster_name, &spec.name);
        let Some(sts) = reader.get_statefulset(&namespace, &workload).await? else {
            continue;
        };
        let current = sts.spec.and_then(|s| s.replicas).unwrap_or(1);
        let target = ScaleTarget {
            cluster: cluster.clone(),
            spec: spec.clone(),
            comp_def: comp_def.clone(),
            current,
        };

        if spec.replicas == current {
            if target.policy() == HScaleDataClonePolicy::CloneVolume {
                let clone = new_data_clone(reader.clone(), target);
                for vertex in clone.clear_tmp_resources(events).await? {
                    graph.add_vertex(vertex);
                }
            }
            continue;
        }
        if spec.replicas < current {
            continue;
        }

        let clone = new_data_clone(reader.clone(), target);
        if clone.succeed(events).await? {
            debug!(component = %spec.name, replicas = spec.replicas, "Data clone done");
            continue;
        }

        info!(component = %spec.name, from = current, to = spec.replicas, "Cloning data for new replicas");
        let comp_key = component_key(cluster, &spec.name);
        for vertex in clone.clone_data(events).await? {
            let key = vertex.key.clone();
            graph.add_vertex(vertex);
            graph.connect(&key, &comp_key);
        }
        hold_replicas(graph, &comp_key, current);
        report.in_progress.push(spec.name.clone());
    }
    Ok(report)
}

fn component_key(cluster: &Cluster, comp_name: &str) -> ObjectKey {
    ObjectKey::new(
        <Component as kube::Resource>::kind(&()),
        cluster.namespace(),
        component_object_name(&cluster.name_any(), comp_name),
    )
}

/// Keep the Component at its current replica count
fn hold_replicas(graph: &mut MutationGraph, comp_key: &ObjectKey, current: i32) {
    if let Some(vertex) = graph.vertex_mut(comp_key)
        && let Some(spec) = vertex.object.data.get_mut("spec").and_then(|s| s.as_object_mut())
    {
        spec.insert("replicas".to_string(), json!(current));
    }
}
