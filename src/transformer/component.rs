//! Component object stage
//!
//! Adds one Component vertex per resolved component, shards included, and a
//! delete vertex for every observed Component the cluster no longer wants.

use std::collections::BTreeSet;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::debug;

use super::{StageResult, TransformContext, TransformDelta, Transformer};
use crate::crd::{ClusterComponentSpec, Component, ComponentSpec};
use crate::graph::{MutationGraph, Vertex};
use crate::resources::common::{
    COMP_DEF_LABEL, SHARDING_DEF_LABEL, SHARDING_NAME_LABEL, component_labels, component_object_name,
    owner_reference,
};

pub struct ComponentTransformer;

/// Desired Component object for a resolved component spec
pub fn build_component(ctx: &TransformContext, spec: &ClusterComponentSpec) -> Component {
    let cluster_name = ctx.cluster_name();
    let mut labels = component_labels(&cluster_name, &spec.name);
    labels.insert(COMP_DEF_LABEL.to_string(), spec.component_def.clone());
    if let Some(sharding) = ctx.sharding_of(&spec.name) {
        labels.insert(SHARDING_NAME_LABEL.to_string(), sharding.to_string());
        if let Some(sharding_def) = ctx.sharding_defs.get(sharding) {
            labels.insert(SHARDING_DEF_LABEL.to_string(), sharding_def.name_any());
        }
    }

    Component {
        metadata: ObjectMeta {
            name: Some(component_object_name(&cluster_name, &spec.name)),
            namespace: Some(ctx.namespace()),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(&ctx.cluster)]),
            ..Default::default()
        },
        spec: ComponentSpec {
            comp_def: spec.component_def.clone(),
            service_version: spec.service_version.clone(),
            replicas: spec.replicas,
        },
        status: None,
    }
}

#[async_trait]
impl Transformer for ComponentTransformer {
    fn name(&self) -> &'static str {
        "component"
    }

    async fn transform(&self, ctx: &TransformContext, _graph: &MutationGraph) -> StageResult {
        let mut delta = TransformDelta::new();
        let mut desired = BTreeSet::new();

        for spec in ctx.all_components() {
            desired.insert(spec.name.as_str());
            delta.vertices.push(Vertex::patch(&build_component(ctx, spec))?);
        }

        for (name, comp) in &ctx.observed_components {
            if !desired.contains(name.as_str()) && comp.metadata.deletion_timestamp.is_none() {
                debug!(component = %name, "Component is no longer wanted");
                delta.vertices.push(Vertex::delete(comp)?);
            }
        }
        Ok(delta)
    }
}
