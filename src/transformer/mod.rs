//! Transformer pipeline
//!
//! A reconcile runs an ordered list of stages over a per-reconcile
//! [`TransformContext`] and a [`MutationGraph`]. Stages never mutate the
//! context directly: each returns a [`TransformDelta`] that the pipeline driver
//! merges before running the next stage. The first failing stage aborts the
//! pipeline; its partial delta (typically conditions describing the failure)
//! is still merged so the failure can be reported in the cluster status.

pub mod account;
pub mod component;
pub mod normalization;
pub mod reference;
pub mod resolver;
pub mod status;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::controller::actions::LifecycleActionRunner;
use crate::controller::client::ClusterReader;
use crate::controller::error::{Error, Result};
use crate::controller::events::PendingEvent;
use crate::controller::status::{condition_changed, upsert_condition};
use crate::controller::store::SecretStore;
use crate::crd::{
    Cluster, ClusterComponentSpec, ClusterDefinition, ClusterSharding, ClusterSpec, ClusterStatus,
    Component, ComponentDefinition, Condition, ShardingDefinition,
};
use crate::graph::{MutationGraph, ObjectKey, Vertex};
use crate::resources::common::COMPONENT_NAME_LABEL;

/// State shared by the stages of one reconcile
#[derive(Debug, Clone)]
pub struct TransformContext {
    /// The cluster as read from the API server
    pub orig_cluster: Arc<Cluster>,
    /// Working copy; spec write-back, annotations and status land here
    pub cluster: Cluster,
    pub cluster_def: Option<ClusterDefinition>,
    /// Resolved component definitions keyed by component name, shards included
    pub component_defs: BTreeMap<String, ComponentDefinition>,
    /// Resolved sharding definitions keyed by sharding name
    pub sharding_defs: BTreeMap<String, ShardingDefinition>,
    /// Resolved plain components
    pub components: Vec<ClusterComponentSpec>,
    pub shardings: Vec<ClusterSharding>,
    /// Shard components keyed by sharding name
    pub sharding_comps: BTreeMap<String, Vec<ClusterComponentSpec>>,
    /// Sidecar names attached to each component
    pub sidecars: BTreeMap<String, Vec<String>>,
    /// Existing Component objects keyed by component name
    pub observed_components: BTreeMap<String, Component>,
    pub events: Vec<PendingEvent>,
}

impl TransformContext {
    pub fn new(cluster: Arc<Cluster>, observed: Vec<Component>) -> Self {
        let cluster_name = cluster.name_any();
        let observed_components = observed
            .into_iter()
            .map(|comp| (component_key(&cluster_name, &comp), comp))
            .collect();
        Self {
            cluster: (*cluster).clone(),
            orig_cluster: cluster,
            cluster_def: None,
            component_defs: BTreeMap::new(),
            sharding_defs: BTreeMap::new(),
            components: Vec::new(),
            shardings: Vec::new(),
            sharding_comps: BTreeMap::new(),
            sidecars: BTreeMap::new(),
            observed_components,
            events: Vec::new(),
        }
    }

    pub fn namespace(&self) -> String {
        self.cluster.namespace().unwrap_or_default()
    }

    pub fn cluster_name(&self) -> String {
        self.cluster.name_any()
    }

    pub fn generation(&self) -> Option<i64> {
        self.cluster.metadata.generation
    }

    /// Plain components followed by every shard component
    pub fn all_components(&self) -> impl Iterator<Item = &ClusterComponentSpec> {
        self.components
            .iter()
            .chain(self.sharding_comps.values().flatten())
    }

    /// Sharding a component belongs to, if any
    pub fn sharding_of(&self, comp_name: &str) -> Option<&str> {
        self.sharding_comps
            .iter()
            .find(|(_, comps)| comps.iter().any(|c| c.name == comp_name))
            .map(|(name, _)| name.as_str())
    }

    pub fn conditions(&self) -> &[Condition] {
        self.cluster
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

/// Component name of an observed Component object
fn component_key(cluster_name: &str, comp: &Component) -> String {
    comp.labels()
        .get(COMPONENT_NAME_LABEL)
        .cloned()
        .unwrap_or_else(|| {
            let name = comp.name_any();
            name.strip_prefix(&format!("{cluster_name}-"))
                .map(str::to_string)
                .unwrap_or(name)
        })
}

/// Changes a stage asks the driver to merge
#[derive(Debug, Default, Clone)]
pub struct TransformDelta {
    pub cluster_def: Option<ClusterDefinition>,
    pub component_defs: BTreeMap<String, ComponentDefinition>,
    pub sharding_defs: BTreeMap<String, ShardingDefinition>,
    pub components: Option<Vec<ClusterComponentSpec>>,
    pub shardings: Option<Vec<ClusterSharding>>,
    pub sharding_comps: Option<BTreeMap<String, Vec<ClusterComponentSpec>>>,
    pub sidecars: BTreeMap<String, Vec<String>>,
    /// Resolved spec written back into the working cluster
    pub cluster_spec: Option<ClusterSpec>,
    /// Replacement status; conditions below are upserted on top of it
    pub status: Option<ClusterStatus>,
    /// Cluster conditions to upsert; skipped when the message is unchanged
    pub conditions: Vec<Condition>,
    pub annotations_removed: Vec<String>,
    pub vertices: Vec<Vertex>,
    /// Apply-order edges, `(before, after)`
    pub edges: Vec<(ObjectKey, ObjectKey)>,
    pub events: Vec<PendingEvent>,
    pub requeue: Option<Duration>,
}

impl TransformDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Merge this delta into the context and graph
    pub fn apply(self, ctx: &mut TransformContext, graph: &mut MutationGraph) -> Option<Duration> {
        if let Some(cluster_def) = self.cluster_def {
            ctx.cluster_def = Some(cluster_def);
        }
        ctx.component_defs.extend(self.component_defs);
        ctx.sharding_defs.extend(self.sharding_defs);
        if let Some(components) = self.components {
            ctx.components = components;
        }
        if let Some(shardings) = self.shardings {
            ctx.shardings = shardings;
        }
        if let Some(sharding_comps) = self.sharding_comps {
            ctx.sharding_comps = sharding_comps;
        }
        ctx.sidecars.extend(self.sidecars);
        if let Some(spec) = self.cluster_spec {
            ctx.cluster.spec = spec;
        }

        if let Some(status) = self.status {
            ctx.cluster.status = Some(status);
        }
        if !self.conditions.is_empty() {
            let status = ctx.cluster.status.get_or_insert_with(ClusterStatus::default);
            for condition in self.conditions {
                if condition_changed(&status.conditions, &condition) {
                    upsert_condition(&mut status.conditions, condition);
                }
            }
        }

        if !self.annotations_removed.is_empty()
            && let Some(annotations) = ctx.cluster.metadata.annotations.as_mut()
        {
            for key in &self.annotations_removed {
                annotations.remove(key);
            }
        }

        for vertex in self.vertices {
            graph.add_vertex(vertex);
        }
        for (before, after) in &self.edges {
            graph.connect(before, after);
        }
        ctx.events.extend(self.events);
        self.requeue
    }
}

/// A failed stage, with whatever it managed to compute before failing
#[derive(Debug)]
pub struct StageError {
    pub error: Error,
    pub partial: TransformDelta,
}

impl From<Error> for StageError {
    fn from(error: Error) -> Self {
        Self {
            error,
            partial: TransformDelta::default(),
        }
    }
}

pub type StageResult = std::result::Result<TransformDelta, StageError>;

/// One stage of the pipeline
///
/// Implementations must be idempotent: running a stage twice over the same
/// observed state yields the same delta.
#[async_trait]
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn transform(&self, ctx: &TransformContext, graph: &MutationGraph) -> StageResult;

    /// Whether a failure still lets the pipeline finish; the error is then
    /// returned in [`PipelineOutcome::deferred`] so the caller can apply the
    /// graph before reporting it
    fn defers_errors(&self) -> bool {
        false
    }
}

/// Outcome of a pipeline run that produced a graph
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    /// Shortest requeue asked for by any stage
    pub requeue: Option<Duration>,
    /// First error of a stage that defers its errors
    pub deferred: Option<Error>,
}

impl PipelineOutcome {
    /// The deferred error, if any, once the graph has been applied
    pub fn into_result(self) -> Result<Self> {
        match self.deferred {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

/// Fixed-order list of stages
pub struct Pipeline {
    stages: Vec<Box<dyn Transformer>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Transformer>>) -> Self {
        Self { stages }
    }

    /// The cluster pipeline: normalization, reference validation, component
    /// objects, status, then account provisioning
    pub fn for_cluster(
        reader: Arc<dyn ClusterReader>,
        actions: Arc<dyn LifecycleActionRunner>,
        secrets: SecretStore,
    ) -> Self {
        Self::new(vec![
            Box::new(normalization::NormalizationTransformer::new(reader.clone())),
            Box::new(reference::ReferenceValidationTransformer::new(reader.clone())),
            Box::new(component::ComponentTransformer),
            Box::new(status::StatusTransformer),
            Box::new(account::AccountProvisionTransformer::new(reader, actions, secrets)),
        ])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order, stopping at the first failure of a stage
    /// that does not defer its errors
    pub async fn run(&self, ctx: &mut TransformContext, graph: &mut MutationGraph) -> Result<PipelineOutcome> {
        let mut outcome = PipelineOutcome::default();
        for stage in &self.stages {
            debug!(stage = stage.name(), "Running transformer");
            match stage.transform(ctx, graph).await {
                Ok(delta) => {
                    let requeue = delta.apply(ctx, graph);
                    outcome.requeue = shortest(outcome.requeue, requeue);
                }
                Err(StageError { error, partial }) if stage.defers_errors() => {
                    warn!(stage = stage.name(), error = %error, "Transformer failed, keeping its partial result");
                    let requeue = partial.apply(ctx, graph);
                    outcome.requeue = shortest(outcome.requeue, requeue);
                    outcome.deferred.get_or_insert(error);
                }
                Err(StageError { error, partial }) => {
                    warn!(stage = stage.name(), error = %error, "Transformer failed");
                    partial.apply(ctx, graph);
                    return Err(error);
                }
            }
        }
        Ok(outcome)
    }
}

fn shortest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Typed key-extraction check for duplicates; returns the first repeated key
pub fn first_duplicate<'a, T, K, F>(items: impl IntoIterator<Item = &'a T>, key: F) -> Option<K>
where
    T: 'a,
    K: Ord + Clone,
    F: Fn(&T) -> K,
{
    let mut seen = std::collections::BTreeSet::new();
    items.into_iter().map(key).find(|k| !seen.insert(k.clone()))
}
