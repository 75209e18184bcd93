//! Normalization stage
//!
//! Turns the user's cluster spec into fully resolved component and sharding
//! specs. With a cluster definition the topology slots are merged with the
//! user's overrides; without one the user's specs are taken as they are. Every
//! component and sharding definition reference is then resolved to a concrete
//! definition and service version and written back into the working spec.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, instrument};

use super::resolver::{
    prefix_or_regex_matched, resolve_component_definition, resolve_sharding_definition,
};
use super::{StageError, StageResult, TransformContext, TransformDelta, Transformer, first_duplicate};
use crate::controller::client::ClusterReader;
use crate::controller::error::{Error, Result};
use crate::controller::status::provisioning_started;
use crate::crd::{
    ClusterComponentSpec, ClusterSharding, ClusterTopology, Component, ComponentDefinition,
    ComponentVersion, ShardingDefinition,
};
use crate::graph::MutationGraph;
use crate::resources::common::{SHARDING_DEF_LABEL, SHARDING_NAME_LABEL};

pub struct NormalizationTransformer {
    reader: Arc<dyn ClusterReader>,
}

impl NormalizationTransformer {
    pub fn new(reader: Arc<dyn ClusterReader>) -> Self {
        Self { reader }
    }

    #[instrument(skip_all, fields(cluster = %ctx.cluster_name()))]
    async fn normalize(&self, ctx: &TransformContext) -> Result<TransformDelta> {
        let comp_defs = self.reader.list_component_definitions().await?;
        let comp_versions = self.reader.list_component_versions().await?;
        let sharding_defs = self.reader.list_sharding_definitions().await?;

        let spec = &ctx.cluster.spec;
        let mut delta = TransformDelta::new();

        let (mut components, mut shardings) =
            match spec.cluster_def.as_deref().filter(|name| !name.is_empty()) {
                Some(name) => {
                    let cluster_def = self
                        .reader
                        .get_cluster_definition(name)
                        .await?
                        .ok_or_else(|| Error::NotFound(format!("ClusterDefinition {name}")))?;
                    let topology = cluster_def.topology(spec.topology.as_deref()).ok_or_else(|| {
                        Error::ValidationError(format!(
                            "referred cluster topology not found: {}",
                            spec.topology.as_deref().unwrap_or("<default>")
                        ))
                    })?;
                    debug!(topology = %topology.name, "Resolving components from topology");
                    let merged = (
                        components_from_topology(topology, &spec.component_specs),
                        shardings_from_topology(topology, &spec.shardings),
                    );
                    delta.cluster_def = Some(cluster_def);
                    merged
                }
                None => (spec.component_specs.clone(), spec.shardings.clone()),
            };

        let mut resolved = Resolved::default();
        for sharding in &mut shardings {
            resolve_sharding(ctx, sharding, &sharding_defs, &comp_defs, &comp_versions, &mut resolved)?;
        }
        for comp in &mut components {
            let observed = ctx.observed_components.get(&comp.name);
            let comp_def = resolve_component(comp, observed, &comp_defs, &comp_versions)?;
            resolved.component_defs.insert(comp.name.clone(), comp_def);
        }

        let sharding_comps: BTreeMap<String, Vec<ClusterComponentSpec>> = shardings
            .iter()
            .map(|sharding| (sharding.name.clone(), build_shard_components(ctx, sharding)))
            .collect();
        for (sharding_name, shards) in &sharding_comps {
            if let Some(comp_def) = resolved.shard_comp_defs.get(sharding_name) {
                for shard in shards {
                    resolved
                        .component_defs
                        .insert(shard.name.clone(), comp_def.clone());
                }
            }
        }

        post_check(&components, &shardings, &sharding_comps, &resolved)?;

        delta.sidecars = resolved
            .component_defs
            .iter()
            .filter(|(_, def)| !def.spec.sidecars.is_empty())
            .map(|(name, def)| (name.clone(), def.spec.sidecars.clone()))
            .collect();

        let mut cluster_spec = spec.clone();
        if !components.is_empty() {
            cluster_spec.component_specs = components.clone();
        }
        if !shardings.is_empty() {
            cluster_spec.shardings = shardings.clone();
        }

        delta.cluster_spec = Some(cluster_spec);
        delta.component_defs = resolved.component_defs;
        delta.sharding_defs = resolved.sharding_defs;
        delta.components = Some(components);
        delta.shardings = Some(shardings);
        delta.sharding_comps = Some(sharding_comps);
        Ok(delta)
    }
}

#[async_trait]
impl Transformer for NormalizationTransformer {
    fn name(&self) -> &'static str {
        "normalization"
    }

    async fn transform(&self, ctx: &TransformContext, _graph: &MutationGraph) -> StageResult {
        let generation = ctx.generation();
        match self.normalize(ctx).await {
            Ok(delta) => Ok(delta.with_condition(provisioning_started(generation, None))),
            Err(error) => {
                let partial =
                    TransformDelta::new().with_condition(provisioning_started(generation, Some(&error)));
                Err(StageError { error, partial })
            }
        }
    }
}

#[derive(Default)]
struct Resolved {
    component_defs: BTreeMap<String, ComponentDefinition>,
    sharding_defs: BTreeMap<String, ShardingDefinition>,
    /// Component definition of every shard, keyed by sharding name
    shard_comp_defs: BTreeMap<String, ComponentDefinition>,
}

/// Merge topology component slots with the user's component specs
///
/// A slot takes every user spec it matches. A plain slot nobody overrides is
/// instantiated with the slot's definition; template slots are never
/// instantiated on their own.
pub fn components_from_topology(
    topology: &ClusterTopology,
    user_specs: &[ClusterComponentSpec],
) -> Vec<ClusterComponentSpec> {
    let mut components = Vec::new();
    for slot in &topology.components {
        let matched: Vec<&ClusterComponentSpec> =
            user_specs.iter().filter(|spec| slot.matches(&spec.name)).collect();
        if matched.is_empty() {
            if !slot.is_template() {
                components.push(ClusterComponentSpec {
                    name: slot.name.clone(),
                    component_def: slot.comp_def.clone(),
                    replicas: 1,
                    ..Default::default()
                });
            }
            continue;
        }
        for spec in matched {
            let mut spec = spec.clone();
            if spec.component_def.is_empty() {
                spec.component_def = slot.comp_def.clone();
            }
            components.push(spec);
        }
    }
    components
}

/// Merge topology sharding slots with the user's shardings, by name
pub fn shardings_from_topology(
    topology: &ClusterTopology,
    user_shardings: &[ClusterSharding],
) -> Vec<ClusterSharding> {
    topology
        .shardings
        .iter()
        .map(|slot| match user_shardings.iter().find(|s| s.name == slot.name) {
            Some(user) => {
                let mut sharding = user.clone();
                if sharding.sharding_def.is_empty() {
                    sharding.sharding_def = slot.sharding_def.clone();
                }
                sharding
            }
            None => ClusterSharding {
                name: slot.name.clone(),
                sharding_def: slot.sharding_def.clone(),
                ..Default::default()
            },
        })
        .collect()
}

/// Whether the spec asks for a different definition or version than the
/// running Component uses
///
/// An empty requested version keeps whatever version is running, and a
/// definition pattern still matching the running definition keeps it.
pub fn is_upgrade(spec: &ClusterComponentSpec, running: &Component) -> bool {
    let version_changed =
        !spec.service_version.is_empty() && spec.service_version != running.spec.service_version;
    let def_changed = spec.component_def != running.spec.comp_def
        && !prefix_or_regex_matched(&running.spec.comp_def, &spec.component_def);
    version_changed || def_changed
}

fn resolve_with_stickiness(
    spec: &ClusterComponentSpec,
    running: Option<&Component>,
    comp_defs: &[ComponentDefinition],
    comp_versions: &[ComponentVersion],
) -> Result<(ComponentDefinition, String)> {
    if spec.component_def.is_empty() {
        return Err(Error::ValidationError(format!(
            "componentDef is not specified for component {}",
            spec.name
        )));
    }
    match running {
        Some(comp) if !comp.spec.comp_def.is_empty() && !is_upgrade(spec, comp) => {
            debug!(component = %spec.name, comp_def = %comp.spec.comp_def, "Keeping running definition");
            resolve_component_definition(&comp.spec.comp_def, &comp.spec.service_version, comp_defs, comp_versions)
        }
        _ => resolve_component_definition(&spec.component_def, &spec.service_version, comp_defs, comp_versions),
    }
}

fn resolve_component(
    spec: &mut ClusterComponentSpec,
    running: Option<&Component>,
    comp_defs: &[ComponentDefinition],
    comp_versions: &[ComponentVersion],
) -> Result<ComponentDefinition> {
    let (comp_def, service_version) = resolve_with_stickiness(spec, running, comp_defs, comp_versions)?;
    spec.component_def = comp_def.name_any();
    spec.service_version = service_version;
    Ok(comp_def)
}

/// First existing shard Component of a sharding, by component name
fn first_shard_component<'a>(ctx: &'a TransformContext, sharding: &str) -> Option<&'a Component> {
    ctx.observed_components
        .values()
        .filter(|comp| comp.labels().get(SHARDING_NAME_LABEL).map(String::as_str) == Some(sharding))
        .min_by_key(|comp| comp.name_any())
}

fn resolve_sharding(
    ctx: &TransformContext,
    sharding: &mut ClusterSharding,
    sharding_defs: &[ShardingDefinition],
    comp_defs: &[ComponentDefinition],
    comp_versions: &[ComponentVersion],
    resolved: &mut Resolved,
) -> Result<()> {
    let first_shard = first_shard_component(ctx, &sharding.name);

    // The definition a running sharding was created with wins over the spec
    if let Some(def) = first_shard
        .and_then(|comp| comp.labels().get(SHARDING_DEF_LABEL))
        .filter(|def| !def.is_empty())
    {
        sharding.sharding_def = def.clone();
    }

    if !sharding.sharding_def.is_empty() {
        let sharding_def = resolve_sharding_definition(&sharding.sharding_def, sharding_defs)?;
        validate_shards(&sharding_def, sharding)?;
        if sharding.template.component_def.is_empty() {
            sharding.template.component_def = sharding_def.spec.template.comp_def.clone();
        }
        sharding.sharding_def = sharding_def.name_any();
        resolved.sharding_defs.insert(sharding.name.clone(), sharding_def);
    }

    let template = &mut sharding.template;
    if template.name.is_empty() {
        template.name = sharding.name.clone();
    }
    let comp_def = resolve_component(template, first_shard, comp_defs, comp_versions)?;
    resolved.shard_comp_defs.insert(sharding.name.clone(), comp_def);
    Ok(())
}

/// Check the shard count against the definition's limit
pub fn validate_shards(sharding_def: &ShardingDefinition, sharding: &ClusterSharding) -> Result<()> {
    if let Some(limit) = sharding_def.spec.shards_limit
        && (sharding.shards < limit.min_shards || sharding.shards > limit.max_shards)
    {
        return Err(Error::ValidationError(format!(
            "shards {} out-of-limit [{}, {}], sharding: {}",
            sharding.shards, limit.min_shards, limit.max_shards, sharding.name
        )));
    }
    Ok(())
}

/// Shard component specs for a sharding
///
/// Existing shards keep their names; new shards take `{sharding}-{n}` with
/// the smallest unused `n`. When scaling in, the lowest names are kept.
pub fn build_shard_components(ctx: &TransformContext, sharding: &ClusterSharding) -> Vec<ClusterComponentSpec> {
    let wanted = usize::try_from(sharding.shards).unwrap_or_default();
    let existing: BTreeSet<&str> = ctx
        .observed_components
        .iter()
        .filter(|(_, comp)| {
            comp.labels().get(SHARDING_NAME_LABEL).map(String::as_str) == Some(sharding.name.as_str())
        })
        .map(|(name, _)| name.as_str())
        .collect();

    let mut names: Vec<String> = existing.iter().take(wanted).map(|n| n.to_string()).collect();
    let mut ordinal = 0usize;
    while names.len() < wanted {
        let candidate = format!("{}-{ordinal}", sharding.name);
        if !existing.contains(candidate.as_str()) {
            names.push(candidate);
        }
        ordinal += 1;
    }
    names.sort();

    names
        .into_iter()
        .map(|name| ClusterComponentSpec {
            name,
            ..sharding.template.clone()
        })
        .collect()
}

fn post_check(
    components: &[ClusterComponentSpec],
    shardings: &[ClusterSharding],
    sharding_comps: &BTreeMap<String, Vec<ClusterComponentSpec>>,
    resolved: &Resolved,
) -> Result<()> {
    let names = components
        .iter()
        .map(|c| c.name.as_str())
        .chain(shardings.iter().map(|s| s.name.as_str()));
    if let Some(name) = first_duplicate(names.collect::<Vec<_>>().iter(), |n| n.to_string()) {
        return Err(Error::ValidationError(format!(
            "duplicate name \"{name}\" between spec.componentSpecs and spec.shardings"
        )));
    }

    for comp in components.iter().chain(sharding_comps.values().flatten()) {
        let Some(limit) = resolved
            .component_defs
            .get(&comp.name)
            .and_then(|def| def.spec.replicas_limit)
        else {
            continue;
        };
        if comp.replicas < limit.min_replicas || comp.replicas > limit.max_replicas {
            return Err(Error::ValidationError(format!(
                "replicas {} out-of-limit [{}, {}], component: {}",
                comp.replicas, limit.min_replicas, limit.max_replicas, comp.name
            )));
        }
    }
    Ok(())
}
