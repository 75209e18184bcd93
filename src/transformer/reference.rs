//! Reference validation stage
//!
//! Every definition the normalized cluster refers to must be Available before
//! any object is built from it. Definitions are fetched again rather than
//! trusted from normalization so a definition that became Unavailable in
//! between is caught.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use super::{StageError, StageResult, TransformContext, TransformDelta, Transformer};
use crate::controller::client::ClusterReader;
use crate::controller::error::{Error, Result};
use crate::controller::status::provisioning_started;
use crate::crd::DefinitionStatus;
use crate::graph::MutationGraph;

pub struct ReferenceValidationTransformer {
    reader: Arc<dyn ClusterReader>,
}

impl ReferenceValidationTransformer {
    pub fn new(reader: Arc<dyn ClusterReader>) -> Self {
        Self { reader }
    }

    async fn validate(&self, ctx: &TransformContext) -> Result<()> {
        if let Some(cluster_def) = &ctx.cluster_def {
            let name = cluster_def.name_any();
            let current = self
                .reader
                .get_cluster_definition(&name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("ClusterDefinition {name}")))?;
            require_available("ClusterDefinition", &name, current.status.as_ref())?;
        }

        let comp_defs: BTreeSet<String> = ctx.component_defs.values().map(|d| d.name_any()).collect();
        for name in comp_defs {
            let current = self
                .reader
                .get_component_definition(&name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("ComponentDefinition {name}")))?;
            require_available("ComponentDefinition", &name, current.status.as_ref())?;
        }

        let sharding_defs: BTreeSet<String> = ctx.sharding_defs.values().map(|d| d.name_any()).collect();
        for name in sharding_defs {
            let current = self
                .reader
                .get_sharding_definition(&name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("ShardingDefinition {name}")))?;
            require_available("ShardingDefinition", &name, current.status.as_ref())?;
        }
        Ok(())
    }
}

fn require_available(kind: &'static str, name: &str, status: Option<&DefinitionStatus>) -> Result<()> {
    if status.is_some_and(|s| s.is_available()) {
        return Ok(());
    }
    let reason = match status.and_then(|s| s.phase) {
        Some(phase) => format!("phase is {phase}"),
        None => "status is not reported yet".to_string(),
    };
    debug!(kind, name, %reason, "Referenced definition is not available");
    Err(Error::ReferenceNotAvailable {
        kind,
        name: name.to_string(),
        reason,
    })
}

#[async_trait]
impl Transformer for ReferenceValidationTransformer {
    fn name(&self) -> &'static str {
        "reference-validation"
    }

    async fn transform(&self, ctx: &TransformContext, _graph: &MutationGraph) -> StageResult {
        match self.validate(ctx).await {
            Ok(()) => Ok(TransformDelta::new()),
            Err(error) => {
                let partial =
                    TransformDelta::new().with_condition(provisioning_started(ctx.generation(), Some(&error)));
                Err(StageError { error, partial })
            }
        }
    }
}
