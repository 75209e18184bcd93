//! Executes a mutation graph against the API server
//!
//! Vertices are applied in walk order. The root vertex is skipped: the
//! cluster's own status and annotations go through the status manager once
//! the graph has been applied.

use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::controller::error::{BackoffConfig, Error, Result};
use crate::graph::{GraphAction, MutationGraph, Vertex};
use crate::resources::common::FIELD_MANAGER;

/// Attempts for a write that keeps conflicting
const MAX_CONFLICT_ATTEMPTS: u32 = 5;

/// Apply every non-root vertex, stopping at the first failure
#[instrument(skip_all, fields(vertices = graph.len()))]
pub async fn apply_graph(client: &Client, graph: &MutationGraph) -> Result<usize> {
    let root = graph.root().map(|r| r.key.clone());
    let mut applied = 0;
    for vertex in graph.walk_order()? {
        if Some(&vertex.key) == root.as_ref() || vertex.action == GraphAction::NoOp {
            continue;
        }
        apply_with_retry(client, vertex).await?;
        applied += 1;
    }
    Ok(applied)
}

async fn apply_with_retry(client: &Client, vertex: &Vertex) -> Result<()> {
    let backoff = BackoffConfig::for_conflicts();
    let mut attempt = 0;
    loop {
        match apply_vertex(client, vertex).await {
            Err(e) if e.is_conflict() && attempt + 1 < MAX_CONFLICT_ATTEMPTS => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(vertex = %vertex.key, attempt, ?delay, "Conflict applying vertex, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn api_for(client: &Client, vertex: &Vertex) -> Api<DynamicObject> {
    match vertex.key.namespace.as_deref() {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &vertex.resource),
        None => Api::all_with(client.clone(), &vertex.resource),
    }
}

async fn apply_vertex(client: &Client, vertex: &Vertex) -> Result<()> {
    let api = api_for(client, vertex);
    let name = vertex.object.name_any();
    debug!(vertex = %vertex.key, action = %vertex.action, "Applying vertex");

    match vertex.action {
        GraphAction::Create => match api.create(&PostParams::default(), &vertex.object).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(vertex = %vertex.key, "Object already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        GraphAction::Patch | GraphAction::Update => {
            let params = PatchParams::apply(FIELD_MANAGER).force();
            api.patch(&name, &params, &Patch::Apply(&vertex.object)).await?;
            Ok(())
        }
        GraphAction::Delete => match api.delete(&name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        },
        GraphAction::Status => {
            let status = vertex
                .object
                .data
                .get("status")
                .cloned()
                .ok_or(Error::MissingObjectKey(".status"))?;
            let patch = json!({ "status": status });
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        }
        GraphAction::NoOp => Ok(()),
    }
}
