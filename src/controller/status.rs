//! Status and conditions management for Cluster resources
//!
//! Conditions are kept as a type-deduplicated list. A condition's
//! `lastTransitionTime` only moves when its status or message changes, and a
//! condition counts as changed when its message differs from the stored one.

use std::collections::BTreeMap;

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::{Cluster, ClusterPhase, ClusterStatus, Condition};
use crate::resources::common::FIELD_MANAGER;

/// Condition types written by the cluster controller
pub mod condition_types {
    /// Normalization resolved every definition the cluster refers to
    pub const PROVISIONING_STARTED: &str = "ProvisioningStarted";
    /// The mutation graph was applied
    pub const APPLY_RESOURCES: &str = "ApplyResources";
    /// Every component is running
    pub const READY: &str = "Ready";
    /// Every component reports ready pods
    pub const REPLICAS_READY: &str = "ReplicasReady";
    /// Provisioned system accounts, encoded in the message
    pub const SYSTEM_ACCOUNT_PROVISION: &str = "SystemAccountProvision";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Condition reasons
pub mod reasons {
    pub const PRE_CHECK_SUCCEED: &str = "PreCheckSucceed";
    pub const PRE_CHECK_FAILED: &str = "PreCheckFailed";
    pub const APPLY_RESOURCES_SUCCEED: &str = "ApplyResourcesSucceed";
    pub const APPLY_RESOURCES_FAILED: &str = "ApplyResourcesFailed";
    pub const ALL_REPLICAS_READY: &str = "AllReplicasReady";
    pub const REPLICAS_NOT_READY: &str = "ReplicasNotReady";
    pub const CLUSTER_READY: &str = "ClusterReady";
    pub const COMPONENTS_NOT_READY: &str = "ComponentsNotReady";
    pub const ACCOUNTS_IN_PROGRESS: &str = "InProgress";
    pub const ALL_ACCOUNTS_PROVISIONED: &str = "AllProvisioned";
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether writing `new` would change the stored condition of the same type
///
/// Only the message is compared, so a status flip with an identical message is
/// not reported as a change.
pub fn condition_changed(conditions: &[Condition], new: &Condition) -> bool {
    find_condition(conditions, &new.type_).is_none_or(|old| old.message != new.message)
}

/// Upsert a condition, replacing any existing condition of the same type
///
/// Returns true when the list was modified.
pub fn upsert_condition(conditions: &mut Vec<Condition>, mut new: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status == new.status && existing.message == new.message {
                new.last_transition_time = existing.last_transition_time.clone();
            }
            if *existing == new {
                return false;
            }
            *existing = new;
            true
        }
        None => {
            conditions.push(new);
            true
        }
    }
}

/// Create a condition stamped with the current time
pub fn new_condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Utc::now().to_rfc3339(),
        observed_generation: generation,
    }
}

pub fn provisioning_started(generation: Option<i64>, error: Option<&Error>) -> Condition {
    match error {
        None => new_condition(
            condition_types::PROVISIONING_STARTED,
            condition_status::TRUE,
            reasons::PRE_CHECK_SUCCEED,
            "The operator has started the provisioning of Cluster",
            generation,
        ),
        Some(err) => new_condition(
            condition_types::PROVISIONING_STARTED,
            condition_status::FALSE,
            reasons::PRE_CHECK_FAILED,
            &err.to_string(),
            generation,
        ),
    }
}

pub fn apply_resources(generation: Option<i64>, error: Option<&Error>) -> Condition {
    match error {
        None => new_condition(
            condition_types::APPLY_RESOURCES,
            condition_status::TRUE,
            reasons::APPLY_RESOURCES_SUCCEED,
            "Successfully applied for resources",
            generation,
        ),
        Some(err) => new_condition(
            condition_types::APPLY_RESOURCES,
            condition_status::FALSE,
            reasons::APPLY_RESOURCES_FAILED,
            &err.to_string(),
            generation,
        ),
    }
}

pub fn all_replicas_ready(generation: Option<i64>) -> Condition {
    new_condition(
        condition_types::REPLICAS_READY,
        condition_status::TRUE,
        reasons::ALL_REPLICAS_READY,
        "all pods of components are ready, waiting for the probe detection successful",
        generation,
    )
}

/// `names` must already be sorted
pub fn replicas_not_ready(generation: Option<i64>, names: &[String]) -> Condition {
    new_condition(
        condition_types::REPLICAS_READY,
        condition_status::FALSE,
        reasons::REPLICAS_NOT_READY,
        &format!("pods are not ready in Components: [{}], refer to related component message in Cluster.status.components", names.join(",")),
        generation,
    )
}

pub fn cluster_ready(generation: Option<i64>, cluster_name: &str) -> Condition {
    new_condition(
        condition_types::READY,
        condition_status::TRUE,
        reasons::CLUSTER_READY,
        &format!("Cluster: {cluster_name} is ready, current phase is Running"),
        generation,
    )
}

/// `names` must already be sorted
pub fn components_not_ready(generation: Option<i64>, names: &[String]) -> Condition {
    new_condition(
        condition_types::READY,
        condition_status::FALSE,
        reasons::COMPONENTS_NOT_READY,
        &format!("pods are unavailable in Components: [{}], refer to related component message in Cluster.status.components", names.join(",")),
        generation,
    )
}

/// Account condition; the message carries the encoded provisioned set
pub fn system_account_provision(generation: Option<i64>, encoded: &str, complete: bool) -> Condition {
    let (status, reason) = if complete {
        (condition_status::TRUE, reasons::ALL_ACCOUNTS_PROVISIONED)
    } else {
        (condition_status::FALSE, reasons::ACCOUNTS_IN_PROGRESS)
    };
    new_condition(
        condition_types::SYSTEM_ACCOUNT_PROVISION,
        status,
        reason,
        encoded,
        generation,
    )
}

/// Check if the spec has changed since the last fully written status
pub fn spec_changed(cluster: &Cluster) -> bool {
    let observed = cluster.status.as_ref().and_then(|s| s.observed_generation);
    observed != cluster.metadata.generation
}

/// Writes the root Cluster object: removed annotations first, then status
pub struct StatusManager<'a> {
    api: Api<Cluster>,
    cluster: &'a Cluster,
}

impl<'a> StatusManager<'a> {
    pub fn new(api: Api<Cluster>, cluster: &'a Cluster) -> Self {
        Self { api, cluster }
    }

    /// Persist the working copy's status and any annotations it dropped
    pub async fn write(&self, working: &Cluster) -> Result<()> {
        let name = self.cluster.name_any();

        let removed = removed_annotations(self.cluster.annotations(), working.annotations());
        if !removed.is_empty() {
            let annotations: serde_json::Map<String, serde_json::Value> = removed
                .into_iter()
                .map(|k| (k, serde_json::Value::Null))
                .collect();
            let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
            self.api
                .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }

        if self.cluster.status == working.status {
            debug!(cluster = %name, "Status unchanged, skipping write");
            return Ok(());
        }
        self.update(working.status.clone().unwrap_or_default()).await
    }

    /// Update the cluster status with full status object
    pub async fn update(&self, status: ClusterStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api
            .patch_status(
                &self.cluster.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    /// Report that the cluster is being deleted
    pub async fn set_deleting(&self) -> Result<()> {
        let mut status = self.cluster.status.clone().unwrap_or_default();
        if status.phase == Some(ClusterPhase::Deleting) {
            return Ok(());
        }
        status.phase = Some(ClusterPhase::Deleting);
        self.update(status).await
    }
}

fn removed_annotations(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> Vec<String> {
    before
        .keys()
        .filter(|k| !after.contains_key(*k))
        .cloned()
        .collect()
}
