//! Common utilities for Kubernetes resource generation
//!
//! Labels, names and owner references shared by every object the cluster
//! controller creates, so that later reconciles can find those objects again.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::crd::Cluster;

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "dbcluster-operator";

pub const APP_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT_NAME_LABEL: &str = "apps.dbcluster.io/component-name";
pub const COMP_DEF_LABEL: &str = "apps.dbcluster.io/component-definition";
pub const SHARDING_NAME_LABEL: &str = "apps.dbcluster.io/sharding-name";
pub const SHARDING_DEF_LABEL: &str = "apps.dbcluster.io/sharding-definition";
pub const VOLUME_CLAIM_TEMPLATE_LABEL: &str = "apps.dbcluster.io/volume-claim-template";
pub const DATA_CLONE_LABEL: &str = "dataprotection.dbcluster.io/data-clone";
pub const ACCOUNT_NAME_LABEL: &str = "apps.dbcluster.io/account-name";

/// Backup policy template a backup policy was created from
pub const BACKUP_POLICY_TEMPLATE_ANNOTATION: &str = "dataprotection.dbcluster.io/backup-policy-template";
/// Components being restored from a backup, as a JSON object keyed by component name
pub const RESTORE_FROM_BACKUP_ANNOTATION: &str = "apps.dbcluster.io/restore-from-backup";

/// Generate an owner reference for a Cluster
///
/// Child resources are garbage collected with the cluster.
pub fn owner_reference(cluster: &Cluster) -> OwnerReference {
    OwnerReference {
        api_version: Cluster::api_version(&()).to_string(),
        kind: Cluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels for every resource belonging to a cluster
pub fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_INSTANCE_LABEL.to_string(), cluster_name.to_string()),
        (APP_MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string()),
    ])
}

/// Labels for resources belonging to one component
pub fn component_labels(cluster_name: &str, comp_name: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster_name);
    labels.insert(COMPONENT_NAME_LABEL.to_string(), comp_name.to_string());
    labels
}

/// Labels marking temporary data-clone objects of a component
pub fn data_clone_labels(cluster_name: &str, comp_name: &str) -> BTreeMap<String, String> {
    let mut labels = component_labels(cluster_name, comp_name);
    labels.insert(DATA_CLONE_LABEL.to_string(), "true".to_string());
    labels
}

/// Render labels as a label selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Full name of a component's runtime objects
pub fn component_object_name(cluster_name: &str, comp_name: &str) -> String {
    format!("{cluster_name}-{comp_name}")
}

/// Name of the workload backing a component
pub fn workload_name(cluster_name: &str, comp_name: &str) -> String {
    component_object_name(cluster_name, comp_name)
}

/// Name of a replica pod of a workload
pub fn replica_name(workload: &str, ordinal: i32) -> String {
    format!("{workload}-{ordinal}")
}

/// Name of the claim a replica mounts for a volume claim template
pub fn pvc_name(vct_name: &str, replica: &str) -> String {
    format!("{vct_name}-{replica}")
}

/// Name of the secret holding a system account's credentials
pub fn account_secret_name(cluster_name: &str, comp_name: &str, account: &str) -> String {
    format!("{cluster_name}-{comp_name}-account-{account}")
}
