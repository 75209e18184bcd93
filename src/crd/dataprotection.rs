//! Data-protection resources used to clone data into new replicas
//!
//! These are owned by the data-protection controllers. The cluster controller
//! creates `Backup` and `Restore` objects and reads their phases.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Backup of a component's volumes
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "dataprotection.dbcluster.io",
    version = "v1alpha1",
    kind = "Backup",
    plural = "backups",
    namespaced,
    status = "BackupStatus",
    printcolumn = r#"{"name":"Policy", "type":"string", "jsonPath":".spec.backupPolicyName"}"#,
    printcolumn = r#"{"name":"Method", "type":"string", "jsonPath":".spec.backupMethod"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    pub backup_policy_name: String,
    pub backup_method: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BackupPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum BackupPhase {
    New,
    Running,
    Completed,
    Failed,
    Deleting,
}

impl Backup {
    pub fn phase(&self) -> Option<BackupPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }
}

/// Restore of a backup into the volumes of one replica
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "dataprotection.dbcluster.io",
    version = "v1alpha1",
    kind = "Restore",
    plural = "restores",
    namespaced,
    status = "RestoreStatus",
    printcolumn = r#"{"name":"Backup", "type":"string", "jsonPath":".spec.backup.name"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    pub backup: RestoreBackupRef,

    /// Volumes to populate before the replica starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_data_config: Option<PrepareDataConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreBackupRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrepareDataConfig {
    /// Claims the restore creates and fills, one per cloned volume
    pub volume_claims: Vec<RestoreVolumeClaim>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreVolumeClaim {
    /// Name of the PersistentVolumeClaim to create
    pub name: String,

    /// Volume of the backup to restore from
    pub volume_source: String,

    pub storage: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RestorePhase>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum RestorePhase {
    Running,
    Completed,
    Failed,
}

impl Restore {
    pub fn phase(&self) -> Option<RestorePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }
}

/// BackupPolicy lists the backup methods available for a component
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "dataprotection.dbcluster.io",
    version = "v1alpha1",
    kind = "BackupPolicy",
    plural = "backuppolicies",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicySpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_methods: Vec<BackupMethod>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupMethod {
    pub name: String,

    /// Method takes volume snapshots instead of copying data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_volumes: Option<bool>,
}

impl BackupMethod {
    pub fn is_snapshot(&self) -> bool {
        self.snapshot_volumes.unwrap_or(false)
    }
}
