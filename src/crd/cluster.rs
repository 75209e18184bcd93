use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Condition, ComponentPhase, PasswordConfig};

/// Cluster is the Schema for the clusters API
///
/// A cluster is either built from a `ClusterDefinition` topology or from
/// component and sharding specs that reference component definitions directly.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "apps.dbcluster.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    shortname = "dbc",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Definition", "type":"string", "jsonPath":".spec.clusterDef"}"#,
    printcolumn = r#"{"name":"Topology", "type":"string", "jsonPath":".spec.topology"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Name of the ClusterDefinition providing topologies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_def: Option<String>,

    /// Topology within the cluster definition; the default topology is used when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<String>,

    /// Plain components
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_specs: Vec<ClusterComponentSpec>,

    /// Sharded components
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shardings: Vec<ClusterSharding>,
}

/// Desired state of one component
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentSpec {
    /// Component name, unique within the cluster
    #[serde(default)]
    pub name: String,

    /// ComponentDefinition name, name prefix or regular expression
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component_def: String,

    /// Requested service version; the latest compatible version when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_version: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,

    /// Overrides for the system accounts declared by the component definition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_accounts: Vec<ComponentSystemAccount>,
}

fn default_replicas() -> i32 {
    1
}

/// Persistent volume requested by every replica of a component
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    /// Volume name, matching a volume declared by the component definition
    pub name: String,

    /// Requested storage size (e.g., "10Gi")
    pub storage: String,

    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
}

/// Per-cluster override of a system account
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSystemAccount {
    pub name: String,

    /// Disabled accounts are dropped from the desired account set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_config: Option<PasswordConfig>,

    /// Use the password stored in an existing secret instead of generating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<ProvisionSecretRef>,
}

/// Reference to a secret holding an account password
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionSecretRef {
    pub name: String,

    /// Namespace of the secret; defaults to the cluster namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Key holding the password
    #[serde(default = "default_password_key")]
    pub password_key: String,
}

fn default_password_key() -> String {
    "password".to_string()
}

/// A set of identical shard components built from one template
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSharding {
    pub name: String,

    /// ShardingDefinition name, name prefix or regular expression
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sharding_def: String,

    /// Spec shared by every shard
    pub template: ClusterComponentSpec,

    /// Number of shards
    pub shards: i32,
}

/// Observed state of a Cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Generation of the spec reflected by this status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Status of each component, keyed by component name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ClusterComponentStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Status of one component as seen by the cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ComponentPhase>,

    /// Whether all pods are ready; unset while unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_ready: Option<bool>,

    /// Messages keyed by "Kind/Name" of the object they describe
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message: BTreeMap<String, String>,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum ClusterPhase {
    /// Cluster resources are being created
    Creating,
    /// All components are running
    Running,
    /// Components are being created, updated or restarted
    Updating,
    Stopping,
    Stopped,
    /// Cluster is being deleted
    Deleting,
    /// Every component failed
    Failed,
    /// Some components failed or are abnormal
    Abnormal,
}

impl ClusterPhase {
    pub const ALL: [ClusterPhase; 8] = [
        ClusterPhase::Creating,
        ClusterPhase::Running,
        ClusterPhase::Updating,
        ClusterPhase::Stopping,
        ClusterPhase::Stopped,
        ClusterPhase::Deleting,
        ClusterPhase::Failed,
        ClusterPhase::Abnormal,
    ];

    /// Phases after which a restore request has nothing left to do
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClusterPhase::Running | ClusterPhase::Stopped | ClusterPhase::Failed | ClusterPhase::Abnormal
        )
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Creating => write!(f, "Creating"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Updating => write!(f, "Updating"),
            ClusterPhase::Stopping => write!(f, "Stopping"),
            ClusterPhase::Stopped => write!(f, "Stopped"),
            ClusterPhase::Deleting => write!(f, "Deleting"),
            ClusterPhase::Failed => write!(f, "Failed"),
            ClusterPhase::Abnormal => write!(f, "Abnormal"),
        }
    }
}

impl Cluster {
    /// Whether the cluster has been marked for deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Current phase, if any status has been written
    pub fn phase(&self) -> Option<ClusterPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Existing conditions, or an empty list
    pub fn conditions(&self) -> Vec<Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}
