//! Cluster-scoped definition resources referenced by clusters
//!
//! Definitions are authored by addon providers and validated by their own
//! controllers; the cluster controller only reads them and requires that they
//! report the `Available` phase.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Phase reported by definition resources
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum DefinitionPhase {
    Available,
    Unavailable,
}

impl std::fmt::Display for DefinitionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefinitionPhase::Available => write!(f, "Available"),
            DefinitionPhase::Unavailable => write!(f, "Unavailable"),
        }
    }
}

/// Status shared by every definition resource
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DefinitionPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DefinitionStatus {
    pub fn is_available(&self) -> bool {
        self.phase == Some(DefinitionPhase::Available)
    }
}

// =============================================================================
// ClusterDefinition
// =============================================================================

/// ClusterDefinition groups component definitions into named topologies
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "apps.dbcluster.io",
    version = "v1",
    kind = "ClusterDefinition",
    plural = "clusterdefinitions",
    shortname = "cd",
    status = "DefinitionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDefinitionSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topologies: Vec<ClusterTopology>,
}

/// A predefined arrangement of components and shardings
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ClusterTopologyComponent>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shardings: Vec<ClusterTopologySharding>,

    /// Used when a cluster names no topology
    #[serde(default)]
    pub default: bool,
}

/// A component slot in a topology
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopologyComponent {
    /// Slot name; for templates, the prefix user components must carry
    pub name: String,

    /// ComponentDefinition name, name prefix or regular expression
    pub comp_def: String,

    /// Template slots are only instantiated by user components with a matching prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<bool>,
}

impl ClusterTopologyComponent {
    pub fn is_template(&self) -> bool {
        self.template.unwrap_or(false)
    }

    /// Whether the given component name fills this slot
    pub fn matches(&self, comp_name: &str) -> bool {
        if self.is_template() {
            comp_name.starts_with(&self.name)
        } else {
            comp_name == self.name
        }
    }
}

/// A sharding slot in a topology
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopologySharding {
    pub name: String,

    /// ShardingDefinition name, name prefix or regular expression
    pub sharding_def: String,
}

impl ClusterDefinition {
    /// Find a topology by name, or the default one when no name is given
    pub fn topology(&self, name: Option<&str>) -> Option<&ClusterTopology> {
        match name {
            Some(name) if !name.is_empty() => self.spec.topologies.iter().find(|t| t.name == name),
            _ => self
                .spec
                .topologies
                .iter()
                .find(|t| t.default)
                .or_else(|| self.spec.topologies.first()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.is_available())
    }
}

// =============================================================================
// ComponentDefinition
// =============================================================================

/// ComponentDefinition describes how to run one kind of database component
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "apps.dbcluster.io",
    version = "v1",
    kind = "ComponentDefinition",
    plural = "componentdefinitions",
    shortname = "cmpd",
    status = "DefinitionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinitionSpec {
    /// Service version provided by this definition itself
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<ComponentVolume>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas_limit: Option<ReplicasLimit>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_scale_policy: Option<HorizontalScalePolicy>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_accounts: Vec<SystemAccount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_actions: Option<LifecycleActions>,

    /// Names of sidecar containers attached to every replica
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<String>,
}

/// Volume declared by a component definition
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVolume {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<VolumeType>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    Data,
    Log,
}

/// Inclusive replica bounds
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicasLimit {
    pub min_replicas: i32,
    pub max_replicas: i32,
}

/// How new replicas get their data during a scale-out
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScalePolicy {
    #[serde(rename = "type", default)]
    pub type_: HScaleDataClonePolicy,

    /// BackupPolicyTemplate used to find the backup policy of the component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_policy_template_name: Option<String>,

    /// Volume to clone; defaults to the data volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum HScaleDataClonePolicy {
    /// New replicas start with empty volumes
    #[default]
    None,
    /// New replicas are restored from a backup of an existing replica
    CloneVolume,
}

/// Account created inside the database engine
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemAccount {
    pub name: String,

    /// Created by the engine itself during initialization
    #[serde(default)]
    pub init_account: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<AccountStatements>,

    #[serde(default)]
    pub password_generation_policy: PasswordConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,
}

/// Rules for generating account passwords
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PasswordConfig {
    /// Total length, between 8 and 32
    #[serde(default = "default_password_length")]
    pub length: i32,

    #[serde(default = "default_num_digits")]
    pub num_digits: i32,

    #[serde(default)]
    pub num_symbols: i32,

    #[serde(default)]
    pub letter_case: LetterCase,
}

fn default_password_length() -> i32 {
    10
}

fn default_num_digits() -> i32 {
    2
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            length: default_password_length(),
            num_digits: default_num_digits(),
            num_symbols: 0,
            letter_case: LetterCase::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum LetterCase {
    LowerCases,
    UpperCases,
    #[default]
    MixedCases,
}

/// Hooks executed inside component replicas
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleActions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_provision: Option<ExecAction>,
}

/// Command executed in a replica container
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecAction {
    pub command: Vec<String>,

    /// Container to run in; the first container when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl ComponentDefinition {
    pub fn is_available(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.is_available())
    }

    pub fn system_account(&self, name: &str) -> Option<&SystemAccount> {
        self.spec.system_accounts.iter().find(|a| a.name == name)
    }

    /// The data volume, or the first volume when none is typed as data
    pub fn data_volume_name(&self) -> Option<&str> {
        self.spec
            .volumes
            .iter()
            .find(|v| v.volume_type == Some(VolumeType::Data))
            .or_else(|| self.spec.volumes.first())
            .map(|v| v.name.as_str())
    }

    pub fn account_provision_action(&self) -> Option<&ExecAction> {
        self.spec
            .lifecycle_actions
            .as_ref()
            .and_then(|a| a.account_provision.as_ref())
    }
}

// =============================================================================
// ShardingDefinition
// =============================================================================

/// ShardingDefinition describes a set of identical shard components
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "apps.dbcluster.io",
    version = "v1",
    kind = "ShardingDefinition",
    plural = "shardingdefinitions",
    shortname = "sdd",
    status = "DefinitionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ShardingDefinitionSpec {
    pub template: ShardingTemplate,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards_limit: Option<ShardsLimit>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardingTemplate {
    /// ComponentDefinition name, name prefix or regular expression
    pub comp_def: String,
}

/// Inclusive shard-count bounds
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardsLimit {
    pub min_shards: i32,
    pub max_shards: i32,
}

impl ShardingDefinition {
    pub fn is_available(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.is_available())
    }
}

// =============================================================================
// ComponentVersion
// =============================================================================

/// ComponentVersion publishes service-version releases for component definitions
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "apps.dbcluster.io",
    version = "v1",
    kind = "ComponentVersion",
    plural = "componentversions",
    shortname = "cmpv",
    status = "DefinitionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersionSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compatibility_rules: Vec<ComponentVersionCompatibilityRule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<ComponentVersionRelease>,
}

/// Which definitions may run which releases
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersionCompatibilityRule {
    /// ComponentDefinition name prefixes or regular expressions
    pub comp_defs: Vec<String>,

    /// Release names
    pub releases: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersionRelease {
    pub name: String,

    /// Semantic version provided by this release
    pub service_version: String,
}

impl ComponentVersion {
    pub fn is_available(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.is_available())
    }
}
