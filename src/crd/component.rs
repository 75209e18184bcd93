use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Component is the runtime object for one component of a cluster
///
/// Components are created from the resolved cluster spec and their status is
/// maintained by the component controller; the cluster controller reads that
/// status to compute the cluster phase.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "apps.dbcluster.io",
    version = "v1",
    kind = "Component",
    plural = "components",
    shortname = "cmp",
    namespaced,
    status = "ComponentStatus",
    printcolumn = r#"{"name":"Definition", "type":"string", "jsonPath":".spec.compDef"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.serviceVersion"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Resolved ComponentDefinition name
    pub comp_def: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_version: String,

    #[serde(default)]
    pub replicas: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ComponentPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_ready: Option<bool>,

    /// Messages keyed by "Kind/Name" of the object they describe
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Component lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentPhase {
    Creating,
    Running,
    Updating,
    Stopping,
    Stopped,
    Deleting,
    Failed,
    Abnormal,
}

impl std::fmt::Display for ComponentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentPhase::Creating => write!(f, "Creating"),
            ComponentPhase::Running => write!(f, "Running"),
            ComponentPhase::Updating => write!(f, "Updating"),
            ComponentPhase::Stopping => write!(f, "Stopping"),
            ComponentPhase::Stopped => write!(f, "Stopped"),
            ComponentPhase::Deleting => write!(f, "Deleting"),
            ComponentPhase::Failed => write!(f, "Failed"),
            ComponentPhase::Abnormal => write!(f, "Abnormal"),
        }
    }
}

impl Component {
    pub fn phase(&self) -> Option<ComponentPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
