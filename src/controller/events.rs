//! Kubernetes Event recording for the Cluster controller
//!
//! Stages collect events while they run; the reconciler publishes them on the
//! cluster once the pipeline is done. Publishing is fire-and-forget: failures
//! are logged and never fail a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{EventType, Recorder, Reporter};
use tracing::warn;

/// An event waiting to be published on the reconciled cluster
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub type_: EventType,
    pub reason: String,
    pub action: &'static str,
    pub note: String,
}

impl PendingEvent {
    pub fn normal(reason: &str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason: reason.to_string(),
            action,
            note: note.into(),
        }
    }

    pub fn warning(reason: &str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason: reason.to_string(),
            action,
            note: note.into(),
        }
    }
}

/// Trait for publishing Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, resource_ref: &ObjectReference, event: &PendingEvent);
}

/// Implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, resource_ref: &ObjectReference, event: &PendingEvent) {
        let ev = kube::runtime::events::Event {
            type_: event.type_,
            reason: event.reason.clone(),
            note: Some(event.note.clone()),
            action: event.action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&ev, resource_ref).await {
            warn!(
                reason = %event.reason,
                action = event.action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _resource_ref: &ObjectReference, _event: &PendingEvent) {}
}

/// Event reasons
pub mod reasons {
    pub const CLUSTER_READY: &str = "ClusterReady";
    pub const HORIZONTAL_SCALE: &str = "HorizontalScale";
    pub const BACKUP_CREATED: &str = "BackupCreated";
    pub const BACKUP_FAILED: &str = "BackupFailed";
    pub const RESTORE_CREATED: &str = "RestoreCreated";
    pub const RESTORE_FAILED: &str = "RestoreFailed";
    pub const BACKUP_METHOD_AMBIGUOUS: &str = "BackupMethodAmbiguous";
    pub const ACCOUNT_PROVISION_FAILED: &str = "AccountProvisionFailed";
    pub const APPLY_RESOURCES_FAILED: &str = "ApplyResourcesFailed";
}

/// Event actions
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const SCALE: &str = "Scale";
    pub const PROVISION: &str = "Provision";
}
