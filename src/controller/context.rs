//! Shared context for the Cluster controller

use std::sync::Arc;

use kube::Client;

use crate::config::OperatorConfig;
use crate::controller::actions::{LifecycleActionRunner, PodExecRunner};
use crate::controller::client::{ClusterReader, KubeReader};
use crate::controller::events::{EventPublisher, KubeEventPublisher};
use crate::controller::store::SecretStore;
use crate::health::HealthState;
use crate::transformer::Pipeline;

/// Controller name reported on published events
pub const CONTROLLER_NAME: &str = "dbcluster-operator";

/// Context passed to every reconcile
pub struct Context {
    /// Kubernetes client used to apply the mutation graph
    pub client: Client,
    pub config: OperatorConfig,
    pub reader: Arc<dyn ClusterReader>,
    pub actions: Arc<dyn LifecycleActionRunner>,
    pub events: Arc<dyn EventPublisher>,
    /// Generated account secrets not yet persisted
    pub secrets: SecretStore,
    /// Health and metrics state, absent when running without a health server
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig, health_state: Option<Arc<HealthState>>) -> Self {
        Self {
            reader: Arc::new(KubeReader::new(client.clone(), config.volume_snapshot)),
            actions: Arc::new(PodExecRunner::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
            secrets: SecretStore::new(),
            client,
            config,
            health_state,
        }
    }

    /// The cluster pipeline wired to this context's collaborators
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::for_cluster(self.reader.clone(), self.actions.clone(), self.secrets.clone())
    }
}
