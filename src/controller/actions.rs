//! Lifecycle actions executed inside component replicas

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{AttachParams, ListParams};
use kube::{Api, Client, ResourceExt};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::ExecAction;
use crate::resources::common::{component_labels, label_selector};

const ACCOUNT_PROVISION: &str = "accountProvision";

/// Where to run an action
#[derive(Debug, Clone)]
pub struct ActionTarget {
    pub namespace: String,
    pub cluster: String,
    pub component: String,
    pub action: ExecAction,
}

/// Account statement to execute, with the credentials it refers to
#[derive(Debug, Clone, PartialEq)]
pub struct AccountStatement {
    pub account: String,
    pub password: String,
    pub statement: String,
}

#[async_trait]
pub trait LifecycleActionRunner: Send + Sync {
    async fn account_provision(&self, target: &ActionTarget, statement: &AccountStatement) -> Result<()>;
}

/// Runs actions by exec-ing the action command in a ready replica
///
/// The statement and credentials are passed as environment variables through
/// `env`, so no shell quoting is involved.
pub struct PodExecRunner {
    client: Client,
}

impl PodExecRunner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn find_ready_pod(&self, target: &ActionTarget) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let selector = label_selector(&component_labels(&target.cluster, &target.component));
        let pod_list = pods.list(&ListParams::default().labels(&selector)).await?;

        pod_list
            .items
            .iter()
            .find(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .is_some_and(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            })
            .map(|pod| pod.name_any())
            .ok_or_else(|| Error::ActionFailed {
                action: ACCOUNT_PROVISION,
                message: format!("no ready pod in component {}", target.component),
            })
    }
}

#[async_trait]
impl LifecycleActionRunner for PodExecRunner {
    async fn account_provision(&self, target: &ActionTarget, statement: &AccountStatement) -> Result<()> {
        if target.action.command.is_empty() {
            return Err(Error::ActionNotDefined(ACCOUNT_PROVISION));
        }
        let pod_name = self.find_ready_pod(target).await?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);

        let mut command = vec![
            "env".to_string(),
            format!("DBC_ACCOUNT_NAME={}", statement.account),
            format!("DBC_ACCOUNT_PASSWORD={}", statement.password),
            format!("DBC_ACCOUNT_STATEMENT={}", statement.statement),
        ];
        command.extend(target.action.command.iter().cloned());

        let attach_params = AttachParams {
            container: target.action.container.clone(),
            stdin: false,
            stdout: false,
            stderr: true,
            tty: false,
            ..Default::default()
        };
        let mut attached = pods.exec(&pod_name, command, &attach_params).await?;

        let mut stderr = String::new();
        if let Some(mut reader) = attached.stderr() {
            reader
                .read_to_string(&mut stderr)
                .await
                .map_err(|e| Error::ActionFailed {
                    action: ACCOUNT_PROVISION,
                    message: format!("failed to read stderr: {e}"),
                })?;
        }

        if let Some(status_channel) = attached.take_status()
            && let Some(result) = status_channel.await
            && let Some(status) = result.status
            && status != "Success"
        {
            debug!(pod = %pod_name, account = %statement.account, status, "Account provision exited with failure");
            return Err(Error::ActionFailed {
                action: ACCOUNT_PROVISION,
                message: if stderr.is_empty() {
                    result.message.unwrap_or(status)
                } else {
                    stderr.trim().to_string()
                },
            });
        }
        Ok(())
    }
}
