//! Account provisioning stage
//!
//! Creates, updates and deletes the system accounts of running components by
//! executing the component definition's account-provision action. The set of
//! provisioned accounts is recorded on the Component's
//! `SystemAccountProvision` condition as `name:passwordHash` tokens, so a
//! password change is detected without reading it back from the engine.
//!
//! Failures for one account do not stop the others; the first error is
//! reported once every component has been handled.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::{StageError, StageResult, TransformContext, TransformDelta, Transformer};
use crate::controller::actions::{AccountStatement, ActionTarget, LifecycleActionRunner};
use crate::controller::client::ClusterReader;
use crate::controller::error::{Error, Result};
use crate::controller::events::{PendingEvent, actions, reasons};
use crate::controller::status::{
    condition_changed, condition_types, find_condition, system_account_provision, upsert_condition,
};
use crate::controller::store::{SecretKey, SecretStore};
use crate::crd::{
    ClusterComponentSpec, Component, ComponentDefinition, ComponentPhase, ComponentStatus,
    ExecAction, SystemAccount,
};
use crate::graph::{MutationGraph, ObjectKey, Vertex};
use crate::resources::common::{RESTORE_FROM_BACKUP_ANNOTATION, account_secret_name};
use crate::resources::secret::{PASSWORD_KEY, generate_account_secret, generate_password, secret_value};

/// Encode provisioned accounts as comma-separated `name:hash` tokens
pub fn encode_accounts(accounts: &BTreeMap<String, String>) -> String {
    accounts
        .iter()
        .map(|(name, hash)| format!("{name}:{hash}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode a provisioned-account record; tokens without a hash decode to an empty hash
pub fn decode_accounts(message: &str) -> BTreeMap<String, String> {
    message
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| match token.split_once(':') {
            Some((name, hash)) => (name.to_string(), hash.to_string()),
            None => (token.to_string(), String::new()),
        })
        .collect()
}

/// Accounts to create, delete, or check for a password change
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AccountDiff {
    pub create: BTreeSet<String>,
    pub delete: BTreeSet<String>,
    /// Desired and already provisioned
    pub both: BTreeSet<String>,
}

impl AccountDiff {
    pub fn is_settled(&self) -> bool {
        self.create.is_empty() && self.delete.is_empty()
    }
}

pub fn diff_accounts(desired: &BTreeSet<String>, provisioned: &BTreeMap<String, String>) -> AccountDiff {
    let provisioned_names: BTreeSet<String> = provisioned.keys().cloned().collect();
    AccountDiff {
        create: desired.difference(&provisioned_names).cloned().collect(),
        delete: provisioned_names.difference(desired).cloned().collect(),
        both: desired.intersection(&provisioned_names).cloned().collect(),
    }
}

/// Accounts of a definition that the component spec does not disable
pub fn desired_accounts<'a>(
    comp_def: &'a ComponentDefinition,
    spec: &ClusterComponentSpec,
) -> BTreeMap<String, &'a SystemAccount> {
    comp_def
        .spec
        .system_accounts
        .iter()
        .filter(|account| {
            !spec
                .system_accounts
                .iter()
                .any(|o| o.name == account.name && o.disabled == Some(true))
        })
        .map(|account| (account.name.clone(), account))
        .collect()
}

fn password_hash(password: &str) -> String {
    sha256::digest(password)
}

/// Whether the restore annotation lists this component
///
/// Read from the cluster as observed: the status stage drops the annotation
/// from the working copy once the cluster reaches a terminal phase.
fn is_restoring(ctx: &TransformContext, comp_name: &str) -> bool {
    ctx.orig_cluster
        .annotations()
        .get(RESTORE_FROM_BACKUP_ANNOTATION)
        .is_some_and(|value| {
            serde_json::from_str::<BTreeMap<String, serde_json::Value>>(value)
                .is_ok_and(|comps| comps.contains_key(comp_name))
        })
}

pub struct AccountProvisionTransformer {
    reader: Arc<dyn ClusterReader>,
    actions: Arc<dyn LifecycleActionRunner>,
    secrets: SecretStore,
}

/// Per-component inputs of one provisioning pass
struct ComponentAccounts<'a> {
    spec: &'a ClusterComponentSpec,
    comp_def: &'a ComponentDefinition,
    component: &'a Component,
    target: ActionTarget,
}

impl AccountProvisionTransformer {
    pub fn new(
        reader: Arc<dyn ClusterReader>,
        actions: Arc<dyn LifecycleActionRunner>,
        secrets: SecretStore,
    ) -> Self {
        Self {
            reader,
            actions,
            secrets,
        }
    }

    /// Password of an account, from (in order) the referenced secret, the
    /// persisted account secret, the store, or freshly generated
    async fn password(
        &self,
        ctx: &TransformContext,
        comp: &ComponentAccounts<'_>,
        account: &SystemAccount,
        delta: &mut TransformDelta,
    ) -> Result<String> {
        let namespace = ctx.namespace();
        let cluster_name = ctx.cluster_name();
        let comp_name = &comp.spec.name;
        let account_override = comp.spec.system_accounts.iter().find(|o| o.name == account.name);

        if let Some(secret_ref) = account_override.and_then(|o| o.secret_ref.as_ref()) {
            let secret_ns = secret_ref.namespace.clone().unwrap_or_else(|| namespace.clone());
            let secret = self
                .reader
                .get_secret(&secret_ns, &secret_ref.name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Secret {secret_ns}/{}", secret_ref.name)))?;
            return secret_value(&secret, &secret_ref.password_key).ok_or_else(|| {
                Error::ValidationError(format!(
                    "secret {} has no key {}",
                    secret_ref.name, secret_ref.password_key
                ))
            });
        }

        let key = SecretKey::new(&namespace, &cluster_name, comp_name, &account.name);
        let secret_name = account_secret_name(&cluster_name, comp_name, &account.name);
        if let Some(secret) = self.reader.get_secret(&namespace, &secret_name).await?
            && let Some(password) = secret_value(&secret, PASSWORD_KEY)
        {
            self.secrets.delete(&key).await;
            return Ok(password);
        }

        let secret = match self.secrets.get(&key).await {
            Some(secret) => secret,
            None => {
                let config = account_override
                    .and_then(|o| o.password_config.as_ref())
                    .unwrap_or(&account.password_generation_policy);
                let password = generate_password(config);
                let secret = generate_account_secret(&ctx.cluster, comp_name, &account.name, &password);
                debug!(component = %comp_name, account = %account.name, "Generated account password");
                self.secrets.put(key, secret.clone()).await;
                secret
            }
        };
        // Persisted by the executor; the store keeps it until it is visible
        delta.vertices.push(Vertex::create(&secret)?);
        secret_value(&secret, PASSWORD_KEY)
            .ok_or_else(|| Error::PermanentError(format!("stored secret {secret_name} has no password")))
    }

    async fn run_statement(
        &self,
        comp: &ComponentAccounts<'_>,
        account: &str,
        password: &str,
        statement: Option<&String>,
        kind: &str,
    ) -> Result<()> {
        let statement = statement.filter(|s| !s.is_empty()).ok_or_else(|| {
            Error::ValidationError(format!(
                "account {account} of component {} has no {kind} statement",
                comp.spec.name
            ))
        })?;
        self.actions
            .account_provision(
                &comp.target,
                &AccountStatement {
                    account: account.to_string(),
                    password: password.to_string(),
                    statement: statement.clone(),
                },
            )
            .await
    }

    /// Reconcile the accounts of one component; returns the first error
    async fn provision(
        &self,
        ctx: &TransformContext,
        comp: &ComponentAccounts<'_>,
        delta: &mut TransformDelta,
    ) -> Option<Error> {
        let desired = desired_accounts(comp.comp_def, comp.spec);
        let existing = find_condition(comp.component.conditions(), condition_types::SYSTEM_ACCOUNT_PROVISION);
        let provisioned = existing.map(|c| decode_accounts(&c.message)).unwrap_or_default();
        let desired_names: BTreeSet<String> = desired.keys().cloned().collect();
        let diff = diff_accounts(&desired_names, &provisioned);

        let mut first_error = None;
        let mut record = |error: Error, account: &str, delta: &mut TransformDelta| {
            warn!(component = %comp.spec.name, account, error = %error, "Account provisioning failed");
            delta.events.push(PendingEvent::warning(
                reasons::ACCOUNT_PROVISION_FAILED,
                actions::PROVISION,
                format!("account {account} of component {}: {error}", comp.spec.name),
            ));
            first_error.get_or_insert(error);
        };

        let mut result = provisioned.clone();
        let restoring = is_restoring(ctx, &comp.spec.name);
        let secrets_from = delta.vertices.len();

        for name in &diff.create {
            if restoring {
                debug!(component = %comp.spec.name, account = %name, "Skipping account creation while restoring");
                continue;
            }
            let Some(account) = desired.get(name) else { continue };
            let password = match self.password(ctx, comp, account, delta).await {
                Ok(password) => password,
                Err(e) => {
                    record(e, name, delta);
                    continue;
                }
            };
            if !account.init_account {
                let create = account.statement.as_ref().and_then(|s| s.create.as_ref());
                if let Err(e) = self.run_statement(comp, name, &password, create, "create").await {
                    record(e, name, delta);
                    continue;
                }
                info!(component = %comp.spec.name, account = %name, "Account created");
            }
            result.insert(name.clone(), password_hash(&password));
        }

        for name in &diff.delete {
            let delete = comp
                .comp_def
                .system_account(name)
                .and_then(|a| a.statement.as_ref())
                .and_then(|s| s.delete.as_ref());
            if let Err(e) = self.run_statement(comp, name, "", delete, "delete").await {
                record(e, name, delta);
                continue;
            }
            info!(component = %comp.spec.name, account = %name, "Account deleted");
            result.remove(name);
        }

        for name in &diff.both {
            let Some(account) = desired.get(name) else { continue };
            let password = match self.password(ctx, comp, account, delta).await {
                Ok(password) => password,
                Err(e) => {
                    record(e, name, delta);
                    continue;
                }
            };
            let hash = password_hash(&password);
            if provisioned.get(name) == Some(&hash) {
                continue;
            }
            let update = account.statement.as_ref().and_then(|s| s.update.as_ref());
            if let Err(e) = self.run_statement(comp, name, &password, update, "update").await {
                record(e, name, delta);
                continue;
            }
            info!(component = %comp.spec.name, account = %name, "Account password updated");
            result.insert(name.clone(), hash);
        }

        let settled = diff_accounts(&desired_names, &result).is_settled();
        let condition = system_account_provision(
            comp.component.metadata.generation,
            &encode_accounts(&result),
            settled,
        );
        let status_unchanged = existing.is_some_and(|c| c.status == condition.status);
        if condition_changed(comp.component.conditions(), &condition) || !status_unchanged {
            let mut updated = comp.component.clone();
            let status = updated.status.get_or_insert_with(ComponentStatus::default);
            upsert_condition(&mut status.conditions, condition);
            match Vertex::status(&updated) {
                Ok(vertex) => {
                    delta.edges.push((ObjectKey::of(comp.component), vertex.key.clone()));
                    // Credentials land before the record that refers to them
                    let secret_edges: Vec<_> = secret_keys(delta.vertices.iter().skip(secrets_from))
                        .map(|key| (key, vertex.key.clone()))
                        .collect();
                    delta.edges.extend(secret_edges);
                    delta.vertices.push(vertex);
                }
                Err(e) => record(e, "*", delta),
            }
        }
        first_error
    }
}

#[async_trait]
impl Transformer for AccountProvisionTransformer {
    fn name(&self) -> &'static str {
        "account-provision"
    }

    /// Accounts provisioned before a failure must be recorded, or the next
    /// reconcile would run their statements again
    fn defers_errors(&self) -> bool {
        true
    }

    async fn transform(&self, ctx: &TransformContext, graph: &MutationGraph) -> StageResult {
        let mut delta = TransformDelta::new();
        let mut first_error = None;

        for spec in ctx.all_components() {
            let Some(comp_def) = ctx.component_defs.get(&spec.name) else {
                continue;
            };
            let Some(action) = comp_def.account_provision_action() else {
                continue;
            };
            let Some(component) = ctx.observed_components.get(&spec.name) else {
                continue;
            };
            if component.phase() != Some(ComponentPhase::Running) {
                continue;
            }

            let comp = ComponentAccounts {
                spec,
                comp_def,
                component,
                target: target(ctx, &spec.name, action),
            };
            if let Some(error) = self.provision(ctx, &comp, &mut delta).await {
                first_error.get_or_insert(error);
            }
        }

        if let Some(root) = graph.root().map(|r| r.key.clone()) {
            let root_edges: Vec<_> = secret_keys(delta.vertices.iter())
                .map(|key| (key, root.clone()))
                .collect();
            delta.edges.extend(root_edges);
        }

        match first_error {
            None => Ok(delta),
            Some(error) => Err(StageError { error, partial: delta }),
        }
    }
}

fn secret_keys<'a>(vertices: impl Iterator<Item = &'a Vertex>) -> impl Iterator<Item = ObjectKey> {
    vertices
        .filter(|v| v.key.kind == <Secret as k8s_openapi::Resource>::KIND)
        .map(|v| v.key.clone())
}

fn target(ctx: &TransformContext, comp_name: &str, action: &ExecAction) -> ActionTarget {
    ActionTarget {
        namespace: ctx.namespace(),
        cluster: ctx.cluster_name(),
        component: comp_name.to_string(),
        action: action.clone(),
    }
}
