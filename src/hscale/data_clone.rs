//! Data-clone strategies for new replicas

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::ScaleTarget;
use crate::controller::client::ClusterReader;
use crate::controller::error::{Error, Result};
use crate::controller::events::{PendingEvent, actions, reasons};
use crate::crd::{BackupPhase, BackupPolicy, RestorePhase, VolumeClaimTemplate};
use crate::graph::Vertex;
use crate::resources::common::{APP_INSTANCE_LABEL, BACKUP_POLICY_TEMPLATE_ANNOTATION, COMP_DEF_LABEL};
use crate::resources::dataprotection::{build_backup, build_pvc, build_restore, restore_volume_claim};

/// Progress of the backup seeding new replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    NotCreated,
    Processing,
    ReadyToUse,
    Failed,
}

/// Progress of the restore preparing one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    NotCreated,
    Processing,
    Completed,
    Failed,
}

/// How a component gives data to its new replicas
#[async_trait]
pub trait DataClone: Send + Sync {
    /// Whether every new replica has its data; never moves backwards for a
    /// fixed observed state
    async fn succeed(&self, events: &mut Vec<PendingEvent>) -> Result<bool>;

    /// Objects to create to move the clone forward
    async fn clone_data(&self, events: &mut Vec<PendingEvent>) -> Result<Vec<Vertex>>;

    /// Temporary objects to delete once the scale-out is done
    async fn clear_tmp_resources(&self, events: &mut Vec<PendingEvent>) -> Result<Vec<Vertex>>;
}

fn no_templates_event() -> PendingEvent {
    PendingEvent::normal(
        reasons::HORIZONTAL_SCALE,
        actions::SCALE,
        "no VolumeClaimTemplates, no need to do data clone.",
    )
}

/// Shared PVC helpers
struct Claims<'a> {
    reader: &'a dyn ClusterReader,
    target: &'a ScaleTarget,
}

impl Claims<'_> {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.reader.get_pvc(&self.target.namespace(), name).await?.is_some())
    }

    /// Whether every template has a claim for every new replica
    async fn all_exist(&self) -> Result<bool> {
        for replica in self.target.new_replicas() {
            for vct in &self.target.spec.volume_claim_templates {
                if !self.exists(&self.target.pvc_name(vct, &replica)).await? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Empty claims for new replicas that have none yet
    async fn create_missing<'v>(&self, vcts: impl IntoIterator<Item = &'v VolumeClaimTemplate>) -> Result<Vec<Vertex>> {
        let vcts: Vec<&VolumeClaimTemplate> = vcts.into_iter().collect();
        let mut vertices = Vec::new();
        for replica in self.target.new_replicas() {
            for vct in &vcts {
                let name = self.target.pvc_name(vct, &replica);
                if self.exists(&name).await? {
                    continue;
                }
                let pvc = build_pvc(&self.target.cluster, &self.target.spec.name, vct, &name);
                vertices.push(Vertex::create(&pvc)?);
            }
        }
        Ok(vertices)
    }

    /// Whether every replica's claim of every template is bound
    async fn all_bound(&self) -> Result<bool> {
        for replica in self.target.all_replicas() {
            for vct in &self.target.spec.volume_claim_templates {
                let name = self.target.pvc_name(vct, &replica);
                let bound = self
                    .reader
                    .get_pvc(&self.target.namespace(), &name)
                    .await?
                    .and_then(|pvc| pvc.status)
                    .and_then(|s| s.phase)
                    .is_some_and(|phase| phase == "Bound");
                if !bound {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// New replicas start with empty volumes
pub struct NoPolicyDataClone {
    reader: Arc<dyn ClusterReader>,
    target: ScaleTarget,
}

impl NoPolicyDataClone {
    pub fn new(reader: Arc<dyn ClusterReader>, target: ScaleTarget) -> Self {
        Self { reader, target }
    }

    fn claims(&self) -> Claims<'_> {
        Claims {
            reader: self.reader.as_ref(),
            target: &self.target,
        }
    }
}

#[async_trait]
impl DataClone for NoPolicyDataClone {
    async fn succeed(&self, events: &mut Vec<PendingEvent>) -> Result<bool> {
        if self.target.spec.volume_claim_templates.is_empty() {
            events.push(no_templates_event());
            return Ok(true);
        }
        self.claims().all_exist().await
    }

    async fn clone_data(&self, _events: &mut Vec<PendingEvent>) -> Result<Vec<Vertex>> {
        self.claims()
            .create_missing(&self.target.spec.volume_claim_templates)
            .await
    }

    async fn clear_tmp_resources(&self, _events: &mut Vec<PendingEvent>) -> Result<Vec<Vertex>> {
        Ok(Vec::new())
    }
}

/// New replicas are restored from a backup of the component
pub struct BackupDataClone {
    reader: Arc<dyn ClusterReader>,
    target: ScaleTarget,
}

impl BackupDataClone {
    pub fn new(reader: Arc<dyn ClusterReader>, target: ScaleTarget) -> Self {
        Self { reader, target }
    }

    fn claims(&self) -> Claims<'_> {
        Claims {
            reader: self.reader.as_ref(),
            target: &self.target,
        }
    }

    pub async fn backup_state(&self) -> Result<BackupState> {
        let Some(backup) = self
            .reader
            .get_backup(&self.target.namespace(), &self.target.backup_name())
            .await?
        else {
            return Ok(BackupState::NotCreated);
        };
        Ok(match backup.phase() {
            Some(BackupPhase::Completed) => BackupState::ReadyToUse,
            Some(BackupPhase::Failed) => BackupState::Failed,
            _ => BackupState::Processing,
        })
    }

    pub async fn restore_state(&self, replica: &str) -> Result<RestoreState> {
        let restore = self
            .reader
            .get_restore(&self.target.namespace(), &self.target.restore_name(replica))
            .await?;
        Ok(match restore {
            None => RestoreState::NotCreated,
            Some(restore) => match restore.phase() {
                Some(RestorePhase::Completed) => RestoreState::Completed,
                Some(RestorePhase::Failed) => RestoreState::Failed,
                _ => RestoreState::Processing,
            },
        })
    }

    /// The backup policy generated for this component from the scale policy's template
    async fn backup_policy(&self) -> Result<BackupPolicy> {
        let template = self
            .target
            .comp_def
            .spec
            .horizontal_scale_policy
            .as_ref()
            .and_then(|p| p.backup_policy_template_name.clone())
            .unwrap_or_default();
        let labels = [
            (APP_INSTANCE_LABEL.to_string(), self.target.cluster.name_any()),
            (COMP_DEF_LABEL.to_string(), self.target.comp_def.name_any()),
        ]
        .into_iter()
        .collect();
        self.reader
            .list_backup_policies(&self.target.namespace(), &labels)
            .await?
            .into_iter()
            .find(|policy| {
                template.is_empty()
                    || policy.annotations().get(BACKUP_POLICY_TEMPLATE_ANNOTATION) == Some(&template)
            })
            .ok_or_else(|| Error::NotFound(format!("backup policy created from template {template:?}")))
    }

    /// Pick the single usable backup method; snapshot methods win when the
    /// source volume supports snapshots
    async fn backup_method(&self, policy: &BackupPolicy, events: &mut Vec<PendingEvent>) -> Result<String> {
        let snapshot_supported = match self.target.backup_vct() {
            Some(vct) => {
                let source = self.target.pvc_name(vct, &self.target.replica(0));
                self.reader
                    .volume_snapshot_supported(&self.target.namespace(), &source)
                    .await?
            }
            None => false,
        };
        let candidates: Vec<&str> = policy
            .spec
            .backup_methods
            .iter()
            .filter(|m| m.is_snapshot() == snapshot_supported)
            .map(|m| m.name.as_str())
            .collect();

        match candidates.as_slice() {
            [method] => Ok(method.to_string()),
            _ => {
                let error = Error::AmbiguousBackupMethod {
                    policy: policy.name_any(),
                    count: candidates.len(),
                };
                events.push(PendingEvent::warning(
                    reasons::BACKUP_METHOD_AMBIGUOUS,
                    actions::SCALE,
                    error.to_string(),
                ));
                Err(error)
            }
        }
    }

    async fn backup(&self, events: &mut Vec<PendingEvent>) -> Result<Vec<Vertex>> {
        let policy = self.backup_policy().await?;
        let method = self.backup_method(&policy, events).await?;
        let name = self.target.backup_name();
        let backup = build_backup(
            &self.target.cluster,
            &self.target.spec.name,
            &name,
            &policy.name_any(),
            &method,
        );
        info!(backup = %name, method = %method, "Creating backup for horizontal scaling");
        events.push(PendingEvent::normal(
            reasons::BACKUP_CREATED,
            actions::SCALE,
            format!("Create backup {name} for component {}", self.target.spec.name),
        ));
        Ok(vec![Vertex::create(&backup)?])
    }

    fn restore(&self, replica: &str) -> Result<Vertex> {
        let vct = self
            .target
            .backup_vct()
            .ok_or_else(|| Error::PermanentError("no volume claim template to restore".to_string()))?;
        let claim = restore_volume_claim(vct, &self.target.pvc_name(vct, replica));
        let restore = build_restore(
            &self.target.cluster,
            &self.target.spec.name,
            &self.target.restore_name(replica),
            &self.target.backup_name(),
            vec![claim],
        );
        Vertex::create(&restore)
    }
}

#[async_trait]
impl DataClone for BackupDataClone {
    async fn succeed(&self, events: &mut Vec<PendingEvent>) -> Result<bool> {
        if self.target.spec.volume_claim_templates.is_empty() {
            events.push(no_templates_event());
            return Ok(true);
        }
        if !self.claims().all_exist().await? {
            return Ok(false);
        }
        for replica in self.target.new_replicas() {
            if self.restore_state(&replica).await? != RestoreState::Completed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn clone_data(&self, events: &mut Vec<PendingEvent>) -> Result<Vec<Vertex>> {
        match self.backup_state().await? {
            BackupState::NotCreated => return self.backup(events).await,
            BackupState::Processing => return Ok(Vec::new()),
            BackupState::Failed => {
                warn!(backup = %self.target.backup_name(), "Backup for horizontal scaling failed");
                events.push(PendingEvent::warning(
                    reasons::BACKUP_FAILED,
                    actions::SCALE,
                    format!("backup {} for horizontal scaling failed", self.target.backup_name()),
                ));
                return Ok(Vec::new());
            }
            BackupState::ReadyToUse => {}
        }

        let mut vertices = Vec::new();
        for replica in self.target.new_replicas() {
            match self.restore_state(&replica).await? {
                RestoreState::NotCreated => {
                    debug!(replica = %replica, "Creating restore for new replica");
                    events.push(PendingEvent::normal(
                        reasons::RESTORE_CREATED,
                        actions::SCALE,
                        format!("Create restore {}", self.target.restore_name(&replica)),
                    ));
                    vertices.push(self.restore(&replica)?);
                }
                RestoreState::Processing | RestoreState::Completed => {}
                RestoreState::Failed => {
                    // Waited on like a running restore; completion never sees it done
                    warn!(restore = %self.target.restore_name(&replica), "Restore for new replica failed");
                    events.push(PendingEvent::warning(
                        reasons::RESTORE_FAILED,
                        actions::SCALE,
                        format!("restore {} for horizontal scaling failed", self.target.restore_name(&replica)),
                    ));
                }
            }
        }

        let backup_vct = self.target.backup_vct().map(|v| v.name.as_str());
        let others = self
            .target
            .spec
            .volume_claim_templates
            .iter()
            .filter(|vct| Some(vct.name.as_str()) != backup_vct);
        vertices.extend(self.claims().create_missing(others).await?);
        Ok(vertices)
    }

    async fn clear_tmp_resources(&self, _events: &mut Vec<PendingEvent>) -> Result<Vec<Vertex>> {
        if !self.claims().all_bound().await? {
            return Ok(Vec::new());
        }
        let namespace = self.target.namespace();
        let labels = self.target.data_clone_labels();
        let mut vertices = Vec::new();
        for backup in self.reader.list_backups(&namespace, &labels).await? {
            vertices.push(Vertex::delete(&backup)?);
        }
        for restore in self.reader.list_restores(&namespace, &labels).await? {
            vertices.push(Vertex::delete(&restore)?);
        }
        if !vertices.is_empty() {
            debug!(component = %self.target.spec.name, count = vertices.len(), "Removing data clone objects");
        }
        Ok(vertices)
    }
}
