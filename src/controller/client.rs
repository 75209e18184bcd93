//! Read access to the platform objects a reconcile depends on
//!
//! Stages and the data-clone orchestrator read through [`ClusterReader`] so
//! they can run against an in-memory platform in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Secret};
use kube::api::{DynamicObject, ListParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use crate::controller::error::Result;
use crate::crd::{
    Backup, BackupPolicy, ClusterDefinition, Component, ComponentDefinition, ComponentVersion,
    Restore, ShardingDefinition,
};
use crate::resources::common::{APP_INSTANCE_LABEL, label_selector};

#[async_trait]
pub trait ClusterReader: Send + Sync {
    async fn get_cluster_definition(&self, name: &str) -> Result<Option<ClusterDefinition>>;
    async fn get_component_definition(&self, name: &str) -> Result<Option<ComponentDefinition>>;
    async fn list_component_definitions(&self) -> Result<Vec<ComponentDefinition>>;
    async fn get_sharding_definition(&self, name: &str) -> Result<Option<ShardingDefinition>>;
    async fn list_sharding_definitions(&self) -> Result<Vec<ShardingDefinition>>;
    async fn list_component_versions(&self) -> Result<Vec<ComponentVersion>>;

    /// Components owned by a cluster
    async fn list_components(&self, namespace: &str, cluster: &str) -> Result<Vec<Component>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;
    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>>;
    async fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<Restore>>;
    async fn list_backups(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Backup>>;
    async fn list_restores(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Restore>>;
    async fn list_backup_policies(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<BackupPolicy>>;

    /// Whether the volume behind a claim can be snapshotted
    async fn volume_snapshot_supported(&self, namespace: &str, pvc_name: &str) -> Result<bool>;
}

/// [`ClusterReader`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeReader {
    client: Client,
    volume_snapshot: bool,
}

impl KubeReader {
    pub fn new(client: Client, volume_snapshot: bool) -> Self {
        Self {
            client,
            volume_snapshot,
        }
    }

    async fn get_namespaced<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_cluster_scoped<K>(&self, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = k8s_openapi::ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_cluster_scoped<K>(&self) -> Result<Vec<K>>
    where
        K: Resource<Scope = k8s_openapi::ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_labeled<K>(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&params).await?.items)
    }
}

#[async_trait]
impl ClusterReader for KubeReader {
    async fn get_cluster_definition(&self, name: &str) -> Result<Option<ClusterDefinition>> {
        self.get_cluster_scoped(name).await
    }

    async fn get_component_definition(&self, name: &str) -> Result<Option<ComponentDefinition>> {
        self.get_cluster_scoped(name).await
    }

    async fn list_component_definitions(&self) -> Result<Vec<ComponentDefinition>> {
        self.list_cluster_scoped().await
    }

    async fn get_sharding_definition(&self, name: &str) -> Result<Option<ShardingDefinition>> {
        self.get_cluster_scoped(name).await
    }

    async fn list_sharding_definitions(&self) -> Result<Vec<ShardingDefinition>> {
        self.list_cluster_scoped().await
    }

    async fn list_component_versions(&self) -> Result<Vec<ComponentVersion>> {
        self.list_cluster_scoped().await
    }

    async fn list_components(&self, namespace: &str, cluster: &str) -> Result<Vec<Component>> {
        let labels = BTreeMap::from([(APP_INSTANCE_LABEL.to_string(), cluster.to_string())]);
        self.list_labeled(namespace, &labels).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get_namespaced(namespace, name).await
    }

    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        self.get_namespaced(namespace, name).await
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        self.get_namespaced(namespace, name).await
    }

    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>> {
        self.get_namespaced(namespace, name).await
    }

    async fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<Restore>> {
        self.get_namespaced(namespace, name).await
    }

    async fn list_backups(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Backup>> {
        self.list_labeled(namespace, labels).await
    }

    async fn list_restores(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Restore>> {
        self.list_labeled(namespace, labels).await
    }

    async fn list_backup_policies(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<BackupPolicy>> {
        self.list_labeled(namespace, labels).await
    }

    /// A claim supports snapshots when its volume is provisioned by a CSI
    /// driver that has a VolumeSnapshotClass
    async fn volume_snapshot_supported(&self, namespace: &str, pvc_name: &str) -> Result<bool> {
        if !self.volume_snapshot {
            return Ok(false);
        }
        let Some(pvc) = self.get_namespaced::<PersistentVolumeClaim>(namespace, pvc_name).await? else {
            return Ok(false);
        };
        let Some(volume_name) = pvc.spec.and_then(|s| s.volume_name) else {
            return Ok(false);
        };
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        let Some(driver) = pvs
            .get_opt(&volume_name)
            .await?
            .and_then(|pv| pv.spec)
            .and_then(|s| s.csi)
            .map(|csi| csi.driver)
        else {
            return Ok(false);
        };

        let gvk = GroupVersionKind::gvk("snapshot.storage.k8s.io", "v1", "VolumeSnapshotClass");
        let resource = ApiResource::from_gvk(&gvk);
        let classes: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let found = classes
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .any(|c| c.data.get("driver").and_then(|d| d.as_str()) == Some(driver.as_str()));
        Ok(found)
    }
}
