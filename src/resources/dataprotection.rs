//! Objects created while cloning data into new replicas

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{
    Backup, BackupSpec, Cluster, PrepareDataConfig, Restore, RestoreBackupRef, RestoreSpec,
    RestoreVolumeClaim, VolumeClaimTemplate,
};
use crate::resources::common::{
    VOLUME_CLAIM_TEMPLATE_LABEL, component_labels, data_clone_labels, owner_reference,
};

/// Name of the backup used to seed new replicas of a component
pub fn backup_name(cluster_name: &str, comp_name: &str) -> String {
    format!("{cluster_name}-{comp_name}-scaling")
}

/// Name of the restore preparing data for one replica
///
/// The replica is identified by its name suffix after the workload name, so
/// that ordinal and instance-template replicas both get distinct names.
pub fn restore_name(backup_name: &str, workload: &str, replica: &str) -> String {
    let suffix = replica
        .strip_prefix(workload)
        .map(|s| s.trim_start_matches('-'))
        .filter(|s| !s.is_empty())
        .unwrap_or(replica);
    format!("{backup_name}-{suffix}")
}

fn meta(cluster: &Cluster, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: cluster.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}

pub fn build_backup(
    cluster: &Cluster,
    comp_name: &str,
    name: &str,
    policy_name: &str,
    method: &str,
) -> Backup {
    let labels = data_clone_labels(&cluster.name_any(), comp_name);
    Backup {
        metadata: meta(cluster, name, labels),
        spec: BackupSpec {
            backup_policy_name: policy_name.to_string(),
            backup_method: method.to_string(),
        },
        status: None,
    }
}

/// Build a restore that creates and fills the given claims before the replica starts
pub fn build_restore(
    cluster: &Cluster,
    comp_name: &str,
    name: &str,
    backup_name: &str,
    volume_claims: Vec<RestoreVolumeClaim>,
) -> Restore {
    let labels = data_clone_labels(&cluster.name_any(), comp_name);
    Restore {
        metadata: meta(cluster, name, labels),
        spec: RestoreSpec {
            backup: RestoreBackupRef {
                name: backup_name.to_string(),
                namespace: cluster.namespace().unwrap_or_default(),
            },
            prepare_data_config: Some(PrepareDataConfig { volume_claims }),
        },
        status: None,
    }
}

pub fn restore_volume_claim(vct: &VolumeClaimTemplate, pvc_name: &str) -> RestoreVolumeClaim {
    RestoreVolumeClaim {
        name: pvc_name.to_string(),
        volume_source: vct.name.clone(),
        storage: vct.storage.clone(),
        storage_class_name: vct.storage_class_name.clone(),
    }
}

/// Build an empty claim for a replica
pub fn build_pvc(
    cluster: &Cluster,
    comp_name: &str,
    vct: &VolumeClaimTemplate,
    pvc_name: &str,
) -> PersistentVolumeClaim {
    let mut labels = component_labels(&cluster.name_any(), comp_name);
    labels.insert(VOLUME_CLAIM_TEMPLATE_LABEL.to_string(), vct.name.clone());

    let access_modes = if vct.access_modes.is_empty() {
        vec!["ReadWriteOnce".to_string()]
    } else {
        vct.access_modes.clone()
    };

    PersistentVolumeClaim {
        metadata: meta(cluster, pvc_name, labels),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes),
            storage_class_name: vct.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(vct.storage.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}
