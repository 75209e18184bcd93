//! Store for generated account secrets that are not persisted yet
//!
//! A generated password must survive until the secret holding it is visible
//! through the API, otherwise a retried reconcile would generate a different
//! one. The store is owned by the controller context and shared by all
//! reconciles.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use tokio::sync::RwLock;

/// Identity of a stored secret
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SecretKey {
    pub namespace: String,
    pub cluster: String,
    pub component: String,
    pub account: String,
}

impl SecretKey {
    pub fn new(namespace: &str, cluster: &str, component: &str, account: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            component: component.to_string(),
            account: account.to_string(),
        }
    }
}

#[derive(Clone, Default)]
pub struct SecretStore {
    inner: Arc<RwLock<BTreeMap<SecretKey, Secret>>>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &SecretKey) -> Option<Secret> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn put(&self, key: SecretKey, secret: Secret) {
        self.inner.write().await.insert(key, secret);
    }

    pub async fn delete(&self, key: &SecretKey) -> Option<Secret> {
        self.inner.write().await.remove(key)
    }

    /// Secrets held for one cluster
    pub async fn list(&self, namespace: &str, cluster: &str) -> Vec<(SecretKey, Secret)> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.namespace == namespace && k.cluster == cluster)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Drop everything held for a cluster, used once it is deleted
    pub async fn delete_cluster(&self, namespace: &str, cluster: &str) {
        self.inner
            .write()
            .await
            .retain(|k, _| !(k.namespace == namespace && k.cluster == cluster));
    }
}
