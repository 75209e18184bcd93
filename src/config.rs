//! Operator configuration read from the process environment

use std::time::Duration;

use tracing::warn;

use crate::controller::error::{Error, Result};

/// Runtime configuration of the operator
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Leader election identity
    pub pod_name: String,
    /// Namespace holding the leader election lease
    pub pod_namespace: String,
    /// Only watch clusters in this namespace when set
    pub watch_namespace: Option<String>,
    /// The platform supports volume snapshots
    pub volume_snapshot: bool,
    pub health_port: u16,
    /// Requeue interval once a cluster is reconciled
    pub requeue_interval: Duration,
    /// Requeue interval while a data clone is waiting on backups or restores
    pub data_clone_requeue: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            pod_name: "unknown".to_string(),
            pod_namespace: "default".to_string(),
            watch_namespace: None,
            volume_snapshot: false,
            health_port: 8080,
            requeue_interval: Duration::from_secs(30),
            data_clone_requeue: Duration::from_secs(5),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let pod_name = lookup("POD_NAME").unwrap_or_else(|| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| defaults.pod_name.clone())
        });
        let pod_namespace = lookup("POD_NAMESPACE").unwrap_or_else(|| {
            warn!("POD_NAMESPACE not set, using 'default'");
            defaults.pod_namespace.clone()
        });
        let watch_namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());

        let volume_snapshot = match lookup("VOLUMESNAPSHOT") {
            Some(v) => parse_bool("VOLUMESNAPSHOT", &v)?,
            None => defaults.volume_snapshot,
        };
        let health_port = match lookup("HEALTH_PORT") {
            Some(v) => v
                .parse::<u16>()
                .map_err(|e| Error::InvalidConfig(format!("HEALTH_PORT={v}: {e}")))?,
            None => defaults.health_port,
        };
        let requeue_interval = match lookup("REQUEUE_INTERVAL_SECS") {
            Some(v) => parse_secs("REQUEUE_INTERVAL_SECS", &v)?,
            None => defaults.requeue_interval,
        };
        let data_clone_requeue = match lookup("DATA_CLONE_REQUEUE_SECS") {
            Some(v) => parse_secs("DATA_CLONE_REQUEUE_SECS", &v)?,
            None => defaults.data_clone_requeue,
        };

        Ok(Self {
            pod_name,
            pod_namespace,
            watch_namespace,
            volume_snapshot,
            health_port,
            requeue_interval,
            data_clone_requeue,
        })
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(Error::InvalidConfig(format!("{key}={value}: expected a boolean"))),
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    let secs = value
        .parse::<u64>()
        .map_err(|e| Error::InvalidConfig(format!("{key}={value}: {e}")))?;
    if secs == 0 {
        return Err(Error::InvalidConfig(format!("{key} must be positive")));
    }
    Ok(Duration::from_secs(secs))
}
