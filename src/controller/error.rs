//! Error types for the Cluster controller

use std::time::Duration;

use thiserror::Error;

/// Error variants are named with the `Error` suffix where they wrap a failure class
/// (e.g., `KubeError`, `ValidationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// The cluster spec can not be satisfied until it changes
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A referenced definition exists but is not Available yet
    #[error("Referenced {kind} {name} is not available: {reason}")]
    ReferenceNotAvailable {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("Backup policy {policy} has {count} usable backup methods, expected exactly one")]
    AmbiguousBackupMethod { policy: String, count: usize },

    #[error("Lifecycle action {action} failed: {message}")]
    ActionFailed {
        action: &'static str,
        message: String,
    },

    #[error("Lifecycle action {0} is not defined")]
    ActionNotDefined(&'static str),

    #[error("Mutation graph has a cycle through {0}")]
    GraphCycle(String),

    #[error("Permanent error (will not retry): {0}")]
    PermanentError(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::PermanentError(_) => false,
            Error::InvalidConfig(_) => false,
            Error::ValidationError(_) => false,
            Error::AmbiguousBackupMethod { .. } => false,
            Error::GraphCycle(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
            Error::ActionNotDefined(_) => false,
            // References and actions can recover on their own
            Error::ReferenceNotAvailable { .. } => true,
            Error::ActionFailed { .. } => true,
            Error::NotFound(_) => true,
            Error::FinalizerError(_) => true,
        }
    }

    /// Check if this error means the object being reconciled is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            Error::NotFound(_) => true,
            _ => false,
        }
    }

    /// Check if this error is an optimistic-concurrency conflict on write
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(api_err)) if api_err.code == 409)
    }

    /// Short machine-friendly reason used in conditions and events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "ApiError",
            Error::SerializationError(_) => "SerializationError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::NotFound(_) => "NotFound",
            Error::FinalizerError(_) => "FinalizerError",
            Error::ValidationError(_) => "ValidationFailed",
            Error::ReferenceNotAvailable { .. } => "ReferenceNotAvailable",
            Error::AmbiguousBackupMethod { .. } => "AmbiguousBackupMethod",
            Error::ActionFailed { .. } => "ActionFailed",
            Error::ActionNotDefined(_) => "ActionNotDefined",
            Error::GraphCycle(_) => "GraphCycle",
            Error::PermanentError(_) => "PermanentError",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Backoff used between attempts of a single conflicting write
    pub fn for_conflicts() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Permanent errors wait for a spec change; the long delay only bounds drift
            self.max_delay
        }
    }
}
