use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// No properties arrived within the bound, or no endpoint is eligible.
    #[error("Service unavailable: {service}: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error("Partition access error: {0}")]
    PartitionAccess(String),

    #[error("Coordination service unavailable: {0}")]
    CoordinationTransient(String),

    #[error("Coordination session expired: {0}")]
    CoordinationFatal(String),

    /// A property record failed to parse or validate and was rejected.
    #[error("Inconsistent configuration for {key}: {reason}")]
    ConfigInconsistent { key: String, reason: String },

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Store switch superseded by a newer request")]
    SwitchCancelled,

    #[error("Load balancer is shut down")]
    ShutDown,

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiscoveryError {
    pub fn service_unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        DiscoveryError::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn config_inconsistent(key: impl Into<String>, reason: impl Into<String>) -> Self {
        DiscoveryError::ConfigInconsistent {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Errors recovered internally by falling back to the backup store.
    pub fn is_coordination_failure(&self) -> bool {
        matches!(
            self,
            DiscoveryError::CoordinationTransient(_) | DiscoveryError::CoordinationFatal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
