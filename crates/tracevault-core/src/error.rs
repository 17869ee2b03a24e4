use thiserror::Error;

use crate::model::Tier;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("failed to start collector: {0}")]
    StartFailed(String),
    #[error("failed to stop collector: {0}")]
    StopFailed(String),
}

/// Durable registry/policy persistence failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open storage: {0}")]
    Open(String),
    #[error("failed to write: {0}")]
    Write(String),
    #[error("failed to read: {0}")]
    Read(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Failures reported by a single storage backend.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Retryable backend failure; counts toward the provider's failover threshold.
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("tier {0} not supported by provider")]
    UnsupportedTier(Tier),
}

impl ProviderError {
    /// Whether this failure is attributable to the provider itself rather than
    /// to the request.
    pub fn is_provider_fault(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelParseError {
    #[error("unknown tier: {0}")]
    Tier(String),
    #[error("malformed object uri (expected provider:object_id): {0}")]
    Uri(String),
}
