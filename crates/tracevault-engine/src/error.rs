use thiserror::Error;
use tracevault_core::collab::CollaboratorError;
use tracevault_core::error::{ProviderError, StorageError};
use tracevault_core::model::{ObjectUri, Tier};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Provider selection and I/O failures surfaced by the multi-provider store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no active provider supports tier {tier}")]
    NoAvailableProvider { tier: Tier },
    #[error("store to tier {tier} failed after {attempts} attempt(s): {last}")]
    AttemptsExhausted {
        tier: Tier,
        attempts: usize,
        last: ProviderError,
    },
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("provider {provider} failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: ProviderError,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Provider {
                source: ProviderError::NotFound(_),
                ..
            }
        )
    }
}

/// A failure inside one stage of the batch codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("{stage} stage failed: {reason}")]
    Stage { stage: &'static str, reason: String },
}

/// One compressed batch could not be decoded. Isolated to that batch.
#[derive(Debug, Error)]
#[error("batch {batch} is corrupt: {source}")]
pub struct CorruptBatch {
    pub batch: u64,
    #[source]
    pub source: CodecError,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("record {0} starts before the unix epoch")]
    InvalidTimestamp(String),
    #[error("buffer is full and could not be relocated: {0}")]
    Relocation(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown data key: {0}")]
    UnknownKey(String),
    #[error("data key {0} is quarantined")]
    Quarantined(String),
    #[error("registry persistence failed: {0}")]
    Persist(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stored object for {key} no longer matches its recorded digest")]
    DigestMismatch { key: String },
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("replicas of {key} disagree with the primary: {}", join_uris(.mismatched))]
    InconsistentReplica {
        key: String,
        mismatched: Vec<ObjectUri>,
    },
}

fn join_uris(uris: &[ObjectUri]) -> String {
    uris.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
}

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("unknown issue kind: {0}")]
    UnknownIssueKind(String),
    #[error("advisor recommended unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error(transparent)]
    Advisor(CollaboratorError),
    #[error("rebuild from source failed: {0}")]
    Source(CollaboratorError),
    #[error("no copy of {0} matches its recorded digest")]
    NoHealthyCopy(String),
    #[error("primary object of {0} is unreadable")]
    PrimaryUnreadable(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error("post-repair verification failed: {0}")]
    Verification(#[from] VerifyError),
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("{name} = {value} outside [{floor}, {ceiling}]")]
    OutOfBounds {
        name: &'static str,
        value: i64,
        floor: u32,
        ceiling: u32,
    },
    #[error("tier {0} has no retention policy")]
    NoRetention(Tier),
    #[error("policy persistence failed: {0}")]
    Persist(#[from] StorageError),
}
