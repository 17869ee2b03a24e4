use crate::error::StorageError;
use crate::model::{PolicyState, RegistryEntry};

/// Durable keyed store behind the registry and the policy thresholds.
pub trait RegistryStore: Send + Sync {
    /// Insert or overwrite the entry for `entry.key`.
    fn put_entry(&self, entry: &RegistryEntry) -> Result<(), StorageError>;

    /// Fetch a single entry.
    fn get_entry(&self, key: &str) -> Result<Option<RegistryEntry>, StorageError>;

    /// Load every persisted entry, ordered by key.
    fn load_entries(&self) -> Result<Vec<RegistryEntry>, StorageError>;

    /// Persist the current policy thresholds.
    fn put_policy(&self, policy: &PolicyState) -> Result<(), StorageError>;

    /// Load the last persisted policy, if any.
    fn load_policy(&self) -> Result<Option<PolicyState>, StorageError>;

    /// Get total entry count.
    fn count(&self) -> Result<u64, StorageError>;
}
