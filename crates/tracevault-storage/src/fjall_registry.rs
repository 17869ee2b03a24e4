use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracevault_core::error::StorageError;
use tracevault_core::model::{PolicyState, RegistryEntry};
use tracevault_core::storage::RegistryStore;

/// Key under which the policy thresholds live in the `policy` partition.
const POLICY_KEY: &[u8] = b"current";

pub struct FjallRegistryStore {
    keyspace: Keyspace,
    entries: PartitionHandle,
    policy: PartitionHandle,
}

impl FjallRegistryStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let keyspace = Config::new(path)
            .open()
            .map_err(|e| StorageError::Open(e.to_string()))?;
        Self::with_keyspace(keyspace)
    }

    /// Open the registry partitions inside an already opened keyspace.
    pub fn with_keyspace(keyspace: Keyspace) -> Result<Self, StorageError> {
        let entries = keyspace
            .open_partition("registry", PartitionCreateOptions::default())
            .map_err(|e| StorageError::Open(e.to_string()))?;

        let policy = keyspace
            .open_partition("policy", PartitionCreateOptions::default())
            .map_err(|e| StorageError::Open(e.to_string()))?;

        Ok(Self {
            keyspace,
            entries,
            policy,
        })
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Flush the journal so everything written so far survives a crash.
    pub fn persist(&self) -> Result<(), StorageError> {
        self.keyspace
            .persist(fjall::PersistMode::SyncAll)
            .map_err(|e| StorageError::Write(e.to_string()))
    }
}

impl RegistryStore for FjallRegistryStore {
    fn put_entry(&self, entry: &RegistryEntry) -> Result<(), StorageError> {
        let serialized =
            serde_json::to_vec(entry).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.entries
            .insert(entry.key.as_bytes(), serialized)
            .map_err(|e| StorageError::Write(e.to_string()))
    }

    fn get_entry(&self, key: &str) -> Result<Option<RegistryEntry>, StorageError> {
        let Some(value) = self
            .entries
            .get(key.as_bytes())
            .map_err(|e| StorageError::Read(e.to_string()))?
        else {
            return Ok(None);
        };
        let entry: RegistryEntry =
            serde_json::from_slice(&value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(entry))
    }

    fn load_entries(&self) -> Result<Vec<RegistryEntry>, StorageError> {
        let mut results = Vec::new();
        for item in self.entries.iter() {
            let (_key, value) = item.map_err(|e| StorageError::Read(e.to_string()))?;
            let entry: RegistryEntry = serde_json::from_slice(&value)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            results.push(entry);
        }
        Ok(results)
    }

    fn put_policy(&self, policy: &PolicyState) -> Result<(), StorageError> {
        let serialized =
            serde_json::to_vec(policy).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.policy
            .insert(POLICY_KEY, serialized)
            .map_err(|e| StorageError::Write(e.to_string()))
    }

    fn load_policy(&self) -> Result<Option<PolicyState>, StorageError> {
        let Some(value) = self
            .policy
            .get(POLICY_KEY)
            .map_err(|e| StorageError::Read(e.to_string()))?
        else {
            return Ok(None);
        };
        let policy: PolicyState =
            serde_json::from_slice(&value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(policy))
    }

    fn count(&self) -> Result<u64, StorageError> {
        Ok(self.entries.approximate_len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tracevault_core::model::{EntryStatus, ObjectUri, Tier};

    fn make_entry(key: &str, tier: Tier) -> RegistryEntry {
        RegistryEntry {
            key: key.to_string(),
            uri: ObjectUri::new("local", format!("obj-{key}")),
            tier,
            status: EntryStatus::Active,
            created_at: SystemTime::now(),
            last_verified: None,
            migrated_at: None,
            replicas: vec![ObjectUri::new("mirror", format!("copy-{key}"))],
            size_bytes: 12,
            digest: "00".repeat(32),
        }
    }

    #[test]
    fn test_put_and_get_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallRegistryStore::open(dir.path()).unwrap();

        store.put_entry(&make_entry("traces/1", Tier::Hot)).unwrap();

        let entry = store.get_entry("traces/1").unwrap().unwrap();
        assert_eq!(entry.tier, Tier::Hot);
        assert_eq!(entry.replicas.len(), 1);
        assert!(store.get_entry("missing").unwrap().is_none());
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallRegistryStore::open(dir.path()).unwrap();

        let mut entry = make_entry("k", Tier::Hot);
        store.put_entry(&entry).unwrap();
        entry.status = EntryStatus::Quarantined;
        store.put_entry(&entry).unwrap();

        let loaded = store.load_entries().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, EntryStatus::Quarantined);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FjallRegistryStore::open(dir.path()).unwrap();
            store.put_entry(&make_entry("a", Tier::Warm)).unwrap();
            store.put_entry(&make_entry("b", Tier::Cold)).unwrap();
            let mut policy = PolicyState::default();
            policy.hot.max_age_days = 4;
            store.put_policy(&policy).unwrap();
            store.persist().unwrap();
        }

        let store = FjallRegistryStore::open(dir.path()).unwrap();
        let keys: Vec<_> = store
            .load_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(store.load_policy().unwrap().unwrap().hot.max_age_days, 4);
    }
}
