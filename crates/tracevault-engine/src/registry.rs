//! Write-through registry of data keys with per-key critical sections.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracevault_core::model::{EntryStatus, RegistryEntry, Tier};
use tracevault_core::storage::RegistryStore;
use tracing::{info, warn};

use crate::error::RegistryError;

pub struct Registry {
    entries: DashMap<String, RegistryEntry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    store: Arc<dyn RegistryStore>,
}

impl Registry {
    /// Load every persisted entry from `store`.
    pub fn load(store: Arc<dyn RegistryStore>) -> Result<Self, RegistryError> {
        let entries = DashMap::new();
        for entry in store.load_entries()? {
            entries.insert(entry.key.clone(), entry);
        }
        info!(entries = entries.len(), "registry loaded");
        Ok(Self {
            entries,
            locks: DashMap::new(),
            store,
        })
    }

    pub fn get(&self, key: &str) -> Option<RegistryEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.sorted_keys(|_| true)
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.sorted_keys(RegistryEntry::is_active)
    }

    pub fn quarantined_keys(&self) -> Vec<String> {
        self.sorted_keys(|e| e.status == EntryStatus::Quarantined)
    }

    /// Persist `entry`, then make it visible.
    pub fn upsert(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        self.store.put_entry(&entry)?;
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    /// Apply `f` to a copy of the entry and write the result through.
    pub fn update<F>(&self, key: &str, f: F) -> Result<RegistryEntry, RegistryError>
    where
        F: FnOnce(&mut RegistryEntry),
    {
        let mut entry = self
            .get(key)
            .ok_or_else(|| RegistryError::UnknownKey(key.to_string()))?;
        f(&mut entry);
        self.upsert(entry.clone())?;
        Ok(entry)
    }

    /// Returns false when the key was already quarantined.
    pub fn quarantine(&self, key: &str) -> Result<bool, RegistryError> {
        let current = self
            .get(key)
            .ok_or_else(|| RegistryError::UnknownKey(key.to_string()))?;
        if current.status == EntryStatus::Quarantined {
            return Ok(false);
        }
        self.update(key, |e| e.status = EntryStatus::Quarantined)?;
        warn!(key, "entry quarantined");
        Ok(true)
    }

    pub fn set_active(&self, key: &str) -> Result<(), RegistryError> {
        self.update(key, |e| e.status = EntryStatus::Active)?;
        info!(key, "entry returned to active");
        Ok(())
    }

    /// Acquire the critical section for one key. Unrelated keys never contend.
    pub async fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            locks: &self.locks,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of per-key locks currently held or awaited.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn count_by_tier(&self) -> BTreeMap<Tier, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.iter() {
            *counts.entry(entry.tier).or_insert(0) += 1;
        }
        counts
    }

    pub fn count_quarantined(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::Quarantined)
            .count()
    }

    /// Entries with the given key prefix.
    pub fn entries_with_prefix(&self, prefix: &str) -> Vec<RegistryEntry> {
        let mut out: Vec<RegistryEntry> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    fn sorted_keys(&self, keep: impl Fn(&RegistryEntry) -> bool) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

/// Holds one key's critical section. The lock itself is dropped from the
/// registry once nobody holds or awaits it.
pub struct KeyGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
