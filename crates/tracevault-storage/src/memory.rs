//! In-memory backends with failure and corruption injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracevault_core::error::{ProviderError, StorageError};
use tracevault_core::model::{PolicyState, RegistryEntry, Tier};
use tracevault_core::provider::{StorageProvider, content_digest};
use tracevault_core::storage::RegistryStore;

pub struct MemoryProvider {
    name: String,
    tiers: Vec<Tier>,
    costs: HashMap<Tier, f64>,
    replica: bool,
    objects: RwLock<HashMap<String, Vec<u8>>>,
    next_id: AtomicU64,
    /// Remaining `store` calls that fail with a transient error.
    failing_stores: AtomicU32,
    store_calls: AtomicU64,
}

impl MemoryProvider {
    /// A provider supporting every tier at the same `cost`.
    pub fn new(name: impl Into<String>, cost: f64, replica: bool) -> Self {
        Self::with_costs(name, Tier::ALL.iter().map(|t| (*t, cost)).collect(), replica)
    }

    pub fn with_costs(name: impl Into<String>, costs: HashMap<Tier, f64>, replica: bool) -> Self {
        let mut tiers: Vec<Tier> = costs.keys().copied().collect();
        tiers.sort();
        Self {
            name: name.into(),
            tiers,
            costs,
            replica,
            objects: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            failing_stores: AtomicU32::new(0),
            store_calls: AtomicU64::new(0),
        }
    }

    /// Make the next `n` calls to `store` fail.
    pub fn fail_next_stores(&self, n: u32) {
        self.failing_stores.store(n, Ordering::SeqCst);
    }

    /// Flip a byte of a stored object. Returns false if the object is unknown.
    pub fn corrupt(&self, object_id: &str) -> bool {
        let mut objects = self.objects.write();
        match objects.get_mut(object_id) {
            Some(data) if !data.is_empty() => {
                data[0] ^= 0xff;
                true
            }
            Some(data) => {
                data.push(0xff);
                true
            }
            None => false,
        }
    }

    /// Drop an object behind the caller's back.
    pub fn lose(&self, object_id: &str) -> bool {
        self.objects.write().remove(object_id).is_some()
    }

    pub fn contains(&self, object_id: &str) -> bool {
        self.objects.read().contains_key(object_id)
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    pub fn store_calls(&self) -> u64 {
        self.store_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_tiers(&self) -> &[Tier] {
        &self.tiers
    }

    fn supports_replica(&self) -> bool {
        self.replica
    }

    fn get_cost(&self, tier: Tier) -> f64 {
        self.costs.get(&tier).copied().unwrap_or(f64::INFINITY)
    }

    async fn store(&self, data: &[u8], tier: Tier) -> Result<String, ProviderError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports_tier(tier) {
            return Err(ProviderError::UnsupportedTier(tier));
        }
        let failing = self
            .failing_stores
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ProviderError::Transient(format!("{} refused write", self.name)));
        }
        let object_id = format!("obj-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.objects.write().insert(object_id.clone(), data.to_vec());
        Ok(object_id)
    }

    async fn retrieve(&self, object_id: &str) -> Result<Vec<u8>, ProviderError> {
        self.objects
            .read()
            .get(object_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(object_id.to_string()))
    }

    async fn get_object_hash(&self, object_id: &str) -> Result<String, ProviderError> {
        self.objects
            .read()
            .get(object_id)
            .map(|data| content_digest(data))
            .ok_or_else(|| ProviderError::NotFound(object_id.to_string()))
    }

    async fn delete(&self, object_id: &str) -> Result<(), ProviderError> {
        self.objects.write().remove(object_id);
        Ok(())
    }
}

/// Registry store that forgets everything on drop.
#[derive(Default)]
pub struct MemoryRegistryStore {
    entries: RwLock<BTreeMap<String, RegistryEntry>>,
    policy: RwLock<Option<PolicyState>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistryStore for MemoryRegistryStore {
    fn put_entry(&self, entry: &RegistryEntry) -> Result<(), StorageError> {
        self.entries.write().insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    fn get_entry(&self, key: &str) -> Result<Option<RegistryEntry>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn load_entries(&self) -> Result<Vec<RegistryEntry>, StorageError> {
        Ok(self.entries.read().values().cloned().collect())
    }

    fn put_policy(&self, policy: &PolicyState) -> Result<(), StorageError> {
        *self.policy.write() = Some(*policy);
        Ok(())
    }

    fn load_policy(&self) -> Result<Option<PolicyState>, StorageError> {
        Ok(*self.policy.read())
    }

    fn count(&self) -> Result<u64, StorageError> {
        Ok(self.entries.read().len() as u64)
    }
}
