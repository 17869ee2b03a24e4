use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use tracevault_core::error::{ProviderError, StorageError};
use tracevault_core::model::Tier;
use tracevault_core::provider::{StorageProvider, content_digest};

/// A [`StorageProvider`] backed by a local fjall partition.
///
/// Every tier it advertises lands in the same partition; the tier only
/// influences the advertised cost.
pub struct FjallObjectProvider {
    name: String,
    tiers: Vec<Tier>,
    costs: HashMap<Tier, f64>,
    replica: bool,
    objects: PartitionHandle,
}

impl FjallObjectProvider {
    /// Open (or create) the object partition for `name` inside `keyspace`.
    pub fn open(
        keyspace: &Keyspace,
        name: impl Into<String>,
        costs: HashMap<Tier, f64>,
        replica: bool,
    ) -> Result<Self, StorageError> {
        let name = name.into();
        let kv_sep_opts = PartitionCreateOptions::default()
            .with_kv_separation(fjall::KvSeparationOptions::default());

        let objects = keyspace
            .open_partition(&format!("objects_{name}"), kv_sep_opts)
            .map_err(|e| StorageError::Open(e.to_string()))?;

        let mut tiers: Vec<Tier> = costs.keys().copied().collect();
        tiers.sort();

        Ok(Self {
            name,
            tiers,
            costs,
            replica,
            objects,
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, ProviderError>
    where
        T: Send + 'static,
        F: FnOnce(PartitionHandle) -> Result<T, ProviderError> + Send + 'static,
    {
        let objects = self.objects.clone();
        tokio::task::spawn_blocking(move || op(objects))
            .await
            .map_err(|e| ProviderError::Transient(format!("blocking task failed: {e}")))?
    }
}

/// Object ids are `{nanos_be_hex}{random_hex}` so they sort by write time.
fn new_object_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64;
    format!("{nanos:016x}{:08x}", rand::random::<u32>())
}

#[async_trait]
impl StorageProvider for FjallObjectProvider {
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
        if !self.supports_tier(tier) {
            return Err(ProviderError::UnsupportedTier(tier));
        }
        let data = data.to_vec();
        self.blocking(move |objects| {
            let object_id = new_object_id();
            objects
                .insert(object_id.as_bytes(), data)
                .map_err(|e| ProviderError::Transient(e.to_string()))?;
            Ok(object_id)
        })
        .await
    }

    async fn retrieve(&self, object_id: &str) -> Result<Vec<u8>, ProviderError> {
        let object_id = object_id.to_string();
        self.blocking(move |objects| {
            objects
                .get(object_id.as_bytes())
                .map_err(|e| ProviderError::Transient(e.to_string()))?
                .map(|value| value.to_vec())
                .ok_or(ProviderError::NotFound(object_id))
        })
        .await
    }

    async fn get_object_hash(&self, object_id: &str) -> Result<String, ProviderError> {
        let data = self.retrieve(object_id).await?;
        Ok(content_digest(&data))
    }

    async fn delete(&self, object_id: &str) -> Result<(), ProviderError> {
        let object_id = object_id.to_string();
        self.blocking(move |objects| {
            objects
                .remove(object_id.as_bytes())
                .map_err(|e| ProviderError::Transient(e.to_string()))
        })
        .await
    }
}
