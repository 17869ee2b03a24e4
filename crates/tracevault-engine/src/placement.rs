//! Data-key level placement: put, get and ordered migration.
//!
//! Every relocation follows the same order: write the new copies, point the
//! registry at them, and only then delete what the registry no longer names.
//! A failure before the registry update deletes the new copies; a failure
//! after it leaves at most an orphaned old object, never a registry entry
//! pointing at a deleted one.

use std::time::SystemTime;

use tracevault_core::model::{EntryStatus, ObjectUri, RegistryEntry, Tier};
use tracevault_core::provider::content_digest;
use tracing::{debug, info, warn};

use crate::context::StorageContext;
use crate::error::{PlacementError, RegistryError};

impl StorageContext {
    /// Store `data` under `key`, replacing any previous content.
    pub async fn put(
        &self,
        key: &str,
        data: &[u8],
        tier: Tier,
    ) -> Result<RegistryEntry, PlacementError> {
        let _guard = self.registry.lock_key(key).await;
        let previous = self.registry.get(key);

        let (uri, replicas) = self.write_copies(data, tier).await?;
        let entry = RegistryEntry {
            key: key.to_string(),
            uri,
            tier,
            status: EntryStatus::Active,
            created_at: previous
                .as_ref()
                .map(|p| p.created_at)
                .unwrap_or_else(SystemTime::now),
            last_verified: None,
            migrated_at: None,
            replicas,
            size_bytes: data.len() as u64,
            digest: content_digest(data),
        };

        if let Err(e) = self.registry.upsert(entry.clone()) {
            self.providers.delete_all(entry.locations()).await;
            return Err(e.into());
        }
        if let Some(previous) = previous {
            self.providers.delete_all(previous.locations()).await;
        }
        debug!(key, %tier, bytes = data.len(), "placed data");
        Ok(entry)
    }

    /// Read the primary copy. Quarantined keys are not served.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, PlacementError> {
        let entry = self
            .registry
            .get(key)
            .ok_or_else(|| RegistryError::UnknownKey(key.to_string()))?;
        if !entry.is_active() {
            return Err(RegistryError::Quarantined(key.to_string()).into());
        }
        Ok(self.providers.retrieve(&entry.uri).await?)
    }

    /// Move `key` to `to`. A no-op when it is already there.
    pub async fn migrate(&self, key: &str, to: Tier) -> Result<bool, PlacementError> {
        let _guard = self.registry.lock_key(key).await;
        let entry = self
            .registry
            .get(key)
            .ok_or_else(|| RegistryError::UnknownKey(key.to_string()))?;
        if !entry.is_active() {
            return Err(RegistryError::Quarantined(key.to_string()).into());
        }
        if entry.tier == to {
            return Ok(false);
        }

        let data = self.providers.retrieve(&entry.uri).await?;
        if !entry.digest.is_empty() && content_digest(&data) != entry.digest {
            return Err(PlacementError::DigestMismatch {
                key: key.to_string(),
            });
        }
        self.relocate_locked(&entry, &data, to, false).await?;
        info!(key, from = %entry.tier, to = %to, "migrated");
        Ok(true)
    }

    /// Write `data` as the new content of `entry` at `tier` and retire the old
    /// locations. The caller must hold the key's lock. The entry's status is
    /// left untouched; `reset_verification` clears `last_verified`.
    pub(crate) async fn relocate_locked(
        &self,
        entry: &RegistryEntry,
        data: &[u8],
        tier: Tier,
        reset_verification: bool,
    ) -> Result<RegistryEntry, PlacementError> {
        let (uri, replicas) = self.write_copies(data, tier).await?;
        let new_locations: Vec<ObjectUri> =
            std::iter::once(uri.clone()).chain(replicas.iter().cloned()).collect();

        let digest = content_digest(data);
        let size = data.len() as u64;
        let now = SystemTime::now();
        let tier_changed = entry.tier != tier;
        let updated = self.registry.update(&entry.key, |e| {
            e.uri = uri;
            e.replicas = replicas;
            e.tier = tier;
            e.digest = digest;
            e.size_bytes = size;
            if tier_changed {
                e.migrated_at = Some(now);
            }
            if reset_verification {
                e.last_verified = None;
            }
        });
        let updated = match updated {
            Ok(updated) => updated,
            Err(e) => {
                self.providers.delete_all(&new_locations).await;
                return Err(e.into());
            }
        };

        let stale: Vec<&ObjectUri> = entry
            .locations()
            .filter(|old| !new_locations.contains(old))
            .collect();
        self.providers.delete_all(stale).await;
        Ok(updated)
    }

    async fn write_copies(
        &self,
        data: &[u8],
        tier: Tier,
    ) -> Result<(ObjectUri, Vec<ObjectUri>), PlacementError> {
        let uri = self.providers.store(data, tier).await?;
        let factor = self.config.providers.replication_factor;
        let replicas = if factor > 0 {
            self.providers.replicate(data, tier, &uri.provider, factor).await
        } else {
            Vec::new()
        };
        if replicas.len() < factor {
            warn!(
                %uri,
                wanted = factor,
                written = replicas.len(),
                "under-replicated placement"
            );
        }
        Ok((uri, replicas))
    }
}
