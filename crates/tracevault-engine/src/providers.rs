//! Tier-aware provider selection with bounded retry and failover.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::Serialize;
use tracevault_core::collab::{Alert, AlertKind, AlertSink, AlertSubject, Severity};
use tracevault_core::model::{ObjectUri, Tier};
use tracevault_core::provider::StorageProvider;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::error::StoreError;

struct ProviderSlot {
    provider: Arc<dyn StorageProvider>,
    active: AtomicBool,
    /// Consecutive provider-fault failures since the last success.
    failures: AtomicU32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub active: bool,
    pub consecutive_failures: u32,
    pub supports_replica: bool,
    pub tiers: Vec<Tier>,
}

pub struct MultiProviderStore {
    slots: Vec<ProviderSlot>,
    alerts: Arc<dyn AlertSink>,
    failover_threshold: u32,
    max_attempts: usize,
}

impl MultiProviderStore {
    pub fn new(
        providers: Vec<Arc<dyn StorageProvider>>,
        alerts: Arc<dyn AlertSink>,
        config: &ProviderConfig,
    ) -> Self {
        let slots = providers
            .into_iter()
            .map(|provider| ProviderSlot {
                provider,
                active: AtomicBool::new(true),
                failures: AtomicU32::new(0),
            })
            .collect();
        Self {
            slots,
            alerts,
            failover_threshold: config.failover_threshold,
            max_attempts: config.max_store_attempts,
        }
    }

    /// Store `data` on the cheapest active provider for `tier`, falling back to
    /// the next cheapest on provider faults.
    pub async fn store(&self, data: &[u8], tier: Tier) -> Result<ObjectUri, StoreError> {
        let mut tried: Vec<usize> = Vec::new();
        let mut last = None;

        for _ in 0..self.max_attempts {
            let Some(index) = self.cheapest_candidate(tier, &tried) else {
                break;
            };
            tried.push(index);
            let slot = &self.slots[index];
            let name = slot.provider.name();

            match slot.provider.store(data, tier).await {
                Ok(object_id) => {
                    slot.failures.store(0, Ordering::Release);
                    debug!(provider = name, %tier, bytes = data.len(), "stored object");
                    return Ok(ObjectUri::new(name, object_id));
                }
                Err(e) => {
                    warn!(provider = name, %tier, error = %e, "store attempt failed");
                    if e.is_provider_fault() {
                        self.record_failure(slot);
                    }
                    last = Some(e);
                }
            }
        }

        match last {
            Some(last) => Err(StoreError::AttemptsExhausted {
                tier,
                attempts: tried.len(),
                last,
            }),
            None => Err(StoreError::NoAvailableProvider { tier }),
        }
    }

    /// Write extra copies to other active replica-capable providers. Failures
    /// are logged and skipped; returns the copies that were written.
    pub async fn replicate(
        &self,
        data: &[u8],
        tier: Tier,
        exclude: &str,
        count: usize,
    ) -> Vec<ObjectUri> {
        let mut candidates: Vec<&ProviderSlot> = self
            .slots
            .iter()
            .filter(|s| {
                s.active.load(Ordering::Acquire)
                    && s.provider.name() != exclude
                    && s.provider.supports_replica()
                    && s.provider.supports_tier(tier)
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.provider
                .get_cost(tier)
                .total_cmp(&b.provider.get_cost(tier))
        });

        let mut written = Vec::new();
        for slot in candidates {
            if written.len() == count {
                break;
            }
            let name = slot.provider.name();
            match slot.provider.store(data, tier).await {
                Ok(object_id) => {
                    slot.failures.store(0, Ordering::Release);
                    written.push(ObjectUri::new(name, object_id));
                }
                Err(e) => {
                    warn!(provider = name, %tier, error = %e, "replica write failed");
                    if e.is_provider_fault() {
                        self.record_failure(slot);
                    }
                }
            }
        }
        written
    }

    /// Reads go to the named provider whether or not it is still selectable
    /// for new writes.
    pub async fn retrieve(&self, uri: &ObjectUri) -> Result<Vec<u8>, StoreError> {
        let provider = self.lookup(&uri.provider)?;
        provider
            .retrieve(&uri.object_id)
            .await
            .map_err(|source| StoreError::Provider {
                provider: uri.provider.clone(),
                source,
            })
    }

    pub async fn object_hash(&self, uri: &ObjectUri) -> Result<String, StoreError> {
        let provider = self.lookup(&uri.provider)?;
        provider
            .get_object_hash(&uri.object_id)
            .await
            .map_err(|source| StoreError::Provider {
                provider: uri.provider.clone(),
                source,
            })
    }

    pub async fn delete(&self, uri: &ObjectUri) -> Result<(), StoreError> {
        let provider = self.lookup(&uri.provider)?;
        provider
            .delete(&uri.object_id)
            .await
            .map_err(|source| StoreError::Provider {
                provider: uri.provider.clone(),
                source,
            })
    }

    /// Delete each location, logging failures instead of returning them.
    pub async fn delete_all<'a>(&self, uris: impl IntoIterator<Item = &'a ObjectUri>) {
        for uri in uris {
            if let Err(e) = self.delete(uri).await {
                warn!(%uri, error = %e, "failed to delete object");
            }
        }
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn StorageProvider>> {
        self.slot(name).map(|s| Arc::clone(&s.provider))
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.slot(name)
            .is_some_and(|s| s.active.load(Ordering::Acquire))
    }

    /// Whether `name` is active and keeps independently verifiable copies.
    pub fn is_replica_capable(&self, name: &str) -> bool {
        self.slot(name).is_some_and(|s| {
            s.active.load(Ordering::Acquire) && s.provider.supports_replica()
        })
    }

    /// Put a failed-over provider back into the selection set.
    pub fn reactivate_provider(&self, name: &str) -> Result<(), StoreError> {
        let slot = self
            .slot(name)
            .ok_or_else(|| StoreError::UnknownProvider(name.to_string()))?;
        slot.failures.store(0, Ordering::Release);
        if !slot.active.swap(true, Ordering::AcqRel) {
            info!(provider = name, "provider reactivated");
        }
        Ok(())
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.slots
            .iter()
            .map(|s| ProviderStatus {
                name: s.provider.name().to_string(),
                active: s.active.load(Ordering::Acquire),
                consecutive_failures: s.failures.load(Ordering::Acquire),
                supports_replica: s.provider.supports_replica(),
                tiers: s.provider.supported_tiers().to_vec(),
            })
            .collect()
    }

    fn cheapest_candidate(&self, tier: Tier, tried: &[usize]) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, s)| {
                !tried.contains(i)
                    && s.active.load(Ordering::Acquire)
                    && s.provider.supports_tier(tier)
            })
            .min_by(|(_, a), (_, b)| {
                a.provider
                    .get_cost(tier)
                    .total_cmp(&b.provider.get_cost(tier))
            })
            .map(|(i, _)| i)
    }

    fn record_failure(&self, slot: &ProviderSlot) {
        let failures = slot.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.failover_threshold {
            return;
        }
        // Only the call that flips the flag raises the alert.
        if slot.active.swap(false, Ordering::AcqRel) {
            let name = slot.provider.name();
            warn!(provider = name, failures, "provider removed from active set");
            self.alerts.trigger_alert(Alert::new(
                AlertKind::StorageFailover,
                AlertSubject::Provider(name.to_string()),
                Severity::Critical,
                format!("provider {name} failed {failures} consecutive times"),
            ));
        }
    }

    fn slot(&self, name: &str) -> Option<&ProviderSlot> {
        self.slots.iter().find(|s| s.provider.name() == name)
    }

    fn lookup(&self, name: &str) -> Result<&Arc<dyn StorageProvider>, StoreError> {
        self.slot(name)
            .map(|s| &s.provider)
            .ok_or_else(|| StoreError::UnknownProvider(name.to_string()))
    }
}
