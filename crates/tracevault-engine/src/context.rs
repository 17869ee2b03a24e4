//! The shared storage context every component is built over.

use std::sync::Arc;

use parking_lot::RwLock;
use tracevault_core::collab::{Alert, AlertSink};
use tracevault_core::model::PolicyState;
use tracevault_core::provider::StorageProvider;
use tracevault_core::storage::RegistryStore;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{PolicyError, RegistryError};
use crate::providers::MultiProviderStore;
use crate::registry::Registry;

/// Registry, provider set and policy thresholds, constructed once and shared.
pub struct StorageContext {
    pub config: EngineConfig,
    pub registry: Registry,
    pub providers: MultiProviderStore,
    policy: RwLock<PolicyState>,
    alerts: Arc<dyn AlertSink>,
    store: Arc<dyn RegistryStore>,
}

impl StorageContext {
    pub fn open(
        config: EngineConfig,
        providers: Vec<Arc<dyn StorageProvider>>,
        store: Arc<dyn RegistryStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Arc<Self>, RegistryError> {
        let registry = Registry::load(Arc::clone(&store))?;
        let policy = store.load_policy()?.unwrap_or_default();
        info!(
            providers = providers.len(),
            hot_days = policy.hot.max_age_days,
            archive_days = policy.archive_frequency_days,
            "storage context opened"
        );
        let providers = MultiProviderStore::new(providers, Arc::clone(&alerts), &config.providers);
        Ok(Arc::new(Self {
            config,
            registry,
            providers,
            policy: RwLock::new(policy),
            alerts,
            store,
        }))
    }

    /// Current thresholds. Always a fresh read.
    pub fn policy(&self) -> PolicyState {
        *self.policy.read()
    }

    /// Apply `f` to the thresholds, persisting before the change is visible.
    pub fn update_policy<F>(&self, f: F) -> Result<PolicyState, PolicyError>
    where
        F: FnOnce(&mut PolicyState),
    {
        let mut guard = self.policy.write();
        let mut next = *guard;
        f(&mut next);
        if next != *guard {
            self.store.put_policy(&next)?;
            *guard = next;
        }
        Ok(next)
    }

    pub fn alert(&self, alert: Alert) {
        self.alerts.trigger_alert(alert);
    }
}
