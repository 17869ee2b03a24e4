//! Service facade: every component over one storage context.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracevault_core::collab::{
    RecordSource, RepairAdvisor, StrategyAssigner, VerificationAnalyzer,
};
use tracevault_core::model::{PolicyState, RegistryEntry, Tier};
use tracevault_core::trace::TraceRecord;
use tracing::info;

use crate::access::AccessPatternAnalyzer;
use crate::adaptive::AdaptivePolicyEngine;
use crate::archiver::TraceArchiver;
use crate::background::BackgroundTasks;
use crate::compressor::{CompressorStats, Retrieved, TraceCompressor};
use crate::context::StorageContext;
use crate::cost::{CostAnalyzer, CostBreakdown};
use crate::error::{ConfigError, IngestError, PlacementError, RepairError, StoreError};
use crate::history::{VerificationHistory, VerificationReport};
use crate::lifecycle::{LifecyclePolicyEngine, LifecycleReport};
use crate::optimizer::{OptimizationReport, StorageTierOptimizer};
use crate::pipeline::BatchCodec;
use crate::prefetch::{CacheRefresh, CacheStats, HotDataCache, PrefetchEngine, PrefetchReport};
use crate::providers::ProviderStatus;
use crate::queue::{QueueStats, VerificationQueue};
use crate::repair::RepairEngine;
use crate::verifier::ConsistencyVerifier;

/// External collaborators. Without an analyzer the verification history
/// produces the diagnostics.
pub struct Collaborators {
    pub advisor: Arc<dyn RepairAdvisor>,
    pub analyzer: Option<Arc<dyn VerificationAnalyzer>>,
    pub source: Arc<dyn RecordSource>,
    pub assigner: Option<Arc<dyn StrategyAssigner>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub compressor: CompressorStats,
    pub entries: usize,
    pub by_tier: BTreeMap<Tier, usize>,
    pub quarantined: usize,
    pub archived_bytes: u64,
    pub daily_cost: CostBreakdown,
    pub cache: CacheStats,
    pub policy: PolicyState,
    pub providers: Vec<ProviderStatus>,
}

/// Outcome of one hot-data cache pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CachePass {
    pub refresh: CacheRefresh,
    pub prefetch: PrefetchReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationStats {
    pub queue: QueueStats,
    pub history: VerificationReport,
}

pub struct TraceVault {
    pub(crate) ctx: Arc<StorageContext>,
    pub(crate) compressor: Arc<TraceCompressor>,
    pub(crate) access: Arc<AccessPatternAnalyzer>,
    pub(crate) history: Arc<VerificationHistory>,
    pub(crate) queue: VerificationQueue,
    pub(crate) repair: RepairEngine,
    pub(crate) archiver: Arc<TraceArchiver>,
    pub(crate) cost: Arc<CostAnalyzer>,
    pub(crate) adaptive: AdaptivePolicyEngine,
    pub(crate) lifecycle: LifecyclePolicyEngine,
    pub(crate) optimizer: StorageTierOptimizer,
    pub(crate) cache: Arc<HotDataCache>,
    pub(crate) prefetch: PrefetchEngine,
    repair_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown: watch::Sender<bool>,
}

impl TraceVault {
    /// Build every component. Verification workers are spawned on the
    /// current tokio runtime.
    pub fn new(
        ctx: Arc<StorageContext>,
        collab: Collaborators,
    ) -> Result<Arc<Self>, ConfigError> {
        let config = &ctx.config;
        let codec = Arc::new(BatchCodec::from_config(&config.pipeline)?);
        let stages = codec.stage_names();
        let compressor = Arc::new(TraceCompressor::new(
            config.compressor.clone(),
            Arc::clone(&codec),
        ));
        let access = Arc::new(
            AccessPatternAnalyzer::new(config.access.log_capacity)
                .with_hotspot_limit(config.access.hotspot_capacity),
        );
        let history = Arc::new(VerificationHistory::new(config.verification.history_capacity));
        let analyzer = collab
            .analyzer
            .unwrap_or_else(|| Arc::clone(&history) as Arc<dyn VerificationAnalyzer>);
        let verifier = Arc::new(ConsistencyVerifier::new(Arc::clone(&ctx)));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (repair_tx, repair_rx) = mpsc::unbounded_channel();
        let queue = VerificationQueue::start(
            Arc::clone(&ctx),
            Arc::clone(&verifier),
            Arc::clone(&history),
            repair_tx,
            shutdown_rx,
        );
        let repair = RepairEngine::new(
            Arc::clone(&ctx),
            verifier,
            collab.advisor,
            analyzer,
            collab.source,
            collab.assigner,
        );

        let archiver = Arc::new(TraceArchiver::new(
            Arc::clone(&ctx),
            Arc::clone(&compressor),
            codec,
        ));
        let cost = Arc::new(CostAnalyzer::new(
            config.cost.clone(),
            Arc::clone(&compressor),
            Arc::clone(&archiver),
        ));
        let adaptive = AdaptivePolicyEngine::new(Arc::clone(&ctx), Arc::clone(&cost));
        let lifecycle = LifecyclePolicyEngine::new(
            Arc::clone(&ctx),
            Arc::clone(&compressor),
            Arc::clone(&archiver),
            Arc::clone(&access),
        );
        let optimizer = StorageTierOptimizer::new(Arc::clone(&ctx), Arc::clone(&access));
        let cache = Arc::new(HotDataCache::new(
            Arc::clone(&ctx),
            config.access.cache_capacity,
        ));
        let prefetch = PrefetchEngine::new(Arc::clone(&access), Arc::clone(&cache), &config.access);

        info!(?stages, "trace vault ready");
        Ok(Arc::new(Self {
            ctx,
            compressor,
            access,
            history,
            queue,
            repair,
            archiver,
            cost,
            adaptive,
            lifecycle,
            optimizer,
            cache,
            prefetch,
            repair_rx: Mutex::new(Some(repair_rx)),
            shutdown,
        }))
    }

    pub fn context(&self) -> &Arc<StorageContext> {
        &self.ctx
    }

    pub fn access(&self) -> &AccessPatternAnalyzer {
        &self.access
    }

    pub fn repair_engine(&self) -> &RepairEngine {
        &self.repair
    }

    pub fn lifecycle(&self) -> &LifecyclePolicyEngine {
        &self.lifecycle
    }

    pub fn adaptive(&self) -> &AdaptivePolicyEngine {
        &self.adaptive
    }

    pub fn archiver(&self) -> &TraceArchiver {
        &self.archiver
    }

    /// Buffer a record and log the data keys it touched. A rejected record
    /// does not affect later ones.
    pub fn ingest(&self, record: TraceRecord) -> Result<(), IngestError> {
        self.access.log_access(&record);
        self.compressor.add(record)
    }

    /// Read the content stored under a data key, from the hot-data cache when
    /// it holds a current copy.
    pub async fn read(&self, key: &str) -> Result<Arc<Vec<u8>>, PlacementError> {
        self.cache.get(key).await
    }

    /// Records from the last `since_hours` hours, newest first.
    pub fn retrieve(&self, since_hours: u64) -> Retrieved {
        self.compressor.retrieve(since_hours)
    }

    pub fn storage_stats(&self) -> StorageStats {
        let registry = &self.ctx.registry;
        StorageStats {
            compressor: self.compressor.stats(),
            entries: registry.len(),
            by_tier: registry.count_by_tier(),
            quarantined: registry.count_quarantined(),
            archived_bytes: self.archiver.archived_bytes(),
            daily_cost: self.cost.calculate_daily_cost(),
            cache: self.cache.stats(),
            policy: self.ctx.policy(),
            providers: self.ctx.providers.provider_status(),
        }
    }

    pub fn verification_stats(&self) -> VerificationStats {
        VerificationStats {
            queue: self.queue.stats(),
            history: self.history.report(),
        }
    }

    pub fn quarantined_keys(&self) -> Vec<String> {
        self.ctx.registry.quarantined_keys()
    }

    /// Enqueue every active key and wait for the queue to drain. Returns how
    /// many keys were queued.
    pub async fn verify_now(&self) -> usize {
        let queued = self.queue.schedule_pass();
        self.queue.wait_idle().await;
        queued
    }

    pub async fn optimize_now(&self) -> OptimizationReport {
        self.optimizer.optimize_tier_placement().await
    }

    pub async fn repair_now(&self, key: &str) -> Result<RegistryEntry, RepairError> {
        self.repair.auto_repair(key).await
    }

    /// Cache the current hotspots, evict keys that cooled down, then prefetch
    /// their likely successors.
    pub async fn refresh_cache_now(&self) -> CachePass {
        let hot: Vec<String> = self
            .access
            .get_hot_data(self.ctx.config.access.prefetch_sources)
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let refresh = self.cache.refresh(&hot).await;
        let prefetch = self.prefetch.schedule_prefetch().await;
        CachePass { refresh, prefetch }
    }

    pub async fn apply_lifecycle_now(&self) -> LifecycleReport {
        self.lifecycle.apply_policies().await
    }

    pub fn reactivate_provider(&self, name: &str) -> Result<(), StoreError> {
        self.ctx.providers.reactivate_provider(name)
    }

    /// Start the scheduled loops. Repair requests from the verification queue
    /// are consumed by the first set of loops spawned.
    pub fn spawn_background(self: &Arc<Self>) -> BackgroundTasks {
        let repair_rx = self.repair_rx.lock().take();
        BackgroundTasks::spawn(Arc::clone(self), repair_rx, self.shutdown.subscribe())
    }

    /// Signal the workers and loops to stop, then wait for the workers.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.queue.join().await;
        info!("trace vault stopped");
    }
}
