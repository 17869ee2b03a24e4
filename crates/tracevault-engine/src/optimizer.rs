//! Access-driven tier reclassification.

use std::sync::Arc;

use serde::Serialize;
use tracevault_core::model::Tier;
use tracing::{info, warn};

use crate::access::AccessPatternAnalyzer;
use crate::config::OptimizerConfig;
use crate::context::StorageContext;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizationReport {
    pub examined: usize,
    /// `(key, from, to)` for every migration performed.
    pub migrated: Vec<(String, Tier, Tier)>,
    pub failed: usize,
}

pub struct StorageTierOptimizer {
    ctx: Arc<StorageContext>,
    access: Arc<AccessPatternAnalyzer>,
}

impl StorageTierOptimizer {
    pub fn new(ctx: Arc<StorageContext>, access: Arc<AccessPatternAnalyzer>) -> Self {
        Self { ctx, access }
    }

    /// Target tier for an access count.
    pub fn classify(config: &OptimizerConfig, access_count: u64) -> Tier {
        if access_count > config.hot_threshold {
            Tier::Hot
        } else if access_count > config.warm_threshold {
            Tier::Warm
        } else {
            Tier::Cold
        }
    }

    /// Migrate every active key whose access count puts it in another tier.
    /// Archived data and quarantined keys are left alone; a failure on one key
    /// does not stop the rest.
    pub async fn optimize_tier_placement(&self) -> OptimizationReport {
        let config = &self.ctx.config.optimizer;
        let mut report = OptimizationReport::default();

        for key in self.ctx.registry.active_keys() {
            let Some(entry) = self.ctx.registry.get(&key) else {
                continue;
            };
            if entry.tier == Tier::Archived {
                continue;
            }
            report.examined += 1;

            let target = Self::classify(config, self.access.access_count(&key));
            if target == entry.tier {
                continue;
            }
            match self.ctx.migrate(&key, target).await {
                Ok(true) => report.migrated.push((key, entry.tier, target)),
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key, to = %target, error = %e, "tier migration failed");
                    report.failed += 1;
                }
            }
        }

        if !report.migrated.is_empty() || report.failed > 0 {
            info!(
                examined = report.examined,
                migrated = report.migrated.len(),
                failed = report.failed,
                "tier optimization finished"
            );
        }
        report
    }
}
