//! Closed-loop retention control from the daily cost trend.
//!
//! The trend over the trailing window is `(latest - earliest) / len`. Rising
//! cost shortens hot retention and archives more often; falling cost does the
//! opposite. The gap between the rising and falling thresholds is a dead band
//! so a flat trend leaves the policy alone.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;
use tracevault_core::collab::{Alert, AlertKind, AlertSubject, Severity};
use tracing::{info, warn};

use crate::context::StorageContext;
use crate::cost::{CostAnalyzer, CostAnomalyDetector};
use crate::error::PolicyError;

pub const HOT_RETENTION_FLOOR: u32 = 3;
pub const HOT_RETENTION_CEILING: u32 = 14;
pub const ARCHIVE_FREQUENCY_FLOOR: u32 = 7;
pub const ARCHIVE_FREQUENCY_CEILING: u32 = 30;

/// Proposed hot retention in days for a trend. Not yet bounds-checked.
pub fn adjust_hot_retention(trend: f64, current: u32) -> i64 {
    let current = i64::from(current);
    if trend > 0.05 {
        current - 1
    } else if trend < -0.02 {
        current + 1
    } else {
        current
    }
}

/// Proposed archive frequency in days for a trend. Not yet bounds-checked.
pub fn adjust_archive_frequency(trend: f64, current: u32) -> i64 {
    let current = i64::from(current);
    if trend > 0.10 {
        current - 3
    } else if trend < -0.05 {
        current + 5
    } else {
        current
    }
}

fn within(name: &'static str, value: i64, floor: u32, ceiling: u32) -> Result<u32, PolicyError> {
    if value < i64::from(floor) || value > i64::from(ceiling) {
        return Err(PolicyError::OutOfBounds {
            name,
            value,
            floor,
            ceiling,
        });
    }
    Ok(value as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostSample {
    pub seq: u64,
    pub cost: f64,
    pub at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyAdjustment {
    pub trend: f64,
    pub hot_retention_days: (u32, u32),
    pub archive_frequency_days: (u32, u32),
    /// Proposals refused for falling outside their bounds.
    pub refused: Vec<String>,
}

impl PolicyAdjustment {
    pub fn changed(&self) -> bool {
        self.hot_retention_days.0 != self.hot_retention_days.1
            || self.archive_frequency_days.0 != self.archive_frequency_days.1
    }
}

#[derive(Default)]
struct AdaptiveState {
    samples: VecDeque<CostSample>,
    next_seq: u64,
    /// Sequence number of the newest sample already acted on.
    last_applied: Option<u64>,
}

pub struct AdaptivePolicyEngine {
    ctx: Arc<StorageContext>,
    cost: Arc<CostAnalyzer>,
    detector: CostAnomalyDetector,
    window: usize,
    state: Mutex<AdaptiveState>,
}

impl AdaptivePolicyEngine {
    pub fn new(ctx: Arc<StorageContext>, cost: Arc<CostAnalyzer>) -> Self {
        let window = ctx.config.adaptive.window.max(2);
        let detector = CostAnomalyDetector::new(
            ctx.config.cost.anomaly_sigma,
            ctx.config.cost.anomaly_warmup,
            window,
        );
        Self {
            ctx,
            cost,
            detector,
            window,
            state: Mutex::new(AdaptiveState::default()),
        }
    }

    pub fn record_sample(&self, cost: f64) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.samples.push_back(CostSample {
            seq,
            cost,
            at: SystemTime::now(),
        });
        if state.samples.len() > self.window {
            state.samples.pop_front();
        }
        seq
    }

    /// `None` until two samples exist.
    pub fn trend(&self) -> Option<f64> {
        trend_of(&self.state.lock().samples)
    }

    pub fn samples(&self) -> Vec<CostSample> {
        self.state.lock().samples.iter().copied().collect()
    }

    /// Act on the current trend. A no-op unless a sample arrived since the last
    /// adjustment.
    pub fn adjust_policies(&self) -> Result<Option<PolicyAdjustment>, PolicyError> {
        let mut state = self.state.lock();
        let Some(newest) = state.samples.back().map(|s| s.seq) else {
            return Ok(None);
        };
        if state.last_applied == Some(newest) {
            return Ok(None);
        }
        let Some(trend) = trend_of(&state.samples) else {
            return Ok(None);
        };

        let mut refused = Vec::new();
        let mut before = None;
        let after = self.ctx.update_policy(|policy| {
            before = Some(*policy);
            let hot = adjust_hot_retention(trend, policy.hot.max_age_days);
            match within("hot_retention_days", hot, HOT_RETENTION_FLOOR, HOT_RETENTION_CEILING) {
                Ok(days) => policy.hot.max_age_days = days,
                Err(e) => refused.push(e.to_string()),
            }
            let archive = adjust_archive_frequency(trend, policy.archive_frequency_days);
            match within(
                "archive_frequency_days",
                archive,
                ARCHIVE_FREQUENCY_FLOOR,
                ARCHIVE_FREQUENCY_CEILING,
            ) {
                Ok(days) => policy.archive_frequency_days = days,
                Err(e) => refused.push(e.to_string()),
            }
        })?;
        state.last_applied = Some(newest);
        let before = before.unwrap_or(after);

        for reason in &refused {
            warn!(trend, reason = %reason, "refused policy adjustment");
        }
        let adjustment = PolicyAdjustment {
            trend,
            hot_retention_days: (before.hot.max_age_days, after.hot.max_age_days),
            archive_frequency_days: (before.archive_frequency_days, after.archive_frequency_days),
            refused,
        };
        if adjustment.changed() {
            info!(
                trend,
                hot_days = after.hot.max_age_days,
                archive_days = after.archive_frequency_days,
                "policy adjusted"
            );
        }
        Ok(Some(adjustment))
    }

    /// Sample today's cost, flag anomalies, and adjust.
    pub fn optimize_policies(&self) -> Result<Option<PolicyAdjustment>, PolicyError> {
        let cost = self.cost.calculate_daily_cost();
        if let Some(anomaly) = self.detector.observe(cost.total) {
            warn!(
                cost = anomaly.value,
                mean = anomaly.mean,
                std_dev = anomaly.std_dev,
                "cost anomaly"
            );
            self.ctx.alert(Alert::new(
                AlertKind::CostAnomaly,
                AlertSubject::System,
                Severity::Warning,
                format!(
                    "daily cost {:.4} deviates from mean {:.4} (stddev {:.4})",
                    anomaly.value, anomaly.mean, anomaly.std_dev
                ),
            ));
        }
        self.record_sample(cost.total);
        self.adjust_policies()
    }
}

fn trend_of(samples: &VecDeque<CostSample>) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let earliest = samples.front()?.cost;
    let latest = samples.back()?.cost;
    Some((latest - earliest) / samples.len() as f64)
}
