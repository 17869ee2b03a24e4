//! Daily storage cost and anomaly detection.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::archiver::TraceArchiver;
use crate::compressor::TraceCompressor;
use crate::config::CostConfig;

const BYTES_PER_GB: f64 = 1e9;

/// Bytes held in each storage class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageFootprint {
    pub buffered_bytes: u64,
    pub compressed_bytes: u64,
    pub archived_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub buffered: f64,
    pub compressed: f64,
    pub archived: f64,
    pub total: f64,
}

pub struct CostAnalyzer {
    config: CostConfig,
    compressor: Arc<TraceCompressor>,
    archiver: Arc<TraceArchiver>,
}

impl CostAnalyzer {
    pub fn new(
        config: CostConfig,
        compressor: Arc<TraceCompressor>,
        archiver: Arc<TraceArchiver>,
    ) -> Self {
        Self {
            config,
            compressor,
            archiver,
        }
    }

    pub fn footprint(&self) -> StorageFootprint {
        StorageFootprint {
            buffered_bytes: self.compressor.buffered_bytes(),
            compressed_bytes: self.compressor.stats().compressed_bytes,
            archived_bytes: self.archiver.archived_bytes(),
        }
    }

    pub fn calculate_daily_cost(&self) -> CostBreakdown {
        cost_of(&self.config, &self.footprint())
    }
}

/// Price a footprint at the configured per-GB daily rates.
pub fn cost_of(config: &CostConfig, footprint: &StorageFootprint) -> CostBreakdown {
    let price = |bytes: u64, rate: f64| bytes as f64 / BYTES_PER_GB * rate;
    let buffered = price(footprint.buffered_bytes, config.buffered_rate);
    let compressed = price(footprint.compressed_bytes, config.compressed_rate);
    let archived = price(footprint.archived_bytes, config.archived_rate);
    CostBreakdown {
        buffered,
        compressed,
        archived,
        total: buffered + compressed + archived,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostAnomaly {
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
}

/// Rolling mean/stddev outlier test over recent cost samples.
pub struct CostAnomalyDetector {
    sigma: f64,
    warmup: usize,
    window: usize,
    samples: Mutex<VecDeque<f64>>,
}

impl CostAnomalyDetector {
    pub fn new(sigma: f64, warmup: usize, window: usize) -> Self {
        Self {
            sigma,
            warmup: warmup.max(2),
            window: window.max(warmup),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Test `value` against the samples seen so far, then add it.
    pub fn observe(&self, value: f64) -> Option<CostAnomaly> {
        let mut samples = self.samples.lock();
        let anomaly = if samples.len() >= self.warmup {
            let n = samples.len() as f64;
            let mean = samples.iter().sum::<f64>() / n;
            let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
            let std_dev = variance.sqrt();
            let distance = (value - mean).abs();
            (distance > self.sigma * std_dev && distance > f64::EPSILON).then_some(CostAnomaly {
                value,
                mean,
                std_dev,
            })
        } else {
            None
        };

        samples.push_back(value);
        if samples.len() > self.window {
            samples.pop_front();
        }
        anomaly
    }
}
