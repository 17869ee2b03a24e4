//! In-memory cache for the hottest data keys, and Markov-chain prefetching
//! driven by the access log.
//!
//! The cache is a read-through copy: the registry and providers stay
//! authoritative. Each cached value carries the digest it was loaded under and
//! is dropped as soon as the registry records different content or the key is
//! quarantined.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracevault_core::model::RegistryEntry;
use tracing::{debug, info, warn};

use crate::access::AccessPatternAnalyzer;
use crate::config::AccessConfig;
use crate::context::StorageContext;
use crate::error::PlacementError;

/// Predictions returned per key.
const MAX_PREDICTIONS: usize = 3;

struct CachedData {
    digest: String,
    bytes: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheRefresh {
    pub promoted: usize,
    pub demoted: usize,
    pub failed: usize,
}

pub struct HotDataCache {
    ctx: Arc<StorageContext>,
    entries: Mutex<LruCache<String, CachedData>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HotDataCache {
    pub fn new(ctx: Arc<StorageContext>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ctx,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains(key)
    }

    /// Serve `key` from memory when the cached copy is current, otherwise
    /// from its provider. Misses are not cached; only promotion fills the
    /// cache.
    pub async fn get(&self, key: &str) -> Result<Arc<Vec<u8>>, PlacementError> {
        if let Some(entry) = self.ctx.registry.get(key).filter(RegistryEntry::is_active) {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(cached) if cached.digest == entry.digest => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(&cached.bytes));
                }
                Some(_) => {
                    entries.pop(key);
                }
                None => {}
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(self.ctx.get(key).await?))
    }

    /// Load `key` into the cache. Returns false when it is already cached
    /// and current, or is not an active registry key.
    pub async fn promote(&self, key: &str) -> Result<bool, PlacementError> {
        let Some(entry) = self.ctx.registry.get(key).filter(RegistryEntry::is_active) else {
            return Ok(false);
        };
        if self
            .entries
            .lock()
            .peek(key)
            .is_some_and(|cached| cached.digest == entry.digest)
        {
            return Ok(false);
        }
        let bytes = Arc::new(self.ctx.get(key).await?);
        self.entries.lock().put(
            key.to_string(),
            CachedData {
                digest: entry.digest,
                bytes,
            },
        );
        debug!(key, "promoted to hot-data cache");
        Ok(true)
    }

    pub fn demote(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Make the cache hold exactly the given hot keys (up to capacity).
    pub async fn refresh(&self, hot: &[String]) -> CacheRefresh {
        let mut report = CacheRefresh::default();
        for key in hot {
            match self.promote(key).await {
                Ok(true) => report.promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "cache promotion failed");
                    report.failed += 1;
                }
            }
        }

        let cold: Vec<String> = self
            .entries
            .lock()
            .iter()
            .map(|(key, _)| key.clone())
            .filter(|key| !hot.contains(key))
            .collect();
        for key in cold {
            if self.demote(&key) {
                report.demoted += 1;
            }
        }
        report
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            entries: entries.len(),
            capacity: entries.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrefetchReport {
    /// Distinct transitions in the model after training.
    pub transitions: usize,
    pub prefetched: Vec<String>,
    pub failed: usize,
}

/// First-order Markov model over the order in which data keys were accessed.
pub struct PrefetchEngine {
    access: Arc<AccessPatternAnalyzer>,
    cache: Arc<HotDataCache>,
    sources: usize,
    threshold: f64,
    transitions: Mutex<HashMap<String, HashMap<String, u64>>>,
}

impl PrefetchEngine {
    pub fn new(
        access: Arc<AccessPatternAnalyzer>,
        cache: Arc<HotDataCache>,
        config: &AccessConfig,
    ) -> Self {
        Self {
            access,
            cache,
            sources: config.prefetch_sources,
            threshold: config.prefetch_threshold,
            transitions: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the transition counts from the current access log. Returns
    /// the number of distinct transitions.
    pub fn train(&self) -> usize {
        let log = self.access.recent(self.access.log_len());
        let sequence: Vec<&str> = log
            .iter()
            .rev()
            .flat_map(|record| record.data_keys.iter().map(String::as_str))
            .collect();

        let mut transitions: HashMap<String, HashMap<String, u64>> = HashMap::new();
        for pair in sequence.windows(2) {
            *transitions
                .entry(pair[0].to_string())
                .or_default()
                .entry(pair[1].to_string())
                .or_insert(0) += 1;
        }
        let distinct = transitions.values().map(HashMap::len).sum();
        *self.transitions.lock() = transitions;
        distinct
    }

    /// The most likely keys to be accessed after `key`, with their
    /// transition probabilities, most likely first.
    pub fn predict_next(&self, key: &str) -> Vec<(String, f64)> {
        let transitions = self.transitions.lock();
        let Some(next) = transitions.get(key) else {
            return Vec::new();
        };
        let total: u64 = next.values().sum();
        let mut ranked: Vec<(&String, u64)> = next.iter().map(|(k, c)| (k, *c)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(MAX_PREDICTIONS)
            .map(|(k, c)| (k.clone(), c as f64 / total as f64))
            .collect()
    }

    /// Train, then load the likely successors of the current hotspots into
    /// the cache.
    pub async fn schedule_prefetch(&self) -> PrefetchReport {
        let mut report = PrefetchReport {
            transitions: self.train(),
            ..PrefetchReport::default()
        };
        for (key, _) in self.access.get_hot_data(self.sources) {
            for (predicted, probability) in self.predict_next(&key) {
                if probability <= self.threshold || self.cache.contains(&predicted) {
                    continue;
                }
                match self.cache.promote(&predicted).await {
                    Ok(true) => report.prefetched.push(predicted),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(key = %predicted, error = %e, "prefetch failed");
                        report.failed += 1;
                    }
                }
            }
        }
        if !report.prefetched.is_empty() {
            info!(prefetched = report.prefetched.len(), "prefetch pass finished");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};

    use tracevault_core::model::Tier;
    use tracevault_core::trace::{DATA_KEY_TAG, Span, SpanId, TraceId, TraceRecord};

    use crate::placement::tests::{Fixture, fixture};

    fn request(key: &str) -> TraceRecord {
        TraceRecord {
            trace_id: TraceId([3; 16]),
            root: Span {
                span_id: SpanId([1; 8]),
                name: "GET /data".into(),
                tags: HashMap::new(),
                children: vec![Span {
                    span_id: SpanId([2; 8]),
                    name: "db.query".into(),
                    tags: HashMap::from([(DATA_KEY_TAG.to_string(), key.to_string())]),
                    children: Vec::new(),
                }],
            },
            start_time: SystemTime::now(),
            duration: Duration::from_millis(4),
            tags: HashMap::new(),
        }
    }

    async fn seeded(keys: &[&str]) -> Fixture {
        let f = fixture(1);
        for key in keys {
            f.ctx.put(key, key.as_bytes(), Tier::Warm).await.unwrap();
        }
        f
    }

    fn engine(
        f: &Fixture,
        accesses: &[&str],
        threshold: f64,
    ) -> (PrefetchEngine, Arc<HotDataCache>) {
        let access = Arc::new(AccessPatternAnalyzer::new(100));
        for key in accesses {
            access.log_access(&request(key));
        }
        let cache = Arc::new(HotDataCache::new(f.ctx.clone(), 10));
        let config = AccessConfig {
            prefetch_sources: 1,
            prefetch_threshold: threshold,
            ..AccessConfig::default()
        };
        (PrefetchEngine::new(access, cache.clone(), &config), cache)
    }

    #[tokio::test]
    async fn test_predict_next_ranks_transitions() {
        let f = seeded(&[]).await;
        let (engine, _) = engine(&f, &["a", "b", "a", "b", "a", "c"], 0.3);
        assert_eq!(engine.train(), 3);

        let predicted = engine.predict_next("a");
        assert_eq!(predicted.len(), 2);
        assert_eq!(predicted[0].0, "b");
        assert!((predicted[0].1 - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(predicted[1].0, "c");
        assert!(engine.predict_next("unseen").is_empty());
    }

    #[tokio::test]
    async fn test_prefetch_loads_likely_successors_only() {
        let f = seeded(&["a", "b", "c"]).await;
        let (engine, cache) = engine(&f, &["a", "b", "a", "b", "a", "c"], 0.5);

        let report = engine.schedule_prefetch().await;
        assert_eq!(report.prefetched, vec!["b".to_string()]);
        assert!(cache.contains("b"));
        assert!(!cache.contains("c"));

        // Already cached: nothing more to do.
        assert!(engine.schedule_prefetch().await.prefetched.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_tracks_hot_set() {
        let f = seeded(&["a", "b"]).await;
        let cache = HotDataCache::new(f.ctx.clone(), 10);
        let hot = |keys: &[&str]| keys.iter().map(|k| k.to_string()).collect::<Vec<_>>();

        let first = cache.refresh(&hot(&["a", "b", "missing"])).await;
        assert_eq!(first, CacheRefresh { promoted: 2, demoted: 0, failed: 0 });

        let second = cache.refresh(&hot(&["b"])).await;
        assert_eq!(second, CacheRefresh { promoted: 0, demoted: 1, failed: 0 });
        assert!(!cache.contains("a"));

        assert_eq!(cache.get("b").await.unwrap().as_slice(), b"b");
        assert_eq!(cache.get("a").await.unwrap().as_slice(), b"a");
        let stats = cache.stats();
        assert_eq!((stats.entries, stats.hits, stats.misses), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_stale_or_quarantined_entries_are_not_served() {
        let f = seeded(&["k", "q"]).await;
        let cache = HotDataCache::new(f.ctx.clone(), 10);
        assert!(cache.promote("k").await.unwrap());
        assert!(cache.promote("q").await.unwrap());

        f.ctx.put("k", b"rewritten", Tier::Warm).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_slice(), b"rewritten");
        assert!(!cache.contains("k"));

        f.ctx.registry.quarantine("q").unwrap();
        assert!(cache.get("q").await.is_err());
    }
}
