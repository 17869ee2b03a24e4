//! Access log and hotspot tracking.

use std::collections::VecDeque;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracevault_core::trace::{TraceId, TraceRecord};

const USER_TAG: &str = "user";
const ENDPOINT_TAG: &str = "endpoint";

#[derive(Debug, Clone, Serialize)]
pub struct AccessRecord {
    pub at: SystemTime,
    pub trace_id: TraceId,
    pub data_keys: Vec<String>,
    pub user: String,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Hotspot {
    pub access_count: u64,
    pub last_accessed: SystemTime,
}

pub struct AccessPatternAnalyzer {
    capacity: usize,
    log: Mutex<VecDeque<AccessRecord>>,
    hotspots: DashMap<String, Hotspot>,
    hotspot_limit: usize,
}

impl AccessPatternAnalyzer {
    /// Both the access log and the hotspot map hold at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            log: Mutex::new(VecDeque::new()),
            hotspots: DashMap::new(),
            hotspot_limit: capacity.max(1),
        }
    }

    pub fn with_hotspot_limit(mut self, limit: usize) -> Self {
        self.hotspot_limit = limit.max(1);
        self
    }

    /// Record the data keys a request touched. Requests without any are
    /// ignored.
    pub fn log_access(&self, request: &TraceRecord) {
        let data_keys: Vec<String> = request.data_keys().into_iter().map(String::from).collect();
        if data_keys.is_empty() {
            return;
        }
        let now = SystemTime::now();
        for key in &data_keys {
            self.touch(key, now);
        }

        let record = AccessRecord {
            at: now,
            trace_id: request.trace_id.clone(),
            data_keys,
            user: request.tag(USER_TAG).unwrap_or("anonymous").to_string(),
            endpoint: request.tag(ENDPOINT_TAG).map(String::from),
        };
        let mut log = self.log.lock();
        if log.len() == self.capacity {
            log.pop_front();
        }
        log.push_back(record);
    }

    /// Count one access of `key` at `at`. A new key evicts the least recently
    /// accessed one when the hotspot map is full.
    pub fn touch(&self, key: &str, at: SystemTime) {
        if let Some(mut hot) = self.hotspots.get_mut(key) {
            hot.access_count += 1;
            hot.last_accessed = hot.last_accessed.max(at);
            return;
        }
        if self.hotspots.len() >= self.hotspot_limit {
            self.evict_stalest();
        }
        self.hotspots
            .entry(key.to_string())
            .and_modify(|h| {
                h.access_count += 1;
                h.last_accessed = h.last_accessed.max(at);
            })
            .or_insert(Hotspot {
                access_count: 1,
                last_accessed: at,
            });
    }

    /// The `n` most accessed keys, most recent first among equal counts.
    pub fn get_hot_data(&self, n: usize) -> Vec<(String, Hotspot)> {
        let mut all: Vec<(String, Hotspot)> = self
            .hotspots
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort_by(|a, b| {
            b.1.access_count
                .cmp(&a.1.access_count)
                .then_with(|| b.1.last_accessed.cmp(&a.1.last_accessed))
                .then_with(|| a.0.cmp(&b.0))
        });
        all.truncate(n);
        all
    }

    fn evict_stalest(&self) {
        let stalest = self
            .hotspots
            .iter()
            .min_by_key(|e| (e.value().last_accessed, e.value().access_count))
            .map(|e| e.key().clone());
        if let Some(key) = stalest {
            self.hotspots.remove(&key);
        }
    }

    pub fn hotspot_count(&self) -> usize {
        self.hotspots.len()
    }

    pub fn access_count(&self, key: &str) -> u64 {
        self.hotspots.get(key).map_or(0, |h| h.access_count)
    }

    pub fn log_len(&self) -> usize {
        self.log.lock().len()
    }

    /// The most recent `n` access records, newest first.
    pub fn recent(&self, n: usize) -> Vec<AccessRecord> {
        self.log.lock().iter().rev().take(n).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use tracevault_core::trace::{DATA_KEY_TAG, Span, SpanId};

    fn request(keys: &[&str], user: Option<&str>) -> TraceRecord {
        let children = keys
            .iter()
            .enumerate()
            .map(|(i, k)| Span {
                span_id: SpanId([i as u8 + 2; 8]),
                name: "db.query".into(),
                tags: HashMap::from([(DATA_KEY_TAG.to_string(), k.to_string())]),
                children: Vec::new(),
            })
            .collect();
        let mut tags = HashMap::new();
        if let Some(user) = user {
            tags.insert(USER_TAG.to_string(), user.to_string());
        }
        TraceRecord {
            trace_id: TraceId([7; 16]),
            root: Span {
                span_id: SpanId([1; 8]),
                name: "GET /traces".into(),
                tags: HashMap::new(),
                children,
            },
            start_time: SystemTime::now(),
            duration: Duration::from_millis(5),
            tags,
        }
    }

    #[test]
    fn test_log_access_counts_each_key() {
        let analyzer = AccessPatternAnalyzer::new(10);
        analyzer.log_access(&request(&["a", "b"], Some("alice")));
        analyzer.log_access(&request(&["a"], None));

        assert_eq!(analyzer.access_count("a"), 2);
        assert_eq!(analyzer.access_count("b"), 1);
        assert_eq!(analyzer.access_count("c"), 0);
        let recent = analyzer.recent(2);
        assert_eq!(recent[0].user, "anonymous");
        assert_eq!(recent[1].user, "alice");
    }

    #[test]
    fn test_requests_without_keys_are_ignored() {
        let analyzer = AccessPatternAnalyzer::new(10);
        analyzer.log_access(&request(&[], None));
        assert_eq!(analyzer.log_len(), 0);
    }

    #[test]
    fn test_log_is_bounded() {
        let analyzer = AccessPatternAnalyzer::new(3);
        for _ in 0..5 {
            analyzer.log_access(&request(&["a"], None));
        }
        assert_eq!(analyzer.log_len(), 3);
        assert_eq!(analyzer.access_count("a"), 5);
    }

    #[test]
    fn test_hot_data_ranks_by_count_then_recency() {
        let analyzer = AccessPatternAnalyzer::new(10);
        let t0 = SystemTime::now();
        analyzer.touch("old", t0);
        analyzer.touch("old", t0);
        analyzer.touch("new", t0 + Duration::from_secs(5));
        analyzer.touch("new", t0 + Duration::from_secs(5));
        analyzer.touch("busy", t0);
        analyzer.touch("busy", t0);
        analyzer.touch("busy", t0);

        let hot: Vec<String> = analyzer.get_hot_data(3).into_iter().map(|(k, _)| k).collect();
        assert_eq!(hot, vec!["busy", "new", "old"]);
        assert_eq!(analyzer.get_hot_data(1).len(), 1);
    }

    #[test]
    fn test_hotspot_map_evicts_least_recent_key() {
        let analyzer = AccessPatternAnalyzer::new(100).with_hotspot_limit(2);
        let t0 = SystemTime::now();
        analyzer.touch("stale", t0);
        analyzer.touch("busy", t0 + Duration::from_secs(1));
        analyzer.touch("busy", t0 + Duration::from_secs(2));
        analyzer.touch("new", t0 + Duration::from_secs(3));

        assert_eq!(analyzer.hotspot_count(), 2);
        assert_eq!(analyzer.access_count("stale"), 0);
        assert_eq!(analyzer.access_count("busy"), 2);
        assert_eq!(analyzer.access_count("new"), 1);
    }
}
