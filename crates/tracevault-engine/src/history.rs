//! Bounded verification history; the default [`VerificationAnalyzer`].

use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracevault_core::collab::{Diagnostics, VerificationAnalyzer};

use crate::verifier::IntegrityVerdict;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Consistent,
    Inconsistent,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationEvent {
    pub key: String,
    pub outcome: Outcome,
    /// Providers holding a mismatched copy.
    pub providers: Vec<String>,
    pub error: Option<String>,
    pub at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub total_checks: usize,
    pub success_rate: f64,
    pub common_issues: Vec<(String, u64)>,
}

#[derive(Default)]
struct HistoryState {
    events: VecDeque<VerificationEvent>,
    patterns: HashMap<String, u64>,
}

pub struct VerificationHistory {
    capacity: usize,
    state: Mutex<HistoryState>,
}

impl VerificationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(HistoryState::default()),
        }
    }

    pub fn record_verdict(&self, key: &str, verdict: &IntegrityVerdict) {
        let (outcome, providers) = match verdict {
            IntegrityVerdict::Consistent { .. } => (Outcome::Consistent, Vec::new()),
            IntegrityVerdict::Skipped => (Outcome::Skipped, Vec::new()),
            IntegrityVerdict::Inconsistent { mismatched } => (
                Outcome::Inconsistent,
                mismatched.iter().map(|u| u.provider.clone()).collect(),
            ),
        };
        self.push(VerificationEvent {
            key: key.to_string(),
            outcome,
            providers,
            error: None,
            at: SystemTime::now(),
        });
    }

    pub fn record_failure(&self, key: &str, error: &str) {
        self.push(VerificationEvent {
            key: key.to_string(),
            outcome: Outcome::Failed,
            providers: Vec::new(),
            error: Some(error.to_string()),
            at: SystemTime::now(),
        });
    }

    /// Aggregate over the retained window.
    pub fn report(&self) -> VerificationReport {
        let state = self.state.lock();
        let total = state.events.len();
        let ok = state
            .events
            .iter()
            .filter(|e| e.outcome == Outcome::Consistent)
            .count();
        let mut common: Vec<(String, u64)> =
            state.patterns.iter().map(|(k, v)| (k.clone(), *v)).collect();
        common.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        common.truncate(5);
        VerificationReport {
            total_checks: total,
            success_rate: if total == 0 { 1.0 } else { ok as f64 / total as f64 },
            common_issues: common,
        }
    }

    pub fn events_for(&self, key: &str) -> Vec<VerificationEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.key == key)
            .cloned()
            .collect()
    }

    fn push(&self, event: VerificationEvent) {
        let mut state = self.state.lock();
        for pattern in patterns_of(&event) {
            *state.patterns.entry(pattern).or_insert(0) += 1;
        }
        if state.events.len() == self.capacity {
            state.events.pop_front();
        }
        state.events.push_back(event);
    }
}

fn patterns_of(event: &VerificationEvent) -> Vec<String> {
    match event.outcome {
        Outcome::Consistent => Vec::new(),
        Outcome::Skipped => vec!["verification_skipped".to_string()],
        Outcome::Failed => vec!["verification_failure".to_string()],
        Outcome::Inconsistent => event
            .providers
            .iter()
            .map(|p| format!("provider_{p}_inconsistency"))
            .collect(),
    }
}

impl VerificationAnalyzer for VerificationHistory {
    fn generate_report(&self, key: &str) -> Diagnostics {
        let events = self.events_for(key);
        let failures = events
            .iter()
            .filter(|e| !matches!(e.outcome, Outcome::Consistent | Outcome::Skipped))
            .count();
        let overall = self.report();
        json!({
            "key": key,
            "checks": events.len(),
            "failures": failures,
            "last": events.last(),
            "system": overall,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracevault_core::model::ObjectUri;

    #[test]
    fn test_report_ranks_common_issues() {
        let history = VerificationHistory::new(100);
        for _ in 0..3 {
            history.record_verdict(
                "a",
                &IntegrityVerdict::Inconsistent {
                    mismatched: vec![ObjectUri::new("s3", "x")],
                },
            );
        }
        history.record_failure("b", "timeout");
        history.record_verdict("c", &IntegrityVerdict::Consistent { replicas: 1 });

        let report = history.report();
        assert_eq!(report.total_checks, 5);
        assert!((report.success_rate - 0.2).abs() < 1e-9);
        assert_eq!(report.common_issues[0], ("provider_s3_inconsistency".into(), 3));
        assert_eq!(report.common_issues[1], ("verification_failure".into(), 1));
    }

    #[test]
    fn test_history_is_bounded() {
        let history = VerificationHistory::new(3);
        for i in 0..10 {
            history.record_verdict(&format!("k{i}"), &IntegrityVerdict::Skipped);
        }
        assert_eq!(history.report().total_checks, 3);
        assert!(history.events_for("k0").is_empty());
    }

    #[test]
    fn test_generate_report_is_per_key() {
        let history = VerificationHistory::new(10);
        history.record_failure("k", "boom");
        history.record_verdict("other", &IntegrityVerdict::Consistent { replicas: 2 });

        let report = history.generate_report("k");
        assert_eq!(report["checks"], 1);
        assert_eq!(report["failures"], 1);
        assert_eq!(report["last"]["error"], "boom");
        assert_eq!(report["system"]["total_checks"], 2);
    }
}
