//! Repair of quarantined keys and the repair ledger.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracevault_core::collab::{
    Alert, AlertKind, AlertSubject, RecordSource, RepairAdvisor, Severity, StrategyAssigner,
    VerificationAnalyzer,
};
use tracevault_core::model::RegistryEntry;
use tracevault_core::provider::content_digest;
use tracing::{debug, info, warn};

use crate::context::StorageContext;
use crate::error::{RegistryError, RepairError};
use crate::verifier::ConsistencyVerifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Restore every copy from one that still matches the recorded digest.
    SingleCorruption,
    /// Rebuild from the original ingestion source.
    MultiCorruption,
    /// Rebuild the registry entry from the stored primary.
    MetadataIssue,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleCorruption => "single_corruption",
            Self::MultiCorruption => "multi_corruption",
            Self::MetadataIssue => "metadata_issue",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueKind {
    type Err = RepairError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_corruption" => Ok(Self::SingleCorruption),
            "multi_corruption" => Ok(Self::MultiCorruption),
            "metadata_issue" => Ok(Self::MetadataIssue),
            other => Err(RepairError::UnknownIssueKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairRecord {
    pub key: String,
    pub kind: Option<IssueKind>,
    pub strategy: String,
    pub variant: Option<String>,
    pub confidence: Option<f64>,
    pub success: bool,
    pub error: Option<String>,
    pub at: SystemTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VariantTally {
    pub success: u64,
    pub total: u64,
}

/// Bounded history of repair outcomes.
pub struct RepairLedger {
    capacity: usize,
    records: Mutex<VecDeque<RepairRecord>>,
}

impl RepairLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, record: RepairRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent first.
    pub fn recent(&self, n: usize) -> Vec<RepairRecord> {
        self.records.lock().iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Success and total counts per assigned variant.
    pub fn variant_tallies(&self) -> BTreeMap<String, VariantTally> {
        let mut tallies: BTreeMap<String, VariantTally> = BTreeMap::new();
        for record in self.records.lock().iter() {
            if let Some(variant) = &record.variant {
                let tally = tallies.entry(variant.clone()).or_default();
                tally.total += 1;
                if record.success {
                    tally.success += 1;
                }
            }
        }
        tallies
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairPassReport {
    pub attempted: usize,
    pub repaired: usize,
    pub failed: usize,
}

pub struct RepairEngine {
    ctx: Arc<StorageContext>,
    verifier: Arc<ConsistencyVerifier>,
    advisor: Arc<dyn RepairAdvisor>,
    analyzer: Arc<dyn VerificationAnalyzer>,
    source: Arc<dyn RecordSource>,
    assigner: Option<Arc<dyn StrategyAssigner>>,
    ledger: RepairLedger,
}

impl RepairEngine {
    pub fn new(
        ctx: Arc<StorageContext>,
        verifier: Arc<ConsistencyVerifier>,
        advisor: Arc<dyn RepairAdvisor>,
        analyzer: Arc<dyn VerificationAnalyzer>,
        source: Arc<dyn RecordSource>,
        assigner: Option<Arc<dyn StrategyAssigner>>,
    ) -> Self {
        let ledger = RepairLedger::new(ctx.config.repair.ledger_capacity);
        Self {
            ctx,
            verifier,
            advisor,
            analyzer,
            source,
            assigner,
            ledger,
        }
    }

    pub fn ledger(&self) -> &RepairLedger {
        &self.ledger
    }

    /// Repair `key` with the given strategy name.
    pub async fn repair_named(
        &self,
        key: &str,
        kind: &str,
    ) -> Result<RegistryEntry, RepairError> {
        let kind: IssueKind = kind.parse()?;
        self.repair_data(key, kind).await
    }

    /// Run one repair strategy and re-verify. The key returns to active only if
    /// the post-repair verification passes.
    pub async fn repair_data(
        &self,
        key: &str,
        kind: IssueKind,
    ) -> Result<RegistryEntry, RepairError> {
        let _guard = self.ctx.registry.lock_key(key).await;
        let entry = self
            .ctx
            .registry
            .get(key)
            .ok_or_else(|| RegistryError::UnknownKey(key.to_string()))?;

        match kind {
            IssueKind::SingleCorruption => self.restore_from_healthy_copy(&entry).await?,
            IssueKind::MultiCorruption => self.rebuild_from_source(&entry).await?,
            IssueKind::MetadataIssue => self.rebuild_metadata(&entry).await?,
        };

        let verdict = self.verifier.ensure_consistent_locked(key).await?;
        debug!(key, ?verdict, "post-repair verification");
        if !entry.is_active() {
            self.ctx.registry.set_active(key)?;
        }
        info!(key, %kind, "repair succeeded");
        self.ctx
            .registry
            .get(key)
            .ok_or_else(|| RegistryError::UnknownKey(key.to_string()).into())
    }

    /// Ask the advisor for a strategy, run it, and record the outcome.
    /// Failures are alerted and the key stays quarantined for the next pass.
    pub async fn auto_repair(&self, key: &str) -> Result<RegistryEntry, RepairError> {
        let diagnostics = self.analyzer.generate_report(key);
        debug!(key, %diagnostics, "verification diagnostics");
        let variant = self
            .assigner
            .as_ref()
            .and_then(|a| a.assign_variant(key));

        let (strategy, confidence, result) = match self.advisor.recommend_strategy(key).await {
            Ok(rec) => {
                let result = match rec.strategy.parse::<IssueKind>() {
                    Ok(kind) => self.repair_data(key, kind).await,
                    Err(_) => Err(RepairError::UnknownStrategy(rec.strategy.clone())),
                };
                (rec.strategy, Some(rec.confidence), result)
            }
            Err(e) => (String::new(), None, Err(RepairError::Advisor(e))),
        };

        self.ledger.record(RepairRecord {
            key: key.to_string(),
            kind: strategy.parse().ok(),
            strategy: strategy.clone(),
            variant,
            confidence,
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
            at: SystemTime::now(),
        });

        if let Err(e) = &result {
            warn!(key, strategy = %strategy, error = %e, "repair failed");
            self.ctx.alert(Alert::new(
                AlertKind::RepairFailed,
                AlertSubject::Key(key.to_string()),
                Severity::Critical,
                format!("repair of {key} failed: {e}"),
            ));
        }
        result
    }

    /// Attempt every quarantined key once.
    pub async fn auto_repair_pass(&self) -> RepairPassReport {
        let mut report = RepairPassReport::default();
        for key in self.ctx.registry.quarantined_keys() {
            report.attempted += 1;
            match self.auto_repair(&key).await {
                Ok(_) => report.repaired += 1,
                Err(_) => report.failed += 1,
            }
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                repaired = report.repaired,
                failed = report.failed,
                "repair pass finished"
            );
        }
        report
    }

    async fn restore_from_healthy_copy(&self, entry: &RegistryEntry) -> Result<(), RepairError> {
        for uri in entry.locations() {
            match self.ctx.providers.retrieve(uri).await {
                Ok(data) if content_digest(&data) == entry.digest => {
                    debug!(key = %entry.key, source = %uri, "restoring from healthy copy");
                    self.ctx
                        .relocate_locked(entry, &data, entry.tier, true)
                        .await?;
                    return Ok(());
                }
                Ok(_) => debug!(key = %entry.key, %uri, "copy does not match digest"),
                Err(e) => debug!(key = %entry.key, %uri, error = %e, "copy unreadable"),
            }
        }
        Err(RepairError::NoHealthyCopy(entry.key.clone()))
    }

    async fn rebuild_from_source(&self, entry: &RegistryEntry) -> Result<(), RepairError> {
        let data = self
            .source
            .fetch_raw(&entry.key)
            .await
            .map_err(RepairError::Source)?;
        self.ctx
            .relocate_locked(entry, &data, entry.tier, true)
            .await?;
        Ok(())
    }

    /// Trust the primary: recompute digest and size, drop replicas that
    /// disagree with it.
    async fn rebuild_metadata(&self, entry: &RegistryEntry) -> Result<(), RepairError> {
        let data = self
            .ctx
            .providers
            .retrieve(&entry.uri)
            .await
            .map_err(|_| RepairError::PrimaryUnreadable(entry.key.clone()))?;
        let digest = content_digest(&data);

        let mut replicas = Vec::new();
        let mut dropped = Vec::new();
        for uri in &entry.replicas {
            match self.ctx.providers.object_hash(uri).await {
                Ok(hash) if hash == digest => replicas.push(uri.clone()),
                _ => dropped.push(uri.clone()),
            }
        }

        let size = data.len() as u64;
        self.ctx.registry.update(&entry.key, |e| {
            e.digest = digest;
            e.size_bytes = size;
            e.replicas = replicas;
            e.last_verified = None;
        })?;
        self.ctx.providers.delete_all(&dropped).await;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tracevault_core::collab::{CollaboratorError, Diagnostics, Recommendation};
    use tracevault_core::model::{EntryStatus, Tier};

    use crate::placement::tests::{Fixture, fixture};

    pub(crate) struct FixedAdvisor(pub &'static str);

    #[async_trait]
    impl RepairAdvisor for FixedAdvisor {
        async fn recommend_strategy(&self, _key: &str) -> Result<Recommendation, CollaboratorError> {
            Ok(Recommendation {
                strategy: self.0.to_string(),
                confidence: 0.9,
            })
        }
    }

    pub(crate) struct NoDiagnostics;

    impl VerificationAnalyzer for NoDiagnostics {
        fn generate_report(&self, key: &str) -> Diagnostics {
            json!({ "key": key })
        }
    }

    pub(crate) struct FixedSource(pub Option<&'static [u8]>);

    #[async_trait]
    impl RecordSource for FixedSource {
        async fn fetch_raw(&self, key: &str) -> Result<Vec<u8>, CollaboratorError> {
            self.0
                .map(<[u8]>::to_vec)
                .ok_or_else(|| CollaboratorError::new("source", format!("{key} not retained")))
        }
    }

    struct EvenOdd;

    impl StrategyAssigner for EvenOdd {
        fn assign_variant(&self, key: &str) -> Option<String> {
            Some(if key.len() % 2 == 0 { "even" } else { "odd" }.to_string())
        }
    }

    fn engine(f: &Fixture, strategy: &'static str, source: Option<&'static [u8]>) -> RepairEngine {
        RepairEngine::new(
            f.ctx.clone(),
            Arc::new(ConsistencyVerifier::new(f.ctx.clone())),
            Arc::new(FixedAdvisor(strategy)),
            Arc::new(NoDiagnostics),
            Arc::new(FixedSource(source)),
            Some(Arc::new(EvenOdd)),
        )
    }

    async fn corrupt_replica(f: &Fixture, key: &str) -> RegistryEntry {
        let entry = f.ctx.put(key, b"original", Tier::Warm).await.unwrap();
        f.providers[1].corrupt(&entry.replicas[0].object_id);
        f.ctx.registry.quarantine(key).unwrap();
        entry
    }

    #[test]
    fn test_unknown_issue_kind_fails_fast() {
        assert!(matches!(
            "cosmic_rays".parse::<IssueKind>(),
            Err(RepairError::UnknownIssueKind(_))
        ));
        assert_eq!("metadata_issue".parse::<IssueKind>().unwrap(), IssueKind::MetadataIssue);
    }

    #[tokio::test]
    async fn test_single_corruption_restores_from_healthy_copy() {
        let f = fixture(2);
        let before = corrupt_replica(&f, "k").await;
        let engine = engine(&f, "single_corruption", None);

        let after = engine.repair_data("k", IssueKind::SingleCorruption).await.unwrap();
        assert_eq!(after.status, EntryStatus::Active);
        assert_eq!(after.digest, before.digest);
        assert_ne!(after.replicas, before.replicas);
        assert_eq!(f.ctx.get("k").await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_multi_corruption_rebuilds_from_source() {
        let f = fixture(2);
        let entry = f.ctx.put("k", b"original", Tier::Warm).await.unwrap();
        f.providers[0].corrupt(&entry.uri.object_id);
        f.providers[1].corrupt(&entry.replicas[0].object_id);
        f.ctx.registry.quarantine("k").unwrap();
        let engine = engine(&f, "multi_corruption", Some(&b"original"[..]));

        assert!(matches!(
            engine.repair_data("k", IssueKind::SingleCorruption).await,
            Err(RepairError::NoHealthyCopy(_))
        ));
        engine.repair_data("k", IssueKind::MultiCorruption).await.unwrap();
        assert_eq!(f.ctx.get("k").await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_metadata_issue_trusts_primary() {
        let f = fixture(2);
        let entry = corrupt_replica(&f, "k").await;
        let engine = engine(&f, "metadata_issue", None);

        let after = engine.repair_data("k", IssueKind::MetadataIssue).await.unwrap();
        assert!(after.replicas.is_empty());
        assert_eq!(after.uri, entry.uri);
        assert!(!f.providers[1].contains(&entry.replicas[0].object_id));
    }

    #[tokio::test]
    async fn test_auto_repair_records_and_reactivates() {
        let f = fixture(2);
        corrupt_replica(&f, "k").await;
        let engine = engine(&f, "single_corruption", None);

        let report = engine.auto_repair_pass().await;
        assert_eq!(report.repaired, 1);
        assert!(f.ctx.registry.quarantined_keys().is_empty());

        let record = &engine.ledger().recent(1)[0];
        assert!(record.success);
        assert_eq!(record.kind, Some(IssueKind::SingleCorruption));
        assert_eq!(record.variant.as_deref(), Some("odd"));
        assert_eq!(engine.ledger().variant_tallies()["odd"], VariantTally { success: 1, total: 1 });
    }

    #[tokio::test]
    async fn test_failed_repair_alerts_and_stays_quarantined() {
        let f = fixture(2);
        let entry = f.ctx.put("kk", b"original", Tier::Warm).await.unwrap();
        f.providers[0].corrupt(&entry.uri.object_id);
        f.providers[1].corrupt(&entry.replicas[0].object_id);
        f.ctx.registry.quarantine("kk").unwrap();
        let engine = engine(&f, "multi_corruption", None);

        assert!(matches!(
            engine.auto_repair("kk").await,
            Err(RepairError::Source(_))
        ));
        assert_eq!(f.ctx.registry.quarantined_keys(), vec!["kk".to_string()]);
        let alerts = f.alerts.alerts();
        assert!(alerts.iter().any(|a| a.kind == AlertKind::RepairFailed));
        assert_eq!(engine.ledger().variant_tallies()["even"], VariantTally { success: 0, total: 1 });
    }

    #[tokio::test]
    async fn test_unknown_strategy_from_advisor() {
        let f = fixture(2);
        corrupt_replica(&f, "k").await;
        let engine = engine(&f, "reboot_the_moon", None);

        assert!(matches!(
            engine.auto_repair("k").await,
            Err(RepairError::UnknownStrategy(_))
        ));
        assert!(engine.ledger().recent(1)[0].kind.is_none());
    }
}
