//! Moves aged records out of the compressor into archived bundles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;
use tracevault_core::model::Tier;
use tracevault_core::trace::TraceRecord;
use tracing::{info, warn};

use crate::compressor::{FlushMode, TraceCompressor};
use crate::context::StorageContext;
use crate::error::ArchiveError;
use crate::pipeline::BatchCodec;

/// Registry key prefix of archive bundles.
pub const ARCHIVE_PREFIX: &str = "archive/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveOutcome {
    pub key: String,
    pub records: usize,
    pub batches: usize,
    pub bytes: u64,
}

pub struct TraceArchiver {
    ctx: Arc<StorageContext>,
    compressor: Arc<TraceCompressor>,
    codec: Arc<BatchCodec>,
    archived_bytes: AtomicU64,
    /// One archival run at a time.
    running: Mutex<()>,
}

impl TraceArchiver {
    pub fn new(
        ctx: Arc<StorageContext>,
        compressor: Arc<TraceCompressor>,
        codec: Arc<BatchCodec>,
    ) -> Self {
        let archived: u64 = ctx
            .registry
            .entries_with_prefix(ARCHIVE_PREFIX)
            .iter()
            .map(|e| e.size_bytes)
            .sum();
        Self {
            ctx,
            compressor,
            codec,
            archived_bytes: AtomicU64::new(archived),
            running: Mutex::new(()),
        }
    }

    pub fn archived_bytes(&self) -> u64 {
        self.archived_bytes.load(Ordering::Acquire)
    }

    /// Archive every record that started before `cutoff`. Returns `None` when
    /// there was nothing to archive.
    ///
    /// Batches leave the compressor only after the bundle is stored.
    pub async fn archive_before(
        &self,
        cutoff: SystemTime,
    ) -> Result<Option<ArchiveOutcome>, ArchiveError> {
        let _running = self.running.lock().await;

        self.compressor.compress_batch(FlushMode::OlderThan(cutoff))?;
        let candidates = self.compressor.archive_candidates(cutoff);
        for skipped in &candidates.skipped {
            warn!(batch = skipped.batch, error = %skipped.source, "corrupt batch left in place");
        }
        let Some(first_seq) = candidates.batch_seqs.first().copied() else {
            return Ok(None);
        };

        let bundle = self.codec.encode_records(&candidates.records)?;
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let key = format!("{ARCHIVE_PREFIX}{secs}-{first_seq}");
        let entry = self.ctx.put(&key, &bundle, Tier::Archived).await?;

        let batches = self.compressor.commit_purge(&candidates)?;
        self.archived_bytes.fetch_add(entry.size_bytes, Ordering::AcqRel);
        info!(
            key = %key,
            records = candidates.records.len(),
            batches,
            bytes = entry.size_bytes,
            "archived records"
        );
        Ok(Some(ArchiveOutcome {
            key,
            records: candidates.records.len(),
            batches,
            bytes: entry.size_bytes,
        }))
    }

    /// Read back an archive bundle.
    pub async fn load(&self, key: &str) -> Result<Vec<TraceRecord>, ArchiveError> {
        let bytes = self.ctx.get(key).await?;
        Ok(self.codec.decode_records(&bytes)?)
    }

    /// Keys of every archive bundle, oldest first.
    pub fn bundles(&self) -> Vec<String> {
        self.ctx
            .registry
            .entries_with_prefix(ARCHIVE_PREFIX)
            .into_iter()
            .map(|e| e.key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::compressor::tests::record_at;
    use crate::config::CompressorConfig;
    use crate::placement::tests::{Fixture, fixture};

    const DAY: Duration = Duration::from_secs(86_400);

    fn setup() -> (Fixture, Arc<TraceCompressor>, TraceArchiver) {
        let f = fixture(2);
        let codec = Arc::new(BatchCodec::default());
        let compressor = Arc::new(TraceCompressor::new(
            CompressorConfig::default(),
            codec.clone(),
        ));
        let archiver = TraceArchiver::new(f.ctx.clone(), compressor.clone(), codec);
        (f, compressor, archiver)
    }

    #[tokio::test]
    async fn test_archives_only_records_older_than_cutoff() {
        let (f, compressor, archiver) = setup();
        let now = SystemTime::now();
        for n in 0..20u32 {
            compressor.add(record_at(n, now - DAY * (40 - n))).unwrap();
        }

        let outcome = archiver.archive_before(now - DAY * 30).await.unwrap().unwrap();
        // Ages 40..=31 days are archived, 30..=21 stay.
        assert_eq!(outcome.records, 10);
        assert_eq!(compressor.retrieve(24 * 365).records.len(), 10);
        assert_eq!(archiver.archived_bytes(), outcome.bytes);

        let entry = f.ctx.registry.get(&outcome.key).unwrap();
        assert_eq!(entry.tier, Tier::Archived);
        let restored = archiver.load(&outcome.key).await.unwrap();
        assert_eq!(restored.len(), 10);
        assert_eq!(archiver.bundles(), vec![outcome.key]);
    }

    #[tokio::test]
    async fn test_nothing_to_archive_is_none() {
        let (_f, compressor, archiver) = setup();
        compressor.add(record_at(1, SystemTime::now())).unwrap();
        assert!(archiver
            .archive_before(SystemTime::now() - DAY)
            .await
            .unwrap()
            .is_none());
        assert_eq!(compressor.stats().live_records, 1);
    }

    #[tokio::test]
    async fn test_failed_placement_keeps_records() {
        let (f, compressor, archiver) = setup();
        let now = SystemTime::now();
        compressor.add(record_at(1, now - DAY * 60)).unwrap();
        f.providers[0].fail_next_stores(1);
        f.providers[1].fail_next_stores(1);

        assert!(archiver.archive_before(now - DAY * 30).await.is_err());
        assert_eq!(compressor.retrieve(24 * 365).records.len(), 1);
        assert_eq!(archiver.archived_bytes(), 0);
    }
}
