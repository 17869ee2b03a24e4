//! Bounded in-memory trace buffer with batch compression.
//!
//! Records are kept in the live buffer ordered by start time. Once enough
//! records have arrived since the last flush, everything but the most recent
//! tail is relocated into a [`CompressedBatch`]. The batch list is ordered by
//! each batch's newest record; a record that arrives late may give a batch an
//! older `oldest` than its predecessors, but never an older `newest`.
//!
//! Relocation is two-phase: the records to flush are copied out and encoded
//! without holding the buffer lock, then the batch is published and the same
//! records are removed from the live buffer inside one critical section. A
//! concurrent [`TraceCompressor::retrieve`] snapshots buffer and batch list
//! under that same lock, so it observes every record exactly once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracevault_core::trace::TraceRecord;
use tracing::{debug, warn};

use crate::config::CompressorConfig;
use crate::error::{CodecError, CorruptBatch, IngestError};
use crate::pipeline::BatchCodec;

/// An immutable, encoded group of relocated records.
#[derive(Debug)]
pub struct CompressedBatch {
    /// Monotonic batch sequence number.
    pub seq: u64,
    pub bytes: Vec<u8>,
    pub record_count: usize,
    pub oldest: SystemTime,
    pub newest: SystemTime,
}

/// Which records a compression pass relocates.
#[derive(Debug, Clone, Copy)]
pub enum FlushMode {
    /// Everything except the configured most recent tail.
    Tail,
    /// Every leading record that started before the cutoff.
    OlderThan(SystemTime),
}

#[derive(Debug, Default)]
pub struct Retrieved {
    /// Matching records, newest first.
    pub records: Vec<TraceRecord>,
    /// Batches that could not be decoded and were skipped.
    pub skipped: Vec<CorruptBatch>,
}

/// Records old enough to leave the compressor, decoded from their batches.
#[derive(Debug, Default)]
pub struct ArchiveCandidates {
    /// Every batch that contributed records.
    pub batch_seqs: Vec<u64>,
    pub records: Vec<TraceRecord>,
    /// Younger records of a batch straddling the cutoff, keyed by batch.
    pub retained: Vec<(u64, Vec<TraceRecord>)>,
    pub skipped: Vec<CorruptBatch>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompressorStats {
    pub live_records: usize,
    pub batches: usize,
    pub batched_records: usize,
    pub compressed_bytes: u64,
}

/// A live record tagged with its arrival number.
struct Buffered {
    id: u64,
    record: TraceRecord,
}

#[derive(Default)]
struct BufferState {
    /// Sorted by `start_time`; equal times keep arrival order.
    live: VecDeque<Buffered>,
    /// Sorted by `newest`.
    batches: Vec<Arc<CompressedBatch>>,
    /// Records added since the last flush.
    unflushed: usize,
    next_seq: u64,
    next_id: u64,
}

impl BufferState {
    fn insert_live(&mut self, record: TraceRecord) {
        let id = self.next_id;
        self.next_id += 1;
        let at = self
            .live
            .partition_point(|b| b.record.start_time <= record.start_time);
        self.live.insert(at, Buffered { id, record });
    }

    fn insert_batch(&mut self, batch: Arc<CompressedBatch>) {
        let at = self.batches.partition_point(|b| b.newest <= batch.newest);
        self.batches.insert(at, batch);
    }
}

pub struct TraceCompressor {
    config: CompressorConfig,
    codec: Arc<BatchCodec>,
    state: Mutex<BufferState>,
    /// Serializes relocation and purging; never held by readers.
    flush_lock: Mutex<()>,
}

impl TraceCompressor {
    pub fn new(config: CompressorConfig, codec: Arc<BatchCodec>) -> Self {
        Self {
            config,
            codec,
            state: Mutex::new(BufferState::default()),
            flush_lock: Mutex::new(()),
        }
    }

    /// Append a record, relocating older records first if the buffer is full.
    pub fn add(&self, record: TraceRecord) -> Result<(), IngestError> {
        if record.start_time.duration_since(UNIX_EPOCH).is_err() {
            return Err(IngestError::InvalidTimestamp(record.trace_id.to_string()));
        }

        let mut record = Some(record);
        let should_flush = loop {
            {
                let mut state = self.state.lock();
                if state.live.len() < self.config.capacity {
                    if let Some(record) = record.take() {
                        state.insert_live(record);
                    }
                    state.unflushed += 1;
                    break state.unflushed >= self.config.flush_threshold;
                }
            }
            // Full: make room before accepting the record.
            if self.compress_batch(FlushMode::Tail)? == 0 {
                return Err(IngestError::Relocation(CodecError::Serialization(
                    "buffer full with nothing eligible for relocation".into(),
                )));
            }
        };

        if should_flush {
            self.compress_batch(FlushMode::Tail)?;
        }
        Ok(())
    }

    /// Relocate records into a new batch. Returns the number relocated.
    pub fn compress_batch(&self, mode: FlushMode) -> Result<usize, CodecError> {
        let _flush = self.flush_lock.lock();

        // Phase 1: copy out the oldest records. Only flushers remove from the
        // buffer and they are serialized by `flush_lock`, so every copied
        // record is still buffered in phase 3. Concurrent adds may insert
        // between them; they are matched by id, not position.
        let (ids, detached): (HashSet<u64>, Vec<TraceRecord>) = {
            let mut state = self.state.lock();
            let count = match mode {
                FlushMode::Tail => state.live.len().saturating_sub(self.config.retain_tail),
                FlushMode::OlderThan(cutoff) => state
                    .live
                    .iter()
                    .take_while(|b| b.record.start_time < cutoff)
                    .count(),
            };
            if count == 0 {
                if matches!(mode, FlushMode::Tail) {
                    state.unflushed = 0;
                }
                return Ok(0);
            }
            state
                .live
                .iter()
                .take(count)
                .map(|b| (b.id, b.record.clone()))
                .unzip()
        };

        // Phase 2: encode outside the buffer lock.
        let count = detached.len();
        let sealed = self.seal(&detached)?;

        // Phase 3: publish the batch and drop the originals atomically.
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.insert_batch(Arc::new(CompressedBatch { seq, ..sealed }));
        state.live.retain(|b| !ids.contains(&b.id));
        if matches!(mode, FlushMode::Tail) {
            state.unflushed = 0;
        }
        debug!(seq, records = count, "relocated records into batch");
        Ok(count)
    }

    /// Records started within the last `since_hours`, newest first.
    pub fn retrieve(&self, since_hours: u64) -> Retrieved {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(since_hours.saturating_mul(3600)))
            .unwrap_or(UNIX_EPOCH);
        self.retrieve_since(cutoff)
    }

    pub fn retrieve_since(&self, cutoff: SystemTime) -> Retrieved {
        let (mut records, batches) = {
            let state = self.state.lock();
            let live: Vec<TraceRecord> = state
                .live
                .iter()
                .filter(|b| b.record.start_time >= cutoff)
                .map(|b| b.record.clone())
                .collect();
            (live, state.batches.clone())
        };

        let mut skipped = Vec::new();
        for batch in batches.iter().rev() {
            // Ordered by newest: every earlier batch ends before this one.
            if batch.newest < cutoff {
                break;
            }
            match self.codec.decode_records(&batch.bytes) {
                Ok(decoded) => {
                    records.extend(decoded.into_iter().filter(|r| r.start_time >= cutoff))
                }
                Err(source) => {
                    warn!(batch = batch.seq, error = %source, "skipping corrupt batch");
                    skipped.push(CorruptBatch {
                        batch: batch.seq,
                        source,
                    });
                }
            }
        }

        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Retrieved { records, skipped }
    }

    /// Collect every batched record that started before `cutoff`. A batch
    /// straddling the cutoff contributes its older records; the rest are
    /// reported in `retained`.
    ///
    /// Nothing is removed; call [`Self::commit_purge`] once the records are
    /// safely stored elsewhere.
    pub fn archive_candidates(&self, cutoff: SystemTime) -> ArchiveCandidates {
        let batches: Vec<Arc<CompressedBatch>> = self
            .state
            .lock()
            .batches
            .iter()
            .filter(|b| b.oldest < cutoff)
            .cloned()
            .collect();

        let mut candidates = ArchiveCandidates::default();
        for batch in batches {
            match self.codec.decode_records(&batch.bytes) {
                Ok(decoded) => {
                    candidates.batch_seqs.push(batch.seq);
                    if batch.newest < cutoff {
                        candidates.records.extend(decoded);
                        continue;
                    }
                    let (old, young): (Vec<_>, Vec<_>) =
                        decoded.into_iter().partition(|r| r.start_time < cutoff);
                    candidates.records.extend(old);
                    candidates.retained.push((batch.seq, young));
                }
                Err(source) => candidates.skipped.push(CorruptBatch {
                    batch: batch.seq,
                    source,
                }),
            }
        }
        candidates
    }

    /// Drop the archived records of `candidates`: whole batches are removed
    /// and straddling batches are rewritten with their retained records.
    /// Returns how many batches were touched.
    pub fn commit_purge(&self, candidates: &ArchiveCandidates) -> Result<usize, CodecError> {
        let mut replacements = HashMap::new();
        for (seq, records) in &candidates.retained {
            if !records.is_empty() {
                let sealed = self.seal(records)?;
                replacements.insert(*seq, Arc::new(CompressedBatch { seq: *seq, ..sealed }));
            }
        }

        let _flush = self.flush_lock.lock();
        let mut state = self.state.lock();
        let mut touched = 0;
        let batches = std::mem::take(&mut state.batches);
        state.batches = batches
            .into_iter()
            .filter_map(|batch| {
                if !candidates.batch_seqs.contains(&batch.seq) {
                    return Some(batch);
                }
                touched += 1;
                replacements.remove(&batch.seq)
            })
            .collect();
        Ok(touched)
    }

    /// Encode chronologically sorted records. The caller assigns `seq`.
    fn seal(&self, records: &[TraceRecord]) -> Result<CompressedBatch, CodecError> {
        Ok(CompressedBatch {
            seq: 0,
            bytes: self.codec.encode_records(records)?,
            record_count: records.len(),
            oldest: records.first().map(|r| r.start_time).unwrap_or(UNIX_EPOCH),
            newest: records.last().map(|r| r.start_time).unwrap_or(UNIX_EPOCH),
        })
    }

    /// Serialized size of the live buffer, in bytes.
    pub fn buffered_bytes(&self) -> u64 {
        self.state
            .lock()
            .live
            .iter()
            .map(|b| serde_json::to_vec(&b.record).map(|v| v.len() as u64).unwrap_or(0))
            .sum()
    }

    pub fn stats(&self) -> CompressorStats {
        let state = self.state.lock();
        CompressorStats {
            live_records: state.live.len(),
            batches: state.batches.len(),
            batched_records: state.batches.iter().map(|b| b.record_count).sum(),
            compressed_bytes: state.batches.iter().map(|b| b.bytes.len() as u64).sum(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use tracevault_core::trace::{Span, SpanId, TraceId};

    pub(crate) fn record_at(n: u32, start_time: SystemTime) -> TraceRecord {
        let mut id = [0u8; 16];
        id[..4].copy_from_slice(&n.to_be_bytes());
        TraceRecord {
            trace_id: TraceId(id),
            root: Span {
                span_id: SpanId([1; 8]),
                name: format!("op-{n}"),
                tags: HashMap::new(),
                children: Vec::new(),
            },
            start_time,
            duration: Duration::from_millis(3),
            tags: HashMap::new(),
        }
    }

    /// `count` records spaced one second apart, ending roughly now.
    fn records(count: u32) -> Vec<TraceRecord> {
        let base = SystemTime::now() - Duration::from_secs(u64::from(count) + 10);
        (0..count)
            .map(|n| record_at(n, base + Duration::from_secs(u64::from(n))))
            .collect()
    }

    fn compressor() -> TraceCompressor {
        TraceCompressor::new(CompressorConfig::default(), Arc::new(BatchCodec::default()))
    }

    #[test]
    fn test_round_trip_across_relocation_boundary() {
        let compressor = compressor();
        let input = records(350);
        for r in input.clone() {
            compressor.add(r).unwrap();
        }

        let stats = compressor.stats();
        assert!(stats.batches >= 1);
        assert_eq!(stats.live_records + stats.batched_records, 350);

        let out = compressor.retrieve(24).records;
        assert_eq!(out.len(), 350);
        let unique: HashSet<_> = out.iter().map(|r| r.trace_id.clone()).collect();
        assert_eq!(unique.len(), 350);
        assert!(out.windows(2).all(|w| w[0].start_time >= w[1].start_time));
        assert_eq!(out[0].trace_id, input[349].trace_id);
        assert_eq!(out[349].trace_id, input[0].trace_id);
    }

    #[test]
    fn test_flush_keeps_most_recent_tail_live() {
        let compressor = compressor();
        for r in records(200) {
            compressor.add(r).unwrap();
        }
        let stats = compressor.stats();
        assert_eq!(stats.live_records, 100);
        assert_eq!(stats.batched_records, 100);
    }

    #[test]
    fn test_buffer_never_exceeds_capacity() {
        let config = CompressorConfig {
            capacity: 20,
            flush_threshold: 1000,
            retain_tail: 5,
        };
        let compressor = TraceCompressor::new(config, Arc::new(BatchCodec::default()));
        for r in records(95) {
            compressor.add(r).unwrap();
            assert!(compressor.stats().live_records <= 20);
        }
        let stats = compressor.stats();
        assert_eq!(stats.live_records + stats.batched_records, 95);
    }

    #[test]
    fn test_retrieve_respects_cutoff() {
        let compressor = compressor();
        let now = SystemTime::now();
        for n in 0..150u32 {
            let age = Duration::from_secs(3600 * u64::from(150 - n) - 1800);
            compressor.add(record_at(n, now - age)).unwrap();
        }
        // Records 146..=149 are within the last 4 hours (ages 3.5h..0.5h).
        let out = compressor.retrieve(4).records;
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|r| {
            now.duration_since(r.start_time).unwrap() <= Duration::from_secs(4 * 3600)
        }));
    }

    #[test]
    fn test_corrupt_batch_is_skipped_not_fatal() {
        let compressor = compressor();
        for r in records(300) {
            compressor.add(r).unwrap();
        }
        let before = compressor.stats();
        {
            let mut state = compressor.state.lock();
            let victim = state.batches[0].as_ref();
            let corrupted = CompressedBatch {
                seq: victim.seq,
                bytes: b"not a batch".to_vec(),
                record_count: victim.record_count,
                oldest: victim.oldest,
                newest: victim.newest,
            };
            state.batches[0] = Arc::new(corrupted);
        }

        let out = compressor.retrieve(24);
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(
            out.records.len(),
            300 - before.batched_records / before.batches
        );
    }

    #[test]
    fn test_flush_older_than_moves_only_old_records() {
        let compressor = compressor();
        let now = SystemTime::now();
        for n in 0..10u32 {
            let age = Duration::from_secs(86_400 * u64::from(10 - n));
            compressor.add(record_at(n, now - age)).unwrap();
        }
        let moved = compressor
            .compress_batch(FlushMode::OlderThan(now - Duration::from_secs(86_400 * 7)))
            .unwrap();
        assert_eq!(moved, 3);
        assert_eq!(compressor.stats().live_records, 7);
        assert_eq!(
            compressor
                .compress_batch(FlushMode::OlderThan(now - Duration::from_secs(86_400 * 7)))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_archive_candidates_then_purge() {
        let compressor = compressor();
        let now = SystemTime::now();
        for n in 0..10u32 {
            let age = Duration::from_secs(86_400 * u64::from(40 - n));
            compressor.add(record_at(n, now - age)).unwrap();
        }
        compressor.compress_batch(FlushMode::OlderThan(now)).unwrap();

        let candidates = compressor.archive_candidates(now - Duration::from_secs(86_400 * 30));
        assert_eq!(candidates.records.len(), 10);
        assert_eq!(compressor.stats().batches, 1);

        assert_eq!(compressor.commit_purge(&candidates).unwrap(), 1);
        assert_eq!(compressor.stats().batches, 0);
        assert!(compressor.retrieve(24 * 365).records.is_empty());
    }

    #[test]
    fn test_straddling_batch_keeps_younger_records() {
        let compressor = compressor();
        let now = SystemTime::now();
        for n in 0..10u32 {
            let age = Duration::from_secs(86_400 * u64::from(40 - 2 * n));
            compressor.add(record_at(n, now - age)).unwrap();
        }
        compressor.compress_batch(FlushMode::OlderThan(now)).unwrap();

        // Ages 40, 38, ..., 32 go; 30, 28, ..., 22 stay.
        let candidates = compressor.archive_candidates(now - Duration::from_secs(86_400 * 31));
        assert_eq!(candidates.records.len(), 5);
        assert_eq!(candidates.retained.len(), 1);

        assert_eq!(compressor.commit_purge(&candidates).unwrap(), 1);
        let stats = compressor.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.batched_records, 5);
        assert_eq!(compressor.retrieve(24 * 365).records.len(), 5);
    }

    #[test]
    fn test_late_record_does_not_hide_earlier_batches() {
        let compressor = compressor();
        let now = SystemTime::now();
        let hour = Duration::from_secs(3600);
        for n in 0..120u32 {
            compressor.add(record_at(n, now - hour * 2)).unwrap();
        }
        compressor.add(record_at(500, now - hour * 48)).unwrap();
        for n in 120..299u32 {
            compressor.add(record_at(n, now - hour)).unwrap();
        }
        assert_eq!(compressor.stats().batches, 2);

        let within_day = compressor.retrieve(24).records;
        assert_eq!(within_day.len(), 299);
        assert!(within_day.iter().all(|r| r.trace_id != record_at(500, now).trace_id));
        assert_eq!(compressor.retrieve(72).records.len(), 300);

        let candidates = compressor.archive_candidates(now - hour * 24);
        assert_eq!(candidates.records.len(), 1);
        assert_eq!(candidates.retained.len(), 1);
    }

    #[test]
    fn test_live_buffer_stays_ordered_by_start_time() {
        let compressor = compressor();
        let now = SystemTime::now();
        for (n, secs) in [(0u32, 30u64), (1, 10), (2, 50), (3, 20)] {
            compressor.add(record_at(n, now - Duration::from_secs(secs))).unwrap();
        }
        let moved = compressor
            .compress_batch(FlushMode::OlderThan(now - Duration::from_secs(25)))
            .unwrap();
        assert_eq!(moved, 2);
        let newest_first: Vec<TraceId> = compressor
            .retrieve(1)
            .records
            .into_iter()
            .map(|r| r.trace_id)
            .collect();
        let expected: Vec<TraceId> = [1, 3, 0, 2]
            .into_iter()
            .map(|n| record_at(n, now).trace_id)
            .collect();
        assert_eq!(newest_first, expected);
    }

    #[test]
    fn test_concurrent_reads_see_each_record_once() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        let compressor = Arc::new(compressor());
        let acked = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let input = records(2_000);

        let writer = {
            let compressor = Arc::clone(&compressor);
            let acked = Arc::clone(&acked);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for r in input {
                    compressor.add(r).unwrap();
                    acked.fetch_add(1, Ordering::SeqCst);
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        loop {
            let finished = done.load(Ordering::SeqCst);
            let before = acked.load(Ordering::SeqCst);
            let out = compressor.retrieve(24).records;
            let unique: HashSet<_> = out.iter().map(|r| r.trace_id.clone()).collect();
            assert_eq!(unique.len(), out.len(), "duplicate record in snapshot");
            assert!(out.len() >= before, "lost {} acknowledged records", before - out.len());
            if finished {
                break;
            }
        }
        writer.join().unwrap();

        assert!(compressor.stats().batches >= 10);
        assert_eq!(compressor.retrieve(24).records.len(), 2_000);
    }

    #[test]
    fn test_pre_epoch_record_is_rejected_without_blocking_others() {
        let compressor = compressor();
        let bad = record_at(1, UNIX_EPOCH - Duration::from_secs(1));
        assert!(matches!(
            compressor.add(bad),
            Err(IngestError::InvalidTimestamp(_))
        ));
        compressor.add(record_at(2, SystemTime::now())).unwrap();
        assert_eq!(compressor.stats().live_records, 1);
    }
}
