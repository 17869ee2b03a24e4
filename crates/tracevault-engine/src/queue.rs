//! Fixed-size worker pool driving the verifier over many keys.
//!
//! At most one verification per key is in flight: enqueuing a key that is
//! already pending or running is a no-op. Inconsistent or failed keys are
//! quarantined, alerted and handed to the repair channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracevault_core::collab::{Alert, AlertKind, AlertSubject, Severity};
use tracing::{debug, info, warn};

use crate::background::wait_for_shutdown;
use crate::context::StorageContext;
use crate::error::{RegistryError, VerifyError};
use crate::history::VerificationHistory;
use crate::verifier::{ConsistencyVerifier, IntegrityVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    Verdict(IntegrityVerdict),
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationTask {
    pub key: String,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    pub updated_at: SystemTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub workers: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub peak_in_flight: usize,
}

struct QueueShared {
    ctx: Arc<StorageContext>,
    verifier: Arc<ConsistencyVerifier>,
    history: Arc<VerificationHistory>,
    repair_tx: mpsc::UnboundedSender<String>,
    in_flight: DashSet<String>,
    tasks: DashMap<String, VerificationTask>,
    pending: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    idle: Notify,
}

type KeyReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>;

pub struct VerificationQueue {
    tx: mpsc::UnboundedSender<String>,
    rx: KeyReceiver,
    shutdown: watch::Receiver<bool>,
    shared: Arc<QueueShared>,
    workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl VerificationQueue {
    /// Spawn `workers` tasks on the current runtime.
    pub fn start(
        ctx: Arc<StorageContext>,
        verifier: Arc<ConsistencyVerifier>,
        history: Arc<VerificationHistory>,
        repair_tx: mpsc::UnboundedSender<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let workers = ctx.config.verification.workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(AsyncMutex::new(rx));
        let shared = Arc::new(QueueShared {
            ctx,
            verifier,
            history,
            repair_tx,
            in_flight: DashSet::new(),
            tasks: DashMap::new(),
            pending: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            idle: Notify::new(),
        });

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    Arc::clone(&shared),
                    Arc::clone(&rx),
                    shutdown.clone(),
                ))
            })
            .collect();
        info!(workers, "verification queue started");

        Self {
            tx,
            rx,
            shutdown,
            shared,
            workers,
            handles: Mutex::new(handles),
        }
    }

    /// Queue `key` for verification. Returns false if it is already in
    /// flight, unknown or quarantined, or once the queue is shutting down.
    pub fn enqueue(&self, key: &str) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        if !self
            .shared
            .ctx
            .registry
            .get(key)
            .is_some_and(|e| e.is_active())
        {
            return false;
        }
        if !self.shared.in_flight.insert(key.to_string()) {
            debug!(key, "verification already in flight");
            return false;
        }
        self.shared.tasks.insert(
            key.to_string(),
            VerificationTask {
                key: key.to_string(),
                status: TaskStatus::Pending,
                result: None,
                updated_at: SystemTime::now(),
            },
        );
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(key.to_string()).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            self.shared.in_flight.remove(key);
            return false;
        }
        true
    }

    /// Enqueue every active registry key. Returns how many were queued.
    pub fn schedule_pass(&self) -> usize {
        let queued = self
            .shared
            .ctx
            .registry
            .active_keys()
            .iter()
            .filter(|key| self.enqueue(key))
            .count();
        info!(queued, "verification pass scheduled");
        queued
    }

    pub fn task(&self, key: &str) -> Option<VerificationTask> {
        self.shared.tasks.get(key).map(|t| t.value().clone())
    }

    pub fn stats(&self) -> QueueStats {
        let s = &self.shared;
        QueueStats {
            workers: self.workers,
            pending: s.pending.load(Ordering::Acquire),
            running: s.running.load(Ordering::Acquire),
            completed: s.completed.load(Ordering::Acquire),
            failed: s.failed.load(Ordering::Acquire),
            peak_in_flight: s.peak.load(Ordering::Acquire),
        }
    }

    /// Resolve once nothing is pending or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Wait for every worker to exit. Workers stop on the shutdown signal;
    /// keys still queued afterwards are marked abandoned.
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "verification worker panicked");
            }
        }
        self.shared.drain(&mut *self.rx.lock().await);
    }
}

impl QueueShared {
    fn is_idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0 && self.running.load(Ordering::Acquire) == 0
    }

    fn begin(&self) {
        // Count as running before leaving pending so the queue never looks idle.
        let running = self.running.fetch_add(1, Ordering::AcqRel) + 1;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.peak.fetch_max(running, Ordering::AcqRel);
    }

    fn finish(&self, key: &str, status: TaskStatus, result: TaskResult) {
        match status {
            TaskStatus::Failed => self.failed.fetch_add(1, Ordering::AcqRel),
            _ => self.completed.fetch_add(1, Ordering::AcqRel),
        };
        if let Some(mut task) = self.tasks.get_mut(key) {
            task.status = status;
            task.result = Some(result);
            task.updated_at = SystemTime::now();
        }
        self.running.fetch_sub(1, Ordering::AcqRel);
        self.in_flight.remove(key);
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Fail every key still waiting in the channel.
    fn drain(&self, rx: &mut mpsc::UnboundedReceiver<String>) {
        let mut abandoned = 0;
        while let Ok(key) = rx.try_recv() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.failed.fetch_add(1, Ordering::AcqRel);
            if let Some(mut task) = self.tasks.get_mut(&key) {
                task.status = TaskStatus::Failed;
                task.result = Some(abandoned_result());
                task.updated_at = SystemTime::now();
            }
            self.in_flight.remove(&key);
            abandoned += 1;
        }
        if abandoned > 0 {
            debug!(abandoned, "queued verifications abandoned on shutdown");
        }
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    async fn process(&self, key: &str) -> (TaskStatus, TaskResult) {
        match self.verifier.verify_integrity(key).await {
            Ok(verdict) => {
                self.history.record_verdict(key, &verdict);
                if let IntegrityVerdict::Inconsistent { mismatched } = &verdict {
                    let providers: Vec<&str> =
                        mismatched.iter().map(|u| u.provider.as_str()).collect();
                    self.quarantine(
                        key,
                        &format!("replica mismatch on {}", providers.join(", ")),
                    )
                    .await;
                }
                (TaskStatus::Completed, TaskResult::Verdict(verdict))
            }
            Err(VerifyError::Registry(RegistryError::UnknownKey(_))) => (
                TaskStatus::Failed,
                TaskResult::Error(format!("unknown key {key}")),
            ),
            Err(e) => {
                warn!(key, error = %e, "verification failed");
                self.history.record_failure(key, &e.to_string());
                self.quarantine(key, &format!("verification failed: {e}"))
                    .await;
                (TaskStatus::Failed, TaskResult::Error(e.to_string()))
            }
        }
    }

    async fn quarantine(&self, key: &str, reason: &str) {
        let _guard = self.ctx.registry.lock_key(key).await;
        match self.ctx.registry.quarantine(key) {
            Ok(true) => {
                self.ctx.alert(Alert::new(
                    AlertKind::DataInconsistency,
                    AlertSubject::Key(key.to_string()),
                    Severity::Critical,
                    reason,
                ));
                if self.repair_tx.send(key.to_string()).is_err() {
                    debug!(key, "no repair consumer; left for the scheduled pass");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(key, error = %e, "failed to quarantine"),
        }
    }
}

fn abandoned_result() -> TaskResult {
    TaskResult::Error("abandoned".to_string())
}

async fn worker(
    id: usize,
    shared: Arc<QueueShared>,
    rx: KeyReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let key = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            key = async { rx.lock().await.recv().await } => match key {
                Some(key) => key,
                None => break,
            },
        };

        shared.begin();
        let outcome = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => None,
            outcome = shared.process(&key) => Some(outcome),
        };
        let abandoned = outcome.is_none();
        let (status, result) = outcome.unwrap_or((TaskStatus::Failed, abandoned_result()));
        shared.finish(&key, status, result);
        if abandoned {
            debug!(worker = id, key = %key, "verification abandoned on shutdown");
            break;
        }
    }
    shared.drain(&mut *rx.lock().await);
    debug!(worker = id, "verification worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MemoryAlertSink;
    use crate::config::EngineConfig;
    use crate::placement::tests::{Fixture, fixture_with};
    use tracevault_core::model::{EntryStatus, Tier};

    struct Harness {
        f: Fixture,
        queue: VerificationQueue,
        repair_rx: mpsc::UnboundedReceiver<String>,
        history: Arc<VerificationHistory>,
        shutdown: watch::Sender<bool>,
    }

    async fn harness(providers: usize, workers: usize) -> Harness {
        let mut config = EngineConfig::default();
        config.verification.workers = workers;
        let f = fixture_with(providers, config);
        let verifier = Arc::new(ConsistencyVerifier::new(f.ctx.clone()));
        let history = Arc::new(VerificationHistory::new(100));
        let (repair_tx, repair_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = VerificationQueue::start(
            f.ctx.clone(),
            verifier,
            history.clone(),
            repair_tx,
            shutdown_rx,
        );
        Harness {
            f,
            queue,
            repair_rx,
            history,
            shutdown: shutdown_tx,
        }
    }

    fn raised(alerts: &MemoryAlertSink, kind: AlertKind) -> usize {
        alerts.alerts().iter().filter(|a| a.kind == kind).count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bounded_concurrency_processes_everything() {
        let h = harness(2, 4).await;
        for i in 0..10 {
            h.f.ctx
                .put(&format!("k{i}"), format!("v{i}").as_bytes(), Tier::Hot)
                .await
                .unwrap();
        }
        for i in 0..10 {
            assert!(h.queue.enqueue(&format!("k{i}")));
        }
        h.queue.wait_idle().await;

        let stats = h.queue.stats();
        assert_eq!(stats.completed + stats.failed, 10);
        assert!(stats.peak_in_flight <= 4);
        for i in 0..10 {
            assert_eq!(
                h.queue.task(&format!("k{i}")).unwrap().status,
                TaskStatus::Completed
            );
        }
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_ignored() {
        let h = harness(2, 1).await;
        h.f.ctx.put("k", b"v", Tier::Hot).await.unwrap();

        // Hold the key lock so the first verification cannot finish.
        let guard = h.f.ctx.registry.lock_key("k").await;
        assert!(h.queue.enqueue("k"));
        assert!(!h.queue.enqueue("k"));
        drop(guard);

        h.queue.wait_idle().await;
        assert_eq!(h.queue.stats().completed, 1);
        assert!(h.queue.enqueue("k"));
        h.queue.wait_idle().await;
        assert_eq!(h.queue.stats().completed, 2);
    }

    #[tokio::test]
    async fn test_inconsistency_quarantines_alerts_and_requests_repair() {
        let mut h = harness(2, 2).await;
        let entry = h.f.ctx.put("bad", b"v", Tier::Hot).await.unwrap();
        h.f.ctx.put("good", b"v", Tier::Hot).await.unwrap();
        h.f.providers[1].corrupt(&entry.replicas[0].object_id);

        assert_eq!(h.queue.schedule_pass(), 2);
        h.queue.wait_idle().await;

        assert_eq!(h.f.ctx.registry.get("bad").unwrap().status, EntryStatus::Quarantined);
        assert!(h.f.ctx.registry.get("good").unwrap().is_active());
        assert_eq!(raised(&h.f.alerts, AlertKind::DataInconsistency), 1);
        assert_eq!(h.repair_rx.recv().await.as_deref(), Some("bad"));
        assert_eq!(h.history.report().total_checks, 2);

        // Quarantined keys are not scheduled again.
        assert_eq!(h.queue.schedule_pass(), 1);
        assert!(!h.queue.enqueue("bad"));
        h.queue.wait_idle().await;
    }

    #[tokio::test]
    async fn test_failure_on_one_key_does_not_block_others() {
        let h = harness(2, 1).await;
        let lost = h.f.ctx.put("lost", b"v", Tier::Hot).await.unwrap();
        h.f.ctx.put("fine", b"v", Tier::Hot).await.unwrap();
        h.f.providers[0].lose(&lost.uri.object_id);

        h.queue.schedule_pass();
        h.queue.wait_idle().await;

        assert_eq!(h.queue.task("lost").unwrap().status, TaskStatus::Failed);
        assert_eq!(h.queue.task("fine").unwrap().status, TaskStatus::Completed);
        assert!(!h.f.ctx.registry.get("lost").unwrap().is_active());
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let h = harness(1, 3).await;
        h.shutdown.send(true).unwrap();
        h.queue.join().await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_unfinished_tasks_and_goes_idle() {
        let h = harness(2, 1).await;
        for key in ["a", "b", "c"] {
            h.f.ctx.put(key, b"v", Tier::Hot).await.unwrap();
        }
        let guard = h.f.ctx.registry.lock_key("a").await;
        assert_eq!(h.queue.schedule_pass(), 3);

        h.shutdown.send(true).unwrap();
        h.queue.join().await;
        drop(guard);

        let stats = h.queue.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.failed, 3);
        for key in ["a", "b", "c"] {
            let task = h.queue.task(key).unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.result, Some(abandoned_result()));
        }
        tokio::time::timeout(std::time::Duration::from_secs(1), h.queue.wait_idle())
            .await
            .unwrap();
        assert!(!h.queue.enqueue("a"));
    }
}
