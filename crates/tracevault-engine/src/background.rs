//! Scheduled loops: verification, repair, lifecycle, tier optimization, the
//! hot-data cache, cost sampling and archival. Each loop stops on the shared shutdown signal.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::vault::TraceVault;

/// Resolve once the shutdown flag is set or its sender is gone.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

pub struct BackgroundTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub(crate) fn spawn(
        vault: Arc<TraceVault>,
        repair_rx: Option<mpsc::UnboundedReceiver<String>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let config = vault.ctx.config.clone();
        let mut handles = Vec::new();

        let v = Arc::clone(&vault);
        handles.push((
            "verification",
            every(config.verification.interval(), shutdown.clone(), move || {
                let v = Arc::clone(&v);
                async move {
                    v.queue.schedule_pass();
                }
            }),
        ));

        let v = Arc::clone(&vault);
        handles.push((
            "repair",
            every(config.repair.interval(), shutdown.clone(), move || {
                let v = Arc::clone(&v);
                async move {
                    v.repair.auto_repair_pass().await;
                }
            }),
        ));

        let v = Arc::clone(&vault);
        handles.push((
            "lifecycle",
            every(config.lifecycle.interval(), shutdown.clone(), move || {
                let v = Arc::clone(&v);
                async move {
                    v.lifecycle.apply_policies().await;
                }
            }),
        ));

        let v = Arc::clone(&vault);
        handles.push((
            "optimizer",
            every(config.optimizer.interval(), shutdown.clone(), move || {
                let v = Arc::clone(&v);
                async move {
                    v.optimizer.optimize_tier_placement().await;
                }
            }),
        ));

        let v = Arc::clone(&vault);
        handles.push((
            "cache",
            every(config.access.cache_interval(), shutdown.clone(), move || {
                let v = Arc::clone(&v);
                async move {
                    v.refresh_cache_now().await;
                }
            }),
        ));

        let v = Arc::clone(&vault);
        handles.push((
            "cost",
            every(config.cost.sample_interval(), shutdown.clone(), move || {
                let v = Arc::clone(&v);
                async move {
                    if let Err(e) = v.adaptive.optimize_policies() {
                        warn!(error = %e, "policy adjustment failed");
                    }
                }
            }),
        ));

        handles.push((
            "archiver",
            tokio::spawn(archive_loop(Arc::clone(&vault), shutdown.clone())),
        ));

        match repair_rx {
            Some(rx) => handles.push((
                "repair-requests",
                tokio::spawn(repair_requests(Arc::clone(&vault), rx, shutdown)),
            )),
            None => warn!("repair request consumer already running"),
        }

        info!(loops = handles.len(), "background loops started");
        Self { handles }
    }

    /// Wait for every loop to exit.
    pub async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "background task panicked");
            }
        }
    }
}

/// Run `tick` on a fixed interval until shutdown. The first tick fires after
/// one full period.
fn every<F, Fut>(
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let period = period.max(Duration::from_secs(1));
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = tick() => {}
            }
        }
    })
}

/// The archive period comes from the policy, which the adaptive engine may
/// change between runs.
async fn archive_loop(vault: Arc<TraceVault>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let period = vault.ctx.policy().archive_interval();
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = time::sleep(period) => {}
        }
        let policy = vault.ctx.policy();
        let now = SystemTime::now();
        let cutoff = now.checked_sub(policy.warm.max_age()).unwrap_or(now);
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            result = vault.archiver.archive_before(cutoff) => {
                if let Err(e) = result {
                    warn!(error = %e, "scheduled archive failed");
                }
            }
        }
    }
}

async fn repair_requests(
    vault: Arc<TraceVault>,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let key = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            key = rx.recv() => match key {
                Some(key) => key,
                None => break,
            },
        };
        debug!(key = %key, "repair requested");
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            // Failures are alerted by the repair engine; the scheduled pass retries.
            _ = vault.repair.auto_repair(&key) => {}
        }
    }
}
