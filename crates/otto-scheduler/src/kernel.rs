//! Scheduler kernel: a periodic tick loop that atomically claims due jobs
//! under a time-bounded lease and hands them to the execution hook.
//!
//! The kernel never awaits executions. Each claimed job is dispatched
//! fire-and-forget; the executor owns run recording, rescheduling, and lease
//! release. A tick that fails logs and the interval keeps going.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use otto_core::config::SchedulerConfig;
use otto_core::traits::{JobExecutor, JobStore};
use otto_core::types::{new_id, now_ms, EpochMs};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Handle returned by `SchedulerKernel::start`. Dropping it does not stop the
/// loop; call `stop()`. An in-flight tick is allowed to finish.
pub struct KernelHandle {
    stop_tx: Option<oneshot::Sender<()>>,
}

impl KernelHandle {
    /// No-op handle for disabled configuration.
    fn noop() -> Self {
        Self { stop_tx: None }
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// The claim-and-dispatch loop.
pub struct SchedulerKernel {
    store: Arc<dyn JobStore>,
    executor: Option<Arc<dyn JobExecutor>>,
    config: SchedulerConfig,
    /// Re-entrancy guard: owned by the instance so kernels in tests never
    /// interfere with each other.
    tick_running: AtomicBool,
}

impl SchedulerKernel {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Option<Arc<dyn JobExecutor>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            tick_running: AtomicBool::new(false),
        }
    }

    /// Run one claim pass at `now`. Returns the number of jobs claimed.
    ///
    /// Skips (returning 0) when a previous tick is still in flight.
    pub async fn tick_at(&self, now: EpochMs) -> usize {
        if self.tick_running.swap(true, Ordering::SeqCst) {
            debug!("Tick skipped: previous tick still running");
            return 0;
        }

        let claimed = self.claim_and_dispatch(now).await;
        self.tick_running.store(false, Ordering::SeqCst);

        match claimed {
            Ok(n) => n,
            Err(e) => {
                // One bad tick must never stop the interval.
                error!("Scheduler tick failed: {e}");
                0
            }
        }
    }

    async fn claim_and_dispatch(&self, now: EpochMs) -> otto_core::Result<usize> {
        let lock_token = new_id("lock");
        let claimed = self.store.claim_due(
            now,
            self.config.batch_size,
            &lock_token,
            self.config.lock_lease_ms,
            now,
        )?;
        if claimed.is_empty() {
            return Ok(0);
        }

        let count = claimed.len();
        info!("⏰ Claimed {count} due job(s)");

        for job in claimed {
            match &self.executor {
                Some(executor) => {
                    let executor = Arc::clone(executor);
                    debug!("Dispatching job {} ({})", job.id, job.job_type);
                    tokio::spawn(async move {
                        executor.execute_claimed_job(job).await;
                    });
                }
                None => {
                    // No execution hook configured: release immediately so the
                    // job does not sit locked until lease expiry.
                    self.store.release_lock(&job.id, &lock_token, now)?;
                }
            }
        }
        Ok(count)
    }

    /// Start the tick interval: one tick immediately, then every `tick_ms`.
    ///
    /// `enabled: false` short-circuits to a no-op handle that still accepts
    /// `stop()`.
    pub fn start(self: Arc<Self>) -> KernelHandle {
        if !self.config.enabled {
            warn!("Scheduler disabled by config");
            return KernelHandle::noop();
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let tick_ms = self.config.tick_ms;
        info!("🚀 Scheduler started (tick every {tick_ms}ms)");

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(tick_ms));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick_at(now_ms()).await;
                    }
                    _ = &mut stop_rx => {
                        info!("Scheduler stopped");
                        break;
                    }
                }
            }
        });

        KernelHandle { stop_tx: Some(stop_tx) }
    }
}
