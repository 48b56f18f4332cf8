//! Built-in execution hook for the runtime-owned job types.
//!
//! The executor owns the whole attempt lifecycle: it records the run row,
//! produces the outcome, marks the run finished, and advances the schedule
//! (which releases the lease). A job type with no engine attached records a
//! skipped run rather than failing; the agent engine is an external
//! collaborator and may not be wired in.

use std::sync::Arc;

use async_trait::async_trait;
use otto_core::traits::JobExecutor;
use otto_core::types::{now_ms, Job, JobRun, RunStatus};
use serde_json::json;
use tracing::{debug, error, info};

use crate::heartbeat::Heartbeat;
use crate::watchdog::Watchdog;

/// Outcome of one dispatch, before it is written to the run row.
struct AttemptResult {
    status: RunStatus,
    error_code: Option<String>,
    error_message: Option<String>,
    result_json: Option<String>,
}

/// Executes the system-owned job types (`heartbeat`, `watchdog_failures`)
/// so self-monitoring rides the same scheduler/lease machinery as user tasks.
pub struct RuntimeExecutor<S: crate::Store> {
    store: Arc<S>,
    watchdog: Watchdog<S>,
    heartbeat: Heartbeat<S>,
}

impl<S: crate::Store> RuntimeExecutor<S> {
    pub fn new(store: Arc<S>, watchdog: Watchdog<S>, heartbeat: Heartbeat<S>) -> Self {
        Self { store, watchdog, heartbeat }
    }

    fn dispatch(&self, job: &Job, now: i64) -> AttemptResult {
        match job.job_type.as_str() {
            "heartbeat" => match self.heartbeat.execute_heartbeat_task(now) {
                Ok(outcome) => AttemptResult {
                    status: RunStatus::Success,
                    error_code: None,
                    error_message: None,
                    result_json: serde_json::to_string(&json!({
                        "notification": outcome.notification.as_str(),
                        "total_runs": outcome.digest.total,
                        "failed": outcome.digest.failed,
                    }))
                    .ok(),
                },
                Err(e) => AttemptResult {
                    status: RunStatus::Failed,
                    error_code: Some("heartbeat_failed".into()),
                    error_message: Some(e.to_string()),
                    result_json: None,
                },
            },
            "watchdog_failures" => match self.watchdog.check_task_failures(true, None, now) {
                Ok(outcome) => AttemptResult {
                    status: RunStatus::Success,
                    error_code: None,
                    error_message: None,
                    result_json: serde_json::to_string(&json!({
                        "notification": outcome.notification.as_str(),
                        "failed_count": outcome.failed_count,
                    }))
                    .ok(),
                },
                Err(e) => AttemptResult {
                    status: RunStatus::Failed,
                    error_code: Some("watchdog_failed".into()),
                    error_message: Some(e.to_string()),
                    result_json: None,
                },
            },
            other => {
                debug!("No engine for job type {other}, skipping");
                AttemptResult {
                    status: RunStatus::Skipped,
                    error_code: Some("no_engine".into()),
                    error_message: Some(format!("no execution engine for type {other}")),
                    result_json: None,
                }
            }
        }
    }
}

#[async_trait]
impl<S: crate::Store> JobExecutor for RuntimeExecutor<S> {
    async fn execute_claimed_job(&self, job: Job) {
        let now = now_ms();
        let Some(lock_token) = job.lock_token.clone() else {
            // Claimed jobs always carry a token; without one there is no lease
            // to release and nothing safe to do.
            error!("Job {} dispatched without a lock token, ignoring", job.id);
            return;
        };

        let run = JobRun::begin(&job.id, job.next_run_at.unwrap_or(now), now);
        if let Err(e) = self.store.insert_run(&run) {
            error!("Failed to record run for job {}: {e}", job.id);
            if let Err(e) = self.store.release_lock(&job.id, &lock_token, now_ms()) {
                error!("Failed to release lease on job {}: {e}", job.id);
            }
            return;
        }

        let attempt = self.dispatch(&job, now);
        info!(
            "Job {} ({}) finished: {}",
            job.id,
            job.job_type,
            attempt.status.as_str()
        );

        if let Err(e) = self.store.mark_run_finished(
            &run.id,
            attempt.status,
            now_ms(),
            attempt.error_code.as_deref(),
            attempt.error_message.as_deref(),
            attempt.result_json.as_deref(),
        ) {
            error!("Failed to finish run {}: {e}", run.id);
        }

        // Advances the schedule and releases the lease, fenced by our token.
        if let Err(e) = self.store.reschedule_after_run(&job.id, &lock_token, now_ms()) {
            error!("Failed to reschedule job {}: {e}", job.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::{ensure_heartbeat_task, HEARTBEAT_TASK_ID};
    use crate::kernel::SchedulerKernel;
    use crate::queue::OutboundQueue;
    use crate::watchdog::{ensure_watchdog_task, WATCHDOG_TASK_ID};
    use otto_core::config::{NotifyConfig, QueueConfig, SchedulerConfig, WatchdogConfig};
    use otto_core::traits::{JobStore, OutboundStore, RunStore};
    use otto_core::types::{JobStatus, NotificationProfile};
    use otto_store::SqliteStore;

    fn executor(store: &Arc<SqliteStore>, chat_id: Option<i64>) -> Arc<RuntimeExecutor<SqliteStore>> {
        let notify = NotifyConfig { default_chat_id: chat_id, ..Default::default() };
        let queue = OutboundQueue::new(store.clone(), QueueConfig::default());
        Arc::new(RuntimeExecutor::new(
            store.clone(),
            Watchdog::new(store.clone(), queue.clone(), WatchdogConfig::default(), &notify),
            Heartbeat::new(store.clone(), queue, &notify),
        ))
    }

    async fn claim_and_execute(
        store: &Arc<SqliteStore>,
        exec: &Arc<RuntimeExecutor<SqliteStore>>,
        job_id: &str,
    ) {
        let now = now_ms();
        let claimed = store.claim_due(now, 10, "tok-test", 600_000, now).unwrap();
        let job = claimed.into_iter().find(|j| j.id == job_id).unwrap();
        exec.execute_claimed_job(job).await;
    }

    #[tokio::test]
    async fn test_heartbeat_job_end_to_end() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .put_profile(&NotificationProfile {
                heartbeat_only_if_signal: false,
                ..Default::default()
            })
            .unwrap();
        let notify = NotifyConfig { default_chat_id: Some(42), ..Default::default() };
        ensure_heartbeat_task(store.as_ref(), &notify, 0).unwrap();

        let exec = executor(&store, Some(42));
        claim_and_execute(&store, &exec, HEARTBEAT_TASK_ID).await;

        // Run recorded as success
        let runs = store.list_runs_by_job(HEARTBEAT_TASK_ID, 10, 0).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert!(runs[0].result_json.as_deref().unwrap().contains("enqueued"));

        // Digest landed in the outbound queue
        assert_eq!(store.list_due(i64::MAX).unwrap().len(), 1);

        // Lease released, schedule advanced
        let job = store.get_by_id(HEARTBEAT_TASK_ID).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Idle);
        assert!(job.lock_token.is_none());
        assert!(job.next_run_at.unwrap() > now_ms());
    }

    #[tokio::test]
    async fn test_watchdog_job_records_run() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        ensure_watchdog_task(store.as_ref(), &WatchdogConfig::default(), 0).unwrap();

        let exec = executor(&store, Some(42));
        claim_and_execute(&store, &exec, WATCHDOG_TASK_ID).await;

        let runs = store.list_runs_by_job(WATCHDOG_TASK_ID, 10, 0).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        // Quiet system, nothing to alert about
        assert!(runs[0].result_json.as_deref().unwrap().contains("skipped"));
    }

    #[tokio::test]
    async fn test_unknown_type_records_skipped_run() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .create_task(&Job {
                id: "job-agent".into(),
                job_type: "agent_prompt".into(),
                status: JobStatus::Idle,
                schedule: otto_core::types::ScheduleType::Oneshot,
                run_at: Some(0),
                cadence_minutes: None,
                next_run_at: Some(0),
                payload: "{\"prompt\":\"hi\"}".into(),
                terminal_state: None,
                terminal_reason: None,
                lock_token: None,
                lock_expires_at: None,
                profile_id: None,
                model_ref: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();

        let exec = executor(&store, None);
        claim_and_execute(&store, &exec, "job-agent").await;

        let runs = store.list_runs_by_job("job-agent", 10, 0).unwrap();
        assert_eq!(runs[0].status, RunStatus::Skipped);
        assert_eq!(runs[0].error_code.as_deref(), Some("no_engine"));

        // Oneshot occurrence spent
        let job = store.get_by_id("job-agent").unwrap().unwrap();
        assert!(job.is_terminal());
    }

    #[tokio::test]
    async fn test_kernel_drives_executor() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let notify = NotifyConfig { default_chat_id: Some(42), ..Default::default() };
        ensure_heartbeat_task(store.as_ref(), &notify, 0).unwrap();
        // Make the heartbeat due immediately
        store.run_task_now(HEARTBEAT_TASK_ID, 0).unwrap();

        let exec = executor(&store, Some(42));
        let kernel = SchedulerKernel::new(store.clone(), Some(exec), SchedulerConfig::default());
        assert_eq!(kernel.tick_at(now_ms()).await, 1);

        // Wait for the spawned execution to settle
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if !store.list_runs_by_job(HEARTBEAT_TASK_ID, 10, 0).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let runs = store.list_runs_by_job(HEARTBEAT_TASK_ID, 10, 0).unwrap();
        assert_eq!(runs.len(), 1);
    }
}
