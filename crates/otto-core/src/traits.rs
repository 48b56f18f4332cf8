//! Trait seams between the scheduling core and its collaborators.
//!
//! The repository traits are the persistence contracts the core consumes; the
//! store crate implements them over SQLite. They are synchronous because every
//! operation is one narrow read-modify-write — callers in async context hold no
//! lock across await points.
//!
//! `JobExecutor` and `MessageTransport` are the outward hooks: the execution
//! engine and the chat transport live outside this core and are injected.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    EpochMs, FailedRun, Job, JobRun, NotificationProfile, OutboundMessage, RunDigestRow,
    RunStatus, TaskAuditRecord, TerminalState,
};

/// Result of a dedupe-guarded enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeOutcome {
    Enqueued,
    Duplicate,
}

/// Durable job table operations.
pub trait JobStore: Send + Sync {
    fn create_task(&self, job: &Job) -> Result<()>;

    /// Full-row write of the mutable fields. The caller (mutation service) owns
    /// merge semantics and guards.
    fn update_task(&self, job: &Job) -> Result<()>;

    /// Mark a job terminal. Terminal jobs keep their row but are never claimed
    /// again (`next_run_at` is cleared).
    fn cancel_task(
        &self,
        job_id: &str,
        state: TerminalState,
        reason: &str,
        updated_at: EpochMs,
    ) -> Result<()>;

    /// Force the next occurrence to `now` and clear terminal markers.
    fn run_task_now(&self, job_id: &str, now: EpochMs) -> Result<()>;

    fn get_by_id(&self, job_id: &str) -> Result<Option<Job>>;

    fn list_tasks(&self) -> Result<Vec<Job>>;

    /// Atomically claim up to `limit` due jobs under a time-bounded lease.
    ///
    /// A job is claimable when it is non-terminal, not paused, `next_run_at <=
    /// now`, and not running with a live lease (an expired lease is reclaimable —
    /// this is the crash-recovery path). Claimed jobs are marked running with
    /// `lock_token` and `lock_expires_at = now + lease_ms` in one transaction.
    fn claim_due(
        &self,
        now: EpochMs,
        limit: usize,
        lock_token: &str,
        lease_ms: i64,
        updated_at: EpochMs,
    ) -> Result<Vec<Job>>;

    /// Release a lease. Fenced by token: a stale holder cannot release a job
    /// that has been re-claimed. Returns whether a row was updated.
    fn release_lock(&self, job_id: &str, lock_token: &str, updated_at: EpochMs) -> Result<bool>;

    /// Advance the schedule after a finished run and release the lease, fenced
    /// by token: recurring jobs get `next_run_at = now + cadence`; oneshot jobs
    /// go terminal completed.
    fn reschedule_after_run(&self, job_id: &str, lock_token: &str, now: EpochMs) -> Result<()>;
}

/// Append-only run history.
pub trait RunStore: Send + Sync {
    fn insert_run(&self, run: &JobRun) -> Result<()>;

    /// The single allowed transition on a run row once written.
    fn mark_run_finished(
        &self,
        run_id: &str,
        status: RunStatus,
        finished_at: EpochMs,
        error_code: Option<&str>,
        error_message: Option<&str>,
        result_json: Option<&str>,
    ) -> Result<()>;

    fn list_runs_by_job(&self, job_id: &str, limit: i64, offset: i64) -> Result<Vec<JobRun>>;

    /// Failed runs finished since `since_ms`, newest first, joined with the
    /// job type. `excluded_types` is applied before the limit so a burst of
    /// excluded failures cannot crowd real ones out of the scan window.
    fn list_recent_failed_runs(
        &self,
        since_ms: EpochMs,
        excluded_types: &[String],
        limit: i64,
    ) -> Result<Vec<FailedRun>>;

    /// Runs started since `since_ms`, joined with the job type (for the
    /// heartbeat digest). Status counts and type labels only — no payloads.
    fn list_runs_since(&self, since_ms: EpochMs, limit: i64) -> Result<Vec<RunDigestRow>>;
}

/// Durable outbound message queue.
pub trait OutboundStore: Send + Sync {
    /// Insert a queued row; a dedupe-key conflict is reported as `Duplicate`,
    /// never as an error and never as a second delivery.
    fn enqueue_or_ignore_dedupe(&self, msg: &OutboundMessage) -> Result<DedupeOutcome>;

    /// Queued rows with `next_attempt_at <= now`, oldest first.
    fn list_due(&self, now: EpochMs) -> Result<Vec<OutboundMessage>>;

    fn mark_sent(&self, id: &str, attempt_count: i64, now: EpochMs) -> Result<()>;

    fn mark_retry(
        &self,
        id: &str,
        attempt_count: i64,
        next_attempt_at: EpochMs,
        error_message: &str,
        now: EpochMs,
    ) -> Result<()>;

    fn mark_failed(&self, id: &str, attempt_count: i64, error_message: &str, now: EpochMs)
        -> Result<()>;
}

/// Append-only mutation audit trail.
pub trait AuditStore: Send + Sync {
    fn insert(&self, record: &TaskAuditRecord) -> Result<()>;
}

/// Singleton notification profile.
pub trait ProfileStore: Send + Sync {
    fn get(&self) -> Result<Option<NotificationProfile>>;
    fn set_last_digest_at(&self, ts: EpochMs) -> Result<()>;
}

/// Execution engine hook, injected into the scheduler kernel.
///
/// The implementation owns the whole attempt lifecycle: recording the run
/// outcome, advancing the schedule, and releasing the lease. The kernel
/// dispatches fire-and-forget and never awaits completion.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute_claimed_job(&self, job: Job);
}

/// Chat transport hook, injected into the delivery processor.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;
}
