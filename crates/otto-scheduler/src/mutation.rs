//! Task mutation service: validated create/update/delete/run-now with
//! ownership guards and an append-only audit trail.
//!
//! Every rejection is raised before any write; a mutation is either fully
//! applied (row + audit record) or not applied at all.

use std::sync::Arc;

use otto_core::error::OttoError;
use otto_core::types::{
    new_id, AuditAction, AuditLane, EpochMs, Job, JobStatus, ScheduleType, TaskAuditRecord,
    TerminalState,
};
use otto_core::traits::{AuditStore, JobStore};
use tracing::info;

/// Job ids the runtime owns; operators cannot mutate them.
pub const SYSTEM_ID_PREFIX: &str = "system-";

/// Job types the runtime owns; same guard as the id prefix.
pub const RESERVED_TYPES: &[&str] = &["heartbeat", "watchdog_failures"];

/// Typed rejection raised synchronously before any mutation is applied.
///
/// `code` is one of `not_found`, `forbidden_mutation`, `state_conflict`,
/// `invalid_request` and maps to HTTP-style status semantics at the API
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TaskMutationError {
    pub code: &'static str,
    pub message: String,
}

impl TaskMutationError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self { code: "not_found", message: message.into() }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self { code: "forbidden_mutation", message: message.into() }
    }

    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self { code: "state_conflict", message: message.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self { code: "invalid_request", message: message.into() }
    }
}

/// A mutation either gets rejected up front or fails in storage.
#[derive(Debug, thiserror::Error)]
pub enum MutationFailure {
    #[error(transparent)]
    Rejected(#[from] TaskMutationError),
    #[error(transparent)]
    Storage(#[from] OttoError),
}

/// Who asked for the mutation and through which lane. Audit attribution only.
#[derive(Debug, Clone)]
pub struct MutationContext {
    pub actor: String,
    pub lane: AuditLane,
}

impl MutationContext {
    pub fn interactive(actor: impl Into<String>) -> Self {
        Self { actor: actor.into(), lane: AuditLane::Interactive }
    }

    pub fn scheduled(actor: impl Into<String>) -> Self {
        Self { actor: actor.into(), lane: AuditLane::Scheduled }
    }
}

/// Input for `create`.
#[derive(Debug, Clone)]
pub struct CreateTaskInput {
    pub job_type: String,
    pub schedule: ScheduleType,
    /// Oneshot trigger time, or an explicit first occurrence for recurring.
    pub run_at: Option<EpochMs>,
    pub cadence_minutes: Option<i64>,
    /// Type-tagged JSON; must parse, content is opaque here.
    pub payload: String,
    pub profile_id: Option<String>,
    pub model_ref: Option<String>,
}

/// Partial update. Outer `None` means "field not in the patch"; inner `None`
/// is an explicit null from the caller.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub run_at: Option<Option<EpochMs>>,
    pub cadence_minutes: Option<Option<i64>>,
    pub payload: Option<String>,
    pub paused: Option<bool>,
    pub profile_id: Option<Option<String>>,
    pub model_ref: Option<Option<String>>,
}

/// Outcome of `delete`. Cancelling an already-terminal job is a no-op, not an
/// error, and performs zero writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Cancelled,
    AlreadyTerminal,
}

/// Validated task mutations over the job store, with one audit row per
/// applied mutation.
pub struct TaskMutationService<S: JobStore + AuditStore> {
    store: Arc<S>,
}

impl<S: JobStore + AuditStore> TaskMutationService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Create a job. Oneshot requires `run_at`; recurring requires a positive
    /// cadence. The initial occurrence is `run_at` when given, else
    /// `now + cadence` for recurring.
    pub fn create(
        &self,
        input: CreateTaskInput,
        ctx: &MutationContext,
        now: EpochMs,
    ) -> Result<Job, MutationFailure> {
        if input.job_type.trim().is_empty() {
            return Err(TaskMutationError::invalid("job_type must be non-empty").into());
        }
        if serde_json::from_str::<serde_json::Value>(&input.payload).is_err() {
            return Err(TaskMutationError::invalid("payload must be valid JSON").into());
        }

        let next_run_at = match input.schedule {
            ScheduleType::Oneshot => {
                let Some(run_at) = input.run_at else {
                    return Err(
                        TaskMutationError::invalid("oneshot task requires run_at").into()
                    );
                };
                run_at
            }
            ScheduleType::Recurring => {
                let cadence = input.cadence_minutes.unwrap_or(0);
                if cadence <= 0 {
                    return Err(TaskMutationError::invalid(
                        "recurring task requires a positive cadence_minutes",
                    )
                    .into());
                }
                input.run_at.unwrap_or(now + cadence * 60_000)
            }
        };

        let job = Job {
            id: new_id("job"),
            job_type: input.job_type,
            status: JobStatus::Idle,
            schedule: input.schedule,
            run_at: input.run_at,
            cadence_minutes: input.cadence_minutes,
            next_run_at: Some(next_run_at),
            payload: input.payload,
            terminal_state: None,
            terminal_reason: None,
            lock_token: None,
            lock_expires_at: None,
            profile_id: input.profile_id,
            model_ref: input.model_ref,
            created_at: now,
            updated_at: now,
        };

        self.store.create_task(&job)?;
        self.audit(&job.id, AuditAction::Create, ctx, None, Some(&job), None, now)?;
        info!("📋 Task created: {} ({})", job.id, job.job_type);
        Ok(job)
    }

    /// Merge a patch into an existing job.
    ///
    /// Runtime-owned jobs (id prefix `system-` or a reserved type) are
    /// rejected with `forbidden_mutation`. An explicit `run_at: null` on a
    /// recurring job is treated as "no change", not "clear the schedule".
    pub fn update(
        &self,
        job_id: &str,
        patch: TaskPatch,
        ctx: &MutationContext,
        now: EpochMs,
    ) -> Result<Job, MutationFailure> {
        let Some(before) = self.store.get_by_id(job_id)? else {
            return Err(TaskMutationError::not_found(format!("no task {job_id}")).into());
        };
        if before.id.starts_with(SYSTEM_ID_PREFIX)
            || RESERVED_TYPES.contains(&before.job_type.as_str())
        {
            return Err(TaskMutationError::forbidden(format!(
                "task {job_id} is runtime-owned and cannot be modified"
            ))
            .into());
        }

        let mut after = before.clone();

        match patch.run_at {
            Some(Some(run_at)) => {
                after.run_at = Some(run_at);
                after.next_run_at = Some(run_at);
            }
            Some(None) => {
                if after.schedule == ScheduleType::Oneshot {
                    after.run_at = None;
                    after.next_run_at = None;
                }
                // Recurring: an explicit null leaves run_at/next_run_at as
                // they are; the schedule keeps deriving from the cadence.
            }
            None => {}
        }
        if let Some(cadence) = patch.cadence_minutes {
            if let Some(c) = cadence {
                if c <= 0 {
                    return Err(
                        TaskMutationError::invalid("cadence_minutes must be positive").into()
                    );
                }
            } else if after.schedule == ScheduleType::Recurring {
                return Err(TaskMutationError::invalid(
                    "recurring task cannot clear cadence_minutes",
                )
                .into());
            }
            after.cadence_minutes = cadence;
        }
        if let Some(payload) = patch.payload {
            if serde_json::from_str::<serde_json::Value>(&payload).is_err() {
                return Err(TaskMutationError::invalid("payload must be valid JSON").into());
            }
            after.payload = payload;
        }
        if let Some(paused) = patch.paused {
            if before.status == JobStatus::Running {
                return Err(TaskMutationError::state_conflict(format!(
                    "task {job_id} is running"
                ))
                .into());
            }
            after.status = if paused { JobStatus::Paused } else { JobStatus::Idle };
        }
        if let Some(profile_id) = patch.profile_id {
            after.profile_id = profile_id;
        }
        if let Some(model_ref) = patch.model_ref {
            after.model_ref = model_ref;
        }
        after.updated_at = now;

        self.store.update_task(&after)?;
        self.audit(job_id, AuditAction::Update, ctx, Some(&before), Some(&after), None, now)?;
        Ok(after)
    }

    /// Cancel a job. Terminal jobs are left untouched and reported as
    /// `AlreadyTerminal`.
    pub fn delete(
        &self,
        job_id: &str,
        ctx: &MutationContext,
        now: EpochMs,
    ) -> Result<DeleteOutcome, MutationFailure> {
        let Some(before) = self.store.get_by_id(job_id)? else {
            return Err(TaskMutationError::not_found(format!("no task {job_id}")).into());
        };
        if before.is_terminal() {
            return Ok(DeleteOutcome::AlreadyTerminal);
        }

        self.store.cancel_task(job_id, TerminalState::Cancelled, &ctx.actor, now)?;
        let after = self.store.get_by_id(job_id)?;
        self.audit(
            job_id,
            AuditAction::Delete,
            ctx,
            Some(&before),
            after.as_ref(),
            None,
            now,
        )?;
        info!("🗑️ Task cancelled: {job_id}");
        Ok(DeleteOutcome::Cancelled)
    }

    /// Force the next occurrence to `now`. Rejected with `state_conflict`
    /// while the job is running. Returns the scheduled-for timestamp.
    pub fn run_task_now(
        &self,
        job_id: &str,
        ctx: &MutationContext,
        now: EpochMs,
    ) -> Result<EpochMs, MutationFailure> {
        let Some(before) = self.store.get_by_id(job_id)? else {
            return Err(TaskMutationError::not_found(format!("no task {job_id}")).into());
        };
        if before.status == JobStatus::Running {
            return Err(TaskMutationError::state_conflict(format!(
                "task {job_id} is already running"
            ))
            .into());
        }

        self.store.run_task_now(job_id, now)?;
        let after = self.store.get_by_id(job_id)?;
        self.audit(
            job_id,
            AuditAction::Update,
            ctx,
            Some(&before),
            after.as_ref(),
            Some("{\"command\":\"run_now\"}"),
            now,
        )?;
        info!("⚡ Task {job_id} scheduled to run now");
        Ok(now)
    }

    fn audit(
        &self,
        task_id: &str,
        action: AuditAction,
        ctx: &MutationContext,
        before: Option<&Job>,
        after: Option<&Job>,
        metadata_json: Option<&str>,
        now: EpochMs,
    ) -> Result<(), MutationFailure> {
        let record = TaskAuditRecord {
            id: new_id("audit"),
            task_id: task_id.to_string(),
            action,
            lane: ctx.lane,
            actor: ctx.actor.clone(),
            before_json: before.map(|j| serde_json::to_string(j).unwrap_or_default()),
            after_json: after.map(|j| serde_json::to_string(j).unwrap_or_default()),
            metadata_json: metadata_json.map(str::to_string),
            created_at: now,
        };
        self.store.insert(&record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otto_store::SqliteStore;

    fn service() -> (TaskMutationService<SqliteStore>, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        (TaskMutationService::new(store.clone()), store)
    }

    fn ctx() -> MutationContext {
        MutationContext::interactive("operator")
    }

    fn recurring_input() -> CreateTaskInput {
        CreateTaskInput {
            job_type: "agent_prompt".into(),
            schedule: ScheduleType::Recurring,
            run_at: None,
            cadence_minutes: Some(30),
            payload: "{\"prompt\":\"check the news\"}".into(),
            profile_id: None,
            model_ref: None,
        }
    }

    fn rejected_code(err: MutationFailure) -> &'static str {
        match err {
            MutationFailure::Rejected(e) => e.code,
            MutationFailure::Storage(e) => panic!("unexpected storage error: {e}"),
        }
    }

    #[test]
    fn test_create_recurring_computes_next_run() {
        let (svc, _) = service();
        let job = svc.create(recurring_input(), &ctx(), 1_000).unwrap();
        assert_eq!(job.next_run_at, Some(1_000 + 30 * 60_000));
        assert_eq!(job.status, JobStatus::Idle);
    }

    #[test]
    fn test_create_recurring_with_explicit_first_run() {
        let (svc, _) = service();
        let mut input = recurring_input();
        input.run_at = Some(9_000);
        let job = svc.create(input, &ctx(), 1_000).unwrap();
        assert_eq!(job.next_run_at, Some(9_000));
    }

    #[test]
    fn test_create_oneshot_requires_run_at() {
        let (svc, _) = service();
        let input = CreateTaskInput {
            job_type: "agent_prompt".into(),
            schedule: ScheduleType::Oneshot,
            run_at: None,
            cadence_minutes: None,
            payload: "{}".into(),
            profile_id: None,
            model_ref: None,
        };
        let err = svc.create(input, &ctx(), 1_000).unwrap_err();
        assert_eq!(rejected_code(err), "invalid_request");
    }

    #[test]
    fn test_create_rejects_bad_payload() {
        let (svc, _) = service();
        let mut input = recurring_input();
        input.payload = "not json".into();
        let err = svc.create(input, &ctx(), 1_000).unwrap_err();
        assert_eq!(rejected_code(err), "invalid_request");
    }

    #[test]
    fn test_create_writes_audit_row() {
        let (svc, store) = service();
        let job = svc.create(recurring_input(), &ctx(), 1_000).unwrap();
        let audit = store.list_audit_for_task(&job.id).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::Create);
        assert!(audit[0].before_json.is_none());
        assert!(audit[0].after_json.is_some());
    }

    #[test]
    fn test_update_reserved_type_is_forbidden_with_zero_writes() {
        let (svc, store) = service();
        let job = Job {
            job_type: "heartbeat".into(),
            ..svc.create(recurring_input(), &ctx(), 1_000).unwrap()
        };
        // Reserved-type row planted directly; the service would refuse to make one
        let planted = Job { id: "job-hb".into(), ..job };
        store.create_task(&planted).unwrap();

        let patch = TaskPatch { payload: Some("{}".into()), ..Default::default() };
        let err = svc.update("job-hb", patch, &ctx(), 2_000).unwrap_err();
        assert_eq!(rejected_code(err), "forbidden_mutation");

        let loaded = store.get_by_id("job-hb").unwrap().unwrap();
        assert_eq!(loaded.payload, planted.payload);
        assert!(store.list_audit_for_task("job-hb").unwrap().is_empty());
    }

    #[test]
    fn test_update_system_id_prefix_is_forbidden() {
        let (svc, store) = service();
        let job = svc.create(recurring_input(), &ctx(), 1_000).unwrap();
        let planted = Job { id: "system-custom".into(), ..job };
        store.create_task(&planted).unwrap();

        let err = svc
            .update("system-custom", TaskPatch::default(), &ctx(), 2_000)
            .unwrap_err();
        assert_eq!(rejected_code(err), "forbidden_mutation");
    }

    #[test]
    fn test_update_explicit_null_run_at_on_recurring_is_ignored() {
        // Pins the "null means no change" semantics for recurring schedules.
        let (svc, _) = service();
        let mut input = recurring_input();
        input.run_at = Some(9_000);
        let job = svc.create(input, &ctx(), 1_000).unwrap();

        let patch = TaskPatch { run_at: Some(None), ..Default::default() };
        let updated = svc.update(&job.id, patch, &ctx(), 2_000).unwrap();
        assert_eq!(updated.run_at, Some(9_000));
        assert_eq!(updated.next_run_at, Some(9_000));
    }

    #[test]
    fn test_update_explicit_null_run_at_on_oneshot_clears_schedule() {
        let (svc, _) = service();
        let input = CreateTaskInput {
            job_type: "agent_prompt".into(),
            schedule: ScheduleType::Oneshot,
            run_at: Some(9_000),
            cadence_minutes: None,
            payload: "{}".into(),
            profile_id: None,
            model_ref: None,
        };
        let job = svc.create(input, &ctx(), 1_000).unwrap();

        let patch = TaskPatch { run_at: Some(None), ..Default::default() };
        let updated = svc.update(&job.id, patch, &ctx(), 2_000).unwrap();
        assert!(updated.run_at.is_none());
        assert!(updated.next_run_at.is_none());
    }

    #[test]
    fn test_update_moves_next_run() {
        let (svc, store) = service();
        let job = svc.create(recurring_input(), &ctx(), 1_000).unwrap();

        let patch = TaskPatch { run_at: Some(Some(5_000)), ..Default::default() };
        let updated = svc.update(&job.id, patch, &ctx(), 2_000).unwrap();
        assert_eq!(updated.next_run_at, Some(5_000));

        let audit = store.list_audit_for_task(&job.id).unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].action, AuditAction::Update);
        assert!(audit[1].before_json.is_some());
    }

    #[test]
    fn test_update_pause_and_resume() {
        let (svc, _) = service();
        let job = svc.create(recurring_input(), &ctx(), 1_000).unwrap();

        let paused = svc
            .update(&job.id, TaskPatch { paused: Some(true), ..Default::default() }, &ctx(), 2_000)
            .unwrap();
        assert_eq!(paused.status, JobStatus::Paused);

        let resumed = svc
            .update(&job.id, TaskPatch { paused: Some(false), ..Default::default() }, &ctx(), 3_000)
            .unwrap();
        assert_eq!(resumed.status, JobStatus::Idle);
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let (svc, _) = service();
        let err = svc.delete("job-missing", &ctx(), 1_000).unwrap_err();
        assert_eq!(rejected_code(err), "not_found");
    }

    #[test]
    fn test_delete_cancels_and_audits() {
        let (svc, store) = service();
        let job = svc.create(recurring_input(), &ctx(), 1_000).unwrap();

        let outcome = svc.delete(&job.id, &ctx(), 2_000).unwrap();
        assert_eq!(outcome, DeleteOutcome::Cancelled);

        let loaded = store.get_by_id(&job.id).unwrap().unwrap();
        assert_eq!(loaded.terminal_state, Some(TerminalState::Cancelled));
        assert!(loaded.next_run_at.is_none());

        let audit = store.list_audit_for_task(&job.id).unwrap();
        assert_eq!(audit.last().unwrap().action, AuditAction::Delete);
    }

    #[test]
    fn test_delete_terminal_is_idempotent_no_writes() {
        let (svc, store) = service();
        let job = svc.create(recurring_input(), &ctx(), 1_000).unwrap();
        svc.delete(&job.id, &ctx(), 2_000).unwrap();
        let audit_count = store.list_audit_for_task(&job.id).unwrap().len();

        let outcome = svc.delete(&job.id, &ctx(), 3_000).unwrap();
        assert_eq!(outcome, DeleteOutcome::AlreadyTerminal);
        // No second delete audit row, no updated_at churn
        assert_eq!(store.list_audit_for_task(&job.id).unwrap().len(), audit_count);
        let loaded = store.get_by_id(&job.id).unwrap().unwrap();
        assert_eq!(loaded.updated_at, 2_000);
    }

    #[test]
    fn test_run_now_conflicts_while_running() {
        let (svc, store) = service();
        let job = svc.create(recurring_input(), &ctx(), 1_000).unwrap();
        store
            .claim_due(job.next_run_at.unwrap(), 10, "tok", 60_000, 2_000)
            .unwrap();

        let err = svc.run_task_now(&job.id, &ctx(), 3_000).unwrap_err();
        assert_eq!(rejected_code(err), "state_conflict");
    }

    #[test]
    fn test_run_now_sets_next_run_and_audits_command() {
        let (svc, store) = service();
        let job = svc.create(recurring_input(), &ctx(), 1_000).unwrap();

        let scheduled_for = svc.run_task_now(&job.id, &ctx(), 4_000).unwrap();
        assert_eq!(scheduled_for, 4_000);

        let loaded = store.get_by_id(&job.id).unwrap().unwrap();
        assert_eq!(loaded.next_run_at, Some(4_000));

        let audit = store.list_audit_for_task(&job.id).unwrap();
        let last = audit.last().unwrap();
        assert_eq!(last.action, AuditAction::Update);
        assert_eq!(last.metadata_json.as_deref(), Some("{\"command\":\"run_now\"}"));
    }
}
