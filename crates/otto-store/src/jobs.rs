//! Job table operations: CRUD, atomic lease claiming, token-fenced release.

use otto_core::error::{OttoError, Result};
use otto_core::traits::JobStore;
use otto_core::types::{EpochMs, Job, JobStatus, ScheduleType, TerminalState};
use rusqlite::Row;

use crate::SqliteStore;

const JOB_COLUMNS: &str = "id, job_type, status, schedule_type, run_at, cadence_minutes, \
     next_run_at, payload, terminal_state, terminal_reason, lock_token, lock_expires_at, \
     profile_id, model_ref, created_at, updated_at";

pub(crate) fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(2)?;
    let schedule: String = row.get(3)?;
    let terminal: Option<String> = row.get(8)?;
    Ok(Job {
        id: row.get(0)?,
        job_type: row.get(1)?,
        status: JobStatus::parse(&status),
        schedule: ScheduleType::parse(&schedule),
        run_at: row.get(4)?,
        cadence_minutes: row.get(5)?,
        next_run_at: row.get(6)?,
        payload: row.get(7)?,
        terminal_state: terminal.as_deref().and_then(TerminalState::parse),
        terminal_reason: row.get(9)?,
        lock_token: row.get(10)?,
        lock_expires_at: row.get(11)?,
        profile_id: row.get(12)?,
        model_ref: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

impl JobStore for SqliteStore {
    fn create_task(&self, job: &Job) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs
             (id, job_type, status, schedule_type, run_at, cadence_minutes, next_run_at,
              payload, terminal_state, terminal_reason, lock_token, lock_expires_at,
              profile_id, model_ref, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            rusqlite::params![
                job.id,
                job.job_type,
                job.status.as_str(),
                job.schedule.as_str(),
                job.run_at,
                job.cadence_minutes,
                job.next_run_at,
                job.payload,
                job.terminal_state.map(|t| t.as_str()),
                job.terminal_reason,
                job.lock_token,
                job.lock_expires_at,
                job.profile_id,
                job.model_ref,
                job.created_at,
                job.updated_at,
            ],
        )
        .map_err(|e| OttoError::Storage(format!("Create task: {e}")))?;
        Ok(())
    }

    fn update_task(&self, job: &Job) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE jobs SET job_type = ?2, status = ?3, schedule_type = ?4, run_at = ?5,
                 cadence_minutes = ?6, next_run_at = ?7, payload = ?8, terminal_state = ?9,
                 terminal_reason = ?10, profile_id = ?11, model_ref = ?12, updated_at = ?13
             WHERE id = ?1",
            rusqlite::params![
                job.id,
                job.job_type,
                job.status.as_str(),
                job.schedule.as_str(),
                job.run_at,
                job.cadence_minutes,
                job.next_run_at,
                job.payload,
                job.terminal_state.map(|t| t.as_str()),
                job.terminal_reason,
                job.profile_id,
                job.model_ref,
                job.updated_at,
            ],
        )
        .map_err(|e| OttoError::Storage(format!("Update task: {e}")))?;
        Ok(())
    }

    fn cancel_task(
        &self,
        job_id: &str,
        state: TerminalState,
        reason: &str,
        updated_at: EpochMs,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE jobs SET terminal_state = ?2, terminal_reason = ?3, next_run_at = NULL,
                 status = 'idle', lock_token = NULL, lock_expires_at = NULL, updated_at = ?4
             WHERE id = ?1",
            rusqlite::params![job_id, state.as_str(), reason, updated_at],
        )
        .map_err(|e| OttoError::Storage(format!("Cancel task: {e}")))?;
        Ok(())
    }

    fn run_task_now(&self, job_id: &str, now: EpochMs) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE jobs SET next_run_at = ?2, terminal_state = NULL, terminal_reason = NULL,
                 status = 'idle', updated_at = ?2
             WHERE id = ?1",
            rusqlite::params![job_id, now],
        )
        .map_err(|e| OttoError::Storage(format!("Run task now: {e}")))?;
        Ok(())
    }

    fn get_by_id(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .map_err(|e| OttoError::Storage(format!("Get job: {e}")))?;
        let job = stmt
            .query_row([job_id], row_to_job)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(OttoError::Storage(format!("Get job: {other}"))),
            })?;
        Ok(job)
    }

    fn list_tasks(&self) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at"
            ))
            .map_err(|e| OttoError::Storage(format!("List tasks: {e}")))?;
        let rows = stmt
            .query_map([], row_to_job)
            .map_err(|e| OttoError::Storage(format!("List tasks: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn claim_due(
        &self,
        now: EpochMs,
        limit: usize,
        lock_token: &str,
        lease_ms: i64,
        updated_at: EpochMs,
    ) -> Result<Vec<Job>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| OttoError::Storage(format!("Claim tx: {e}")))?;

        let mut claimed = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE terminal_state IS NULL
                       AND status != 'paused'
                       AND next_run_at IS NOT NULL AND next_run_at <= ?1
                       AND (status != 'running'
                            OR lock_expires_at IS NULL OR lock_expires_at <= ?1)
                     ORDER BY next_run_at ASC
                     LIMIT ?2"
                ))
                .map_err(|e| OttoError::Storage(format!("Claim select: {e}")))?;
            let rows = stmt
                .query_map(rusqlite::params![now, limit as i64], row_to_job)
                .map_err(|e| OttoError::Storage(format!("Claim select: {e}")))?;
            rows.filter_map(|r| r.ok()).collect::<Vec<Job>>()
        };

        let expires_at = now + lease_ms;
        for job in &mut claimed {
            tx.execute(
                "UPDATE jobs SET status = 'running', lock_token = ?2, lock_expires_at = ?3,
                     updated_at = ?4
                 WHERE id = ?1",
                rusqlite::params![job.id, lock_token, expires_at, updated_at],
            )
            .map_err(|e| OttoError::Storage(format!("Claim update: {e}")))?;
            job.status = JobStatus::Running;
            job.lock_token = Some(lock_token.to_string());
            job.lock_expires_at = Some(expires_at);
            job.updated_at = updated_at;
        }

        tx.commit()
            .map_err(|e| OttoError::Storage(format!("Claim commit: {e}")))?;
        Ok(claimed)
    }

    fn release_lock(&self, job_id: &str, lock_token: &str, updated_at: EpochMs) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET status = 'idle', lock_token = NULL, lock_expires_at = NULL,
                     updated_at = ?3
                 WHERE id = ?1 AND lock_token = ?2",
                rusqlite::params![job_id, lock_token, updated_at],
            )
            .map_err(|e| OttoError::Storage(format!("Release lock: {e}")))?;
        if changed == 0 {
            tracing::debug!("Stale lock release ignored for job {job_id}");
        }
        Ok(changed > 0)
    }

    fn reschedule_after_run(&self, job_id: &str, lock_token: &str, now: EpochMs) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| OttoError::Storage(format!("Reschedule tx: {e}")))?;

        let job = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1 AND lock_token = ?2"
                ))
                .map_err(|e| OttoError::Storage(format!("Reschedule select: {e}")))?;
            stmt.query_row(rusqlite::params![job_id, lock_token], row_to_job)
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(OttoError::Storage(format!("Reschedule select: {other}"))),
                })?
        };

        // Token mismatch: the lease expired and someone else re-claimed the job.
        // The stale holder's reschedule must not clobber the new claim.
        let Some(job) = job else {
            tracing::debug!("Stale reschedule ignored for job {job_id}");
            return Ok(());
        };

        match (job.schedule, job.cadence_minutes) {
            (ScheduleType::Recurring, Some(cadence)) => {
                let next = now + cadence * 60_000;
                tx.execute(
                    "UPDATE jobs SET status = 'idle', lock_token = NULL,
                         lock_expires_at = NULL, next_run_at = ?2, updated_at = ?3
                     WHERE id = ?1 AND lock_token = ?4",
                    rusqlite::params![job_id, next, now, lock_token],
                )
                .map_err(|e| OttoError::Storage(format!("Reschedule: {e}")))?;
            }
            _ => {
                // Oneshot (or recurring with no cadence, which create() rejects):
                // the single occurrence is spent.
                tx.execute(
                    "UPDATE jobs SET status = 'idle', lock_token = NULL,
                         lock_expires_at = NULL, next_run_at = NULL,
                         terminal_state = 'completed', updated_at = ?2
                     WHERE id = ?1 AND lock_token = ?3",
                    rusqlite::params![job_id, now, lock_token],
                )
                .map_err(|e| OttoError::Storage(format!("Reschedule: {e}")))?;
            }
        }

        tx.commit()
            .map_err(|e| OttoError::Storage(format!("Reschedule commit: {e}")))?;
        Ok(())
    }
}
