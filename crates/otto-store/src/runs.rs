//! Run history: append-only attempt records and the watchdog/heartbeat queries.

use otto_core::error::{OttoError, Result};
use otto_core::traits::RunStore;
use otto_core::types::{EpochMs, FailedRun, JobRun, RunDigestRow, RunStatus};
use rusqlite::Row;

use crate::SqliteStore;

const RUN_COLUMNS: &str = "id, job_id, scheduled_for, started_at, finished_at, status, \
     error_code, error_message, result_json, created_at";

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    let status: String = row.get(5)?;
    Ok(JobRun {
        id: row.get(0)?,
        job_id: row.get(1)?,
        scheduled_for: row.get(2)?,
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        status: RunStatus::parse(&status),
        error_code: row.get(6)?,
        error_message: row.get(7)?,
        result_json: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl RunStore for SqliteStore {
    fn insert_run(&self, run: &JobRun) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO job_runs
             (id, job_id, scheduled_for, started_at, finished_at, status,
              error_code, error_message, result_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                run.id,
                run.job_id,
                run.scheduled_for,
                run.started_at,
                run.finished_at,
                run.status.as_str(),
                run.error_code,
                run.error_message,
                run.result_json,
                run.created_at,
            ],
        )
        .map_err(|e| OttoError::Storage(format!("Insert run: {e}")))?;
        Ok(())
    }

    fn mark_run_finished(
        &self,
        run_id: &str,
        status: RunStatus,
        finished_at: EpochMs,
        error_code: Option<&str>,
        error_message: Option<&str>,
        result_json: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        // The single allowed transition: a finished row is never rewritten.
        conn.execute(
            "UPDATE job_runs SET status = ?2, finished_at = ?3, error_code = ?4,
                 error_message = ?5, result_json = ?6
             WHERE id = ?1 AND finished_at IS NULL",
            rusqlite::params![
                run_id,
                status.as_str(),
                finished_at,
                error_code,
                error_message,
                result_json
            ],
        )
        .map_err(|e| OttoError::Storage(format!("Mark run finished: {e}")))?;
        Ok(())
    }

    fn list_runs_by_job(&self, job_id: &str, limit: i64, offset: i64) -> Result<Vec<JobRun>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM job_runs WHERE job_id = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            ))
            .map_err(|e| OttoError::Storage(format!("List runs: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![job_id, limit, offset], row_to_run)
            .map_err(|e| OttoError::Storage(format!("List runs: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn list_recent_failed_runs(
        &self,
        since_ms: EpochMs,
        excluded_types: &[String],
        limit: i64,
    ) -> Result<Vec<FailedRun>> {
        let conn = self.lock()?;
        // Exclusion lives in the WHERE clause so it applies before LIMIT.
        let exclusion = if excluded_types.is_empty() {
            String::new()
        } else {
            let marks = vec!["?"; excluded_types.len()].join(", ");
            format!("AND j.job_type NOT IN ({marks})")
        };
        let mut stmt = conn
            .prepare(&format!(
                "SELECT r.id, r.job_id, j.job_type, r.finished_at, r.error_message
                 FROM job_runs r
                 JOIN jobs j ON j.id = r.job_id
                 WHERE r.status = 'failed' AND r.finished_at IS NOT NULL
                   AND r.finished_at >= ? {exclusion}
                 ORDER BY r.finished_at DESC
                 LIMIT ?"
            ))
            .map_err(|e| OttoError::Storage(format!("List failed runs: {e}")))?;

        let mut params: Vec<rusqlite::types::Value> = Vec::with_capacity(excluded_types.len() + 2);
        params.push(since_ms.into());
        params.extend(excluded_types.iter().map(|t| t.clone().into()));
        params.push(limit.into());

        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                Ok(FailedRun {
                    run_id: row.get(0)?,
                    job_id: row.get(1)?,
                    job_type: row.get(2)?,
                    finished_at: row.get(3)?,
                    error_message: row.get(4)?,
                })
            })
            .map_err(|e| OttoError::Storage(format!("List failed runs: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn list_runs_since(&self, since_ms: EpochMs, limit: i64) -> Result<Vec<RunDigestRow>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT r.job_id, j.job_type, r.status, r.started_at, r.finished_at
                 FROM job_runs r
                 JOIN jobs j ON j.id = r.job_id
                 WHERE r.started_at >= ?1
                 ORDER BY r.started_at ASC
                 LIMIT ?2",
            )
            .map_err(|e| OttoError::Storage(format!("List runs since: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![since_ms, limit], |row| {
                let status: String = row.get(2)?;
                Ok(RunDigestRow {
                    job_id: row.get(0)?,
                    job_type: row.get(1)?,
                    status: RunStatus::parse(&status),
                    started_at: row.get(3)?,
                    finished_at: row.get(4)?,
                })
            })
            .map_err(|e| OttoError::Storage(format!("List runs since: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}
