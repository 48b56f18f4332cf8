//! SQLite-backed persistence for the Otto scheduling core.
//!
//! One database file holds jobs, run history, the mutation audit trail, the
//! outbound delivery queue, and the singleton notification profile. Every state
//! transition the core performs is a single narrow statement here; the only
//! multi-statement operation is `claim_due`, which runs in one transaction so
//! two concurrent claimants can never both win the same job.

mod audit;
mod jobs;
mod outbound;
mod profile;
mod runs;

use std::path::Path;
use std::sync::Mutex;

use otto_core::error::{OttoError, Result};
use rusqlite::Connection;

/// SQLite store implementing every repository contract in `otto_core::traits`.
pub struct SqliteStore {
    pub(crate) conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| OttoError::Storage(format!("DB open: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| OttoError::Storage(format!("DB open: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub(crate) fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| OttoError::Storage(format!("DB lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            -- Scheduled jobs (oneshot, recurring); never physically deleted
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'idle',
                schedule_type TEXT NOT NULL,
                run_at INTEGER,
                cadence_minutes INTEGER,
                next_run_at INTEGER,
                payload TEXT NOT NULL DEFAULT '{}',
                terminal_state TEXT,
                terminal_reason TEXT,
                lock_token TEXT,
                lock_expires_at INTEGER,
                profile_id TEXT,
                model_ref TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_next_run
                ON jobs(next_run_at) WHERE terminal_state IS NULL;

            -- One append-only row per execution attempt
            CREATE TABLE IF NOT EXISTS job_runs (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                scheduled_for INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                status TEXT NOT NULL,
                error_code TEXT,
                error_message TEXT,
                result_json TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_job ON job_runs(job_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_runs_finished ON job_runs(finished_at);

            -- Mutation audit trail
            CREATE TABLE IF NOT EXISTS task_audit (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                action TEXT NOT NULL,
                lane TEXT NOT NULL,
                actor TEXT NOT NULL,
                before_json TEXT,
                after_json TEXT,
                metadata_json TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_task ON task_audit(task_id, created_at);

            -- Durable outbound delivery queue (one row per chunk)
            CREATE TABLE IF NOT EXISTS outbound_messages (
                id TEXT PRIMARY KEY,
                dedupe_key TEXT,
                chat_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'normal',
                status TEXT NOT NULL DEFAULT 'queued',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                sent_at INTEGER,
                failed_at INTEGER,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            -- The dedupe invariant: same logical message enqueued twice is a no-op
            CREATE UNIQUE INDEX IF NOT EXISTS idx_outbound_dedupe
                ON outbound_messages(dedupe_key) WHERE dedupe_key IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_outbound_due
                ON outbound_messages(next_attempt_at) WHERE status = 'queued';

            -- Singleton notification profile
            CREATE TABLE IF NOT EXISTS notification_profile (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                timezone TEXT NOT NULL DEFAULT 'UTC',
                quiet_hours_start TEXT,
                quiet_hours_end TEXT,
                quiet_mode TEXT NOT NULL DEFAULT 'off',
                mute_until INTEGER,
                heartbeat_cadence_minutes INTEGER,
                heartbeat_only_if_signal INTEGER NOT NULL DEFAULT 1,
                onboarded_at INTEGER,
                last_digest_at INTEGER
            );
            ",
        )
        .map_err(|e| OttoError::Storage(format!("Migration: {e}")))?;
        Ok(())
    }
}
