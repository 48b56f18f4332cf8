//! Data model for scheduled jobs, run history, audit, and outbound delivery.
//!
//! All timestamps are epoch milliseconds (UTC). Lease and backoff arithmetic is
//! integer math end to end, so the storage layer never parses dates on the hot
//! path.

use serde::{Deserialize, Serialize};

/// Epoch milliseconds, UTC.
pub type EpochMs = i64;

/// Current time as epoch milliseconds.
pub fn now_ms() -> EpochMs {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a fresh uuid-v4 identifier with a type prefix, e.g. `job-…`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

// ─── Jobs ──────────────────────────────────────────────────────

/// Job status while non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
        }
    }

    /// Parse a stored tag; unknown values fall back to `Idle`.
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            _ => JobStatus::Idle,
        }
    }
}

/// How a job's occurrences are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Single occurrence at `run_at`.
    Oneshot,
    /// Repeats every `cadence_minutes`; next occurrence recomputed after each run.
    Recurring,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Oneshot => "oneshot",
            ScheduleType::Recurring => "recurring",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "recurring" => ScheduleType::Recurring,
            _ => ScheduleType::Oneshot,
        }
    }
}

/// Terminal job states. Once set, the job is never claimed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Completed,
    Cancelled,
    Expired,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalState::Completed => "completed",
            TerminalState::Cancelled => "cancelled",
            TerminalState::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(TerminalState::Completed),
            "cancelled" => Some(TerminalState::Cancelled),
            "expired" => Some(TerminalState::Expired),
            _ => None,
        }
    }
}

/// A scheduled unit of work.
///
/// The payload is an opaque type-tagged JSON string; only the execution engine
/// for the matching `job_type` decodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id. Runtime-owned jobs use the `system-` prefix.
    pub id: String,
    /// Type tag, e.g. "agent_prompt", "heartbeat", "watchdog_failures".
    pub job_type: String,
    pub status: JobStatus,
    pub schedule: ScheduleType,
    /// Oneshot trigger time (epoch ms).
    pub run_at: Option<EpochMs>,
    /// Recurring interval in minutes.
    pub cadence_minutes: Option<i64>,
    /// Drives claiming: the job is due once `next_run_at <= now`.
    pub next_run_at: Option<EpochMs>,
    /// Opaque type-tagged JSON payload.
    pub payload: String,
    pub terminal_state: Option<TerminalState>,
    pub terminal_reason: Option<String>,
    /// Lease token; non-null iff status is running and the lease has not expired.
    pub lock_token: Option<String>,
    pub lock_expires_at: Option<EpochMs>,
    /// Execution-config hints, opaque to the scheduling core.
    pub profile_id: Option<String>,
    pub model_ref: Option<String>,
    pub created_at: EpochMs,
    pub updated_at: EpochMs,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.terminal_state.is_some()
    }

    /// Whether the job currently holds an unexpired lease.
    pub fn has_live_lease(&self, now: EpochMs) -> bool {
        self.status == JobStatus::Running
            && self.lock_token.is_some()
            && self.lock_expires_at.is_some_and(|exp| exp > now)
    }
}

// ─── Job runs ──────────────────────────────────────────────────

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => RunStatus::Success,
            "skipped" => RunStatus::Skipped,
            _ => RunStatus::Failed,
        }
    }
}

/// One append-only row per execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub job_id: String,
    /// The occurrence this attempt was claimed for.
    pub scheduled_for: EpochMs,
    pub started_at: EpochMs,
    /// Null while the attempt is in flight.
    pub finished_at: Option<EpochMs>,
    pub status: RunStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub result_json: Option<String>,
    pub created_at: EpochMs,
}

impl JobRun {
    /// Start a new in-flight run record for a claimed job.
    pub fn begin(job_id: &str, scheduled_for: EpochMs, now: EpochMs) -> Self {
        Self {
            id: new_id("run"),
            job_id: job_id.to_string(),
            scheduled_for,
            started_at: now,
            finished_at: None,
            status: RunStatus::Failed,
            error_code: None,
            error_message: None,
            result_json: None,
            created_at: now,
        }
    }
}

/// A finished-or-running attempt joined with its job's type tag, for the
/// heartbeat digest. Carries no payload or prompt content.
#[derive(Debug, Clone)]
pub struct RunDigestRow {
    pub job_id: String,
    pub job_type: String,
    pub status: RunStatus,
    pub started_at: EpochMs,
    pub finished_at: Option<EpochMs>,
}

/// A failed run joined with its job's type tag, for the watchdog sweep.
#[derive(Debug, Clone)]
pub struct FailedRun {
    pub run_id: String,
    pub job_id: String,
    pub job_type: String,
    pub finished_at: EpochMs,
    pub error_message: Option<String>,
}

// ─── Audit ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
        }
    }
}

/// Origin of a mutation — user-driven vs automation-driven. Audit-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLane {
    Interactive,
    Scheduled,
}

impl AuditLane {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditLane::Interactive => "interactive",
            AuditLane::Scheduled => "scheduled",
        }
    }
}

/// Append-only record of one task mutation, with before/after snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAuditRecord {
    pub id: String,
    pub task_id: String,
    pub action: AuditAction,
    pub lane: AuditLane,
    pub actor: String,
    pub before_json: Option<String>,
    pub after_json: Option<String>,
    pub metadata_json: Option<String>,
    pub created_at: EpochMs,
}

// ─── Outbound delivery ─────────────────────────────────────────

/// Delivery priority; `Critical` bypasses quiet hours and mute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "low" => MessagePriority::Low,
            "high" => MessagePriority::High,
            "critical" => MessagePriority::Critical,
            _ => MessagePriority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundStatus {
    Queued,
    Sent,
    Failed,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundStatus::Queued => "queued",
            OutboundStatus::Sent => "sent",
            OutboundStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => OutboundStatus::Sent,
            "failed" => OutboundStatus::Failed,
            _ => OutboundStatus::Queued,
        }
    }
}

/// One durable outbound chat message (a single chunk after splitting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: String,
    /// Globally unique when present; re-enqueue with the same key is a no-op.
    pub dedupe_key: Option<String>,
    pub chat_id: i64,
    pub content: String,
    pub priority: MessagePriority,
    pub status: OutboundStatus,
    pub attempt_count: i64,
    /// The delivery processor picks the row up once `next_attempt_at <= now`.
    pub next_attempt_at: EpochMs,
    pub sent_at: Option<EpochMs>,
    pub failed_at: Option<EpochMs>,
    pub error_message: Option<String>,
    pub created_at: EpochMs,
    pub updated_at: EpochMs,
}

// ─── Notification profile ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuietMode {
    Off,
    CriticalOnly,
}

impl QuietMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuietMode::Off => "off",
            QuietMode::CriticalOnly => "critical_only",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "critical_only" => QuietMode::CriticalOnly,
            _ => QuietMode::Off,
        }
    }
}

/// Singleton per-install notification preferences, persisted as-is.
/// Normalization and fallbacks happen in the policy gate, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationProfile {
    /// IANA timezone name, e.g. "Europe/Berlin".
    pub timezone: String,
    /// "HH:mm"; the window may wrap midnight (e.g. 20:00–08:00).
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub quiet_mode: QuietMode,
    /// Hold non-critical notifications until this time (epoch ms).
    pub mute_until: Option<EpochMs>,
    pub heartbeat_cadence_minutes: Option<i64>,
    /// When true, a heartbeat window with zero runs produces no message.
    pub heartbeat_only_if_signal: bool,
    pub onboarded_at: Option<EpochMs>,
    pub last_digest_at: Option<EpochMs>,
}

impl Default for NotificationProfile {
    fn default() -> Self {
        Self {
            timezone: "UTC".into(),
            quiet_hours_start: None,
            quiet_hours_end: None,
            quiet_mode: QuietMode::Off,
            mute_until: None,
            heartbeat_cadence_minutes: None,
            heartbeat_only_if_signal: true,
            onboarded_at: None,
            last_digest_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [JobStatus::Idle, JobStatus::Running, JobStatus::Paused] {
            assert_eq!(JobStatus::parse(s.as_str()), s);
        }
        assert_eq!(JobStatus::parse("garbage"), JobStatus::Idle);
    }

    #[test]
    fn test_live_lease() {
        let mut job = Job {
            id: new_id("job"),
            job_type: "agent_prompt".into(),
            status: JobStatus::Running,
            schedule: ScheduleType::Recurring,
            run_at: None,
            cadence_minutes: Some(30),
            next_run_at: Some(1_000),
            payload: "{}".into(),
            terminal_state: None,
            terminal_reason: None,
            lock_token: Some("tok".into()),
            lock_expires_at: Some(2_000),
            profile_id: None,
            model_ref: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(job.has_live_lease(1_999));
        assert!(!job.has_live_lease(2_000));
        job.status = JobStatus::Idle;
        assert!(!job.has_live_lease(1_000));
    }

    #[test]
    fn test_terminal_parse() {
        assert_eq!(TerminalState::parse("cancelled"), Some(TerminalState::Cancelled));
        assert_eq!(TerminalState::parse(""), None);
    }
}
