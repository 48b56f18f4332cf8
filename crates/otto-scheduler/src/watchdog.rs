//! Watchdog: a self-monitoring sweep that alerts when failed runs pile up
//! inside a lookback window.
//!
//! Alert dedupe is content-addressed: the key hashes the sorted failing run
//! ids plus the window parameters, so an unchanged failure set never re-alerts
//! while any change produces a fresh key.

use std::sync::Arc;

use otto_core::config::{NotifyConfig, WatchdogConfig};
use otto_core::error::Result;
use otto_core::traits::{DedupeOutcome, JobStore, ProfileStore, RunStore};
use otto_core::types::{
    EpochMs, Job, JobStatus, MessagePriority, ScheduleType,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::policy::{gate, GateAction, NotificationPolicy};
use crate::queue::{EnqueueInput, OutboundQueue};

/// Fixed id of the watchdog's own recurring job.
pub const WATCHDOG_TASK_ID: &str = "system-watchdog-failures";

/// How many failed runs one sweep will look at.
const FAILED_RUN_SCAN_LIMIT: i64 = 200;

/// How many failing entries the alert text lists.
const ALERT_DETAIL_LIMIT: usize = 3;

/// What happened to the alert for one sweep. All of these are expected
/// operational states, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStatus {
    /// Below threshold, or the caller did not ask to notify.
    Skipped,
    /// No target chat configured.
    NoChatId,
    /// The notification policy held the alert.
    Held,
    Enqueued,
    Duplicate,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Skipped => "skipped",
            NotificationStatus::NoChatId => "no_chat_id",
            NotificationStatus::Held => "held",
            NotificationStatus::Enqueued => "enqueued",
            NotificationStatus::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogOutcome {
    pub failed_count: usize,
    pub notification: NotificationStatus,
}

/// The failure sweep. `S` is the store the runtime wires in.
pub struct Watchdog<S: RunStore + ProfileStore> {
    store: Arc<S>,
    queue: OutboundQueue,
    policy: NotificationPolicy,
    config: WatchdogConfig,
    default_chat_id: Option<i64>,
}

impl<S: RunStore + ProfileStore> Watchdog<S> {
    pub fn new(
        store: Arc<S>,
        queue: OutboundQueue,
        config: WatchdogConfig,
        notify: &NotifyConfig,
    ) -> Self {
        Self {
            store,
            queue,
            policy: NotificationPolicy::new(notify.fallback_timezone.clone()),
            config,
            default_chat_id: notify.default_chat_id,
        }
    }

    /// Count failed runs inside the lookback window and enqueue a
    /// high-priority alert when the threshold is met.
    pub fn check_task_failures(
        &self,
        notify: bool,
        chat_override: Option<i64>,
        now: EpochMs,
    ) -> Result<WatchdogOutcome> {
        let since = now - self.config.lookback_minutes * 60_000;
        // Excluded types are filtered inside the query so a burst of excluded
        // failures cannot push real ones past the scan limit.
        let failing = self.store.list_recent_failed_runs(
            since,
            &self.config.excluded_types,
            FAILED_RUN_SCAN_LIMIT,
        )?;
        let failed_count = failing.len();

        if (failed_count as i64) < self.config.max_failures {
            debug!(
                "Watchdog: {failed_count} failure(s) in the last {}min, below threshold",
                self.config.lookback_minutes
            );
            return Ok(WatchdogOutcome { failed_count, notification: NotificationStatus::Skipped });
        }
        warn!(
            "Watchdog: {failed_count} failure(s) in the last {}min",
            self.config.lookback_minutes
        );
        if !notify {
            return Ok(WatchdogOutcome { failed_count, notification: NotificationStatus::Skipped });
        }

        let Some(chat_id) = chat_override.or(self.default_chat_id) else {
            return Ok(WatchdogOutcome { failed_count, notification: NotificationStatus::NoChatId });
        };

        let profile = self.policy.resolve_effective_profile(self.store.get()?);
        if gate(&profile, MessagePriority::High, now).action == GateAction::Hold {
            return Ok(WatchdogOutcome { failed_count, notification: NotificationStatus::Held });
        }

        let dedupe_key = self.failure_set_key(&failing);
        let mut content = format!(
            "⚠️ {failed_count} task run(s) failed in the last {} minute(s):",
            self.config.lookback_minutes
        );
        for run in failing.iter().take(ALERT_DETAIL_LIMIT) {
            let error = run.error_message.as_deref().unwrap_or("unknown error");
            content.push_str(&format!("\n• {}: {error}", run.job_type));
        }
        if failed_count > ALERT_DETAIL_LIMIT {
            content.push_str(&format!("\n… and {} more", failed_count - ALERT_DETAIL_LIMIT));
        }

        let result = self.queue.enqueue_message(
            EnqueueInput {
                chat_id,
                content,
                dedupe_key: Some(dedupe_key),
                priority: Some(MessagePriority::High),
            },
            now,
        )?;

        let notification = match result.status {
            DedupeOutcome::Enqueued => {
                info!("🐶 Watchdog alert enqueued ({failed_count} failure(s))");
                NotificationStatus::Enqueued
            }
            DedupeOutcome::Duplicate => NotificationStatus::Duplicate,
        };
        Ok(WatchdogOutcome { failed_count, notification })
    }

    /// Content hash over the sorted failing run ids and the sweep parameters.
    fn failure_set_key(&self, failing: &[otto_core::types::FailedRun]) -> String {
        let mut ids: Vec<&str> = failing.iter().map(|r| r.run_id.as_str()).collect();
        ids.sort_unstable();

        let mut hasher = Sha256::new();
        for id in ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(
            format!("{}:{}", self.config.lookback_minutes, self.config.max_failures).as_bytes(),
        );
        format!("watchdog:{:x}", hasher.finalize())
    }
}

/// Insert the watchdog's own recurring job on first boot. A no-op when the
/// fixed id already exists, so restarts never duplicate it.
pub fn ensure_watchdog_task(
    store: &dyn JobStore,
    config: &WatchdogConfig,
    now: EpochMs,
) -> Result<bool> {
    if store.get_by_id(WATCHDOG_TASK_ID)?.is_some() {
        return Ok(false);
    }
    store.create_task(&Job {
        id: WATCHDOG_TASK_ID.into(),
        job_type: "watchdog_failures".into(),
        status: JobStatus::Idle,
        schedule: ScheduleType::Recurring,
        run_at: None,
        cadence_minutes: Some(config.cadence_minutes),
        next_run_at: Some(now + config.cadence_minutes * 60_000),
        payload: "{}".into(),
        terminal_state: None,
        terminal_reason: None,
        lock_token: None,
        lock_expires_at: None,
        profile_id: None,
        model_ref: None,
        created_at: now,
        updated_at: now,
    })?;
    info!("🐶 Watchdog task installed ({WATCHDOG_TASK_ID})");
    Ok(true)
}
