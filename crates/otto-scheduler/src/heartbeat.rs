//! Heartbeat: a periodic compact status digest, distinct from alerting.
//!
//! The digest summarizes run counts and active task-type labels only. Raw
//! prompts, payloads, and tool names never reach the notification channel.

use std::sync::Arc;

use otto_core::config::NotifyConfig;
use otto_core::error::Result;
use otto_core::traits::{DedupeOutcome, JobStore, ProfileStore, RunStore};
use otto_core::types::{
    EpochMs, Job, JobStatus, MessagePriority, RunStatus, ScheduleType,
};
use tracing::{debug, info};

use crate::policy::{gate, GateAction, NotificationPolicy};
use crate::queue::{EnqueueInput, OutboundQueue};
use crate::watchdog::NotificationStatus;

/// Fixed id of the heartbeat's own recurring job.
pub const HEARTBEAT_TASK_ID: &str = "system-heartbeat";

/// Distinct task-type labels shown per digest.
const MAX_TYPE_LABELS: usize = 6;

const RUN_SCAN_LIMIT: i64 = 500;

/// Aggregated run counts for one digest window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunDigest {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Distinct active task types, first-seen order, capped.
    pub type_labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    pub digest: RunDigest,
    pub notification: NotificationStatus,
}

/// The digest emitter.
pub struct Heartbeat<S: RunStore + ProfileStore> {
    store: Arc<S>,
    queue: OutboundQueue,
    policy: NotificationPolicy,
    default_chat_id: Option<i64>,
    default_cadence_minutes: i64,
}

impl<S: RunStore + ProfileStore> Heartbeat<S> {
    pub fn new(store: Arc<S>, queue: OutboundQueue, notify: &NotifyConfig) -> Self {
        Self {
            store,
            queue,
            policy: NotificationPolicy::new(notify.fallback_timezone.clone()),
            default_chat_id: notify.default_chat_id,
            default_cadence_minutes: notify.heartbeat_cadence_minutes,
        }
    }

    /// Summarize runs since the previous digest and emit one compact message.
    ///
    /// A window with zero runs produces no message unless the profile turned
    /// `heartbeat_only_if_signal` off. `last_digest_at` advances only on emit.
    pub fn execute_heartbeat_task(&self, now: EpochMs) -> Result<HeartbeatOutcome> {
        let profile = self.policy.resolve_effective_profile(self.store.get()?);

        let cadence = profile
            .heartbeat_cadence_minutes
            .unwrap_or(self.default_cadence_minutes);
        let since = profile.last_digest_at.unwrap_or(now - cadence * 60_000);

        let mut digest = RunDigest::default();
        for row in self.store.list_runs_since(since, RUN_SCAN_LIMIT)? {
            if row.job_type == "heartbeat" {
                continue;
            }
            digest.total += 1;
            match row.status {
                RunStatus::Success => digest.success += 1,
                RunStatus::Failed => digest.failed += 1,
                RunStatus::Skipped => digest.skipped += 1,
            }
            if !digest.type_labels.contains(&row.job_type)
                && digest.type_labels.len() < MAX_TYPE_LABELS
            {
                digest.type_labels.push(row.job_type);
            }
        }

        if digest.total == 0 && profile.heartbeat_only_if_signal {
            debug!("Heartbeat: no runs since {since}, staying quiet");
            return Ok(HeartbeatOutcome { digest, notification: NotificationStatus::Skipped });
        }

        let Some(chat_id) = self.default_chat_id else {
            return Ok(HeartbeatOutcome { digest, notification: NotificationStatus::NoChatId });
        };

        if gate(&profile, MessagePriority::Normal, now).action == GateAction::Hold {
            return Ok(HeartbeatOutcome { digest, notification: NotificationStatus::Held });
        }

        let mut content = format!(
            "💓 {} run(s): {} ok, {} failed, {} skipped",
            digest.total, digest.success, digest.failed, digest.skipped
        );
        if !digest.type_labels.is_empty() {
            content.push_str(&format!("\nActive: {}", digest.type_labels.join(", ")));
        }

        let result = self.queue.enqueue_message(
            EnqueueInput {
                chat_id,
                content,
                dedupe_key: Some(format!("heartbeat:{since}")),
                priority: Some(MessagePriority::Normal),
            },
            now,
        )?;

        let notification = match result.status {
            DedupeOutcome::Enqueued => {
                self.store.set_last_digest_at(now)?;
                info!("💓 Heartbeat digest enqueued ({} run(s))", digest.total);
                NotificationStatus::Enqueued
            }
            DedupeOutcome::Duplicate => NotificationStatus::Duplicate,
        };
        Ok(HeartbeatOutcome { digest, notification })
    }
}

/// Insert the heartbeat's own recurring job on first boot; a no-op when the
/// fixed id already exists.
pub fn ensure_heartbeat_task(
    store: &dyn JobStore,
    notify: &NotifyConfig,
    now: EpochMs,
) -> Result<bool> {
    if store.get_by_id(HEARTBEAT_TASK_ID)?.is_some() {
        return Ok(false);
    }
    let cadence = notify.heartbeat_cadence_minutes;
    store.create_task(&Job {
        id: HEARTBEAT_TASK_ID.into(),
        job_type: "heartbeat".into(),
        status: JobStatus::Idle,
        schedule: ScheduleType::Recurring,
        run_at: None,
        cadence_minutes: Some(cadence),
        next_run_at: Some(now + cadence * 60_000),
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
    info!("💓 Heartbeat task installed ({HEARTBEAT_TASK_ID})");
    Ok(true)
}
