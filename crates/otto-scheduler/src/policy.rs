//! Notification policy gate: decides whether a notification is delivered now
//! or held, based on quiet hours, mute, and criticality.
//!
//! Normalization happens once in `resolve_effective_profile`; the gate itself
//! is a pure function over the normalized profile and a timestamp.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use otto_core::types::{EpochMs, MessagePriority, NotificationProfile, QuietMode};
use tracing::warn;

/// What to do with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    DeliverNow,
    Hold,
}

/// Why the gate decided what it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    CriticalBypass,
    QuietHours,
    Muted,
    Clear,
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::CriticalBypass => "critical_bypass",
            GateReason::QuietHours => "quiet_hours",
            GateReason::Muted => "muted",
            GateReason::Clear => "clear",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub action: GateAction,
    pub reason: GateReason,
}

/// A persisted profile after normalization: timezone resolved to a concrete
/// `Tz`, quiet hours parsed, everything else carried through.
#[derive(Debug, Clone)]
pub struct EffectiveProfile {
    pub timezone: Tz,
    /// Local-time window; may wrap midnight (start > end).
    pub quiet_window: Option<(NaiveTime, NaiveTime)>,
    pub quiet_mode: QuietMode,
    pub mute_until: Option<EpochMs>,
    pub heartbeat_cadence_minutes: Option<i64>,
    pub heartbeat_only_if_signal: bool,
    pub last_digest_at: Option<EpochMs>,
}

/// Profile normalization with documented fallbacks.
pub struct NotificationPolicy {
    fallback_timezone: String,
}

impl NotificationPolicy {
    pub fn new(fallback_timezone: impl Into<String>) -> Self {
        Self { fallback_timezone: fallback_timezone.into() }
    }

    /// Normalize a raw profile (or its absence). An unparsable IANA timezone
    /// falls back to the configured default rather than failing; a malformed
    /// or half-open quiet window is dropped.
    pub fn resolve_effective_profile(&self, raw: Option<NotificationProfile>) -> EffectiveProfile {
        let raw = raw.unwrap_or_default();

        let timezone = raw.timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!(
                "Unparsable timezone {:?}, falling back to {}",
                raw.timezone, self.fallback_timezone
            );
            self.fallback_timezone.parse::<Tz>().unwrap_or(Tz::UTC)
        });

        let quiet_window = match (
            raw.quiet_hours_start.as_deref().and_then(parse_hhmm),
            raw.quiet_hours_end.as_deref().and_then(parse_hhmm),
        ) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        };

        EffectiveProfile {
            timezone,
            quiet_window,
            quiet_mode: raw.quiet_mode,
            mute_until: raw.mute_until,
            heartbeat_cadence_minutes: raw.heartbeat_cadence_minutes,
            heartbeat_only_if_signal: raw.heartbeat_only_if_signal,
            last_digest_at: raw.last_digest_at,
        }
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Whether `t` falls inside the window. A wrapping window (e.g. 20:00-08:00)
/// covers the two segments around midnight.
fn in_window(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        t >= start && t < end
    } else {
        t >= start || t < end
    }
}

/// Gate one notification.
///
/// Critical priority always delivers, unconditionally. Otherwise quiet hours
/// (when `quiet_mode` enforces them) hold first, then an active mute, then
/// the message is clear to go.
pub fn gate(profile: &EffectiveProfile, priority: MessagePriority, now: EpochMs) -> GateDecision {
    if priority == MessagePriority::Critical {
        return GateDecision { action: GateAction::DeliverNow, reason: GateReason::CriticalBypass };
    }

    if profile.quiet_mode == QuietMode::CriticalOnly {
        if let Some((start, end)) = profile.quiet_window {
            let local = DateTime::<Utc>::from_timestamp_millis(now)
                .map(|dt| dt.with_timezone(&profile.timezone).time());
            if local.is_some_and(|t| in_window(t, start, end)) {
                return GateDecision { action: GateAction::Hold, reason: GateReason::QuietHours };
            }
        }
    }

    if profile.mute_until.is_some_and(|until| until > now) {
        return GateDecision { action: GateAction::Hold, reason: GateReason::Muted };
    }

    GateDecision { action: GateAction::DeliverNow, reason: GateReason::Clear }
}
