//! Singleton notification profile row.

use otto_core::error::{OttoError, Result};
use otto_core::traits::ProfileStore;
use otto_core::types::{EpochMs, NotificationProfile, QuietMode};

use crate::SqliteStore;

impl ProfileStore for SqliteStore {
    fn get(&self) -> Result<Option<NotificationProfile>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT timezone, quiet_hours_start, quiet_hours_end, quiet_mode, mute_until,
                        heartbeat_cadence_minutes, heartbeat_only_if_signal,
                        onboarded_at, last_digest_at
                 FROM notification_profile WHERE id = 1",
            )
            .map_err(|e| OttoError::Storage(format!("Profile get: {e}")))?;
        let profile = stmt
            .query_row([], |row| {
                let quiet_mode: String = row.get(3)?;
                Ok(NotificationProfile {
                    timezone: row.get(0)?,
                    quiet_hours_start: row.get(1)?,
                    quiet_hours_end: row.get(2)?,
                    quiet_mode: QuietMode::parse(&quiet_mode),
                    mute_until: row.get(4)?,
                    heartbeat_cadence_minutes: row.get(5)?,
                    heartbeat_only_if_signal: row.get::<_, i64>(6)? != 0,
                    onboarded_at: row.get(7)?,
                    last_digest_at: row.get(8)?,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(OttoError::Storage(format!("Profile get: {other}"))),
            })?;
        Ok(profile)
    }

    fn set_last_digest_at(&self, ts: EpochMs) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO notification_profile (id, last_digest_at) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET last_digest_at = excluded.last_digest_at",
            rusqlite::params![ts],
        )
        .map_err(|e| OttoError::Storage(format!("Profile set digest: {e}")))?;
        Ok(())
    }
}

impl SqliteStore {
    /// Write the full profile row (settings surface; not part of the core
    /// repository contract).
    pub fn put_profile(&self, profile: &NotificationProfile) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO notification_profile
             (id, timezone, quiet_hours_start, quiet_hours_end, quiet_mode, mute_until,
              heartbeat_cadence_minutes, heartbeat_only_if_signal, onboarded_at, last_digest_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 timezone = excluded.timezone,
                 quiet_hours_start = excluded.quiet_hours_start,
                 quiet_hours_end = excluded.quiet_hours_end,
                 quiet_mode = excluded.quiet_mode,
                 mute_until = excluded.mute_until,
                 heartbeat_cadence_minutes = excluded.heartbeat_cadence_minutes,
                 heartbeat_only_if_signal = excluded.heartbeat_only_if_signal,
                 onboarded_at = excluded.onboarded_at,
                 last_digest_at = excluded.last_digest_at",
            rusqlite::params![
                profile.timezone,
                profile.quiet_hours_start,
                profile.quiet_hours_end,
                profile.quiet_mode.as_str(),
                profile.mute_until,
                profile.heartbeat_cadence_minutes,
                profile.heartbeat_only_if_signal as i64,
                profile.onboarded_at,
                profile.last_digest_at,
            ],
        )
        .map_err(|e| OttoError::Storage(format!("Profile put: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_profile_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get().unwrap().is_none());
    }

    #[test]
    fn test_put_and_get_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let profile = NotificationProfile {
            timezone: "Europe/Berlin".into(),
            quiet_hours_start: Some("20:00".into()),
            quiet_hours_end: Some("08:00".into()),
            quiet_mode: QuietMode::CriticalOnly,
            mute_until: Some(9_999),
            heartbeat_cadence_minutes: Some(360),
            heartbeat_only_if_signal: false,
            onboarded_at: Some(1_000),
            last_digest_at: None,
        };
        store.put_profile(&profile).unwrap();

        let loaded = store.get().unwrap().unwrap();
        assert_eq!(loaded.timezone, "Europe/Berlin");
        assert_eq!(loaded.quiet_mode, QuietMode::CriticalOnly);
        assert!(!loaded.heartbeat_only_if_signal);
    }

    #[test]
    fn test_set_last_digest_creates_or_updates() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_last_digest_at(5_000).unwrap();
        assert_eq!(store.get().unwrap().unwrap().last_digest_at, Some(5_000));

        store.set_last_digest_at(6_000).unwrap();
        assert_eq!(store.get().unwrap().unwrap().last_digest_at, Some(6_000));
    }
}
