//! Otto configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{OttoError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OttoConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
}

fn default_db_path() -> String {
    "~/.otto/otto.db".into()
}

impl Default for OttoConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            watchdog: WatchdogConfig::default(),
            notify: NotifyConfig::default(),
            telegram: None,
        }
    }
}

impl OttoConfig {
    /// Load config from the default path (~/.otto/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OttoError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| OttoError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| OttoError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Otto home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".otto")
    }
}

/// Scheduler kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Interval between claim ticks.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Max jobs claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Lease duration; an executor that outlives this gets its job re-claimed.
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: i64,
}

fn bool_true() -> bool {
    true
}
fn default_tick_ms() -> u64 {
    30_000
}
fn default_batch_size() -> usize {
    5
}
fn default_lock_lease_ms() -> i64 {
    10 * 60 * 1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_ms: default_tick_ms(),
            batch_size: default_batch_size(),
            lock_lease_ms: default_lock_lease_ms(),
        }
    }
}

/// Outbound delivery queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// First-retry delay; doubles per attempt up to `max_delay_ms`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: i64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: i64,
    /// Attempts before a message is terminally failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    /// Transport per-message size limit; longer content is chunked.
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    /// Persisted error messages are truncated to this length.
    #[serde(default = "default_max_error_len")]
    pub max_error_len: usize,
}

fn default_base_delay_ms() -> i64 {
    5_000
}
fn default_max_delay_ms() -> i64 {
    5 * 60 * 1000
}
fn default_max_attempts() -> i64 {
    5
}
fn default_max_message_len() -> usize {
    4_000
}
fn default_max_error_len() -> usize {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            max_message_len: default_max_message_len(),
            max_error_len: default_max_error_len(),
        }
    }
}

/// Watchdog failure-sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: i64,
    /// Alert threshold: failures within the lookback window.
    #[serde(default = "default_max_failures")]
    pub max_failures: i64,
    /// Cadence of the watchdog's own recurring job.
    #[serde(default = "default_watchdog_cadence")]
    pub cadence_minutes: i64,
    /// Task types excluded from the failure count.
    #[serde(default = "default_excluded_types")]
    pub excluded_types: Vec<String>,
}

fn default_lookback_minutes() -> i64 {
    60
}
fn default_max_failures() -> i64 {
    3
}
fn default_watchdog_cadence() -> i64 {
    30
}
fn default_excluded_types() -> Vec<String> {
    vec!["heartbeat".into(), "watchdog_failures".into()]
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            lookback_minutes: default_lookback_minutes(),
            max_failures: default_max_failures(),
            cadence_minutes: default_watchdog_cadence(),
            excluded_types: default_excluded_types(),
        }
    }
}

/// Notification routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Default chat id for system notifications (watchdog, heartbeat).
    #[serde(default)]
    pub default_chat_id: Option<i64>,
    /// Used when a profile carries an unparsable IANA timezone.
    #[serde(default = "default_fallback_timezone")]
    pub fallback_timezone: String,
    /// Cadence of the heartbeat's own recurring job.
    #[serde(default = "default_heartbeat_cadence")]
    pub heartbeat_cadence_minutes: i64,
}

fn default_fallback_timezone() -> String {
    "UTC".into()
}
fn default_heartbeat_cadence() -> i64 {
    6 * 60
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            default_chat_id: None,
            fallback_timezone: default_fallback_timezone(),
            heartbeat_cadence_minutes: default_heartbeat_cadence(),
        }
    }
}

/// Telegram transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: String,
}
