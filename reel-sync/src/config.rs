//! Engine configuration.
//!
//! All timing knobs live here so tests can shrink them. Values are plain
//! integers (milliseconds or seconds) for easy JSON overrides; the
//! `Duration` accessors are what the engine reads.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CollabError;

/// Retry policy for shared-file reads and writes.
///
/// Attempt `n` (1-based) that fails waits `base_delay × n` before the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 200,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(attempt as u64))
    }
}

/// Per-peer transport lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Time allowed to go from CONNECTING to CONNECTED.
    pub connect_timeout_ms: u64,
    /// Reconnect attempts after a failure before the connection is CLOSED.
    pub max_reconnect_attempts: u32,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Outbound frames buffered per channel before `send` reports failure.
    pub channel_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 2_000,
            heartbeat_interval_secs: 10,
            channel_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Adaptive sync cadence tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncCadenceConfig {
    pub collaborating_interval_ms: u64,
    pub active_interval_ms: u64,
    /// Trailing window over which local mutations are counted.
    pub activity_window_secs: u64,
    /// Mutations within the window that switch to the active tier.
    pub activity_threshold: usize,
}

impl Default for SyncCadenceConfig {
    fn default() -> Self {
        Self {
            collaborating_interval_ms: 5_000,
            active_interval_ms: 3_000,
            activity_window_secs: 60,
            activity_threshold: 5,
        }
    }
}

impl SyncCadenceConfig {
    pub fn collaborating_interval(&self) -> Duration {
        Duration::from_millis(self.collaborating_interval_ms)
    }

    pub fn active_interval(&self) -> Duration {
        Duration::from_millis(self.active_interval_ms)
    }

    pub fn activity_window(&self) -> Duration {
        Duration::from_secs(self.activity_window_secs)
    }
}

/// Top-level configuration for a [`crate::session::CollaborationSession`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub presence_interval_secs: u64,
    /// Records older than this are evicted.
    pub presence_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    /// Remote viewer entries (frame/cursor) expire after this long without updates.
    pub peer_presence_idle_secs: u64,
    /// Broadcast channel capacity for outward events.
    pub event_capacity: usize,
    pub file_retry: RetryPolicy,
    pub sync: SyncCadenceConfig,
    pub connection: ConnectionConfig,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            presence_interval_secs: 10,
            presence_timeout_secs: 45,
            lock_timeout_secs: 60,
            peer_presence_idle_secs: 30,
            event_capacity: 256,
            file_retry: RetryPolicy::default(),
            sync: SyncCadenceConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl CollabConfig {
    /// Load overrides from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CollabError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CollabError::Config(format!("{}: {e}", path.as_ref().display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| CollabError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall timers or make every record stale.
    pub fn validate(&self) -> Result<(), CollabError> {
        if self.presence_interval_secs == 0 {
            return Err(CollabError::Config("presence_interval_secs must be > 0".into()));
        }
        if self.presence_timeout_secs <= self.presence_interval_secs {
            return Err(CollabError::Config(
                "presence_timeout_secs must exceed presence_interval_secs".into(),
            ));
        }
        if self.sync.collaborating_interval_ms == 0 || self.sync.active_interval_ms == 0 {
            return Err(CollabError::Config("sync intervals must be > 0".into()));
        }
        if self.file_retry.attempts == 0 {
            return Err(CollabError::Config("file_retry.attempts must be >= 1".into()));
        }
        Ok(())
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_secs(self.presence_interval_secs)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_secs(self.presence_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn peer_presence_idle(&self) -> Duration {
        Duration::from_secs(self.peer_presence_idle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.presence_timeout(), Duration::from_secs(45));
        assert_eq!(config.lock_timeout(), Duration::from_secs(60));
        assert_eq!(config.sync.collaborating_interval(), Duration::from_secs(5));
        assert_eq!(config.sync.active_interval(), Duration::from_secs(3));
        assert_eq!(config.sync.activity_threshold, 5);
        assert_eq!(config.connection.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.connection.max_reconnect_attempts, 3);
        assert_eq!(config.file_retry.attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_delay_is_linear() {
        let policy = RetryPolicy { attempts: 3, base_delay_ms: 100 };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));
    }

    #[test]
    fn test_partial_json_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "lock_timeout_secs": 30, "connection": {{ "max_reconnect_attempts": 5 }} }}"#
        )
        .unwrap();

        let config = CollabConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.lock_timeout_secs, 30);
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        // Untouched keys keep defaults
        assert_eq!(config.presence_timeout_secs, 45);
        assert_eq!(config.connection.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CollabConfig {
            presence_interval_secs: 60,
            presence_timeout_secs: 45,
            ..CollabConfig::default()
        };
        assert!(matches!(config.validate(), Err(CollabError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = CollabConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, CollabError::Config(_)));
    }
}
