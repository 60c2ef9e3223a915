//! Timeout configuration and pure deadline checks.
//!
//! The checks here are pure (no store access); the Dispatcher (C7) is
//! responsible for querying due tasks/workflows and applying the outcome —
//! see `crate::worker::dispatcher`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-activity timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    /// Schedule-to-close: total time budget from scheduling to terminal outcome.
    pub schedule_to_close_secs: Option<f64>,
    /// Maximum time between heartbeats (`None` = no heartbeat required).
    pub heartbeat_secs: Option<f64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            schedule_to_close_secs: None,
            heartbeat_secs: None,
        }
    }
}

impl TimeoutConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schedule_to_close(mut self, secs: f64) -> Self {
        self.schedule_to_close_secs = Some(secs);
        self
    }

    pub fn with_heartbeat(mut self, secs: f64) -> Self {
        self.heartbeat_secs = Some(secs);
        self
    }
}

/// The cause of a timeout, used to pick the persisted `ErrorCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    /// Activity exceeded its schedule-to-close deadline.
    ScheduleToClose,
    /// No heartbeat arrived within `heartbeat_secs`.
    Heartbeat,
    /// Workflow execution exceeded its own `expires_at`.
    Workflow,
}

/// True if `expires_at` has passed relative to `now`.
pub fn is_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.is_some_and(|at| at <= now)
}

/// True if a running activity's heartbeat has gone stale.
///
/// `last_heartbeat_at` falls back to `started_at` when no heartbeat has been
/// recorded yet, matching the reference engine's behavior.
pub fn heartbeat_is_stale(
    started_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    heartbeat_secs: Option<f64>,
    now: DateTime<Utc>,
) -> bool {
    let Some(heartbeat_secs) = heartbeat_secs else {
        return false;
    };
    let Some(started_at) = started_at else {
        return false;
    };
    let last_beat = last_heartbeat_at.unwrap_or(started_at);
    let elapsed = now.signed_duration_since(last_beat).to_std().unwrap_or(Duration::ZERO);
    elapsed.as_secs_f64() > heartbeat_secs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn expired_when_deadline_passed() {
        let now = Utc::now();
        assert!(is_expired(Some(now - ChronoDuration::seconds(1)), now));
        assert!(!is_expired(Some(now + ChronoDuration::seconds(1)), now));
        assert!(!is_expired(None, now));
    }

    #[test]
    fn heartbeat_stale_after_timeout() {
        let now = Utc::now();
        let started = now - ChronoDuration::seconds(60);
        let stale_beat = now - ChronoDuration::seconds(30);
        assert!(heartbeat_is_stale(
            Some(started),
            Some(stale_beat),
            Some(10.0),
            now
        ));
    }

    #[test]
    fn heartbeat_not_stale_within_timeout() {
        let now = Utc::now();
        let started = now - ChronoDuration::seconds(60);
        let fresh_beat = now - ChronoDuration::seconds(2);
        assert!(!heartbeat_is_stale(
            Some(started),
            Some(fresh_beat),
            Some(10.0),
            now
        ));
    }

    #[test]
    fn heartbeat_falls_back_to_started_at() {
        let now = Utc::now();
        let started = now - ChronoDuration::seconds(60);
        assert!(heartbeat_is_stale(Some(started), None, Some(10.0), now));
    }

    #[test]
    fn no_heartbeat_config_never_stale() {
        let now = Utc::now();
        assert!(!heartbeat_is_stale(Some(now), Some(now), None, now));
    }

    #[test]
    fn timeout_config_builder() {
        let config = TimeoutConfig::new()
            .with_schedule_to_close(30.0)
            .with_heartbeat(10.0);
        assert_eq!(config.schedule_to_close_secs, Some(30.0));
        assert_eq!(config.heartbeat_secs, Some(10.0));
    }

    #[test]
    fn timeout_config_serialization_round_trips() {
        let config = TimeoutConfig::new().with_heartbeat(5.0);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: TimeoutConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
