//! Runtime settings models.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

const MAX_CONCURRENT_SESSIONS: std::ops::RangeInclusive<i64> = 1..=5000;
const PER_USER_SESSION_LIMIT: std::ops::RangeInclusive<i64> = 1..=100;
const IDLE_TIMEOUT_MINUTES: std::ops::RangeInclusive<i64> = 1..=1440;

/// Limits in force right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RuntimeSettings {
    /// Cluster-wide cap on pending + running sessions.
    pub max_concurrent_sessions: i64,
    pub per_user_session_limit: i64,
    /// Idle timeout for templates created without one.
    pub default_idle_timeout_minutes: i64,
}

impl RuntimeSettings {
    pub fn validate(&self) -> Result<()> {
        check_range(
            "max_concurrent_sessions",
            self.max_concurrent_sessions,
            &MAX_CONCURRENT_SESSIONS,
        )?;
        check_range(
            "per_user_session_limit",
            self.per_user_session_limit,
            &PER_USER_SESSION_LIMIT,
        )?;
        check_range(
            "default_idle_timeout_minutes",
            self.default_idle_timeout_minutes,
            &IDLE_TIMEOUT_MINUTES,
        )
    }
}

fn check_range(field: &str, value: i64, range: &std::ops::RangeInclusive<i64>) -> Result<()> {
    if !range.contains(&value) {
        bail!(
            "invalid settings: {} must be between {} and {} (got {})",
            field,
            range.start(),
            range.end(),
            value
        );
    }
    Ok(())
}

/// Body of `POST /admin/settings/concurrency`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConcurrencySettings {
    pub max_concurrent_sessions: i64,
    pub per_user_session_limit: i64,
}

impl ConcurrencySettings {
    pub fn apply(self, current: RuntimeSettings) -> RuntimeSettings {
        RuntimeSettings {
            max_concurrent_sessions: self.max_concurrent_sessions,
            per_user_session_limit: self.per_user_session_limit,
            ..current
        }
    }
}

/// Body of `POST /admin/settings/idle-timeout`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IdleTimeoutSettings {
    pub idle_timeout_minutes: i64,
}

impl IdleTimeoutSettings {
    pub fn apply(self, current: RuntimeSettings) -> RuntimeSettings {
        RuntimeSettings {
            default_idle_timeout_minutes: self.idle_timeout_minutes,
            ..current
        }
    }
}
