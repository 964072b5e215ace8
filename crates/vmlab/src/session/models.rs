//! Session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use vmlab_protocol::{SessionInfo, SessionStatus};

pub const MINUTE_MS: i64 = 60_000;

/// Session record from the database. All timestamps are Unix ms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    /// Subject of the user who started it.
    pub owner: String,
    pub template_id: String,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub console_endpoint: Option<String>,
    pub idle_timeout_minutes: i64,
    pub auto_delete_minutes: i64,
    pub last_active_at: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub error_message: Option<String>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Server-side idle deadline.
    pub fn idle_deadline(&self) -> i64 {
        self.last_active_at + self.idle_timeout_minutes * MINUTE_MS
    }

    /// Running and past its idle deadline.
    pub fn is_idle_expired(&self, now: i64) -> bool {
        self.status == SessionStatus::Running && now > self.idle_deadline()
    }

    /// Terminal for longer than `auto_delete_minutes`.
    pub fn is_auto_delete_due(&self, now: i64) -> bool {
        if !matches!(
            self.status,
            SessionStatus::Stopped | SessionStatus::Completed
        ) {
            return false;
        }
        let since = self.stopped_at.unwrap_or(self.last_active_at);
        now > since + self.auto_delete_minutes * MINUTE_MS
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            owner: self.owner.clone(),
            template_id: self.template_id.clone(),
            status: self.status,
            console_endpoint: self.console_endpoint.clone(),
            last_active_at: self.last_active_at,
            idle_timeout_minutes: self.idle_timeout_minutes,
            auto_delete_minutes: self.auto_delete_minutes,
            created_at: self.created_at,
            stopped_at: self.stopped_at,
            error_message: self.error_message.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_session(id: &str, owner: &str, status: SessionStatus, last_active_at: i64) -> Session {
    Session {
        id: id.to_string(),
        owner: owner.to_string(),
        template_id: "t1".to_string(),
        status,
        console_endpoint: None,
        idle_timeout_minutes: 30,
        auto_delete_minutes: 5,
        last_active_at,
        created_at: last_active_at,
        started_at: None,
        stopped_at: None,
        error_message: None,
    }
}
