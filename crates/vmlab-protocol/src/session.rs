//! Session lifecycle types.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a VM session.
///
/// `pending -> running -> stopping -> stopped | completed -> deleted`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Provisioning requested, console not reachable yet.
    Pending,
    /// VM is up and the console endpoint is live.
    Running,
    /// Stop issued to the orchestrator.
    Stopping,
    /// Stopped, resources released.
    Stopped,
    /// The VM exited on its own.
    Completed,
    /// Removed. Only ever reported, never persisted.
    Deleted,
}

impl SessionStatus {
    /// Still holding (or about to hold) compute resources.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Stopping)
    }

    /// Resources released; only deletion remains.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Deleted)
    }

    /// Counts toward the idle deadline.
    pub fn counts_for_idle(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Stopping => write!(f, "stopping"),
            SessionStatus::Stopped => write!(f, "stopped"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Deleted => write!(f, "deleted"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "stopping" => Ok(SessionStatus::Stopping),
            "stopped" => Ok(SessionStatus::Stopped),
            "completed" => Ok(SessionStatus::Completed),
            "deleted" => Ok(SessionStatus::Deleted),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A session as returned by the REST API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub owner: String,
    pub template_id: String,
    pub status: SessionStatus,
    /// Console URL, present once provisioning completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_endpoint: Option<String>,
    /// Server-side last activity, Unix ms.
    pub last_active_at: i64,
    pub idle_timeout_minutes: i64,
    pub auto_delete_minutes: i64,
    /// Unix ms.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
