//! REST request and response bodies shared by server and client.

use serde::{Deserialize, Serialize};

use crate::session::SessionStatus;

/// Body of `POST /sessions/{id}/activity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityReport {
    /// Client clock, Unix ms. The server clamps it to its own clock.
    pub timestamp: i64,
}

/// How a terminated session is disposed of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposal {
    /// Stop the VM and keep the record until auto-delete.
    Stop,
    /// Stop if needed, then remove everything.
    #[default]
    Delete,
}

impl std::fmt::Display for Disposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposal::Stop => write!(f, "stop"),
            Disposal::Delete => write!(f, "delete"),
        }
    }
}

/// Body of `POST /sessions/terminate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateRequest {
    pub session_ids: Vec<String>,
    #[serde(default)]
    pub disposal: Disposal,
}

/// Outcome for one session of a batch termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateResult {
    pub session_id: String,
    pub ok: bool,
    /// Status after the operation; `deleted` when the record is gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of `POST /sessions/terminate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateResponse {
    pub results: Vec<TerminateResult>,
}

impl TerminateResponse {
    pub fn failures(&self) -> impl Iterator<Item = &TerminateResult> {
        self.results.iter().filter(|r| !r.ok)
    }
}
