//! Background reclamation of idle and abandoned sessions.
//!
//! Each tick looks at every stored session once:
//! - `running` past its idle deadline is disposed of, unless it was touched
//!   after the listing
//! - `stopping` (a disposal that failed earlier) is retried
//! - `pending` past the provisioning timeout with no watcher is dropped
//! - `stopped`/`completed` past `auto_delete_minutes` is deleted
//!
//! Failures are logged and picked up again on the next tick.

use anyhow::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vmlab_protocol::SessionStatus;
use vmlab_protocol::api::Disposal;

use crate::session::{Session, SessionService};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// What happens to sessions that went idle.
    pub disposal: Disposal,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            disposal: Disposal::Delete,
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperReport {
    pub idle: Vec<String>,
    pub retried: Vec<String>,
    pub abandoned: Vec<String>,
    pub auto_deleted: Vec<String>,
    /// `(session_id, error)` for every action that failed.
    pub failed: Vec<(String, String)>,
}

impl ReaperReport {
    pub fn is_empty(&self) -> bool {
        self.idle.is_empty()
            && self.retried.is_empty()
            && self.abandoned.is_empty()
            && self.auto_deleted.is_empty()
            && self.failed.is_empty()
    }
}

enum Action {
    Idle,
    Retry,
    Abandon,
    AutoDelete,
}

pub struct Reaper {
    sessions: SessionService,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(sessions: SessionService, config: ReaperConfig) -> Self {
        Self { sessions, config }
    }

    fn action_for(&self, session: &Session, now: i64) -> Option<Action> {
        match session.status {
            SessionStatus::Running if session.is_idle_expired(now) => Some(Action::Idle),
            SessionStatus::Stopping => Some(Action::Retry),
            SessionStatus::Pending => {
                let timeout = self.sessions.config().provisioning_timeout.as_millis() as i64;
                let stale = now > session.created_at.max(session.last_active_at) + timeout;
                (stale && !self.sessions.is_provisioning(&session.id)).then_some(Action::Abandon)
            }
            SessionStatus::Stopped | SessionStatus::Completed
                if session.is_auto_delete_due(now) =>
            {
                Some(Action::AutoDelete)
            }
            _ => None,
        }
    }

    /// One sweep at `now` (Unix ms).
    pub async fn tick(&self, now: i64) -> Result<ReaperReport> {
        let mut report = ReaperReport::default();

        for session in self.sessions.list_sessions().await? {
            let Some(action) = self.action_for(&session, now) else {
                continue;
            };
            let id = session.id.clone();

            let result = match action {
                Action::Idle => {
                    info!(
                        "Session {} idle since {} ({} min timeout), disposing ({})",
                        id, session.last_active_at, session.idle_timeout_minutes, self.config.disposal
                    );
                    // Activity may have landed since the listing; re-checked under the lock.
                    self.sessions
                        .terminate_if_idle(&id, now, self.config.disposal)
                        .await
                        .map(|outcome| match outcome {
                            Some(_) => report.idle.push(id.clone()),
                            None => debug!("Session {} became active again, keeping it", id),
                        })
                }
                Action::Retry => {
                    debug!("Retrying disposal of session {}", id);
                    self.sessions
                        .terminate(&id, self.config.disposal)
                        .await
                        .map(|_| report.retried.push(id.clone()))
                }
                Action::Abandon => self
                    .sessions
                    .abandon_provisioning(&id, "provisioning never completed")
                    .await
                    .map(|abandoned| {
                        if abandoned {
                            report.abandoned.push(id.clone())
                        }
                    }),
                Action::AutoDelete => {
                    info!("Auto-deleting session {} ({})", id, session.status);
                    self.sessions
                        .delete_session(&id)
                        .await
                        .map(|_| report.auto_deleted.push(id.clone()))
                }
            };

            if let Err(e) = result {
                warn!("Reaper action on session {} failed: {:?}", id, e);
                report.failed.push((id, e.to_string()));
            }
        }

        if !report.is_empty() {
            info!(
                "Reaper: {} idle, {} retried, {} abandoned, {} auto-deleted, {} failed",
                report.idle.len(),
                report.retried.len(),
                report.abandoned.len(),
                report.auto_deleted.len(),
                report.failed.len()
            );
        }

        Ok(report)
    }

    /// Run `tick` every `interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting session reaper (every {}s, disposal {})",
            self.config.interval.as_secs(),
            self.config.disposal
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Session reaper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.tick(vmlab_protocol::now_ms()).await {
                            warn!("Session reaper sweep failed: {:?}", e);
                        }
                    }
                }
            }
        })
    }
}
