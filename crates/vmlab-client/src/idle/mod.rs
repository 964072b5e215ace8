//! Idle detection across the dashboard and the console views it opens.
//!
//! ```text
//! ActivityMonitor (dashboard) --+
//!                               +--> IdleCoordinator --effects--> IdleDriver --> server
//! ConsoleEndpoint --ContextLink-+          (pure)                (tokio task)
//! ```
//!
//! The coordinator never touches I/O. It takes timestamped inputs and returns
//! [`Effect`]s; the driver executes them and owns every timer.

mod console;
mod coordinator;
mod driver;
mod link;
mod monitor;
mod store;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use vmlab_protocol::api::Disposal;

pub use console::{ConsoleAction, ConsoleEndpoint};
pub use coordinator::{Effect, IdleCoordinator, IdlePromptState, Wake};
pub use driver::{IdleCommand, IdleDriver, IdleHandle, IdleView};
pub use link::{ChannelWindow, ConsoleWindow, ContextLink, InboundEvent, LinkError};
pub use monitor::{ActivityMonitor, InputSignal, MonitorEvent};
pub use store::{ActivityRecord, ActivityStore, JsonFileStore, MemoryStore};

/// Dashboard idle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// Length of the "are you still there?" countdown.
    pub grace_period_secs: u64,
    /// Session list refresh interval.
    pub refresh_interval_secs: u64,
    /// Handshake retry interval for consoles that have not acknowledged yet,
    /// and recheck interval for consoles holding focus.
    pub handshake_interval_ms: u64,
    /// Unanswered handshakes after which a focused console no longer suspends
    /// the idle clock.
    pub focus_ack_limit: u32,
    /// Minimum spacing between activity reports to the server.
    pub activity_report_interval_secs: u64,
    /// What ending a session does on the server.
    pub disposal: Disposal,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 300,
            refresh_interval_secs: 5,
            handshake_interval_ms: 1_000,
            focus_ack_limit: 5,
            activity_report_interval_secs: 60,
            disposal: Disposal::Delete,
        }
    }
}

impl IdleConfig {
    pub fn grace_period_ms(&self) -> i64 {
        secs_to_ms(self.grace_period_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn handshake_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_interval_ms.max(10))
    }

    pub fn activity_report_interval_ms(&self) -> i64 {
        secs_to_ms(self.activity_report_interval_secs)
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1_000) * 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IdleConfig::default();
        assert_eq!(config.grace_period_ms(), 300_000);
        assert_eq!(config.refresh_interval(), Duration::from_secs(5));
        assert_eq!(config.disposal, Disposal::Delete);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: IdleConfig =
            serde_json::from_str(r#"{"grace_period_secs": 60, "disposal": "stop"}"#).unwrap();
        assert_eq!(config.grace_period_ms(), 60_000);
        assert_eq!(config.disposal, Disposal::Stop);
        assert_eq!(config.activity_report_interval_secs, 60);
    }
}
