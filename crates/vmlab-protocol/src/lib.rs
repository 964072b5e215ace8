//! Wire types shared by the vmlab server and its clients.
//!
//! ```text
//! Console view <--[context messages]--> Dashboard <--[REST: sessions, activity]--> Server
//!                                                                                    |
//!                                                                              Orchestrator
//! ```
//!
//! The dashboard and console views never share memory. Everything they tell each
//! other travels as a [`context::ContextMessage`]; everything the dashboard tells
//! the server travels through the REST types in [`api`].

pub mod api;
pub mod context;
pub mod session;

pub use context::{ContextMessage, EndReason, MessageKind};
pub use session::{SessionInfo, SessionStatus};

/// Current wall clock as Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
