//! VM session lifecycle.
//!
//! Sessions move `pending -> running -> stopping -> stopped | completed` and are
//! removed on delete. Stop and delete are idempotent.

mod models;
mod repository;
mod service;

pub use models::{MINUTE_MS, Session};
pub use repository::SessionRepository;
pub use service::{SessionService, SessionServiceConfig, TerminateOutcome};
