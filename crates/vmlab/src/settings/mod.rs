//! Runtime settings administrators can change without a restart.

mod models;
mod repository;

pub use models::{ConcurrencySettings, IdleTimeoutSettings, RuntimeSettings};
pub use repository::SettingsRepository;
