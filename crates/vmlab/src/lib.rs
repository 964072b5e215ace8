//! vmlab server library.
//!
//! Provisions ephemeral per-user VM sessions through an external orchestrator,
//! tracks their lifecycle, and reclaims them when nobody is using them.

pub mod api;
pub mod auth;
pub mod db;
pub mod orchestrator;
pub mod reaper;
pub mod session;
pub mod settings;
pub mod template;
