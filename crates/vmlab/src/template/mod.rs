//! VM templates: what a user may start, and the limits each session inherits.

mod models;
mod repository;

pub use models::{
    CreateTemplateRequest, NetworkMode, OsType, Template, UpdateTemplateRequest,
    DEFAULT_AUTO_DELETE_MINUTES, DEFAULT_IDLE_TIMEOUT_MINUTES,
};
pub use repository::TemplateRepository;
