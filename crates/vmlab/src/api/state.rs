//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::reaper::Reaper;
use crate::session::SessionService;
use crate::template::TemplateRepository;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionService,
    pub templates: TemplateRepository,
    pub reaper: Arc<Reaper>,
    pub auth: AuthState,
}

impl AppState {
    pub fn new(
        sessions: SessionService,
        templates: TemplateRepository,
        reaper: Arc<Reaper>,
        auth: AuthState,
    ) -> Self {
        Self {
            sessions,
            templates,
            reaper,
            auth,
        }
    }
}
