//! Authentication.
//!
//! Tokens are issued elsewhere; this module only validates them:
//! - HS256 JWTs signed with the configured secret
//! - Dev mode with configured users (`X-Dev-User` header or `dev:<id>` tokens)

mod claims;
mod config;
mod error;
mod middleware;

pub use claims::{Claims, Role};
pub use config::{AuthConfig, ConfigValidationError, DevUser};
pub use error::AuthError;
pub use middleware::{AuthState, CurrentUser, RequireAdmin, auth_middleware};
