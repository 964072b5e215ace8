//! Authentication configuration.

use super::Role;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accept configured dev users without a signed token.
    pub dev_mode: bool,

    /// HS256 secret. Supports `env:VAR_NAME`. Required unless `dev_mode`.
    pub jwt_secret: Option<String>,

    /// Users accepted in dev mode.
    pub dev_users: Vec<DevUser>,

    /// Allowed CORS origins.
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            jwt_secret: None,
            dev_users: Vec::new(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8080".to_string(),
            ],
        }
    }
}

impl AuthConfig {
    /// Resolve the JWT secret, expanding `env:VAR_NAME` syntax.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>, ConfigValidationError> {
        match &self.jwt_secret {
            None => Ok(None),
            Some(value) => match value.strip_prefix("env:") {
                Some(var_name) => match std::env::var(var_name) {
                    Ok(secret) if !secret.is_empty() => Ok(Some(secret)),
                    Ok(_) => Err(ConfigValidationError::EnvVarEmpty(var_name.to_string())),
                    Err(_) => Err(ConfigValidationError::EnvVarNotFound(var_name.to_string())),
                },
                None => Ok(Some(value.clone())),
            },
        }
    }

    /// Reject configurations that would leave the API unauthenticated.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.dev_mode {
            return Ok(());
        }

        match self.resolve_jwt_secret()? {
            None => Err(ConfigValidationError::MissingJwtSecret),
            Some(secret) if secret.len() < 32 => Err(ConfigValidationError::JwtSecretTooShort),
            Some(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    MissingJwtSecret,
    JwtSecretTooShort,
    EnvVarNotFound(String),
    EnvVarEmpty(String),
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingJwtSecret => write!(
                f,
                "JWT secret is required when dev_mode is false. Set VMLAB__AUTH__JWT_SECRET or auth.jwt_secret in config."
            ),
            Self::JwtSecretTooShort => {
                write!(f, "JWT secret must be at least 32 characters long.")
            }
            Self::EnvVarNotFound(var) => write!(
                f,
                "Environment variable '{}' not found (referenced via env:{} in config).",
                var, var
            ),
            Self::EnvVarEmpty(var) => write!(
                f,
                "Environment variable '{}' is empty (referenced via env:{} in config).",
                var, var
            ),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// A user accepted in dev mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: Role,
}
