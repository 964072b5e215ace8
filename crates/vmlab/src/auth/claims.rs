//! JWT claims and user roles.

use serde::{Deserialize, Serialize};

/// User role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular user; may only touch their own sessions.
    #[default]
    User,
    /// Administrator; manages templates and every session.
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID). Sessions are owned by this value.
    pub sub: String,

    /// Expiration time (Unix seconds).
    pub exp: i64,

    #[serde(default)]
    pub iat: Option<i64>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub roles: Vec<String>,

    /// Single-role claim, checked before `roles`.
    #[serde(default)]
    pub role: Option<String>,
}

impl Claims {
    pub fn effective_role(&self) -> Role {
        let admin = self
            .role
            .iter()
            .chain(self.roles.iter())
            .any(|r| r.eq_ignore_ascii_case("admin"));

        if admin { Role::Admin } else { Role::User }
    }

    pub fn is_admin(&self) -> bool {
        self.effective_role() == Role::Admin
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.sub)
    }
}
