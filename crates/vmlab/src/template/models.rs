//! Template data models.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const DEFAULT_IDLE_TIMEOUT_MINUTES: i64 = 30;
pub const DEFAULT_AUTO_DELETE_MINUTES: i64 = 5;

const CPU_CORES: std::ops::RangeInclusive<i64> = 1..=32;
const RAM_MB: std::ops::RangeInclusive<i64> = 512..=262_144;
const AUTO_DELETE_MINUTES: std::ops::RangeInclusive<i64> = 1..=30;
const IDLE_TIMEOUT_MINUTES: std::ops::RangeInclusive<i64> = 1..=1440;

/// Network isolation requested from the orchestrator. Enforcement is the orchestrator's job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Bridge,
    Host,
    None,
    Unrestricted,
    Isolated,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkMode::Bridge => "bridge",
            NetworkMode::Host => "host",
            NetworkMode::None => "none",
            NetworkMode::Unrestricted => "unrestricted",
            NetworkMode::Isolated => "isolated",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bridge" => Ok(NetworkMode::Bridge),
            "host" => Ok(NetworkMode::Host),
            "none" => Ok(NetworkMode::None),
            "unrestricted" => Ok(NetworkMode::Unrestricted),
            "isolated" => Ok(NetworkMode::Isolated),
            _ => Err(format!("unknown network mode: {}", s)),
        }
    }
}

impl TryFrom<String> for NetworkMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Windows,
    #[default]
    Linux,
}

impl std::fmt::Display for OsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsType::Windows => write!(f, "windows"),
            OsType::Linux => write!(f, "linux"),
        }
    }
}

impl std::str::FromStr for OsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "windows" => Ok(OsType::Windows),
            "linux" => Ok(OsType::Linux),
            _ => Err(format!("unknown os type: {}", s)),
        }
    }
}

impl TryFrom<String> for OsType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A startable VM configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[sqlx(try_from = "String")]
    pub os_type: OsType,
    pub image_id: String,
    pub cpu_cores: i64,
    pub ram_mb: i64,
    pub idle_timeout_minutes: i64,
    pub auto_delete_minutes: i64,
    #[sqlx(try_from = "String")]
    pub network_mode: NetworkMode,
    pub enabled: bool,
    /// Unix ms.
    pub created_at: i64,
}

impl Template {
    /// Check every bounded field. Messages are user-facing.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("invalid template: name must not be empty");
        }
        if self.image_id.trim().is_empty() {
            bail!("invalid template: image_id must not be empty");
        }
        check_range("cpu_cores", self.cpu_cores, &CPU_CORES)?;
        check_range("ram_mb", self.ram_mb, &RAM_MB)?;
        check_range(
            "idle_timeout_minutes",
            self.idle_timeout_minutes,
            &IDLE_TIMEOUT_MINUTES,
        )?;
        check_range(
            "auto_delete_minutes",
            self.auto_delete_minutes,
            &AUTO_DELETE_MINUTES,
        )?;
        Ok(())
    }
}

fn check_range(field: &str, value: i64, range: &std::ops::RangeInclusive<i64>) -> Result<()> {
    if !range.contains(&value) {
        bail!(
            "invalid template: {} must be between {} and {} (got {})",
            field,
            range.start(),
            range.end(),
            value
        );
    }
    Ok(())
}

/// Body of `POST /admin/templates`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub os_type: OsType,
    pub image_id: String,
    pub cpu_cores: i64,
    pub ram_mb: i64,
    /// Falls back to the runtime default when absent.
    #[serde(default)]
    pub idle_timeout_minutes: Option<i64>,
    #[serde(default = "default_auto_delete")]
    pub auto_delete_minutes: i64,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_auto_delete() -> i64 {
    DEFAULT_AUTO_DELETE_MINUTES
}

fn default_enabled() -> bool {
    true
}

impl CreateTemplateRequest {
    pub fn into_template(self, id: String, created_at: i64, default_idle_timeout: i64) -> Template {
        Template {
            id,
            name: self.name,
            description: self.description,
            os_type: self.os_type,
            image_id: self.image_id,
            cpu_cores: self.cpu_cores,
            ram_mb: self.ram_mb,
            idle_timeout_minutes: self.idle_timeout_minutes.unwrap_or(default_idle_timeout),
            auto_delete_minutes: self.auto_delete_minutes,
            network_mode: self.network_mode,
            enabled: self.enabled,
            created_at,
        }
    }
}

/// Body of `PATCH /admin/templates/{id}`. Absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTemplateRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub os_type: Option<OsType>,
    pub image_id: Option<String>,
    pub cpu_cores: Option<i64>,
    pub ram_mb: Option<i64>,
    pub idle_timeout_minutes: Option<i64>,
    pub auto_delete_minutes: Option<i64>,
    pub network_mode: Option<NetworkMode>,
    pub enabled: Option<bool>,
}

impl UpdateTemplateRequest {
    pub fn apply(self, mut template: Template) -> Template {
        if let Some(name) = self.name {
            template.name = name;
        }
        if self.description.is_some() {
            template.description = self.description;
        }
        if let Some(os_type) = self.os_type {
            template.os_type = os_type;
        }
        if let Some(image_id) = self.image_id {
            template.image_id = image_id;
        }
        if let Some(cpu_cores) = self.cpu_cores {
            template.cpu_cores = cpu_cores;
        }
        if let Some(ram_mb) = self.ram_mb {
            template.ram_mb = ram_mb;
        }
        if let Some(minutes) = self.idle_timeout_minutes {
            template.idle_timeout_minutes = minutes;
        }
        if let Some(minutes) = self.auto_delete_minutes {
            template.auto_delete_minutes = minutes;
        }
        if let Some(mode) = self.network_mode {
            template.network_mode = mode;
        }
        if let Some(enabled) = self.enabled {
            template.enabled = enabled;
        }
        template
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Template {
        Template {
            id: "t1".to_string(),
            name: "Ubuntu desktop".to_string(),
            description: None,
            os_type: OsType::Linux,
            image_id: "img-ubuntu".to_string(),
            cpu_cores: 2,
            ram_mb: 4096,
            idle_timeout_minutes: 30,
            auto_delete_minutes: 5,
            network_mode: NetworkMode::Bridge,
            enabled: true,
            created_at: 0,
        }
    }

    #[test]
    fn test_valid_template() {
        assert!(template().validate().is_ok());
    }

    #[test]
    fn test_bounds() {
        let cases = [
            Template { cpu_cores: 0, ..template() },
            Template { cpu_cores: 33, ..template() },
            Template { ram_mb: 511, ..template() },
            Template { ram_mb: 262_145, ..template() },
            Template { idle_timeout_minutes: 0, ..template() },
            Template { idle_timeout_minutes: 1441, ..template() },
            Template { auto_delete_minutes: 31, ..template() },
            Template { name: "  ".to_string(), ..template() },
        ];

        for case in cases {
            let err = case.validate().unwrap_err().to_string();
            assert!(err.starts_with("invalid template"), "{err}");
        }

        let edges = Template {
            cpu_cores: 32,
            ram_mb: 512,
            idle_timeout_minutes: 1440,
            auto_delete_minutes: 1,
            ..template()
        };
        assert!(edges.validate().is_ok());
    }

    #[test]
    fn test_create_request_defaults() {
        let req: CreateTemplateRequest = serde_json::from_str(
            r#"{"name":"Win11","image_id":"img-win","cpu_cores":4,"ram_mb":8192}"#,
        )
        .unwrap();
        let t = req.into_template("t2".to_string(), 1, 45);

        assert_eq!(t.idle_timeout_minutes, 45);
        assert_eq!(t.network_mode, NetworkMode::Bridge);
        assert_eq!(t.os_type, OsType::Linux);
        assert!(t.enabled);
    }

    #[test]
    fn test_update_keeps_absent_fields() {
        let update = UpdateTemplateRequest {
            enabled: Some(false),
            network_mode: Some(NetworkMode::Isolated),
            ..UpdateTemplateRequest::default()
        };
        let t = update.apply(template());

        assert!(!t.enabled);
        assert_eq!(t.network_mode, NetworkMode::Isolated);
        assert_eq!(t.cpu_cores, 2);
    }

    #[test]
    fn test_network_mode_parse() {
        assert_eq!("isolated".parse::<NetworkMode>().unwrap(), NetworkMode::Isolated);
        assert!("nat".parse::<NetworkMode>().is_err());
    }
}
