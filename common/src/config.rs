// Layered configuration: defaults file, local overrides, then environment

use crate::auth::{AuthContext, AuthPolicy, DEFAULT_PRIVILEGED_ROLES};
use crate::errors::ValidationError;
use crate::scheduler::SchedulerConfig;
use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub scheduler: SchedulerSettings,
    pub auth: AuthSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub poll_interval_seconds: u64,
    pub max_candidates_per_poll: usize,
    /// IANA name used to interpret appointment dates and times
    #[serde(default = "default_timezone_name")]
    pub timezone: String,
}

fn default_timezone_name() -> String {
    "UTC".to_string()
}

/// Actor the background scheduler runs on behalf of
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    pub authenticated: bool,
    pub role: String,
    #[serde(default = "default_privileged_roles")]
    pub privileged_roles: Vec<String>,
}

fn default_privileged_roles() -> Vec<String> {
    DEFAULT_PRIVILEGED_ROLES.iter().map(|r| r.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl SchedulerSettings {
    pub fn parsed_timezone(&self) -> Result<Tz, ValidationError> {
        self.timezone
            .trim()
            .parse::<Tz>()
            .map_err(|e| ValidationError::InvalidFieldValue {
                field: "scheduler.timezone".to_string(),
                reason: e.to_string(),
            })
    }
}

impl AuthSettings {
    pub fn context(&self) -> AuthContext {
        AuthContext {
            is_authenticated: self.authenticated,
            role: self.role.clone(),
        }
    }

    pub fn policy(&self) -> AuthPolicy {
        AuthPolicy::new(&self.privileged_roles)
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → local → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Not committed; per-host overrides
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("auth.privileged_roles")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.store.backend == StoreBackend::Postgres {
            if self.database.url.trim().is_empty() {
                return Err(ValidationError::MissingField("database.url".to_string()));
            }
            if self.database.max_connections == 0 {
                return Err(invalid("database.max_connections", "must be greater than 0"));
            }
            if self.database.min_connections > self.database.max_connections {
                return Err(invalid(
                    "database.min_connections",
                    "must not exceed max_connections",
                ));
            }
        }

        if self.scheduler.poll_interval_seconds == 0 {
            return Err(invalid("scheduler.poll_interval_seconds", "must be greater than 0"));
        }
        if self.scheduler.max_candidates_per_poll == 0 {
            return Err(invalid("scheduler.max_candidates_per_poll", "must be greater than 0"));
        }
        self.scheduler.parsed_timezone()?;

        if self
            .auth
            .privileged_roles
            .iter()
            .all(|role| role.trim().is_empty())
        {
            return Err(ValidationError::MissingField("auth.privileged_roles".to_string()));
        }

        Ok(())
    }

    /// Driver configuration derived from the `[scheduler]` section
    pub fn scheduler_config(&self) -> Result<SchedulerConfig, ValidationError> {
        Ok(SchedulerConfig {
            poll_interval_seconds: self.scheduler.poll_interval_seconds,
            max_candidates_per_poll: self.scheduler.max_candidates_per_poll,
            timezone: self.scheduler.parsed_timezone()?,
        })
    }
}

fn invalid(field: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidFieldValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/yard_dispatch".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            store: StoreConfig::default(),
            scheduler: SchedulerSettings {
                poll_interval_seconds: 30,
                max_candidates_per_poll: 200,
                timezone: default_timezone_name(),
            },
            auth: AuthSettings {
                authenticated: false,
                role: String::new(),
                privileged_roles: default_privileged_roles(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        let config = settings.scheduler_config().unwrap();
        assert_eq!(config.poll_interval_seconds, 30);
        assert_eq!(config.max_candidates_per_poll, 200);
        assert_eq!(config.timezone, Tz::UTC);
    }

    #[test]
    fn test_validation_catches_empty_database_url_for_postgres() {
        let mut settings = Settings::default();
        settings.database.url = String::new();
        assert_eq!(
            settings.validate(),
            Err(ValidationError::MissingField("database.url".to_string()))
        );

        settings.store.backend = StoreBackend::Memory;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_zero_interval_and_limit() {
        let mut settings = Settings::default();
        settings.scheduler.poll_interval_seconds = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.scheduler.max_candidates_per_poll = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_unknown_timezone() {
        let mut settings = Settings::default();
        settings.scheduler.timezone = "Mars/Olympus_Mons".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ValidationError::InvalidFieldValue { ref field, .. }) if field == "scheduler.timezone"
        ));
    }

    #[test]
    fn test_validation_catches_empty_privileged_roles() {
        let mut settings = Settings::default();
        settings.auth.privileged_roles = vec!["  ".to_string()];
        assert_eq!(
            settings.validate(),
            Err(ValidationError::MissingField("auth.privileged_roles".to_string()))
        );
    }

    #[test]
    fn test_load_from_path_layers_local_over_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
[database]
url = "postgresql://localhost/yard"
max_connections = 5
min_connections = 1
connect_timeout_seconds = 10

[scheduler]
poll_interval_seconds = 30
max_candidates_per_poll = 200

[auth]
authenticated = true
role = "driver"

[observability]
log_level = "info"
metrics_port = 9090
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("local.toml"),
            r#"
[store]
backend = "memory"

[scheduler]
poll_interval_seconds = 5
timezone = "America/Sao_Paulo"

[auth]
role = "lead"
"#,
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.scheduler.poll_interval_seconds, 5);
        assert_eq!(settings.scheduler.max_candidates_per_poll, 200);
        assert_eq!(
            settings.scheduler.parsed_timezone().unwrap(),
            chrono_tz::America::Sao_Paulo
        );
        assert_eq!(settings.auth.role, "lead");
        assert_eq!(settings.auth.privileged_roles, vec!["admin", "lead"]);
        assert!(settings.auth.policy().permits(&settings.auth.context()));
        assert!(settings.observability.tracing_endpoint.is_none());
    }
}
