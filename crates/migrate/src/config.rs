//! Configuration for the migration runner
//!
//! Both structs have sensible defaults and can be loaded from the environment.
//! `DatabaseConfig` understands either a full `DATABASE_URL` or the libpq-style
//! `PG*` variables used by the rest of the backend.

use std::env;
use std::path::{Path, PathBuf};

/// Configuration error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

impl ConfigError {
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }
}

/// Configuration for the migration system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Directory where migration files are stored
    pub migrations_dir: PathBuf,
    /// Subdirectory of `migrations_dir` that receives rollback templates
    pub rollback_subdir: String,
    /// Table tracking applied migrations
    pub migrations_table: String,
    /// Audit table of apply / mark / reset attempts
    pub history_table: String,
    /// Key/value table holding `migration_system_version`
    pub config_table: String,
    /// Actor recorded in `applied_by` for executed migrations
    pub applied_by: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            rollback_subdir: "rollbacks".to_string(),
            migrations_table: "schema_migrations".to_string(),
            history_table: "migration_history".to_string(),
            config_table: "migration_config".to_string(),
            applied_by: "migration_runner".to_string(),
        }
    }
}

impl MigrationConfig {
    /// Configuration rooted at a specific migrations directory
    pub fn with_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            migrations_dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(dir) = env::var("MIGRATIONS_DIR") {
            config.migrations_dir = PathBuf::from(dir);
        }
        if let Ok(table) = env::var("MIGRATIONS_TABLE") {
            config.migrations_table = table;
        }
        if let Ok(table) = env::var("MIGRATION_HISTORY_TABLE") {
            config.history_table = table;
        }
        if let Ok(table) = env::var("MIGRATION_CONFIG_TABLE") {
            config.config_table = table;
        }
        if let Ok(actor) = env::var("MIGRATION_ACTOR") {
            config.applied_by = actor;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("migrations_table", &self.migrations_table),
            ("history_table", &self.history_table),
            ("config_table", &self.config_table),
        ] {
            if !is_sql_identifier(value) {
                return Err(ConfigError::invalid_value(
                    field,
                    value.as_str(),
                    "a SQL identifier ([A-Za-z_][A-Za-z0-9_]*, optionally schema-qualified)",
                ));
            }
        }

        if self.rollback_subdir.is_empty()
            || self.rollback_subdir.contains(['/', '\\'])
            || self.rollback_subdir == ".."
        {
            return Err(ConfigError::invalid_value(
                "rollback_subdir",
                self.rollback_subdir.as_str(),
                "a single directory name",
            ));
        }

        if self.applied_by.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "applied_by".to_string(),
                hint: "Set MIGRATION_ACTOR or leave it unset for the default".to_string(),
            });
        }

        Ok(())
    }

    /// Directory receiving rollback templates
    pub fn rollback_dir(&self) -> PathBuf {
        self.migrations_dir.join(&self.rollback_subdir)
    }
}

/// Table names may be interpolated into SQL, so only plain identifiers pass.
fn is_sql_identifier(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    value.split('.').count() <= 2
        && value.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// Database connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Seconds to wait for a pooled connection
    pub acquire_timeout: u64,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: 30,
        }
    }

    /// Load from `DATABASE_URL`, falling back to `PGUSER`/`PGPASSWORD`/`PGHOST`/`PGPORT`/`PGDATABASE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = match env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => Self::url_from_pg_vars()?,
        };

        let mut config = Self::new(url);

        if let Ok(max) = env::var("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = max.parse().map_err(|_| {
                ConfigError::invalid_value("max_connections", max.as_str(), "a positive integer")
            })?;
        }
        if let Ok(timeout) = env::var("DATABASE_ACQUIRE_TIMEOUT") {
            config.acquire_timeout = timeout.parse().map_err(|_| {
                ConfigError::invalid_value("acquire_timeout", timeout.as_str(), "seconds as an integer")
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    fn url_from_pg_vars() -> Result<String, ConfigError> {
        let user = env::var("PGUSER").unwrap_or_else(|_| "pathfinder".to_string());
        let host = env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let database = env::var("PGDATABASE").unwrap_or_else(|_| "pathfinder".to_string());
        let port = env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::invalid_value("PGPORT", port.as_str(), "valid port number (0-65535)"))?;

        let mut url = url::Url::parse(&format!("postgres://{}:{}/{}", host, port, database))
            .map_err(|e| ConfigError::invalid_value("PGHOST", host.as_str(), e.to_string()))?;
        // Credentials can only be rejected for cannot-be-a-base URLs, which postgres:// is not.
        let _ = url.set_username(&user);
        if let Ok(password) = env::var("PGPASSWORD") {
            let _ = url.set_password(Some(&password));
        }
        Ok(url.to_string())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.url.starts_with("postgresql://") && !self.url.starts_with("postgres://") {
            return Err(ConfigError::invalid_value(
                "database_url",
                self.redacted_url(),
                "postgres:// or postgresql:// URL",
            ));
        }
        if self.max_connections == 0 || self.min_connections > self.max_connections {
            return Err(ConfigError::invalid_value(
                "max_connections",
                self.max_connections.to_string(),
                "at least 1 and not below min_connections",
            ));
        }
        Ok(())
    }

    /// URL safe for logs: the password is replaced with `***`
    pub fn redacted_url(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(mut parsed) => {
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("***"));
                }
                parsed.to_string()
            }
            Err(_) => "<invalid url>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "MIGRATIONS_DIR",
            "MIGRATIONS_TABLE",
            "MIGRATION_HISTORY_TABLE",
            "MIGRATION_CONFIG_TABLE",
            "MIGRATION_ACTOR",
            "DATABASE_URL",
            "DATABASE_MAX_CONNECTIONS",
            "DATABASE_ACQUIRE_TIMEOUT",
            "PGUSER",
            "PGPASSWORD",
            "PGHOST",
            "PGPORT",
            "PGDATABASE",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = MigrationConfig::default();
        assert_eq!(config.migrations_table, "schema_migrations");
        assert_eq!(config.rollback_dir(), PathBuf::from("migrations").join("rollbacks"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_identifier_table() {
        let config = MigrationConfig {
            migrations_table: "schema_migrations; DROP TABLE users".to_string(),
            ..MigrationConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));

        let qualified = MigrationConfig {
            migrations_table: "ops.schema_migrations".to_string(),
            ..MigrationConfig::default()
        };
        assert!(qualified.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_migration_config_from_env() {
        clear_env();
        env::set_var("MIGRATIONS_DIR", "/srv/app/migrations");
        env::set_var("MIGRATION_ACTOR", "deploy_step");

        let config = MigrationConfig::from_env().unwrap();
        assert_eq!(config.migrations_dir, PathBuf::from("/srv/app/migrations"));
        assert_eq!(config.applied_by, "deploy_step");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_database_config_prefers_database_url() {
        clear_env();
        env::set_var("DATABASE_URL", "postgres://alice:secret@db:5432/loot");
        env::set_var("PGHOST", "ignored");

        let config = DatabaseConfig::from_env().unwrap();
        assert_eq!(config.url, "postgres://alice:secret@db:5432/loot");
        assert_eq!(config.redacted_url(), "postgres://alice:***@db:5432/loot");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_database_config_from_pg_vars() {
        clear_env();
        env::set_var("PGUSER", "gm");
        env::set_var("PGHOST", "db.internal");
        env::set_var("PGPORT", "6543");
        env::set_var("PGDATABASE", "campaign");

        let config = DatabaseConfig::from_env().unwrap();
        assert_eq!(config.url, "postgres://gm@db.internal:6543/campaign");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_database_config_rejects_bad_port() {
        clear_env();
        env::set_var("PGPORT", "not-a-port");
        assert!(matches!(
            DatabaseConfig::from_env(),
            Err(ConfigError::InvalidValue { .. })
        ));
        clear_env();
    }

    #[test]
    fn test_database_config_rejects_non_postgres_url() {
        let config = DatabaseConfig::new("mysql://localhost/loot");
        assert!(config.validate().is_err());
    }
}
