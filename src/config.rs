use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::lsn::Lsn;
use crate::mapper::MappingErrorPolicy;
use crate::postgres::{is_valid_identifier, is_valid_slot_name, CreateStyle, TableName};
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub subscription: SubscriptionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub ssl_mode: SslMode,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionConfig {
    pub slot_name: String,
    pub publication_name: String,
    /// `table` or `schema.table`.
    pub table_name: String,
    #[serde(default)]
    pub slot_create_style: CreateStyle,
    #[serde(default)]
    pub publication_create_style: CreateStyle,
    #[serde(default = "default_true")]
    pub reconcile_publication_tables: bool,
    #[serde(default)]
    pub mapping_error_policy: MappingErrorPolicy,
    #[serde(default)]
    pub include_deletes: bool,
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default)]
    pub start_lsn: Option<Lsn>,
}

impl Config {
    /// Loads a TOML file, then applies `PG_SUBSCRIPTION_*` environment
    /// overrides (`PG_SUBSCRIPTION_POSTGRES__HOST`, ...).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_SUBSCRIPTION")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sub = &self.subscription;

        if !is_valid_slot_name(&sub.slot_name) {
            return Err(Error::Config(format!(
                "slot_name '{}' must be 1-63 characters of [a-z0-9_]",
                sub.slot_name
            )));
        }
        if !is_valid_identifier(&sub.publication_name) {
            return Err(Error::Config(format!(
                "publication_name '{}' is not a valid identifier",
                sub.publication_name
            )));
        }
        TableName::parse(&sub.table_name)?;

        if sub.status_interval_ms == 0 {
            return Err(Error::Config("status_interval_ms must be positive".to_string()));
        }
        if self.postgres.ssl_mode != SslMode::Disable {
            return Err(Error::Config(format!(
                "ssl_mode {:?} is not supported; only 'disable' is available",
                self.postgres.ssl_mode
            )));
        }

        Ok(())
    }

    pub fn connection_config(&self) -> Result<tokio_postgres::Config> {
        let pg = &self.postgres;
        if pg.ssl_mode != SslMode::Disable {
            return Err(Error::Config(format!("unsupported ssl_mode {:?}", pg.ssl_mode)));
        }

        let mut config = tokio_postgres::Config::new();
        config
            .host(&pg.host)
            .port(pg.port)
            .dbname(&pg.database)
            .user(&pg.username)
            .application_name("pg-subscription")
            .connect_timeout(Duration::from_secs(pg.connect_timeout_secs))
            .ssl_mode(tokio_postgres::config::SslMode::Disable);
        if !pg.password.is_empty() {
            config.password(&pg.password);
        }

        Ok(config)
    }
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_status_interval_ms() -> u64 {
    1000
}

fn default_close_timeout_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[postgres]
host = "db.internal"
database = "fleet"
username = "replicator"
password = "secret"

[subscription]
slot_name = "trips_slot"
publication_name = "trips_pub"
table_name = "fleet.trips"
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_with_defaults() {
        let file = write_config(MINIMAL);
        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.postgres.port, 5432);
        assert_eq!(config.postgres.connect_timeout_secs, 30);
        assert_eq!(config.postgres.ssl_mode, SslMode::Disable);

        let sub = &config.subscription;
        assert_eq!(sub.slot_create_style, CreateStyle::WhenNotExists);
        assert_eq!(sub.publication_create_style, CreateStyle::WhenNotExists);
        assert!(sub.reconcile_publication_tables);
        assert_eq!(sub.mapping_error_policy, MappingErrorPolicy::Fail);
        assert!(!sub.include_deletes);
        assert_eq!(sub.status_interval_ms, 1000);
        assert_eq!(sub.close_timeout_ms, 5000);
        assert!(sub.start_lsn.is_none());
    }

    #[test]
    fn test_load_full() {
        let file = write_config(
            r#"
[postgres]
host = "localhost"
port = 5433
database = "fleet"
username = "postgres"

[subscription]
slot_name = "alerts_slot"
publication_name = "alerts_pub"
table_name = "fuel_efficiency_alerts"
slot_create_style = "always_recreate"
publication_create_style = "never"
mapping_error_policy = "skip"
include_deletes = true
start_lsn = "0/16B3748"
"#,
        );

        let config = Config::from_file(file.path()).unwrap();
        let sub = &config.subscription;
        assert_eq!(config.postgres.port, 5433);
        assert_eq!(sub.slot_create_style, CreateStyle::AlwaysRecreate);
        assert_eq!(sub.publication_create_style, CreateStyle::Never);
        assert_eq!(sub.mapping_error_policy, MappingErrorPolicy::Skip);
        assert!(sub.include_deletes);
        assert_eq!(sub.start_lsn, Some(Lsn(0x16B3748)));
    }

    #[test]
    fn test_rejects_invalid_identifiers() {
        let file = write_config(&MINIMAL.replace("trips_slot", "Trips-Slot"));
        assert!(matches!(Config::from_file(file.path()), Err(Error::Config(_))));

        let file = write_config(&MINIMAL.replace("fleet.trips", "fleet.trips; drop"));
        assert!(matches!(Config::from_file(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_tls() {
        let file = write_config(&MINIMAL.replace(
            "password = \"secret\"",
            "password = \"secret\"\nssl_mode = \"require\"",
        ));
        assert!(matches!(Config::from_file(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_file("/nonexistent/pg-subscription.toml"),
            Err(Error::ConfigLoad(_))
        ));
    }

    #[test]
    fn test_connection_config() {
        let file = write_config(MINIMAL);
        let config = Config::from_file(file.path()).unwrap();
        let pg = config.connection_config().unwrap();

        assert_eq!(pg.get_dbname(), Some("fleet"));
        assert_eq!(pg.get_user(), Some("replicator"));
        assert_eq!(pg.get_ports(), &[5432]);
        assert_eq!(pg.get_connect_timeout(), Some(&Duration::from_secs(30)));
    }
}
