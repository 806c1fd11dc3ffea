//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// PostgreSQL SSL mode.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Where resource cache bookkeeping lives.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database. Suitable for tests and single-node setups.
    Sqlite {
        /// Database file path, or `:memory:`.
        path: PathBuf,
        /// Busy timeout in seconds while waiting for the write lock.
        #[serde(default = "default_busy_timeout_secs")]
        busy_timeout_secs: u64,
    },
    /// PostgreSQL database shared with the orchestrator.
    Postgres {
        /// Connection URL. Takes precedence over the individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer RESCACHE_METADATA__PASSWORD over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Server-side statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_busy_timeout_secs() -> u64 {
    5
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(300_000)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/rescache.db"),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate that a postgres config names a server to connect to.
    pub fn validate(&self) -> crate::Result<()> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) | (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => Err(crate::Error::InvalidConfig(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                )),
                (None, Some(_), None) => Err(crate::Error::InvalidConfig(
                    "postgres config requires 'database' when using individual fields".to_string(),
                )),
            },
        }
    }
}

/// Garbage collection schedule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Seconds between reclamation cycles.
    #[serde(default = "default_gc_interval_secs")]
    pub interval_secs: u64,
    /// Per-sweep timeout in seconds. A sweep that exceeds it is abandoned
    /// and its transaction rolled back.
    #[serde(default = "default_gc_sweep_timeout_secs")]
    pub sweep_timeout_secs: u64,
    /// Run a cycle immediately on startup instead of waiting one interval.
    #[serde(default = "default_true")]
    pub run_on_start: bool,
}

fn default_gc_interval_secs() -> u64 {
    30
}

fn default_gc_sweep_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_gc_interval_secs(),
            sweep_timeout_secs: default_gc_sweep_timeout_secs(),
            run_on_start: true,
        }
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_secs(self.sweep_timeout_secs)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.interval_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "gc.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.sweep_timeout_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "gc.sweep_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

/// Top-level application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    pub fn validate(&self) -> crate::Result<()> {
        self.metadata.validate()?;
        self.gc.validate()
    }
}
