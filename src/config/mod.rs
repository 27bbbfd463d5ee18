//! Configuration management for the tracker
//!
//! Configuration is loaded from a TOML file or from environment variables,
//! then validated once before anything connects.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::tracker::keys::{DEFAULT_BURST, DEFAULT_RATE_PER_SECOND};

/// Default API base URL
pub const DEFAULT_API_BASE_URL: &str = "https://api.clashofclans.com/v1";

/// Load a `.env` file from the working directory or one of its parents
///
/// A missing file is fine; a file that cannot be parsed is an error. Variables
/// already set in the environment win over the file.
pub fn load_dotenv() -> Result<Option<PathBuf>> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e).context("Failed to load .env file"),
    }
}

/// Load a specific env file, returning whether it existed
pub fn load_env_file(path: &Path) -> Result<bool> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(true),
        Err(e) if e.not_found() => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to load env file: {}", path.display())),
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API key file and throttling
    pub keys: KeysConfig,

    /// Remote API settings
    pub api: ApiConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Fetch and execution loop tuning
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// API key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Newline-delimited key file
    pub file: PathBuf,

    /// Token refill rate per key
    pub rate_per_second: u32,

    /// Bucket size per key
    pub burst: u32,
}

/// Remote API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL every request path is appended to
    pub base_url: String,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

/// SSL negotiation for the database connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbSslMode {
    #[default]
    Disable,
    Prefer,
}

impl FromStr for DbSslMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "disable" => Ok(Self::Disable),
            "prefer" => Ok(Self::Prefer),
            other => anyhow::bail!("unsupported ssl mode '{other}' (expected disable or prefer)"),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string; takes precedence over the fields below
    pub url: Option<String>,

    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: DbSslMode,

    /// Maximum pool size
    pub pool_size: usize,

    /// Directory holding `<version>_<name>.up.sql` files
    pub migrations_dir: PathBuf,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pause between claims
    pub poll_interval_ms: u64,

    /// Buffered jobs between fetcher and workers
    pub channel_capacity: usize,

    /// Number of worker tasks
    pub workers: usize,

    /// Maximum jobs claimed per poll; unlimited when unset
    pub claim_batch_size: Option<i64>,

    /// Upper bound for a single job run
    pub job_timeout_secs: u64,

    /// Delay before a failed job becomes due again
    pub failure_retry_secs: u64,

    /// Delay before a job with no registered provider becomes due again
    pub unknown_kind_retry_secs: u64,
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => anyhow::bail!("unknown log format '{other}' (expected json or text)"),
        }
    }
}

/// Where log lines go
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogOutput {
    #[default]
    Stdout,
    File(PathBuf),
    Off,
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "" | "stdout" => Ok(Self::Stdout),
            "off" => Ok(Self::Off),
            _ => match s.strip_prefix("file:") {
                Some(path) if !path.is_empty() => Ok(Self::File(PathBuf::from(path))),
                _ => anyhow::bail!("invalid log output '{s}' (expected stdout, off or file:<path>)"),
            },
        }
    }
}

impl TryFrom<String> for LogOutput {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LogOutput> for String {
    fn from(value: LogOutput) -> Self {
        value.to_string()
    }
}

impl fmt::Display for LogOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Off => f.write_str("off"),
            Self::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,

    /// Log format
    pub format: LogFormat,

    /// Log destination
    pub output: LogOutput,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("keys.txt"),
            rate_per_second: DEFAULT_RATE_PER_SECOND,
            burst: DEFAULT_BURST,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::from(DEFAULT_API_BASE_URL),
            request_timeout_secs: 30,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: String::from("localhost"),
            port: 5432,
            database: String::from("coc_tracker"),
            user: String::from("postgres"),
            password: String::new(),
            ssl_mode: DbSslMode::Disable,
            pool_size: 10,
            migrations_dir: PathBuf::from("migrations"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            channel_capacity: 16,
            workers: 4,
            claim_batch_size: None,
            job_timeout_secs: 300,
            failure_retry_secs: 3600,
            unknown_kind_retry_secs: 3600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: LogFormat::Json,
            output: LogOutput::Stdout,
        }
    }
}

/// Read an environment variable and parse it, failing on malformed values
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {name}: {e}")),
        Err(_) => Ok(None),
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// `KEYS_FILE` is required; everything else falls back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let keys_file = env_string("KEYS_FILE").context("KEYS_FILE is not set")?;

        let keys = KeysConfig {
            file: PathBuf::from(keys_file),
            rate_per_second: env_parse("KEYS_RATE_PER_SECOND")?
                .unwrap_or(defaults.keys.rate_per_second),
            burst: env_parse("KEYS_BURST")?.unwrap_or(defaults.keys.burst),
        };

        let api = ApiConfig {
            base_url: env_string("API_BASE_URL").unwrap_or(defaults.api.base_url),
            request_timeout_secs: env_parse("API_REQUEST_TIMEOUT")?
                .unwrap_or(defaults.api.request_timeout_secs),
        };

        let database = DatabaseConfig {
            url: env_string("DATABASE_URL"),
            host: env_string("DB_HOST").unwrap_or(defaults.database.host),
            port: env_parse("DB_PORT")?.unwrap_or(defaults.database.port),
            database: env_string("DB_DATABASE").unwrap_or(defaults.database.database),
            user: env_string("DB_USER").unwrap_or(defaults.database.user),
            password: std::env::var("DB_PASSWORD").unwrap_or_default(),
            ssl_mode: env_parse("DB_SSL")?.unwrap_or(defaults.database.ssl_mode),
            pool_size: env_parse("DB_POOL_SIZE")?.unwrap_or(defaults.database.pool_size),
            migrations_dir: env_string("MIGRATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.database.migrations_dir),
        };

        let scheduler = SchedulerConfig {
            poll_interval_ms: env_parse("POLL_INTERVAL_MS")?
                .unwrap_or(defaults.scheduler.poll_interval_ms),
            channel_capacity: env_parse("JOB_CHANNEL_CAPACITY")?
                .unwrap_or(defaults.scheduler.channel_capacity),
            workers: env_parse("JOB_WORKERS")?.unwrap_or(defaults.scheduler.workers),
            claim_batch_size: env_parse("CLAIM_BATCH_SIZE")?,
            job_timeout_secs: env_parse("JOB_TIMEOUT_SECS")?
                .unwrap_or(defaults.scheduler.job_timeout_secs),
            failure_retry_secs: env_parse("JOB_FAILURE_RETRY_SECS")?
                .unwrap_or(defaults.scheduler.failure_retry_secs),
            unknown_kind_retry_secs: env_parse("JOB_UNKNOWN_KIND_RETRY_SECS")?
                .unwrap_or(defaults.scheduler.unknown_kind_retry_secs),
        };

        let logging = LoggingConfig {
            level: env_string("LOG_LEVEL").unwrap_or(defaults.logging.level),
            format: env_parse("LOG_HANDLE")?.unwrap_or(defaults.logging.format),
            output: env_parse("LOG_OUT")?.unwrap_or(defaults.logging.output),
        };

        Ok(Self {
            keys,
            api,
            database,
            scheduler,
            logging,
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.keys.file.as_os_str().is_empty() {
            anyhow::bail!("keys.file must be set");
        }

        if self.keys.rate_per_second == 0 || self.keys.burst == 0 {
            anyhow::bail!("keys.rate_per_second and keys.burst must be greater than 0");
        }

        url::Url::parse(&self.api.base_url)
            .with_context(|| format!("api.base_url is not a valid URL: {}", self.api.base_url))?;

        if self.database.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than 0");
        }

        if self.scheduler.workers == 0 {
            anyhow::bail!("scheduler.workers must be greater than 0");
        }

        if self.scheduler.channel_capacity == 0 {
            anyhow::bail!("scheduler.channel_capacity must be greater than 0");
        }

        if self.scheduler.poll_interval_ms == 0 {
            anyhow::bail!("scheduler.poll_interval_ms must be greater than 0");
        }

        if matches!(self.scheduler.claim_batch_size, Some(n) if n <= 0) {
            anyhow::bail!("scheduler.claim_batch_size must be positive when set");
        }

        if self.scheduler.job_timeout_secs == 0 {
            anyhow::bail!("scheduler.job_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    /// Get request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    #[must_use]
    pub fn failure_retry(&self) -> Duration {
        Duration::from_secs(self.failure_retry_secs)
    }

    #[must_use]
    pub fn unknown_kind_retry(&self) -> Duration {
        Duration::from_secs(self.unknown_kind_retry_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_workers() {
        let mut config = Config::default();
        config.scheduler.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_batch_size() {
        let mut config = Config::default();
        config.scheduler.claim_batch_size = Some(0);
        assert!(config.validate().is_err());

        config.scheduler.claim_batch_size = Some(50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_base_url() {
        let mut config = Config::default();
        config.api.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_conversion() {
        let config = Config::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.scheduler.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.scheduler.job_timeout(), Duration::from_secs(300));
        assert_eq!(config.scheduler.failure_retry(), Duration::from_secs(3600));
    }

    #[test]
    fn test_log_output_parse() {
        assert_eq!("stdout".parse::<LogOutput>().unwrap(), LogOutput::Stdout);
        assert_eq!("off".parse::<LogOutput>().unwrap(), LogOutput::Off);
        assert_eq!(
            "file:/var/log/tracker.log".parse::<LogOutput>().unwrap(),
            LogOutput::File(PathBuf::from("/var/log/tracker.log"))
        );
        assert!("file:".parse::<LogOutput>().is_err());
        assert!("syslog".parse::<LogOutput>().is_err());
    }

    #[test]
    fn test_ssl_mode_parse() {
        assert_eq!("disable".parse::<DbSslMode>().unwrap(), DbSslMode::Disable);
        assert_eq!("PREFER".parse::<DbSslMode>().unwrap(), DbSslMode::Prefer);
        assert!("require".parse::<DbSslMode>().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [keys]
            file = "/etc/tracker/keys"

            [scheduler]
            workers = 8

            [logging]
            output = "file:tracker.log"
            format = "text"
            "#,
        )
        .unwrap();

        assert_eq!(config.keys.file, PathBuf::from("/etc/tracker/keys"));
        assert_eq!(config.keys.burst, DEFAULT_BURST);
        assert_eq!(config.scheduler.workers, 8);
        assert_eq!(config.scheduler.channel_capacity, 16);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(
            config.logging.output,
            LogOutput::File(PathBuf::from("tracker.log"))
        );
    }
}
