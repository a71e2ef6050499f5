//! Application configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Redis configuration (cache, locks, pub/sub and queue storage).
    pub redis: RedisConfig,
    /// Worker process configuration.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Exclusive lock defaults.
    #[serde(default)]
    pub locks: LockSettings,
    /// Throttling lock defaults.
    #[serde(default)]
    pub throttling: ThrottlingSettings,
    /// Paginated bulk mutation pacing.
    #[serde(default)]
    pub bulk: BulkSettings,
    /// Outgoing mail configuration.
    #[serde(default)]
    pub mail: MailConfig,
    /// Log output configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys and channels.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Worker process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Worker name, used for the queue consumer and log context.
    #[serde(default = "default_worker_name")]
    pub name: String,
    /// Maximum number of work items processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Delivery attempts before a work item is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds in-flight handlers get to reach a check point after shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Exclusive lock settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LockSettings {
    /// Lock time-to-live in seconds.
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    /// How long `acquire` waits for a busy lock, in seconds.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Retry interval covering missed release notifications, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Throttling lock settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ThrottlingSettings {
    /// Grants allowed per period.
    #[serde(default = "default_max_hits")]
    pub max_hits_per_period: u64,
    /// Period length in seconds.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
}

/// Pacing of paginated bulk mutations.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BulkSettings {
    /// Documents fetched per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Pause between pages, in milliseconds.
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
}

/// Outgoing mail configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// Whether mail is sent at all.
    #[serde(default)]
    pub enabled: bool,
    /// SMTP relay host.
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    /// SMTP relay port.
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// SMTP username.
    #[serde(default)]
    pub username: Option<String>,
    /// SMTP password.
    #[serde(default)]
    pub password: Option<String>,
    /// Sender address.
    #[serde(default = "default_from_address")]
    pub from_address: String,
}

/// Log output configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_redis_prefix() -> String {
    "faultline".to_string()
}

fn default_worker_name() -> String {
    "work-items".to_string()
}

const fn default_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_shutdown_grace_secs() -> u64 {
    30
}

const fn default_lock_ttl_secs() -> u64 {
    5 * 60
}

const fn default_acquire_timeout_secs() -> u64 {
    60
}

const fn default_poll_interval_ms() -> u64 {
    500
}

const fn default_max_hits() -> u64 {
    1
}

const fn default_period_secs() -> u64 {
    15 * 60
}

const fn default_page_size() -> usize {
    100
}

const fn default_page_delay_ms() -> u64 {
    2_500
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

const fn default_smtp_port() -> u16 {
    587
}

fn default_from_address() -> String {
    "noreply@faultline.local".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl WorkerConfig {
    /// Grace period granted to in-flight handlers on shutdown.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl LockSettings {
    /// Lock time-to-live.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Acquisition budget.
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Retry interval while waiting on a busy lock.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ThrottlingSettings {
    fn default() -> Self {
        Self {
            max_hits_per_period: default_max_hits(),
            period_secs: default_period_secs(),
        }
    }
}

impl ThrottlingSettings {
    /// Window length.
    #[must_use]
    pub const fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            page_delay_ms: default_page_delay_ms(),
        }
    }
}

impl BulkSettings {
    /// Pause between pages.
    #[must_use]
    pub const fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            username: None,
            password: None,
            from_address: default_from_address(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `FAULTLINE_ENV`)
    /// 4. Environment variables with `FAULTLINE__` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();
        let env = std::env::var("FAULTLINE_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("FAULTLINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("FAULTLINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break lock exclusivity or stall workers.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let checks = [
            (self.locks.ttl_secs == 0, "locks.ttl_secs must be greater than 0"),
            (
                self.throttling.period_secs == 0,
                "throttling.period_secs must be greater than 0",
            ),
            (
                self.throttling.max_hits_per_period == 0,
                "throttling.max_hits_per_period must be greater than 0",
            ),
            (self.bulk.page_size == 0, "bulk.page_size must be greater than 0"),
            (self.worker.concurrency == 0, "worker.concurrency must be greater than 0"),
            (self.worker.max_attempts == 0, "worker.max_attempts must be greater than 0"),
        ];

        match checks.iter().find(|(invalid, _)| *invalid) {
            Some((_, message)) => Err(config::ConfigError::Message((*message).to_string())),
            None => Ok(()),
        }
    }
}
