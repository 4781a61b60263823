//! Configuration management for the stratum mining client
//!
//! Supports configuration via command line arguments, environment variables,
//! and configuration files (YAML/JSON) with validation and defaults.

use crate::stratum::PoolSettings;
use crate::{Error, Result, APP_NAME, APP_VERSION};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How search and pool I/O share the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One task alternating between pool polling and search slices
    Cooperative,
    /// One search task per worker plus connection and watchdog tasks
    Threaded,
}

/// Submit discipline on the pool connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    /// At most one submit in flight; new shares are dropped while waiting
    Backpressure,
    /// Bounded FIFO drained on every poll
    Queued,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Json,
    Pretty,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Cooperative => write!(f, "cooperative"),
            ExecutionMode::Threaded => write!(f, "threaded"),
        }
    }
}

/// Complete configuration for the mining client
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "leafline",
    version = env!("CARGO_PKG_VERSION"),
    about = "Lightweight stratum pool-mining client",
    long_about = "A stratum v1 pool-mining client with time-sliced double SHA-256 search for small CPUs"
)]
pub struct Config {
    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(default)]
    pub print_config: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Pool host name or address
    #[arg(short = 'o', long, env = "LEAFLINE_POOL_HOST")]
    pub pool_host: Option<String>,

    /// Pool TCP port
    #[arg(short = 'p', long, env = "LEAFLINE_POOL_PORT", default_value_t = default_pool_port())]
    #[serde(default = "default_pool_port")]
    pub pool_port: u16,

    /// Wallet address or worker name
    #[arg(short = 'u', long, env = "LEAFLINE_USER")]
    pub user: Option<String>,

    /// Worker password
    #[arg(long, env = "LEAFLINE_PASSWORD", default_value = "x")]
    #[serde(default = "default_password")]
    pub password: String,

    /// Difficulty suggested to the pool after authorizing
    #[arg(short = 'd', long, env = "LEAFLINE_SUGGEST_DIFFICULTY", default_value_t = default_suggest_difficulty())]
    #[serde(default = "default_suggest_difficulty")]
    pub suggest_difficulty: f64,

    /// Agent name sent with mining.subscribe
    #[arg(long, default_value = "LeafLine")]
    #[serde(default = "default_agent")]
    pub agent: String,

    /// Execution model
    #[arg(short = 'm', long, env = "LEAFLINE_MODE", default_value = "cooperative")]
    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,

    /// Search workers in threaded mode (0 = one per CPU)
    #[arg(short = 't', long, env = "LEAFLINE_THREADS", default_value_t = 0)]
    #[serde(default)]
    pub threads: usize,

    /// Submit discipline
    #[arg(long, default_value = "backpressure")]
    #[serde(default = "default_submit_mode")]
    pub submit_mode: SubmitMode,

    /// Length of one search slice
    #[arg(long, value_parser = humantime::parse_duration, default_value = "8ms")]
    #[serde(default = "default_slice", with = "duration_str")]
    pub slice: Duration,

    /// Time to wait for a submit reply before restarting the handshake
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    #[serde(default = "default_submit_timeout", with = "duration_str")]
    pub submit_timeout: Duration,

    /// Pool silence before restarting the handshake
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s")]
    #[serde(default = "default_rx_idle_timeout", with = "duration_str")]
    pub rx_idle_timeout: Duration,

    /// Time without any share result before a full restart
    #[arg(long, value_parser = humantime::parse_duration, default_value = "200s")]
    #[serde(default = "default_stale_timeout", with = "duration_str")]
    pub stale_timeout: Duration,

    /// Network reachability checks per connect
    #[arg(long, default_value_t = default_attempts())]
    #[serde(default = "default_attempts")]
    pub network_attempts: u32,

    /// TCP connect attempts per connect
    #[arg(long, default_value_t = default_attempts())]
    #[serde(default = "default_attempts")]
    pub connect_attempts: u32,

    /// Delay between connect attempts
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    #[serde(default = "default_connect_retry_delay", with = "duration_str")]
    pub connect_retry_delay: Duration,

    /// Timeout of a single TCP connect
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    #[serde(default = "default_connect_timeout", with = "duration_str")]
    pub connect_timeout: Duration,

    /// Interval between statistics log lines
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    #[serde(default = "default_stats_interval", with = "duration_str")]
    pub stats_interval: Duration,

    /// Log level
    #[arg(short = 'l', long, env = "LEAFLINE_LOG_LEVEL", default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, default_value = "plain")]
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Also write logs to this file
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Parse the command line, merge the config file and validate
    pub async fn load() -> Result<Self> {
        let mut config = Self::parse();

        if let Some(config_file) = config.config_file.clone() {
            let file_config = Self::load_from_file(&config_file).await?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            // Default to YAML
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Merge file values under CLI values
    ///
    /// A CLI value wins when it was given or differs from its default.
    fn merge_with_file(mut self, file: Self) -> Self {
        macro_rules! fill {
            ($field:ident, $default:expr) => {
                if self.$field == $default {
                    self.$field = file.$field;
                }
            };
        }

        if self.pool_host.is_none() {
            self.pool_host = file.pool_host;
        }
        if self.user.is_none() {
            self.user = file.user;
        }
        if self.log_file.is_none() {
            self.log_file = file.log_file;
        }

        fill!(pool_port, default_pool_port());
        fill!(password, default_password());
        fill!(suggest_difficulty, default_suggest_difficulty());
        fill!(agent, default_agent());
        fill!(mode, default_mode());
        fill!(threads, 0);
        fill!(submit_mode, default_submit_mode());
        fill!(slice, default_slice());
        fill!(submit_timeout, default_submit_timeout());
        fill!(rx_idle_timeout, default_rx_idle_timeout());
        fill!(stale_timeout, default_stale_timeout());
        fill!(network_attempts, default_attempts());
        fill!(connect_attempts, default_attempts());
        fill!(connect_retry_delay, default_connect_retry_delay());
        fill!(connect_timeout, default_connect_timeout());
        fill!(stats_interval, default_stats_interval());
        fill!(log_level, default_log_level());
        fill!(log_format, default_log_format());

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.pool_host.as_deref() {
            Some(host) if !host.trim().is_empty() => {}
            _ => return Err(Error::config("Pool host is required")),
        }

        match self.user.as_deref() {
            Some(user) if !user.trim().is_empty() => {}
            _ => return Err(Error::config("User (wallet address) is required")),
        }

        if self.pool_port == 0 {
            return Err(Error::config("Pool port must be greater than 0"));
        }

        if !(self.suggest_difficulty.is_finite() && self.suggest_difficulty > 0.0) {
            return Err(Error::config("Suggested difficulty must be positive"));
        }

        if self.slice.is_zero() {
            return Err(Error::config("Slice duration must be greater than 0"));
        }

        for (name, value) in [
            ("submit timeout", self.submit_timeout),
            ("rx idle timeout", self.rx_idle_timeout),
            ("stale timeout", self.stale_timeout),
            ("connect timeout", self.connect_timeout),
            ("stats interval", self.stats_interval),
        ] {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be greater than 0", name)));
            }
        }

        if self.network_attempts == 0 || self.connect_attempts == 0 {
            return Err(Error::config("Connect attempts must be greater than 0"));
        }

        Ok(())
    }

    /// Search workers to run in threaded mode
    pub fn worker_count(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }

    /// Agent string sent with mining.subscribe
    pub fn agent_string(&self) -> String {
        format!("{}/{}", self.agent, APP_VERSION)
    }

    /// Settings consumed by the pool connection
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            host: self.pool_host.clone().unwrap_or_default(),
            port: self.pool_port,
            user: self.user.clone().unwrap_or_default(),
            password: self.password.clone(),
            agent: self.agent_string(),
            suggest_difficulty: self.suggest_difficulty,
            submit_mode: self.submit_mode,
            submit_timeout_ms: self.submit_timeout.as_millis() as u64,
            rx_idle_timeout_ms: self.rx_idle_timeout.as_millis() as u64,
            network_attempts: self.network_attempts,
            connect_attempts: self.connect_attempts,
            connect_retry_delay: self.connect_retry_delay,
        }
    }

    /// Human-readable summary for `--print-config`
    pub fn summary(&self) -> Result<String> {
        let mut printable = self.clone();
        printable.password = "********".to_string();
        let body = serde_yaml::to_string(&printable)?;
        Ok(format!("# {} {}\n{}", APP_NAME, APP_VERSION, body))
    }
}

// Default value functions for serde
fn default_pool_port() -> u16 {
    3333
}

fn default_password() -> String {
    "x".to_string()
}

fn default_suggest_difficulty() -> f64 {
    0.0001
}

fn default_agent() -> String {
    "LeafLine".to_string()
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Cooperative
}

fn default_submit_mode() -> SubmitMode {
    SubmitMode::Backpressure
}

fn default_slice() -> Duration {
    Duration::from_millis(8)
}

fn default_submit_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_rx_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_stale_timeout() -> Duration {
    Duration::from_secs(200)
}

fn default_attempts() -> u32 {
    2
}

fn default_connect_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_format() -> LogFormat {
    LogFormat::Plain
}

/// Durations in config files as humantime strings ("8ms", "1m 30s")
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
