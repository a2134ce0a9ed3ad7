//! Configuration management for Sendgate.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::ThrottlePolicy;
use crate::error::{Result, SendgateError};

/// Prefix for environment overrides, e.g. `SENDGATE__RATE_LIMITING__QUOTA=5`.
const ENV_PREFIX: &str = "SENDGATE";

/// Main configuration for the Sendgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendgateConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Campaign dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Email transport configuration
    #[serde(default)]
    pub sender: SenderConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Sends admitted per user per window
    #[serde(default = "default_quota")]
    pub quota: u32,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// How often idle windows are reaped, in seconds
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            quota: default_quota(),
            window_secs: default_window_secs(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

impl RateLimitingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

fn default_quota() -> u32 {
    2
}

fn default_window_secs() -> u64 {
    60
}

fn default_reap_interval() -> u64 {
    300
}

/// Campaign dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Fixed pause between consecutive recipients, in seconds
    #[serde(default = "default_inter_send_pause")]
    pub inter_send_pause_secs: u64,

    /// What happens to a recipient whose send was throttled
    #[serde(default)]
    pub throttle_policy: ThrottlePolicy,

    /// Consecutive throttles tolerated for one recipient before it is counted as failed
    #[serde(default = "default_max_throttle_retries")]
    pub max_throttle_retries: u32,

    /// Directory for dispatch checkpoints; in-memory when unset
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            inter_send_pause_secs: default_inter_send_pause(),
            throttle_policy: ThrottlePolicy::default(),
            max_throttle_retries: default_max_throttle_retries(),
            checkpoint_dir: None,
        }
    }
}

impl DispatchConfig {
    pub fn inter_send_pause(&self) -> Duration {
        Duration::from_secs(self.inter_send_pause_secs)
    }
}

fn default_inter_send_pause() -> u64 {
    30
}

fn default_max_throttle_retries() -> u32 {
    3
}

/// Which transport delivers messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    /// Log the message and report success
    #[default]
    Log,
    /// Sleep for a latency and fail at a configured rate
    Simulated,
}

/// Email transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    #[serde(default)]
    pub kind: SenderKind,

    /// Simulated delivery latency in milliseconds
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,

    /// Fraction of simulated sends that fail, between 0 and 1
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            kind: SenderKind::default(),
            latency_ms: default_latency_ms(),
            failure_rate: default_failure_rate(),
        }
    }
}

fn default_latency_ms() -> u64 {
    100
}

fn default_failure_rate() -> f64 {
    0.05
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SendgateConfig {
    /// Load configuration from a YAML file, with `SENDGATE__*` environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SendgateError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let builder = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml));
        Self::load(builder, ENV_PREFIX)
    }

    /// Load configuration from environment overrides only.
    pub fn from_env() -> Result<Self> {
        Self::load(config::Config::builder(), ENV_PREFIX)
    }

    fn load(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        env_prefix: &str,
    ) -> Result<Self> {
        let config: SendgateConfig = builder
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SendgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SendgateConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the limiter and dispatcher cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.quota == 0 {
            return Err(SendgateError::Config("rate_limiting.quota must be at least 1".into()));
        }
        if self.rate_limiting.window_secs == 0 {
            return Err(SendgateError::Config(
                "rate_limiting.window_secs must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sender.failure_rate) {
            return Err(SendgateError::Config(
                "sender.failure_rate must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}
