//! TOML-based configuration with two layers of environment overrides:
//! `${VAR}` / `${VAR:-default}` substitution inside the file, and
//! `EMBERMQ__SECTION__KEY` variables on top of it.

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::session::QueuePolicy;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Config(config::ConfigError),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Per-broker and per-session limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum in-flight outgoing messages per session (QoS 1/2)
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u16,
    /// Maximum queued messages per offline session
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    /// What to do when the offline queue is full
    #[serde(default)]
    pub queue_policy: QueuePolicy,
    /// Maximum incoming QoS 2 publishes awaiting PUBREL
    #[serde(default = "default_max_awaiting_rel")]
    pub max_awaiting_rel: usize,
    /// Delay before retransmitting unacked messages
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Retransmissions before the delivery is abandoned (0 = unlimited)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-connection outbound buffer capacity, in packets. A connection
    /// whose buffer overflows is treated as a slow consumer and closed.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_max_connections() -> usize {
    100_000
}
fn default_max_inflight() -> u16 {
    32
}
fn default_max_queued() -> usize {
    1000
}
fn default_max_awaiting_rel() -> usize {
    100
}
fn default_retry_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_max_retries() -> u32 {
    5
}
fn default_outbound_buffer() -> usize {
    1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_inflight: default_max_inflight(),
            max_queued: default_max_queued(),
            queue_policy: QueuePolicy::default(),
            max_awaiting_rel: default_max_awaiting_rel(),
            retry_interval: default_retry_interval(),
            max_retries: default_max_retries(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep-alive assigned when the client connects with 0
    #[serde(default = "default_keep_alive")]
    pub default_keep_alive: u16,
    /// Ceiling applied to client-requested keep-alive
    #[serde(default = "default_max_keep_alive")]
    pub max_keep_alive: u16,
    /// Expiry for persistent sessions whose CONNECT named none
    #[serde(default = "default_expiry", with = "humantime_serde")]
    pub default_expiry: Duration,
    /// How often expired sessions are swept
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

fn default_keep_alive() -> u16 {
    60
}
fn default_max_keep_alive() -> u16 {
    65535
}
fn default_expiry() -> Duration {
    Duration::from_secs(3600)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: default_keep_alive(),
            max_keep_alive: default_max_keep_alive(),
            default_expiry: default_expiry(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Protocol feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level granted (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    /// Whether retained messages are accepted
    #[serde(default = "default_true")]
    pub retain_available: bool,
    /// Whether wildcard subscriptions are accepted
    #[serde(default = "default_true")]
    pub wildcard_subscriptions: bool,
    /// Whether empty-client-id connects get a generated id
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            retain_available: true,
            wildcard_subscriptions: true,
            allow_anonymous: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment overrides.
    ///
    /// `EMBERMQ__` variables with double underscores for nesting layer on
    /// top of the file, e.g. `EMBERMQ__LIMITS__MAX_INFLIGHT=64` overrides
    /// `limits.max_inflight`. A missing file falls back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("limits.max_connections", 100_000)?
            .set_default("limits.max_inflight", 32)?
            .set_default("limits.max_queued", 1000)?
            .set_default("limits.max_awaiting_rel", 100)?
            .set_default("limits.retry_interval", "30s")?
            .set_default("limits.max_retries", 5)?
            .set_default("limits.outbound_buffer", 1024)?
            .set_default("session.default_keep_alive", 60)?
            .set_default("session.max_keep_alive", 65535)?
            .set_default("session.default_expiry", "1h")?
            .set_default("session.sweep_interval", "60s")?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("mqtt.wildcard_subscriptions", true)?
            .set_default("mqtt.allow_anonymous", true)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Missing file means defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("EMBERMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env overrides)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.limits.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "max_inflight must be at least 1".to_string(),
            ));
        }
        if self.limits.outbound_buffer == 0 {
            return Err(ConfigError::Validation(
                "outbound_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
