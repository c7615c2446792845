//! Application configuration loading, validation, and management.
//!
//! The top-level `Config` aggregates logging, broker, gateway, topic,
//! subscriber, and sensor settings. It is loaded from a TOML file early in
//! the application lifecycle, validated with the `validator` crate, and
//! intended to remain immutable thereafter.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{
    gateway::{GatewayConfig, SensorsConfig, SubscriberConfig, TopicsConfig},
    logger::LoggerConfig,
};

pub mod gateway;
pub mod logger;

/// Broker connection settings, shared by the gateway and subscriber
/// clients (each overrides the client id).
pub type BrokerConfig = parkgate_mqtt::Config;

/// Simple macros for printing timestamped messages before the tracing
/// subscriber is initialized. Used during early configuration loading.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors that can occur during configuration loading, parsing, or
/// validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error while reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error while reading configuration: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    /// Logging subsystem configuration.
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Broker connection settings.
    #[validate(nested)]
    pub broker: BrokerConfig,

    /// Gateway identity, publish cadence, and alert threshold.
    #[validate(nested)]
    pub gateway: GatewayConfig,

    /// Topic prefix and subtopic names.
    #[validate(nested)]
    pub topics: TopicsConfig,

    /// Subscriber side settings.
    #[validate(nested)]
    pub subscriber: SubscriberConfig,

    /// Simulated sensors registered by the binary.
    #[validate(nested)]
    pub sensors: SensorsConfig,
}

impl Config {
    /// Locates and loads the configuration file.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Determines the configuration file path.
    ///
    /// Priority:
    /// 1. `PARKGATE_CONFIG` environment variable
    /// 2. `/etc/parkgate/config.toml`
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var("PARKGATE_CONFIG") {
            let path = PathBuf::from(config_path);
            print_info!("Using config from PARKGATE_CONFIG: {}", path.display());
            return Ok(path);
        }

        let fallback = Path::new("/etc/parkgate/config.toml");
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(
            "No configuration file found.".to_string(),
        ))
    }

    /// Loads and validates configuration from the specified path.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(path.to_string_lossy().to_string()));
        }

        let config_str = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&config_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }
}
