//! Agent configuration loading and validation.
//!
//! The configuration file is TOML with three sections:
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [device]
//! host = "myhub.azure-devices.net"
//! device_id = "thermostat-01"
//! auth = { shared_access_key = "..." }
//!
//! [telemetry]
//! interval = 10
//! ```
//!
//! Every section falls back to its defaults when omitted, except that the
//! device section needs credentials to validate.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use skylink_client::ClientConfig;
use validator::Validate;

use self::{logger::LoggerConfig, telemetry::TelemetryConfig};

pub mod logger;
pub mod telemetry;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "SKYLINK_CONFIG";

/// Used when the environment variable is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/skylink/config.toml";

/// Timestamp prefix of the `print_*` macros.
#[doc(hidden)]
pub const PRINT_TIMESTAMP: &[time::format_description::BorrowedFormatItem<'static>] = time::macros::format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

/// Prints a timestamped line before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        $crate::__print_line!(console::style("INFO").green(), $($arg)*)
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        $crate::__print_line!(console::style("WARN").yellow(), $($arg)*)
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        $crate::__print_line!(console::style("ERROR").red(), $($arg)*)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __print_line {
    ($level:expr, $($arg:tt)*) => {
        println!(
            "{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format($crate::config::PRINT_TIMESTAMP)
                    .unwrap_or_default()
            )
            .dim(),
            $level,
            format_args!($($arg)*)
        )
    };
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Complete agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Hub connection settings handed to the client SDK.
    #[validate(nested)]
    pub device: ClientConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Locates and loads the configuration file.
    pub fn new() -> Result<Self, ConfigError> {
        let path = Self::config_path(std::env::var(CONFIG_ENV).ok())?;
        Self::load(&path)
    }

    /// Resolves the file path: the environment override first, then the
    /// default location if it exists.
    fn config_path(from_env: Option<String>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = from_env {
            let path = PathBuf::from(path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found. Set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH}"
        )))
    }

    /// Reads, parses and validates `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let raw = fs::read_to_string(path)?;
        let config = Self::parse(&raw)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        config
            .device
            .validate_all()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use skylink_client::config::RetryStrategy;
    use tempfile::NamedTempFile;

    use super::*;

    const MINIMAL: &str = r#"
        [device]
        host = "hub.example.net"
        device_id = "thermostat-01"
        auth = { sas_token = "SharedAccessSignature sr=hub.example.net%2Fdevices%2Fthermostat-01&sig=abc&se=1" }
    "#;

    #[test]
    fn test_parse_minimal() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.device.device_id, "thermostat-01");
        assert_eq!(config.device.port, 8883);
        assert_eq!(config.telemetry.interval, 10);
        assert_eq!(config.logger.level, "info");
    }

    #[test]
    fn test_parse_full() {
        let raw = r#"
            [logger]
            level = "debug"

            [device]
            host = "hub.example.net"
            device_id = "thermostat-01"
            module_id = "sensor"
            auth = { shared_access_key = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=" }

            [device.retry]
            strategy = "fixed"
            max_retries = 3
            fixed_delay_ms = 500

            [telemetry]
            interval = 2
            temperature_alert = 25.0
        "#;

        let config = Config::parse(raw).unwrap();
        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.device.client_id(), "thermostat-01/sensor");
        assert_eq!(config.device.retry.strategy, RetryStrategy::Fixed);
        assert_eq!(config.telemetry.interval, 2);
    }

    #[test]
    fn test_missing_credentials_fail_validation() {
        let raw = r#"
            [device]
            host = "hub.example.net"
        "#;
        assert!(matches!(
            Config::parse(raw),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            Config::parse("[device"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.device.host, "hub.example.net");

        assert!(matches!(
            Config::load(Path::new("/nonexistent/skylink.toml")),
            Err(ConfigError::Config(_))
        ));
    }

    #[test]
    fn test_config_path_prefers_environment() {
        let path = Config::config_path(Some("/tmp/custom.toml".into())).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
    }
}
