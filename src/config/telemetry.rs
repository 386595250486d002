//! Simulated sensor settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_ranges"))]
pub struct TelemetryConfig {
    /// Seconds between readings. Can be changed at runtime through the
    /// `SetTelemetryInterval` method or the `telemetryInterval` desired property.
    #[validate(range(
        min = 1,
        max = 86_400,
        message = "Telemetry interval must be between 1 second and 1 day"
    ))]
    pub interval: u64,

    /// Degrees Celsius the simulated temperature varies around.
    pub temperature_baseline: f64,

    /// Readings vary by up to this much on either side of the baseline.
    #[validate(range(min = 0.0, message = "Temperature spread must not be negative"))]
    pub temperature_spread: f64,

    /// Relative humidity baseline, percent.
    #[validate(range(min = 0.0, max = 100.0, message = "Humidity must be a percentage"))]
    pub humidity_baseline: f64,

    #[validate(range(min = 0.0, message = "Humidity spread must not be negative"))]
    pub humidity_spread: f64,

    /// Readings above this temperature carry `temperatureAlert=true`.
    pub temperature_alert: f64,
}

fn validate_ranges(config: &TelemetryConfig) -> Result<(), ValidationError> {
    if config.temperature_alert <= config.temperature_baseline - config.temperature_spread {
        return Err(ValidationError::new("alert_threshold")
            .with_message("temperature_alert is below every possible reading".into()));
    }
    Ok(())
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval: 10,
            temperature_baseline: 20.0,
            temperature_spread: 15.0,
            humidity_baseline: 60.0,
            humidity_spread: 20.0,
            temperature_alert: 30.0,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}
