//! Configuration System using Figment
//!
//! Configuration is layered, highest precedence last:
//! 1. Built-in defaults
//! 2. `config/stage.toml` (or the file passed to [`StageConfig::load_from`])
//! 3. Environment variables prefixed with `STAGESCAN_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! STAGESCAN_APPLICATION__LOG_LEVEL=debug
//! STAGESCAN_SERIAL__PORT=/dev/ttyUSB1
//! STAGESCAN_PROTOCOL__MOTION_TIMEOUT=90s
//! ```
//!
//! # Example
//!
//! ```no_run
//! use stage_scan::config::StageConfig;
//!
//! let config = StageConfig::load()?;
//! println!("Port: {:?} @ {} baud", config.serial.port, config.serial.baud_rate);
//! # Ok::<(), stage_scan::config::ConfigError>(())
//! ```

use crate::engine::EngineSettings;
use crate::error::StageError;
use crate::error_recovery::RetryPolicy;
use crate::grid::GridPathPlanner;
use crate::limits::TravelLimits;
use crate::poller::PollerSettings;
use crate::scan::ScanSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/stage.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for StageError {
    fn from(err: ConfigError) -> Self {
        StageError::Config(err.to_string())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub application: ApplicationConfig,
    pub serial: SerialConfig,
    pub protocol: ProtocolConfig,
    pub limits: TravelLimits,
    pub poller: PollerSettings,
    pub scan: ScanSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "stage-scan".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port path; when absent the ports are probed at startup.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Rates tried during discovery.
    pub probe_baud_rates: Vec<u32>,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Per-line read timeout.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    pub command_terminator: String,
    /// Single character ending each reply.
    pub response_delimiter: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            probe_baud_rates: crate::adapters::serial_adapter::DEFAULT_BAUD_RATES.to_vec(),
            probe_timeout: Duration::from_millis(300),
            read_timeout: Duration::from_millis(500),
            command_terminator: "\r".to_string(),
            response_delimiter: "\r".to_string(),
        }
    }
}

impl SerialConfig {
    /// Delimiter as the byte the transport splits on.
    pub fn delimiter_byte(&self) -> Result<u8, ConfigError> {
        match self.response_delimiter.as_bytes() {
            [b] => Ok(*b),
            _ => Err(ConfigError::ValidationError(format!(
                "response_delimiter {:?} must be exactly one ASCII character",
                self.response_delimiter
            ))),
        }
    }
}

/// Exchange and motion timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Attempts per non-motion exchange, including the first.
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    /// Budget for a motion command's completion.
    #[serde(with = "humantime_serde")]
    pub motion_timeout: Duration,
    /// 2 for XY stages, 3 when a focus drive is fitted.
    pub axes: u8,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            max_attempts: retry.max_attempts,
            backoff_base: retry.base_delay,
            backoff_max: retry.max_delay,
            motion_timeout: Duration::from_secs(60),
            axes: 3,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl StageConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STAGESCAN_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.serial.baud_rate == 0 || self.serial.probe_baud_rates.contains(&0) {
            return invalid("baud rates must be non-zero".to_string());
        }
        if self.serial.read_timeout.is_zero() {
            return invalid("serial.read_timeout must be non-zero".to_string());
        }
        self.serial.delimiter_byte()?;

        if self.protocol.max_attempts == 0 {
            return invalid("protocol.max_attempts must be at least 1".to_string());
        }
        if !matches!(self.protocol.axes, 2 | 3) {
            return invalid(format!(
                "Invalid axes {}. Must be 2 or 3",
                self.protocol.axes
            ));
        }
        if self.protocol.motion_timeout.is_zero() {
            return invalid("protocol.motion_timeout must be non-zero".to_string());
        }

        if !self.limits.is_well_formed() {
            return invalid(format!(
                "travel limits must have min < max on every axis: {:?}",
                self.limits
            ));
        }

        if self.poller.period.is_zero() {
            return invalid("poller.period must be non-zero".to_string());
        }

        let (w, h) = self.scan.tile_size;
        if w <= 0 || h <= 0 {
            return invalid(format!("scan.tile_size ({w}, {h}) must be positive"));
        }
        let (fx, fy) = self.scan.non_overlap;
        if !(fx > 0.0 && fx <= 1.0 && fy > 0.0 && fy <= 1.0) {
            return invalid(format!(
                "scan.non_overlap ({fx}, {fy}) must lie in (0, 1]"
            ));
        }

        Ok(())
    }

    /// Engine tunables from the `protocol`, `serial` and `limits` sections.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            retry: RetryPolicy {
                max_attempts: self.protocol.max_attempts,
                base_delay: self.protocol.backoff_base,
                max_delay: self.protocol.backoff_max,
            },
            read_timeout: self.serial.read_timeout,
            motion_timeout: self.protocol.motion_timeout,
            axes: self.protocol.axes,
            limits: self.limits,
        }
    }

    /// Grid planner configured from the scan section.
    pub fn planner(&self) -> GridPathPlanner {
        GridPathPlanner::new().with_realignment(self.scan.realign_to_start_row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StageConfig::default();
        assert!(config.validate().is_ok());
        let engine = config.engine_settings();
        assert_eq!(engine.retry, RetryPolicy::default());
        assert_eq!(engine.axes, 3);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = StageConfig::default();
        config.application.log_level = "loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_axes() {
        let mut config = StageConfig::default();
        config.protocol.axes = 4;
        assert!(config.validate().unwrap_err().to_string().contains("axes"));
    }

    #[test]
    fn test_inverted_limits() {
        let mut config = StageConfig::default();
        config.limits.y.min = config.limits.y.max;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_delimiter() {
        let mut config = StageConfig::default();
        config.serial.response_delimiter = "\r\n".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_scan_defaults() {
        let mut config = StageConfig::default();
        config.scan.non_overlap = (0.5, 0.0);
        assert!(config.validate().is_err());

        let mut config = StageConfig::default();
        config.scan.tile_size = (100, -1);
        assert!(config.validate().is_err());
    }
}
