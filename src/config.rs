//! Layered configuration using Figment
//!
//! Configuration is merged from, lowest precedence first:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `SPECTRO_`, nested keys split on `__`
//!
//! ```text
//! SPECTRO_WORKER__CONNECT_TIMEOUT_MS=3000
//! SPECTRO_BALANCE__MODE=laser_then_integration
//! SPECTRO_LOGGING__LEVEL=debug
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::balance::BalanceMode;
use crate::error::{AppResult, SpectroError};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// `[worker]`
    #[serde(default)]
    pub worker: WorkerConfig,
    /// `[balance]`
    #[serde(default)]
    pub balance: BalanceConfig,
    /// `[eeprom]`
    #[serde(default)]
    pub eeprom: EepromConfig,
    /// `[logging]`
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Timing of the worker lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Upper bound on the settings handoff after spawning the worker
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Sleep between acquisitions inside the worker loop
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Upper bound on joining the worker before it is aborted
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
    /// Pause after poisoning a worker whose connect failed
    #[serde(default = "default_connect_failure_grace")]
    pub connect_failure_grace_ms: u64,
    /// Pause after spawning before waiting on the handoff
    #[serde(default = "default_startup_delay")]
    pub startup_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            poll_interval_ms: default_poll_interval(),
            join_timeout_ms: default_join_timeout(),
            connect_failure_grace_ms: default_connect_failure_grace(),
            startup_delay_ms: default_startup_delay(),
        }
    }
}

impl WorkerConfig {
    /// `connect_timeout_ms` as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `poll_interval_ms` as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `join_timeout_ms` as a [`Duration`].
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// `connect_failure_grace_ms` as a [`Duration`].
    pub fn connect_failure_grace(&self) -> Duration {
        Duration::from_millis(self.connect_failure_grace_ms)
    }

    /// `startup_delay_ms` as a [`Duration`].
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

/// Balancer defaults, overridable per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceConfig {
    #[serde(default)]
    pub mode: BalanceMode,
    /// Target peak intensity in counts
    #[serde(default = "default_intensity")]
    pub intensity: f64,
    /// Accepted distance from the target
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Pixel used as the peak; the spectrum maximum when unset
    #[serde(default)]
    pub pixel: Option<usize>,
    /// Optional cap on acquisitions per pass. Unset means no cap.
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            mode: BalanceMode::default(),
            intensity: default_intensity(),
            threshold: default_threshold(),
            pixel: None,
            max_iterations: None,
        }
    }
}

/// EEPROM encode options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EepromConfig {
    /// Stamp page 0 with the latest revision when encoding
    #[serde(default = "default_latest_revision")]
    pub latest_revision: bool,
}

impl Default for EepromConfig {
    fn default() -> Self {
        Self {
            latest_revision: default_latest_revision(),
        }
    }
}

/// Subscriber options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error or off; or an EnvFilter directive
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_connect_timeout() -> u64 {
    8000
}

fn default_poll_interval() -> u64 {
    50
}

fn default_join_timeout() -> u64 {
    2000
}

fn default_connect_failure_grace() -> u64 {
    500
}

fn default_startup_delay() -> u64 {
    100
}

fn default_intensity() -> f64 {
    45000.0
}

fn default_threshold() -> f64 {
    2500.0
}

fn default_latest_revision() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Level names accepted by [`LoggingConfig::level`] and the `log_level` command.
pub const VALID_LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// A plain level name, or a directive string such as `spectro_daq=debug`.
pub fn is_valid_log_level(level: &str) -> bool {
    VALID_LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) || level.contains('=')
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Settings {
    /// Defaults overlaid with `SPECTRO_` environment variables.
    pub fn load() -> AppResult<Self> {
        Self::extract(Self::figment())
    }

    /// Defaults, then the TOML file at `path`, then environment variables.
    ///
    /// A missing file is not an error; Figment simply contributes nothing for it.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SPECTRO_").split("__"));
        Self::extract(figment)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Env::prefixed("SPECTRO_").split("__"))
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would make the worker or balancer misbehave.
    pub fn validate(&self) -> AppResult<()> {
        if !is_valid_log_level(&self.logging.level) {
            return Err(SpectroError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.balance.intensity <= 0.0 {
            return Err(SpectroError::Configuration(format!(
                "Invalid balance intensity {}. Must be positive",
                self.balance.intensity
            )));
        }

        if self.balance.threshold < 0.0 {
            return Err(SpectroError::Configuration(format!(
                "Invalid balance threshold {}. Must not be negative",
                self.balance.threshold
            )));
        }

        if self.worker.poll_interval_ms == 0 {
            return Err(SpectroError::Configuration(
                "worker.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.worker.connect_timeout_ms == 0 {
            return Err(SpectroError::Configuration(
                "worker.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
