//! Closed-loop hardware balancing.
//!
//! Adjusts integration time and/or laser power until the peak of a spectrum
//! lands within `threshold` counts of `intensity`. Each pass is proportional
//! control that assumes a linear detector response. An overshoot halves the
//! controlled quantity instead, and more than [`MAX_OVERSHOOTS`] overshoots
//! in one pass fail it.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::BalanceConfig;
use crate::device::DeviceSession;
use crate::error::{AppResult, SpectroError};
use crate::messages::{ControlObject, Setting};
use crate::reading::Reading;

/// A pass fails on the overshoot after this many.
pub const MAX_OVERSHOOTS: u32 = 5;

/// Integration time is clamped to this range while balancing.
pub const INTEGRATION_LIMITS_MS: (u32, u32) = (10, 5000);
/// Laser power is clamped to this range while balancing.
pub const LASER_POWER_LIMITS_PERC: (u32, u32) = (1, 100);

/// Which quantity a [`Balancer`] adjusts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMode {
    /// Integration time only.
    #[default]
    Integration,
    /// Laser power only.
    Laser,
    /// Laser first; integration only if the laser pass converged.
    LaserThenIntegration,
}

impl FromStr for BalanceMode {
    type Err = SpectroError;

    /// Prefix match: `integ...`, `laser...integ...`, then `laser...`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s.starts_with("integ") {
            Ok(BalanceMode::Integration)
        } else if let Some(rest) = s.strip_prefix("laser") {
            if rest.contains("integ") {
                Ok(BalanceMode::LaserThenIntegration)
            } else {
                Ok(BalanceMode::Laser)
            }
        } else {
            Err(SpectroError::Configuration(format!(
                "invalid balance mode: {s}"
            )))
        }
    }
}

impl fmt::Display for BalanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BalanceMode::Integration => "integration",
            BalanceMode::Laser => "laser",
            BalanceMode::LaserThenIntegration => "laser_then_integration",
        })
    }
}

/// What the balancer drives.
#[async_trait]
pub trait BalanceTarget: Send {
    /// One complete reading, or `None` when nothing could be acquired.
    async fn acquire_reading(&mut self) -> AppResult<Option<Reading>>;

    /// Current integration time.
    fn integration_time_ms(&self) -> u32;

    /// Current laser power.
    fn laser_power_perc(&self) -> u32;

    #[allow(missing_docs)]
    async fn set_integration_time_ms(&mut self, ms: u32) -> AppResult<()>;

    #[allow(missing_docs)]
    async fn set_laser_power_perc(&mut self, perc: u32) -> AppResult<()>;
}

#[async_trait]
impl BalanceTarget for DeviceSession {
    /// Skips partial frames of an averaged series.
    async fn acquire_reading(&mut self) -> AppResult<Option<Reading>> {
        loop {
            match self.acquire().await? {
                Some(reading)
                    if !reading.averaged
                        && reading.failure.is_none()
                        && reading.spectrum.is_some() =>
                {
                    continue
                }
                other => return Ok(other),
            }
        }
    }

    fn integration_time_ms(&self) -> u32 {
        self.state().integration_time_ms
    }

    fn laser_power_perc(&self) -> u32 {
        self.state().laser_power_perc
    }

    async fn set_integration_time_ms(&mut self, ms: u32) -> AppResult<()> {
        let cmd = ControlObject::new(Setting::IntegrationTimeMs, ms)?;
        self.change_setting(&cmd).await
    }

    async fn set_laser_power_perc(&mut self, perc: u32) -> AppResult<()> {
        let cmd = ControlObject::new(Setting::LaserPowerPerc, perc)?;
        self.change_setting(&cmd).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quantity {
    Integration,
    Laser,
}

impl Quantity {
    fn limits(self) -> (u32, u32) {
        match self {
            Quantity::Integration => INTEGRATION_LIMITS_MS,
            Quantity::Laser => LASER_POWER_LIMITS_PERC,
        }
    }

    fn current(self, target: &dyn BalanceTarget) -> u32 {
        match self {
            Quantity::Integration => target.integration_time_ms(),
            Quantity::Laser => target.laser_power_perc(),
        }
    }

    async fn apply(self, target: &mut dyn BalanceTarget, value: u32) -> AppResult<()> {
        match self {
            Quantity::Integration => target.set_integration_time_ms(value).await,
            Quantity::Laser => target.set_laser_power_perc(value).await,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quantity::Integration => "integration_time_ms",
            Quantity::Laser => "laser_power_perc",
        })
    }
}

/// Drives a line toward a target intensity through repeated readings.
#[derive(Debug, Clone, PartialEq)]
pub struct Balancer {
    /// What to adjust.
    pub mode: BalanceMode,
    /// Target counts.
    pub intensity: f64,
    /// Accepted distance from `intensity`.
    pub threshold: f64,
    /// Pixel to watch; the spectrum maximum when unset.
    pub pixel: Option<usize>,
    /// Unset means a pass may run until it converges or overshoots out.
    pub max_iterations: Option<u32>,
}

impl Default for Balancer {
    fn default() -> Self {
        Self::from_config(&BalanceConfig::default())
    }
}

impl Balancer {
    /// No pixel and no iteration cap.
    pub fn new(mode: BalanceMode, intensity: f64, threshold: f64) -> Self {
        Self {
            mode,
            intensity,
            threshold,
            pixel: None,
            max_iterations: None,
        }
    }

    /// Build from the `[balance]` config section.
    pub fn from_config(config: &BalanceConfig) -> Self {
        Self {
            mode: config.mode,
            intensity: config.intensity,
            threshold: config.threshold,
            pixel: config.pixel,
            max_iterations: config.max_iterations,
        }
    }

    /// Watch `pixel` instead of the maximum.
    pub fn with_pixel(mut self, pixel: Option<usize>) -> Self {
        self.pixel = pixel;
        self
    }

    /// Cap each pass at this many readings.
    pub fn with_max_iterations(mut self, max_iterations: Option<u32>) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Run the configured mode. `true` when balanced.
    pub async fn balance(&self, target: &mut dyn BalanceTarget) -> bool {
        info!(
            mode = %self.mode,
            intensity = self.intensity,
            threshold = self.threshold,
            pixel = ?self.pixel,
            "balancing"
        );
        match self.mode {
            BalanceMode::Integration => self.balance_pass(target, Quantity::Integration).await,
            BalanceMode::Laser => self.balance_pass(target, Quantity::Laser).await,
            BalanceMode::LaserThenIntegration => {
                if !self.balance_pass(target, Quantity::Laser).await {
                    return false;
                }
                self.balance_pass(target, Quantity::Integration).await
            }
        }
    }

    async fn balance_pass(&self, target: &mut dyn BalanceTarget, quantity: Quantity) -> bool {
        let mut overshoots = 0u32;
        let mut iterations = 0u32;

        loop {
            if let Some(max) = self.max_iterations {
                if iterations >= max {
                    warn!(%quantity, iterations, "balance pass hit its iteration cap");
                    return false;
                }
            }
            iterations += 1;

            let reading = match target.acquire_reading().await {
                Ok(Some(reading)) => reading,
                Ok(None) => {
                    error!("failed to get spectrum");
                    return false;
                }
                Err(e) => {
                    error!(error = %e, "failed to get spectrum");
                    return false;
                }
            };
            let Some(peak) = reading.peak(self.pixel) else {
                error!(pixel = ?self.pixel, "failed to get spectrum");
                return false;
            };

            let delta = self.intensity - peak;
            debug!(
                integration_time_ms = target.integration_time_ms(),
                laser_power_perc = target.laser_power_perc(),
                peak,
                delta,
                "balance step"
            );

            if delta.abs() <= self.threshold {
                info!(%quantity, iterations, "balanced");
                return true;
            }

            let current = quantity.current(target);
            let next = if peak > self.intensity {
                overshoots += 1;
                if overshoots > MAX_OVERSHOOTS {
                    error!(%quantity, overshoots, "too many overshoots");
                    return false;
                }
                current / 2
            } else if peak.is_nan() || peak <= 0.0 {
                u32::MAX
            } else {
                let scaled = f64::from(current) * self.intensity / peak;
                if scaled >= f64::from(u32::MAX) {
                    u32::MAX
                } else {
                    scaled as u32
                }
            };

            let (lo, hi) = quantity.limits();
            let next = next.clamp(lo, hi);
            debug!(%quantity, value = next, "adjusting");

            if let Err(e) = quantity.apply(target, next).await {
                error!(%quantity, error = %e, "failed to apply balance adjustment");
                return false;
            }
        }
    }
}
