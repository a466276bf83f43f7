//! Mock Hardware Implementation
//!
//! Provides a simulated spectrometer for testing without physical hardware.
//! All waits use `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Response model
//!
//! Each frame is a Gaussian line centred on the middle pixel over a flat
//! baseline. The line height is linear in integration time:
//!
//! ```text
//! peak = baseline + counts_per_ms * integration_time_ms * laser_factor
//! ```
//!
//! where `laser_factor` is `laser_power_perc / 100` while the laser is enabled
//! and `1` otherwise. Every sample saturates at 65535 like a 16-bit ADC.
//!
//! # Fault injection
//!
//! - [`MockSpectrometer::failing_connect`]: `connect` returns an error
//! - [`MockSpectrometer::hanging_connect`]: `connect` never completes
//! - [`MockSpectrometer::fail_after`]: frames past N carry a failure flag
//! - [`MockSpectrometer::error_after`]: frames past N return a hardware error
//! - [`MockSpectrometer::rejecting`]: `apply_setting` fails for that setting

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::device::SpectrometerBackend;
use crate::eeprom::ConfigRecord;
use crate::messages::{ControlObject, Setting};
use crate::reading::Reading;

/// 16-bit ADC ceiling
pub const SATURATION: f64 = 65535.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectBehavior {
    Succeed,
    Fail,
    Hang,
}

/// Simulated spectrometer.
///
/// # Example
///
/// ```rust,ignore
/// let mock = MockSpectrometer::new("WP-00001").with_counts_per_ms(10.0);
/// let mut session = DeviceSession::with_backend(id, Box::new(mock));
/// session.connect().await?;
/// ```
pub struct MockSpectrometer {
    eeprom: ConfigRecord,
    pixels: usize,
    counts_per_ms: f64,
    baseline: f64,
    readout_delay: Duration,
    connect_behavior: ConnectBehavior,
    fail_after: Option<u64>,
    error_after: Option<u64>,
    rejected: Vec<Setting>,

    connected: bool,
    frames: u64,
    integration_time_ms: u32,
    laser_power_perc: u32,
    laser_enabled: bool,
    applied: Arc<RwLock<Vec<ControlObject>>>,
}

impl MockSpectrometer {
    /// Mock with a plausible calibrated EEPROM carrying `serial`.
    pub fn new(serial: &str) -> Self {
        let eeprom = Self::default_eeprom(serial);
        Self {
            pixels: usize::from(eeprom.active_pixels_horizontal),
            eeprom,
            counts_per_ms: 10.0,
            baseline: 0.0,
            readout_delay: Duration::ZERO,
            connect_behavior: ConnectBehavior::Succeed,
            fail_after: None,
            error_after: None,
            rejected: Vec::new(),
            connected: false,
            frames: 0,
            integration_time_ms: 0,
            laser_power_perc: 100,
            laser_enabled: false,
            applied: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Build from the address part of a `mock:` device id.
    ///
    /// `fail-connect` and `hang` select the matching fault; anything else is
    /// used as the serial number.
    pub fn from_address(address: &str) -> Result<Self> {
        if address.trim().is_empty() {
            return Err(anyhow!("mock address must not be empty"));
        }
        let mock = Self::new(address);
        Ok(match address {
            "fail-connect" => mock.failing_connect(),
            "hang" => mock.hanging_connect(),
            _ => mock,
        })
    }

    /// EEPROM contents of a format-5 unit with every coefficient set populated.
    pub fn default_eeprom(serial: &str) -> ConfigRecord {
        ConfigRecord {
            format: 5,
            model: "MOCK-785".to_string(),
            serial_number: serial.to_string(),
            baud_rate: 0,
            has_cooling: true,
            has_laser: true,
            excitation_nm: 785,
            excitation_nm_float: 785.0,
            slit_size_um: 50,
            startup_integration_time_ms: 100,
            wavelength_coeffs: vec![800.0, 0.15, -1.0e-5, 0.0],
            degc_to_dac_coeffs: vec![3566.0, -127.0, 0.0],
            adc_to_degc_coeffs: vec![66.0, -0.024, 0.0],
            tec_r298: 6750,
            tec_beta: 3977,
            calibration_date: "2026-01-01".to_string(),
            calibrated_by: "SIM".to_string(),
            detector: "SIMCCD".to_string(),
            active_pixels_horizontal: 1024,
            active_pixels_vertical: 64,
            actual_horizontal: 1024,
            actual_vertical: 64,
            roi_horizontal_end: 1023,
            linearity_coeffs: vec![0.0, 1.0, 0.0, 0.0, 0.0],
            laser_power_coeffs: vec![0.0, 0.2, 0.0, 0.0],
            max_laser_power_mw: 450.0,
            min_laser_power_mw: 5.0,
            user_data: vec![0; 63],
            product_configuration: "sim".to_string(),
            ..ConfigRecord::default()
        }
    }

    /// Replace the EEPROM; the pixel count follows it.
    pub fn with_eeprom(mut self, eeprom: ConfigRecord) -> Self {
        self.pixels = usize::from(eeprom.active_pixels_horizontal).max(1);
        self.eeprom = eeprom;
        self
    }

    #[allow(missing_docs)]
    pub fn with_pixels(mut self, pixels: usize) -> Self {
        self.pixels = pixels.max(1);
        self
    }

    /// Slope of the linear response model.
    pub fn with_counts_per_ms(mut self, counts_per_ms: f64) -> Self {
        self.counts_per_ms = counts_per_ms;
        self
    }

    /// Flat offset under the line.
    pub fn with_baseline(mut self, baseline: f64) -> Self {
        self.baseline = baseline;
        self
    }

    /// Time each `acquire` spends "reading out".
    pub fn with_readout_delay(mut self, delay: Duration) -> Self {
        self.readout_delay = delay;
        self
    }

    /// `connect` errors.
    pub fn failing_connect(mut self) -> Self {
        self.connect_behavior = ConnectBehavior::Fail;
        self
    }

    /// `connect` never returns.
    pub fn hanging_connect(mut self) -> Self {
        self.connect_behavior = ConnectBehavior::Hang;
        self
    }

    /// Frames after the first `frames` carry a failure flag.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Frames after the first `frames` return a hardware error.
    pub fn error_after(mut self, frames: u64) -> Self {
        self.error_after = Some(frames);
        self
    }

    /// The device refuses `setting`. May be called repeatedly.
    pub fn rejecting(mut self, setting: Setting) -> Self {
        self.rejected.push(setting);
        self
    }

    /// Every setting applied so far, in order.
    pub fn applied_settings(&self) -> Arc<RwLock<Vec<ControlObject>>> {
        Arc::clone(&self.applied)
    }

    /// Expected height of the line for the current state.
    pub fn expected_peak(&self) -> f64 {
        let laser_factor = if self.laser_enabled {
            f64::from(self.laser_power_perc) / 100.0
        } else {
            1.0
        };
        let signal = self.counts_per_ms * f64::from(self.integration_time_ms) * laser_factor;
        (self.baseline + signal).min(SATURATION)
    }

    fn spectrum(&self) -> Vec<f64> {
        let amplitude = self.counts_per_ms
            * f64::from(self.integration_time_ms)
            * if self.laser_enabled {
                f64::from(self.laser_power_perc) / 100.0
            } else {
                1.0
            };
        let centre = (self.pixels / 2) as f64;
        let sigma = (self.pixels as f64 / 50.0).max(1.0);
        (0..self.pixels)
            .map(|i| {
                let x = i as f64 - centre;
                let line = amplitude * (-(x * x) / (2.0 * sigma * sigma)).exp();
                (self.baseline + line).clamp(0.0, SATURATION)
            })
            .collect()
    }
}

#[async_trait]
impl SpectrometerBackend for MockSpectrometer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&mut self) -> Result<()> {
        match self.connect_behavior {
            ConnectBehavior::Succeed => {}
            ConnectBehavior::Fail => bail!("simulated connect failure"),
            ConnectBehavior::Hang => {
                info!(serial = %self.eeprom.serial_number, "MockSpectrometer: hanging in connect");
                futures::future::pending::<()>().await;
            }
        }
        self.connected = true;
        self.frames = 0;
        info!(serial = %self.eeprom.serial_number, "MockSpectrometer: connected");
        Ok(())
    }

    async fn read_eeprom_pages(&mut self) -> Result<Vec<Vec<u8>>> {
        if !self.connected {
            bail!("mock not connected");
        }
        let buffers = self.eeprom.generate_write_buffers(true)?;
        Ok(buffers.pages.iter().map(|p| p.to_vec()).collect())
    }

    async fn acquire(&mut self) -> Result<Option<Reading>> {
        if !self.connected {
            bail!("mock not connected");
        }

        // simulated readout; never block the runtime here
        sleep(self.readout_delay).await;
        self.frames += 1;

        if self.error_after.is_some_and(|n| self.frames > n) {
            bail!("simulated hardware error on frame {}", self.frames);
        }
        if self.fail_after.is_some_and(|n| self.frames > n) {
            return Ok(Some(Reading::failed(
                self.eeprom.serial_number.clone(),
                format!("simulated failure on frame {}", self.frames),
            )));
        }

        let mut reading =
            Reading::new(self.eeprom.serial_number.clone()).with_spectrum(self.spectrum());
        if self.eeprom.has_cooling {
            reading.detector_temperature_raw = Some(2048);
            reading.detector_temperature_degc = Some(f32::from(self.eeprom.startup_temp_degc));
        }
        debug!(frame = self.frames, peak = self.expected_peak(), "MockSpectrometer: frame");
        Ok(Some(reading))
    }

    async fn apply_setting(&mut self, cmd: &ControlObject) -> Result<()> {
        if self.rejected.contains(&cmd.setting) {
            bail!("simulated rejection of {}", cmd.setting);
        }
        match cmd.setting {
            Setting::IntegrationTimeMs => {
                let ms = cmd
                    .value
                    .as_i64()
                    .ok_or_else(|| anyhow!("integration time must be an integer"))?;
                self.integration_time_ms = u32::try_from(ms)?;
            }
            Setting::LaserPowerPerc => {
                let perc = cmd
                    .value
                    .as_i64()
                    .ok_or_else(|| anyhow!("laser power must be an integer"))?;
                self.laser_power_perc = u32::try_from(perc)?.min(100);
            }
            Setting::LaserEnable => {
                self.laser_enabled = cmd
                    .value
                    .as_bool()
                    .ok_or_else(|| anyhow!("laser_enable must be a bool"))?;
            }
            _ => debug!(setting = cmd.name(), value = %cmd.value, "MockSpectrometer: accepted"),
        }
        self.applied.write().await.push(cmd.clone());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        info!(serial = %self.eeprom.serial_number, "MockSpectrometer: disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(mock: MockSpectrometer) -> MockSpectrometer {
        let mut mock = mock;
        mock.connect().await.unwrap();
        mock
    }

    #[tokio::test]
    async fn peak_is_linear_in_integration_time() {
        let mut mock = connected(MockSpectrometer::new("SN").with_counts_per_ms(10.0)).await;
        mock.apply_setting(&ControlObject::new(Setting::IntegrationTimeMs, 100i64).unwrap())
            .await
            .unwrap();
        let reading = mock.acquire().await.unwrap().unwrap();
        assert_eq!(reading.peak(None), Some(1000.0));

        mock.apply_setting(&ControlObject::new(Setting::IntegrationTimeMs, 200i64).unwrap())
            .await
            .unwrap();
        let reading = mock.acquire().await.unwrap().unwrap();
        assert_eq!(reading.peak(None), Some(2000.0));
    }

    #[tokio::test]
    async fn laser_power_scales_when_enabled() {
        let mut mock = connected(MockSpectrometer::new("SN").with_counts_per_ms(10.0)).await;
        for cmd in [
            ControlObject::new(Setting::IntegrationTimeMs, 100i64).unwrap(),
            ControlObject::new(Setting::LaserPowerPerc, 50i64).unwrap(),
            ControlObject::new(Setting::LaserEnable, true).unwrap(),
        ] {
            mock.apply_setting(&cmd).await.unwrap();
        }
        assert_eq!(mock.expected_peak(), 500.0);
        let reading = mock.acquire().await.unwrap().unwrap();
        assert_eq!(reading.peak(None), Some(500.0));
        assert_eq!(mock.applied_settings().read().await.len(), 3);
    }

    #[tokio::test]
    async fn spectrum_saturates() {
        let mut mock = connected(MockSpectrometer::new("SN").with_counts_per_ms(1000.0)).await;
        mock.apply_setting(&ControlObject::new(Setting::IntegrationTimeMs, 5000i64).unwrap())
            .await
            .unwrap();
        let reading = mock.acquire().await.unwrap().unwrap();
        assert_eq!(reading.peak(None), Some(SATURATION));
    }

    #[tokio::test]
    async fn faults_trigger_after_n_frames() {
        let mut mock = connected(MockSpectrometer::new("SN").fail_after(1)).await;
        assert!(mock.acquire().await.unwrap().unwrap().failure.is_none());
        assert!(mock.acquire().await.unwrap().unwrap().failure.is_some());

        let mut mock = connected(MockSpectrometer::new("SN").error_after(0)).await;
        assert!(mock.acquire().await.is_err());
    }

    #[tokio::test]
    async fn rejected_settings_are_not_recorded() {
        let mut mock = connected(MockSpectrometer::new("SN").rejecting(Setting::LaserEnable)).await;
        let cmd = ControlObject::new(Setting::LaserEnable, true).unwrap();
        assert!(mock.apply_setting(&cmd).await.is_err());
        assert!(!mock.laser_enabled);
        assert!(mock.applied_settings().read().await.is_empty());
    }

    #[tokio::test]
    async fn failing_connect_errors() {
        let mut mock = MockSpectrometer::new("SN").failing_connect();
        assert!(mock.connect().await.is_err());
        assert!(mock.acquire().await.is_err());
    }

    #[tokio::test]
    async fn eeprom_pages_decode_back() {
        let mut mock = connected(MockSpectrometer::new("WP-42")).await;
        let pages = mock.read_eeprom_pages().await.unwrap();
        assert_eq!(pages.len(), 6);
        let record = ConfigRecord::parse(&pages).unwrap();
        assert_eq!(record, MockSpectrometer::default_eeprom("WP-42"));
    }
}
