//! One acquisition result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A spectrum plus the state it was taken under.
///
/// `spectrum` is `None` when the backend had nothing to deliver; `failure` is
/// set when the backend reports that the device itself is no longer usable.
/// The worker treats a reading with `failure` set as terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// `scheme:address` of the producing device.
    pub device_id: String,
    /// Monotonic per-session counter, starting at 1.
    pub session_count: u64,
    /// When the frame was read out.
    pub timestamp: DateTime<Utc>,
    /// Set when the final frame of an averaged series completed.
    pub timestamp_complete: Option<DateTime<Utc>>,
    /// Counts per pixel. The final frame of an average carries the mean.
    pub spectrum: Option<Vec<f64>>,
    /// True when this is a complete sample: either the last member of an
    /// averaged series, or any frame when averaging is off.
    pub averaged: bool,
    /// Number of frames summed into `spectrum` so far.
    pub sum_count: u32,
    /// Why the device is no longer usable.
    pub failure: Option<String>,

    /// Integration time in effect for this frame.
    pub integration_time_ms: u32,
    /// Laser power setting, 0 to 100.
    pub laser_power_perc: u32,
    /// Whether the laser was on.
    pub laser_enabled: bool,

    /// Detector thermistor ADC count.
    pub detector_temperature_raw: Option<u16>,
    /// Detector temperature in °C.
    pub detector_temperature_degc: Option<f32>,
    /// Laser thermistor ADC count.
    pub laser_temperature_raw: Option<u16>,
    /// Laser temperature in °C.
    pub laser_temperature_degc: Option<f32>,
    /// Secondary ADC count, when enabled.
    pub secondary_adc_raw: Option<u16>,
}

impl Reading {
    /// Empty reading stamped with the current time.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            session_count: 0,
            timestamp: Utc::now(),
            timestamp_complete: None,
            spectrum: None,
            averaged: false,
            sum_count: 0,
            failure: None,
            integration_time_ms: 0,
            laser_power_perc: 0,
            laser_enabled: false,
            detector_temperature_raw: None,
            detector_temperature_degc: None,
            laser_temperature_raw: None,
            laser_temperature_degc: None,
            secondary_adc_raw: None,
        }
    }

    /// Attach the frame data.
    pub fn with_spectrum(mut self, spectrum: Vec<f64>) -> Self {
        self.spectrum = Some(spectrum);
        self
    }

    /// A reading that reports the device as failed.
    pub fn failed(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut reading = Self::new(device_id);
        reading.failure = Some(reason.into());
        reading
    }

    /// Sample at `pixel`, or the maximum sample when no pixel is given.
    ///
    /// `None` without a spectrum, for an out-of-range pixel, or for an empty one.
    pub fn peak(&self, pixel: Option<usize>) -> Option<f64> {
        let spectrum = self.spectrum.as_ref()?;
        match pixel {
            Some(index) => spectrum.get(index).copied(),
            None => spectrum.iter().copied().reduce(f64::max),
        }
    }
}
