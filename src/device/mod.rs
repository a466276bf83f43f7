//! Device session: the hardware-owning object that runs inside the worker.
//!
//! A [`DeviceSession`] wraps exactly one [`SpectrometerBackend`], picked from a
//! [`BackendRegistry`] by the scheme of its [`DeviceId`]. Once connected it
//! owns the decoded [`ConfigRecord`] and the live [`SpectrometerState`], and
//! presents the same `connect / acquire / change_setting` contract whatever
//! the backend.

pub mod backend;

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use backend::{BackendRegistry, SpectrometerBackend};

use crate::eeprom::ConfigRecord;
use crate::error::{AppResult, SpectroError};
use crate::logging::LogHandle;
use crate::messages::{ControlObject, Setting, SettingValue};
use crate::reading::Reading;

/// `scheme:address`, e.g. `mock:WP-00123` or `usb:0x24aa:0x1000`.
///
/// The address is opaque here; only the backend for the scheme interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    /// Lowercased backend selector.
    pub scheme: String,
    /// Everything after the first `:`.
    pub address: String,
}

impl FromStr for DeviceId {
    type Err = SpectroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((scheme, address)) if !scheme.is_empty() && !address.is_empty() => Ok(Self {
                scheme: scheme.to_ascii_lowercase(),
                address: address.to_string(),
            }),
            _ => Err(SpectroError::UnsupportedDevice(s.to_string())),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.address)
    }
}

/// Live, non-persistent state of a spectrometer.
///
/// One field per stateful setting in the catalog, under the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SpectrometerState {
    pub integration_time_ms: u32,
    pub laser_power_perc: u32,
    pub laser_enabled: bool,
    pub laser_power_ramping_enabled: bool,
    pub laser_power_ramp_increments: i64,
    pub laser_temperature_setpoint_raw: i64,
    pub scans_to_average: u32,
    pub detector_tec_enabled: bool,
    pub detector_tec_setpoint_degc: i64,
    pub high_gain_mode_enabled: bool,
    pub area_scan_enabled: bool,
    pub secondary_adc_enabled: bool,
    pub invert_x_axis: bool,
    pub bad_pixel_mode: i64,
    pub trigger_source: i64,
    pub ccd_gain: f64,
    pub ccd_offset: i64,
    pub min_usb_interval_ms: i64,
    pub max_usb_interval_ms: i64,
    pub log_level: Option<String>,
}

impl Default for SpectrometerState {
    fn default() -> Self {
        Self {
            integration_time_ms: 0,
            laser_power_perc: 100,
            laser_enabled: false,
            laser_power_ramping_enabled: false,
            laser_power_ramp_increments: 0,
            laser_temperature_setpoint_raw: 0,
            scans_to_average: 1,
            detector_tec_enabled: false,
            detector_tec_setpoint_degc: 0,
            high_gain_mode_enabled: false,
            area_scan_enabled: false,
            secondary_adc_enabled: false,
            invert_x_axis: false,
            bad_pixel_mode: 0,
            trigger_source: 0,
            ccd_gain: 1.9,
            ccd_offset: 0,
            min_usb_interval_ms: 0,
            max_usb_interval_ms: 0,
            log_level: None,
        }
    }
}

fn invalid(cmd: &ControlObject, reason: impl Into<String>) -> SpectroError {
    SpectroError::InvalidSettingValue {
        setting: cmd.name().to_string(),
        reason: reason.into(),
    }
}

fn bool_of(cmd: &ControlObject) -> AppResult<bool> {
    cmd.value
        .as_bool()
        .ok_or_else(|| invalid(cmd, "expected bool"))
}

fn int_of(cmd: &ControlObject) -> AppResult<i64> {
    cmd.value
        .as_i64()
        .ok_or_else(|| invalid(cmd, "expected int"))
}

fn u32_of(cmd: &ControlObject) -> AppResult<u32> {
    let value = int_of(cmd)?;
    u32::try_from(value).map_err(|_| invalid(cmd, format!("{value} is out of range")))
}

impl SpectrometerState {
    /// Record the effect of `cmd`. Validates ranges; nothing changes on error.
    pub fn apply(&mut self, cmd: &ControlObject) -> AppResult<()> {
        cmd.validate()?;
        match cmd.setting {
            Setting::IntegrationTimeMs => self.integration_time_ms = u32_of(cmd)?,
            Setting::LaserPowerPerc => {
                let perc = u32_of(cmd)?;
                if perc > 100 {
                    return Err(invalid(cmd, format!("{perc}% exceeds 100%")));
                }
                self.laser_power_perc = perc;
            }
            Setting::LaserEnable => self.laser_enabled = bool_of(cmd)?,
            Setting::LaserPowerRampingEnabled => self.laser_power_ramping_enabled = bool_of(cmd)?,
            Setting::LaserPowerRampIncrements => self.laser_power_ramp_increments = int_of(cmd)?,
            Setting::LaserTemperatureSetpointRaw => {
                self.laser_temperature_setpoint_raw = int_of(cmd)?
            }
            Setting::ScansToAverage => self.scans_to_average = u32_of(cmd)?.max(1),
            Setting::DetectorTecEnable => self.detector_tec_enabled = bool_of(cmd)?,
            Setting::DetectorTecSetpointDegc => self.detector_tec_setpoint_degc = int_of(cmd)?,
            Setting::HighGainModeEnable => self.high_gain_mode_enabled = bool_of(cmd)?,
            Setting::AreaScanEnable => self.area_scan_enabled = bool_of(cmd)?,
            Setting::EnableSecondaryAdc => self.secondary_adc_enabled = bool_of(cmd)?,
            Setting::InvertXAxis => self.invert_x_axis = bool_of(cmd)?,
            Setting::BadPixelMode => self.bad_pixel_mode = int_of(cmd)?,
            Setting::TriggerSource => self.trigger_source = int_of(cmd)?,
            Setting::CcdGain => {
                self.ccd_gain = cmd
                    .value
                    .as_f64()
                    .ok_or_else(|| invalid(cmd, "expected float"))?
            }
            Setting::CcdOffset => self.ccd_offset = int_of(cmd)?,
            Setting::MinUsbIntervalMs => self.min_usb_interval_ms = int_of(cmd)?,
            Setting::MaxUsbIntervalMs => self.max_usb_interval_ms = int_of(cmd)?,
            Setting::LogLevel => {
                let level = cmd
                    .value
                    .as_str()
                    .ok_or_else(|| invalid(cmd, "expected string"))?;
                self.log_level = Some(level.to_string());
            }
            Setting::ResetFpga
            | Setting::WavelengthCoeffs
            | Setting::DegcToDacCoeffs
            | Setting::AdcToDegcCoeffs => {}
        }
        Ok(())
    }
}

/// Snapshot handed to the controlling side once the worker has connected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrometerSettings {
    /// `scheme:address` of the device.
    pub device_id: String,
    /// Decoded EEPROM as loaded at connect.
    pub eeprom: ConfigRecord,
    /// State right after connect.
    pub state: SpectrometerState,
}

/// Running sum for scan averaging.
#[derive(Debug, Default)]
struct Accumulator {
    sum: Vec<f64>,
    count: u32,
}

impl Accumulator {
    fn reset(&mut self) {
        self.sum.clear();
        self.count = 0;
    }

    fn add(&mut self, spectrum: &[f64]) -> u32 {
        if self.sum.len() != spectrum.len() {
            if self.count > 0 {
                warn!(
                    had = self.sum.len(),
                    got = spectrum.len(),
                    "spectrum length changed, restarting average"
                );
            }
            self.sum = vec![0.0; spectrum.len()];
            self.count = 0;
        }
        for (acc, v) in self.sum.iter_mut().zip(spectrum) {
            *acc += v;
        }
        self.count += 1;
        self.count
    }

    fn mean(&self) -> Vec<f64> {
        let n = f64::from(self.count.max(1));
        self.sum.iter().map(|v| v / n).collect()
    }
}

/// One connected (or connectable) spectrometer.
pub struct DeviceSession {
    id: DeviceId,
    backend: Box<dyn SpectrometerBackend>,
    eeprom: ConfigRecord,
    state: SpectrometerState,
    connected: bool,
    session_count: u64,
    accumulator: Accumulator,
    log_handle: Option<LogHandle>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("connected", &self.connected)
            .field("session_count", &self.session_count)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Pick the backend for `id`. Does not touch hardware.
    pub fn new(id: DeviceId, registry: &BackendRegistry) -> AppResult<Self> {
        let backend = registry.create(&id)?;
        Ok(Self::with_backend(id, backend))
    }

    /// Wrap an already constructed backend.
    pub fn with_backend(id: DeviceId, backend: Box<dyn SpectrometerBackend>) -> Self {
        Self {
            id,
            backend,
            eeprom: ConfigRecord::default(),
            state: SpectrometerState::default(),
            connected: false,
            session_count: 0,
            accumulator: Accumulator::default(),
            log_handle: None,
        }
    }

    /// Route `log_level` commands to this handle.
    pub fn with_log_handle(mut self, handle: Option<LogHandle>) -> Self {
        self.log_handle = handle;
        self
    }

    /// Open the backend, load its EEPROM and push the startup integration time.
    pub async fn connect(&mut self) -> AppResult<()> {
        info!(device = %self.id, backend = self.backend.name(), "connecting");
        self.backend.connect().await?;

        let pages = self.backend.read_eeprom_pages().await?;
        self.eeprom = ConfigRecord::parse(&pages)?;
        self.eeprom.dump();

        self.state = SpectrometerState {
            integration_time_ms: u32::from(self.eeprom.startup_integration_time_ms),
            ccd_gain: f64::from(self.eeprom.detector_gain),
            ccd_offset: i64::from(self.eeprom.detector_offset),
            ..SpectrometerState::default()
        };
        let startup = ControlObject::new(
            Setting::IntegrationTimeMs,
            self.state.integration_time_ms,
        )?;
        self.backend.apply_setting(&startup).await?;

        self.connected = true;
        self.session_count = 0;
        self.accumulator.reset();
        info!(
            device = %self.id,
            model = %self.eeprom.model,
            serial = %self.eeprom.serial_number,
            integration_time_ms = self.state.integration_time_ms,
            "connected"
        );
        Ok(())
    }

    /// Whether `connect` succeeded and `disconnect` has not run since.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    #[allow(missing_docs)]
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// In-memory EEPROM, including coefficient edits.
    pub fn eeprom(&self) -> &ConfigRecord {
        &self.eeprom
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> &SpectrometerState {
        &self.state
    }

    /// Copy of everything the controlling side needs after connect.
    pub fn settings(&self) -> SpectrometerSettings {
        SpectrometerSettings {
            device_id: self.id.to_string(),
            eeprom: self.eeprom.clone(),
            state: self.state.clone(),
        }
    }

    /// Take one frame.
    ///
    /// Returns `Ok(None)` when integration time is zero or the backend had
    /// nothing. Backend errors are hardware failures and end the session.
    pub async fn acquire(&mut self) -> AppResult<Option<Reading>> {
        if !self.connected {
            return Err(SpectroError::NotConnected);
        }
        if self.state.integration_time_ms == 0 {
            debug!(device = %self.id, "integration time is zero, skipping acquisition");
            return Ok(None);
        }

        let Some(mut reading) = self.backend.acquire().await? else {
            return Ok(None);
        };

        self.session_count += 1;
        reading.session_count = self.session_count;
        reading.device_id = self.id.to_string();
        reading.integration_time_ms = self.state.integration_time_ms;
        reading.laser_power_perc = self.state.laser_power_perc;
        reading.laser_enabled = self.state.laser_enabled;

        if reading.failure.is_some() {
            return Ok(Some(reading));
        }

        let target = self.state.scans_to_average;
        match reading.spectrum.as_deref() {
            Some(spectrum) if target > 1 => {
                let count = self.accumulator.add(spectrum);
                reading.sum_count = count;
                if count >= target {
                    reading.spectrum = Some(self.accumulator.mean());
                    reading.averaged = true;
                    reading.timestamp_complete = Some(Utc::now());
                    self.accumulator.reset();
                    debug!(device = %self.id, frames = count, "average complete");
                } else {
                    reading.averaged = false;
                }
            }
            Some(_) => {
                reading.sum_count = 1;
                reading.averaged = true;
            }
            None => {}
        }

        Ok(Some(reading))
    }

    /// Apply one setting change.
    ///
    /// Coefficient commands also update the in-memory EEPROM. `log_level`
    /// goes to the log handle and `scans_to_average` only restarts the
    /// running average; neither reaches the backend.
    ///
    /// State and EEPROM are committed only once the change has been accepted,
    /// so an error leaves the session exactly as it was.
    pub async fn change_setting(&mut self, cmd: &ControlObject) -> AppResult<()> {
        if !self.connected {
            return Err(SpectroError::NotConnected);
        }
        debug!(device = %self.id, setting = cmd.name(), value = %cmd.value, "change_setting");
        let mut next = self.state.clone();
        next.apply(cmd)?;

        match (&cmd.setting, &cmd.value) {
            (Setting::LogLevel, SettingValue::Text(level)) => match &self.log_handle {
                Some(handle) => handle.set_level(level)?,
                None => warn!(level = %level, "no log handle, ignoring log_level"),
            },
            (Setting::ScansToAverage, _) => self.accumulator.reset(),
            _ => self.backend.apply_setting(cmd).await?,
        }

        self.state = next;
        if let SettingValue::FloatArray(c) = &cmd.value {
            match cmd.setting {
                Setting::WavelengthCoeffs => self.eeprom.wavelength_coeffs = to_f32(c),
                Setting::DegcToDacCoeffs => self.eeprom.degc_to_dac_coeffs = to_f32(c),
                Setting::AdcToDegcCoeffs => self.eeprom.adc_to_degc_coeffs = to_f32(c),
                _ => {}
            }
        }
        Ok(())
    }

    /// Close the backend. Errors are logged, not returned.
    pub async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        if let Err(e) = self.backend.disconnect().await {
            warn!(device = %self.id, error = %e, "backend disconnect failed");
        } else {
            info!(device = %self.id, "disconnected");
        }
    }
}

fn to_f32(values: &[f64]) -> Vec<f32> {
    values.iter().map(|&v| v as f32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockSpectrometer;

    fn mock_session(mock: MockSpectrometer) -> DeviceSession {
        DeviceSession::with_backend("mock:test".parse().unwrap(), Box::new(mock))
    }

    #[test]
    fn device_id_parsing() {
        let id: DeviceId = "USB:0x24aa:0x1000".parse().unwrap();
        assert_eq!(id.scheme, "usb");
        assert_eq!(id.address, "0x24aa:0x1000");
        assert_eq!(id.to_string(), "usb:0x24aa:0x1000");
        assert!("nocolon".parse::<DeviceId>().is_err());
        assert!(":addr".parse::<DeviceId>().is_err());
        assert!("mock:".parse::<DeviceId>().is_err());
    }

    #[test]
    fn state_rejects_out_of_range_laser_power() {
        let mut state = SpectrometerState::default();
        let cmd = ControlObject::new(Setting::LaserPowerPerc, 150i64).unwrap();
        assert!(state.apply(&cmd).is_err());
        assert_eq!(state.laser_power_perc, 100);

        let cmd = ControlObject::new(Setting::IntegrationTimeMs, -5i64).unwrap();
        assert!(state.apply(&cmd).is_err());
    }

    #[test]
    fn state_rejects_hand_built_short_coefficients() {
        let mut state = SpectrometerState::default();
        let cmd = ControlObject {
            setting: Setting::DegcToDacCoeffs,
            value: SettingValue::FloatArray(vec![1.0, 2.0]),
        };
        assert!(matches!(
            state.apply(&cmd),
            Err(SpectroError::InvalidSettingValue { .. })
        ));
        assert_eq!(state, SpectrometerState::default());
    }

    #[tokio::test]
    async fn acquire_before_connect_fails() {
        let mut session = mock_session(MockSpectrometer::new("SN-1"));
        assert!(matches!(
            session.acquire().await,
            Err(SpectroError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connect_loads_eeprom_and_startup_integration() {
        let mut session = mock_session(MockSpectrometer::new("SN-1"));
        session.connect().await.unwrap();
        assert_eq!(session.eeprom().serial_number, "SN-1");
        assert_eq!(
            session.state().integration_time_ms,
            u32::from(session.eeprom().startup_integration_time_ms)
        );
        let settings = session.settings();
        assert_eq!(settings.device_id, "mock:test");
    }

    #[tokio::test]
    async fn zero_integration_time_yields_nothing() {
        let mut session = mock_session(MockSpectrometer::new("SN-1"));
        session.connect().await.unwrap();
        let cmd = ControlObject::new(Setting::IntegrationTimeMs, 0i64).unwrap();
        session.change_setting(&cmd).await.unwrap();
        assert!(session.acquire().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn readings_are_counted_and_complete_without_averaging() {
        let mut session = mock_session(MockSpectrometer::new("SN-1"));
        session.connect().await.unwrap();
        let first = session.acquire().await.unwrap().unwrap();
        let second = session.acquire().await.unwrap().unwrap();
        assert_eq!(first.session_count, 1);
        assert_eq!(second.session_count, 2);
        assert!(first.averaged && second.averaged);
        assert_eq!(second.device_id, "mock:test");
    }

    #[tokio::test]
    async fn scan_averaging_marks_final_frame() {
        let mut session = mock_session(MockSpectrometer::new("SN-1"));
        session.connect().await.unwrap();
        let cmd = ControlObject::parse("scans_to_average", "3").unwrap();
        session.change_setting(&cmd).await.unwrap();

        let flags: Vec<(bool, u32)> = {
            let mut out = Vec::new();
            for _ in 0..4 {
                let r = session.acquire().await.unwrap().unwrap();
                out.push((r.averaged, r.sum_count));
            }
            out
        };
        assert_eq!(flags, vec![(false, 1), (false, 2), (true, 3), (false, 1)]);
    }

    #[tokio::test]
    async fn coefficient_command_updates_eeprom() {
        let mut session = mock_session(MockSpectrometer::new("SN-1"));
        session.connect().await.unwrap();
        let cmd = ControlObject::parse("wavelength_coeffs", "800,0.2,0,0").unwrap();
        session.change_setting(&cmd).await.unwrap();
        assert_eq!(session.eeprom().wavelength_coeffs, vec![800.0, 0.2, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn short_coefficients_leave_eeprom_writable() {
        let mut session = mock_session(MockSpectrometer::new("SN-1"));
        session.connect().await.unwrap();
        let before = session.eeprom().clone();

        for values in [vec![800.0, 0.2], vec![], vec![1.0, 2.0, 3.0, 4.0, 5.0]] {
            let cmd = ControlObject {
                setting: Setting::WavelengthCoeffs,
                value: SettingValue::FloatArray(values),
            };
            assert!(matches!(
                session.change_setting(&cmd).await,
                Err(SpectroError::InvalidSettingValue { .. })
            ));
        }

        assert_eq!(session.eeprom(), &before);
        assert!(session.eeprom().generate_write_buffers(true).is_ok());
    }

    #[tokio::test]
    async fn rejected_setting_changes_nothing() {
        let mock = MockSpectrometer::new("SN-1")
            .rejecting(Setting::LaserEnable)
            .rejecting(Setting::WavelengthCoeffs);
        let mut session = mock_session(mock);
        session.connect().await.unwrap();
        let state = session.state().clone();
        let eeprom = session.eeprom().clone();

        let cmd = ControlObject::new(Setting::LaserEnable, true).unwrap();
        assert!(session.change_setting(&cmd).await.is_err());
        let cmd = ControlObject::parse("wavelength_coeffs", "800,0.2,0,0").unwrap();
        assert!(session.change_setting(&cmd).await.is_err());

        assert_eq!(session.state(), &state);
        assert_eq!(session.eeprom(), &eeprom);

        // settings the device accepts still go through
        let cmd = ControlObject::new(Setting::IntegrationTimeMs, 250i64).unwrap();
        session.change_setting(&cmd).await.unwrap();
        assert_eq!(session.state().integration_time_ms, 250);
        assert!(!session.state().laser_enabled);
    }
}
