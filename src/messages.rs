//! Message types for the worker channels.
//!
//! The controlling side and the worker only ever exchange the values defined
//! here, by value:
//!
//! - [`WorkerCommand`] on the command channel (controller → worker)
//! - [`WorkerResponse`] on the response channel (worker → controller)
//! - [`SettingsHandoff`] on the one-shot settings channel (worker → controller)
//!
//! Setting changes are typed at the boundary. [`ControlObject::parse`] looks
//! the name up in the static command catalog and converts the raw text into a
//! [`SettingValue`] of the right kind, so unknown names and malformed values are
//! rejected before anything is queued.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::device::SpectrometerSettings;
use crate::eeprom::layout::{ADC_TO_DEGC_COEFFS, DEGC_TO_DAC_COEFFS, WAVELENGTH_COEFFS};
use crate::error::{AppResult, SpectroError};
use crate::reading::Reading;

/// Value type a setting accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingKind {
    /// `true`/`false`
    Bool,
    /// Signed integer
    Int,
    /// Floating point
    Float,
    /// Comma-separated floats
    FloatArray,
    /// Free text
    Text,
}

impl fmt::Display for SettingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettingKind::Bool => "bool",
            SettingKind::Int => "int",
            SettingKind::Float => "float",
            SettingKind::FloatArray => "float array",
            SettingKind::Text => "string",
        };
        f.write_str(name)
    }
}

macro_rules! command_catalog {
    ($($variant:ident => $name:literal : $kind:ident),* $(,)?) => {
        /// Every setting the worker understands.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum Setting {
            $(
                #[doc = concat!("`", $name, "`")]
                #[serde(rename = $name)]
                $variant,
            )*
        }

        /// Static name → kind table. Never mutated.
        pub const COMMAND_CATALOG: &[(Setting, &str, SettingKind)] = &[
            $((Setting::$variant, $name, SettingKind::$kind)),*
        ];

        impl Setting {
            /// Catalog name, as used on the wire.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Setting::$variant => $name,)*
                }
            }

            /// Value kind from the catalog.
            pub fn kind(&self) -> SettingKind {
                match self {
                    $(Setting::$variant => SettingKind::$kind,)*
                }
            }
        }
    };
}

command_catalog! {
    AdcToDegcCoeffs => "adc_to_degC_coeffs": FloatArray,
    DegcToDacCoeffs => "degC_to_dac_coeffs": FloatArray,
    WavelengthCoeffs => "wavelength_coeffs": FloatArray,

    AreaScanEnable => "area_scan_enable": Bool,
    DetectorTecEnable => "detector_tec_enable": Bool,
    EnableSecondaryAdc => "enable_secondary_adc": Bool,
    HighGainModeEnable => "high_gain_mode_enable": Bool,
    InvertXAxis => "invert_x_axis": Bool,
    LaserEnable => "laser_enable": Bool,
    LaserPowerRampingEnabled => "laser_power_ramping_enabled": Bool,
    ResetFpga => "reset_fpga": Bool,

    BadPixelMode => "bad_pixel_mode": Int,
    DetectorTecSetpointDegc => "detector_tec_setpoint_degC": Int,
    CcdOffset => "ccd_offset": Int,
    IntegrationTimeMs => "integration_time_ms": Int,
    LaserPowerPerc => "laser_power_perc": Int,
    LaserPowerRampIncrements => "laser_power_ramp_increments": Int,
    LaserTemperatureSetpointRaw => "laser_temperature_setpoint_raw": Int,
    MaxUsbIntervalMs => "max_usb_interval_ms": Int,
    MinUsbIntervalMs => "min_usb_interval_ms": Int,
    ScansToAverage => "scans_to_average": Int,
    TriggerSource => "trigger_source": Int,

    CcdGain => "ccd_gain": Float,

    LogLevel => "log_level": Text,
}

impl Setting {
    /// Required element count for array settings; `None` for scalars.
    pub fn array_len(&self) -> Option<usize> {
        match self {
            Setting::WavelengthCoeffs => Some(WAVELENGTH_COEFFS.len()),
            Setting::DegcToDacCoeffs => Some(DEGC_TO_DAC_COEFFS.len()),
            Setting::AdcToDegcCoeffs => Some(ADC_TO_DEGC_COEFFS.len()),
            _ => None,
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Setting {
    type Err = SpectroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        COMMAND_CATALOG
            .iter()
            .find(|(_, name, _)| *name == s)
            .map(|(setting, _, _)| *setting)
            .ok_or_else(|| SpectroError::UnknownSetting(s.to_string()))
    }
}

/// All setting names, sorted.
pub fn settings() -> Vec<&'static str> {
    let mut names: Vec<_> = COMMAND_CATALOG.iter().map(|(_, name, _)| *name).collect();
    names.sort_unstable();
    names
}

/// Value kind for `name`, if it is a known setting.
pub fn setting_type(name: &str) -> Option<SettingKind> {
    name.parse::<Setting>().ok().map(|s| s.kind())
}

/// Whether `name` is in the catalog.
pub fn is_setting(name: &str) -> bool {
    setting_type(name).is_some()
}

/// Convert the external text form of a value for `name`.
///
/// Booleans are true when the text contains "true" in any case; float arrays
/// are comma-separated and every token must be a number, so empty input or an
/// empty token is rejected.
pub fn convert_type(name: &str, raw: &str) -> AppResult<SettingValue> {
    let setting: Setting = name.parse()?;
    let invalid = |reason: String| SpectroError::InvalidSettingValue {
        setting: name.to_string(),
        reason,
    };

    let value = match setting.kind() {
        SettingKind::Bool => SettingValue::Bool(raw.to_lowercase().contains("true")),
        SettingKind::Int => raw
            .trim()
            .parse::<i64>()
            .map(SettingValue::Int)
            .map_err(|e| invalid(format!("'{raw}' is not an integer: {e}")))?,
        SettingKind::Float => raw
            .trim()
            .parse::<f64>()
            .map(SettingValue::Float)
            .map_err(|e| invalid(format!("'{raw}' is not a number: {e}")))?,
        SettingKind::FloatArray => {
            let mut values = Vec::new();
            for token in raw.split(',').map(str::trim) {
                if token.is_empty() {
                    return Err(invalid(format!("'{raw}' has an empty element")));
                }
                let v = token
                    .parse::<f64>()
                    .map_err(|e| invalid(format!("'{token}' is not a number: {e}")))?;
                values.push(v);
            }
            SettingValue::FloatArray(values)
        }
        SettingKind::Text => SettingValue::Text(raw.to_string()),
    };
    Ok(value)
}

/// Payload of a setting change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SettingValue {
    /// Flag settings
    Bool(bool),
    /// Integer settings; also accepted where a float is expected
    Int(i64),
    /// Float settings
    Float(f64),
    /// Coefficient arrays
    FloatArray(Vec<f64>),
    /// `log_level`
    Text(String),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(b) => write!(f, "{}", b),
            SettingValue::Int(i) => write!(f, "{}", i),
            SettingValue::Float(fl) => write!(f, "{}", fl),
            SettingValue::FloatArray(arr) => write!(f, "{:?}", arr),
            SettingValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl SettingValue {
    /// Kind of the payload.
    pub fn kind(&self) -> SettingKind {
        match self {
            SettingValue::Bool(_) => SettingKind::Bool,
            SettingValue::Int(_) => SettingKind::Int,
            SettingValue::Float(_) => SettingKind::Float,
            SettingValue::FloatArray(_) => SettingKind::FloatArray,
            SettingValue::Text(_) => SettingKind::Text,
        }
    }

    /// The flag, for `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; floats are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            SettingValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    /// Float view; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Float(f) => Some(*f),
            SettingValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// The elements, for `FloatArray`.
    pub fn as_float_array(&self) -> Option<&[f64]> {
        match self {
            SettingValue::FloatArray(arr) => Some(arr),
            _ => None,
        }
    }

    /// The text, for `Text`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Int(value)
    }
}

impl From<u32> for SettingValue {
    fn from(value: u32) -> Self {
        SettingValue::Int(i64::from(value))
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Float(value)
    }
}

impl From<Vec<f64>> for SettingValue {
    fn from(value: Vec<f64>) -> Self {
        SettingValue::FloatArray(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Text(value)
    }
}

/// A typed `(setting, value)` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlObject {
    /// Which setting
    pub setting: Setting,
    /// New value
    pub value: SettingValue,
}

impl ControlObject {
    /// Build a command, checking the value against the catalog.
    ///
    /// Integers are accepted for float settings.
    pub fn new(setting: Setting, value: impl Into<SettingValue>) -> AppResult<Self> {
        let value = match (setting.kind(), value.into()) {
            (SettingKind::Float, SettingValue::Int(i)) => SettingValue::Float(i as f64),
            (_, value) => value,
        };
        let cmd = Self { setting, value };
        cmd.validate()?;
        Ok(cmd)
    }

    /// Build a command from its external text form.
    pub fn parse(name: &str, raw: &str) -> AppResult<Self> {
        let setting: Setting = name.parse()?;
        let cmd = Self {
            setting,
            value: convert_type(name, raw)?,
        };
        cmd.validate()?;
        Ok(cmd)
    }

    /// Check the value kind and, for coefficient arrays, the element count.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |reason: String| SpectroError::InvalidSettingValue {
            setting: self.name().to_string(),
            reason,
        };
        if self.value.kind() != self.setting.kind() {
            return Err(invalid(format!(
                "expected {}, got {}",
                self.setting.kind(),
                self.value.kind()
            )));
        }
        if let (Some(expected), Some(values)) =
            (self.setting.array_len(), self.value.as_float_array())
        {
            if values.len() != expected {
                return Err(invalid(format!(
                    "expected {expected} coefficients, got {}",
                    values.len()
                )));
            }
        }
        Ok(())
    }

    /// Catalog name of the setting.
    pub fn name(&self) -> &'static str {
        self.setting.name()
    }
}

impl fmt::Display for ControlObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.setting, self.value)
    }
}

/// Command channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    /// Apply a setting change.
    Setting(ControlObject),
    /// Shut the worker down.
    Poison,
}

impl WorkerCommand {
    /// Deduplication slot. Poison has a slot of its own.
    pub fn dedupe_key(&self) -> Option<Setting> {
        match self {
            WorkerCommand::Setting(cmd) => Some(cmd.setting),
            WorkerCommand::Poison => None,
        }
    }
}

impl From<ControlObject> for WorkerCommand {
    fn from(cmd: ControlObject) -> Self {
        WorkerCommand::Setting(cmd)
    }
}

/// Response channel message.
#[derive(Debug, Clone)]
pub enum WorkerResponse {
    /// One frame.
    Reading(Box<Reading>),
    /// The worker has terminated; nothing follows.
    Poison,
}

impl WorkerResponse {
    /// Box a reading for the channel.
    pub fn reading(reading: Reading) -> Self {
        WorkerResponse::Reading(Box::new(reading))
    }
}

/// Sent exactly once on the settings channel.
#[derive(Debug, Clone)]
pub enum SettingsHandoff {
    /// Connected; the device's settings.
    Ready(Box<SpectrometerSettings>),
    /// Instantiation or connect failed.
    Failed,
}
