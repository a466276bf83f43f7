//! Spectrometer EEPROM record.
//!
//! The instrument keeps its non-volatile configuration in six 64-byte pages.
//! [`ConfigRecord`] is the decoded form: it is populated once from the pages
//! read off the device, may then take user edits through
//! [`ConfigRecord::update_editable`], and is turned back into six fresh pages
//! by [`ConfigRecord::generate_write_buffers`].
//!
//! # Format versions
//!
//! Byte 63 of page 0 is the format version and is decoded before anything
//! else. It decides:
//!
//! | Field                         | format < 3 | 3        | 4        | >= 5        |
//! |-------------------------------|------------|----------|----------|-------------|
//! | excitation (int)              | i16        | u16      | u16      | u16         |
//! | slit, ROI, vertical pixels    | i16        | i16      | u16      | u16         |
//! | startup / gain / offset block | absent     | present  | present  | present     |
//! | excitation (float)            | = int form | = int    | page 3   | page 3      |
//! | integration limits            | u16 p2     | u16 p2   | u16 p2   | u32 p3      |
//!
//! Fields absent at a given format keep their [`Default`] values.
//!
//! # Encoding
//!
//! Encoding always uses the newest widths. Unsigned fields clamp negative
//! values to zero and string fields are cut to width; both are logged, and the
//! names of truncated string fields are returned in [`WriteBuffers`].

pub mod codec;
pub mod layout;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{AppResult, SpectroError};
use codec::{Field, PageReader, PageWriter, PAGE_COUNT, PAGE_SIZE};
use layout::*;

/// Decoded EEPROM contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    /// Byte 63 of page 0.
    pub format: u8,

    /// Model name, up to 16 characters.
    pub model: String,
    /// Unique per unit.
    pub serial_number: String,
    /// Serial baud rate; zero on USB-only units.
    pub baud_rate: u32,
    /// Detector has a TEC.
    pub has_cooling: bool,
    /// Battery-powered unit.
    pub has_battery: bool,
    /// A laser is fitted.
    pub has_laser: bool,
    /// Laser wavelength, whole nanometres.
    pub excitation_nm: i32,
    /// Laser wavelength as calibrated.
    pub excitation_nm_float: f32,
    /// Entrance slit width.
    pub slit_size_um: i32,
    /// Pushed to the device on connect.
    pub startup_integration_time_ms: u16,
    /// TEC setpoint applied at power-up.
    pub startup_temp_degc: i16,
    /// Trigger source applied at power-up.
    pub startup_triggering_scheme: u8,
    /// Even pixels, or all pixels on silicon detectors.
    pub detector_gain: f32,
    /// Pairs with `detector_gain`.
    pub detector_offset: i16,
    /// Odd pixels on InGaAs detectors.
    pub detector_gain_odd: f32,
    /// Pairs with `detector_gain_odd`.
    pub detector_offset_odd: i16,

    /// Pixel to nm, constant term first. Four on encode.
    pub wavelength_coeffs: Vec<f32>,
    /// Three on encode.
    pub degc_to_dac_coeffs: Vec<f32>,
    /// Three on encode.
    pub adc_to_degc_coeffs: Vec<f32>,
    /// TEC setpoint ceiling.
    pub max_temp_degc: i16,
    /// TEC setpoint floor.
    pub min_temp_degc: i16,
    /// Thermistor resistance at 298 K.
    pub tec_r298: i16,
    /// Thermistor beta.
    pub tec_beta: i16,
    /// Free text, usually ISO 8601.
    pub calibration_date: String,
    /// Technician initials, three characters.
    pub calibrated_by: String,

    /// Detector part name.
    pub detector: String,
    /// Spectrum length.
    pub active_pixels_horizontal: u16,
    /// Detector rows.
    pub active_pixels_vertical: i32,
    /// Lowest integration time the unit accepts.
    pub min_integration_time_ms: u32,
    /// Highest integration time the unit accepts.
    pub max_integration_time_ms: u32,
    /// Physical columns, including masked ones.
    pub actual_horizontal: i32,
    /// Not stored on the device; mirrors `active_pixels_vertical`.
    pub actual_vertical: i32,
    /// First pixel of the horizontal region of interest.
    pub roi_horizontal_start: i32,
    /// Last pixel of the horizontal region of interest.
    pub roi_horizontal_end: i32,
    /// Start row of vertical region 1.
    pub roi_vertical_region_1_start: i32,
    /// End row of vertical region 1.
    pub roi_vertical_region_1_end: i32,
    /// Start row of vertical region 2.
    pub roi_vertical_region_2_start: i32,
    /// End row of vertical region 2.
    pub roi_vertical_region_2_end: i32,
    /// Start row of vertical region 3.
    pub roi_vertical_region_3_start: i32,
    /// End row of vertical region 3.
    pub roi_vertical_region_3_end: i32,
    /// Five on encode.
    pub linearity_coeffs: Vec<f32>,

    /// Milliwatts to percent, constant term first.
    pub laser_power_coeffs: Vec<f32>,
    /// Laser output at 100%.
    pub max_laser_power_mw: f32,
    /// Lowest usable laser output.
    pub min_laser_power_mw: f32,

    /// Raw page 4 contents (63 bytes).
    pub user_data: Vec<u8>,
    /// Printable rendering of `user_data`; this is what gets written back.
    pub user_text: String,

    /// Deduplicated, ascending.
    pub bad_pixels: Vec<i16>,
    /// Free-form build descriptor.
    pub product_configuration: String,
}

impl Default for ConfigRecord {
    fn default() -> Self {
        Self {
            format: 0,
            model: String::new(),
            serial_number: String::new(),
            baud_rate: 0,
            has_cooling: false,
            has_battery: false,
            has_laser: false,
            excitation_nm: 0,
            excitation_nm_float: 0.0,
            slit_size_um: 0,
            startup_integration_time_ms: 10,
            startup_temp_degc: 15,
            startup_triggering_scheme: 0,
            detector_gain: 1.9,
            detector_offset: 0,
            detector_gain_odd: 1.9,
            detector_offset_odd: 0,
            wavelength_coeffs: Vec::new(),
            degc_to_dac_coeffs: Vec::new(),
            adc_to_degc_coeffs: Vec::new(),
            max_temp_degc: 20,
            min_temp_degc: 10,
            tec_r298: 0,
            tec_beta: 0,
            calibration_date: String::new(),
            calibrated_by: String::new(),
            detector: String::new(),
            active_pixels_horizontal: 1024,
            active_pixels_vertical: 0,
            min_integration_time_ms: 10,
            max_integration_time_ms: 60_000,
            actual_horizontal: 0,
            actual_vertical: 0,
            roi_horizontal_start: 0,
            roi_horizontal_end: 0,
            roi_vertical_region_1_start: 0,
            roi_vertical_region_1_end: 0,
            roi_vertical_region_2_start: 0,
            roi_vertical_region_2_end: 0,
            roi_vertical_region_3_start: 0,
            roi_vertical_region_3_end: 0,
            linearity_coeffs: Vec::new(),
            laser_power_coeffs: Vec::new(),
            max_laser_power_mw: 0.0,
            min_laser_power_mw: 0.0,
            user_data: Vec::new(),
            user_text: String::new(),
            bad_pixels: Vec::new(),
            product_configuration: String::new(),
        }
    }
}

/// Six freshly encoded pages, ready to be written to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBuffers {
    /// Page images, revision byte included.
    pub pages: [[u8; PAGE_SIZE]; PAGE_COUNT],
    /// Labels of string fields that were cut to fit their width.
    pub truncated: Vec<&'static str>,
}

impl WriteBuffers {
    /// All pages back to back (384 bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.pages.concat()
    }
}

/// Render possibly-binary data as printable ASCII.
///
/// Bytes 32..=126 map to themselves, a NUL ends the string and anything else
/// becomes `.`.
pub fn printable(buf: &[u8]) -> String {
    let mut s = String::with_capacity(buf.len());
    for &c in buf {
        match c {
            32..=126 => s.push(c as char),
            0 => break,
            _ => s.push('.'),
        }
    }
    s
}

/// Sanity check for a coefficient set.
///
/// Rejects a length mismatch (when `count` is given), any NaN, the
/// never-calibrated `[0, 1, 0, 0, ...]` pattern, and sets where every
/// coefficient is `-1.0` or every coefficient is `0.0`.
pub fn coeffs_look_valid(coeffs: &[f32], count: Option<usize>) -> bool {
    if let Some(count) = count {
        if coeffs.len() != count {
            return false;
        }
    }

    if coeffs.iter().any(|c| c.is_nan()) {
        return false;
    }

    let all_default = coeffs
        .iter()
        .enumerate()
        .all(|(i, &c)| if i == 1 { c == 1.0 } else { c == 0.0 });
    if all_default {
        return false;
    }

    for constant in [-1.0f32, 0.0] {
        if coeffs.iter().all(|&c| c == constant) {
            return false;
        }
    }

    true
}

/// Declares the user-editable whitelist and the merge that honours it.
macro_rules! editable_fields {
    ($($field:ident),* $(,)?) => {
        /// Fields a user may change after the record has been read from the device.
        pub const EDITABLE_FIELDS: &[&str] = &[$(stringify!($field)),*];

        impl ConfigRecord {
            /// Copy every whitelisted field that differs in `new` into `self`.
            ///
            /// Fields outside [`EDITABLE_FIELDS`] are never touched.
            pub fn update_editable(&mut self, new: &ConfigRecord) {
                $(
                    if self.$field == new.$field {
                        debug!(field = stringify!($field), "no change");
                    } else {
                        debug!(
                            field = stringify!($field),
                            old = ?self.$field,
                            new = ?new.$field,
                            "updating editable field"
                        );
                        self.$field = new.$field.clone();
                    }
                )*
            }
        }
    };
}

editable_fields!(
    excitation_nm,
    excitation_nm_float,
    detector_gain,
    detector_offset,
    detector_gain_odd,
    detector_offset_odd,
    calibrated_by,
    calibration_date,
    user_text,
    wavelength_coeffs,
    linearity_coeffs,
    max_laser_power_mw,
    min_laser_power_mw,
    laser_power_coeffs,
    bad_pixels,
    roi_horizontal_end,
    roi_horizontal_start,
    roi_vertical_region_1_end,
    roi_vertical_region_1_start,
    roi_vertical_region_2_end,
    roi_vertical_region_2_start,
    roi_vertical_region_3_end,
    roi_vertical_region_3_start,
);

fn read_coeffs<B: AsRef<[u8]>>(reader: &PageReader<'_, B>, fields: &[Field]) -> Vec<f32> {
    fields.iter().map(|&f| reader.f32(f)).collect()
}

fn write_coeffs(
    writer: &mut PageWriter,
    fields: &[Field],
    coeffs: &[f32],
    name: &'static str,
) -> AppResult<()> {
    for (index, &field) in fields.iter().enumerate() {
        let value = coeffs
            .get(index)
            .copied()
            .ok_or(SpectroError::MissingCoefficient { field: name, index })?;
        writer.put_f32(field, value)?;
    }
    Ok(())
}

impl ConfigRecord {
    /// Decode a record from the pages read off a device.
    ///
    /// At least six pages are required. Individual fields that cannot be
    /// decoded are logged and keep a zero/empty value.
    pub fn parse<B: AsRef<[u8]>>(pages: &[B]) -> AppResult<Self> {
        if pages.len() < PAGE_COUNT {
            error!(pages = pages.len(), "EEPROM parse expects at least 6 pages");
            return Err(SpectroError::InsufficientPages {
                expected: PAGE_COUNT,
                actual: pages.len(),
            });
        }

        let mut record = Self::default();
        record.read_pages(&PageReader::new(pages));
        Ok(record)
    }

    fn read_pages<B: AsRef<[u8]>>(&mut self, r: &PageReader<'_, B>) {
        self.format = r.u8(FORMAT);
        debug!(format = self.format, "parsing EEPROM");

        let unsigned_excitation = self.format >= FORMAT_UNSIGNED_EXCITATION;
        let unsigned_geometry = self.format >= FORMAT_UNSIGNED_GEOMETRY;

        // page 0
        self.model = r.string(MODEL);
        self.serial_number = r.string(SERIAL_NUMBER);
        self.baud_rate = r.u32(BAUD_RATE);
        self.has_cooling = r.bool(HAS_COOLING);
        self.has_battery = r.bool(HAS_BATTERY);
        self.has_laser = r.bool(HAS_LASER);
        self.excitation_nm = r.u16_or_i16(EXCITATION_NM, unsigned_excitation);
        self.slit_size_um = r.u16_or_i16(SLIT_SIZE_UM, unsigned_geometry);

        if self.format >= FORMAT_UNSIGNED_EXCITATION {
            self.startup_integration_time_ms = r.u16(STARTUP_INTEGRATION_TIME_MS);
            self.startup_temp_degc = r.i16(STARTUP_TEMP_DEGC);
            self.startup_triggering_scheme = r.u8(STARTUP_TRIGGERING_SCHEME);
            self.detector_gain = r.f32(DETECTOR_GAIN);
            self.detector_offset = r.i16(DETECTOR_OFFSET);
            self.detector_gain_odd = r.f32(DETECTOR_GAIN_ODD);
            self.detector_offset_odd = r.i16(DETECTOR_OFFSET_ODD);
        }

        // page 1
        self.wavelength_coeffs = read_coeffs(r, &WAVELENGTH_COEFFS);
        self.degc_to_dac_coeffs = read_coeffs(r, &DEGC_TO_DAC_COEFFS);
        self.max_temp_degc = r.i16(MAX_TEMP_DEGC);
        self.min_temp_degc = r.i16(MIN_TEMP_DEGC);
        self.adc_to_degc_coeffs = read_coeffs(r, &ADC_TO_DEGC_COEFFS);
        self.tec_r298 = r.i16(TEC_R298);
        self.tec_beta = r.i16(TEC_BETA);
        self.calibration_date = r.string(CALIBRATION_DATE);
        self.calibrated_by = r.string(CALIBRATED_BY);

        // page 2
        self.detector = r.string(DETECTOR);
        self.active_pixels_horizontal = r.u16(ACTIVE_PIXELS_HORIZONTAL);
        self.active_pixels_vertical = r.u16_or_i16(ACTIVE_PIXELS_VERTICAL, unsigned_geometry);
        if self.format < FORMAT_WIDE_INTEGRATION {
            self.min_integration_time_ms = u32::from(r.u16(MIN_INTEGRATION_TIME_MS_U16));
            self.max_integration_time_ms = u32::from(r.u16(MAX_INTEGRATION_TIME_MS_U16));
        }
        self.actual_horizontal = r.u16_or_i16(ACTUAL_HORIZONTAL, unsigned_geometry);
        self.actual_vertical = self.active_pixels_vertical;
        self.roi_horizontal_start = r.u16_or_i16(ROI_HORIZONTAL_START, unsigned_geometry);
        self.roi_horizontal_end = r.u16_or_i16(ROI_HORIZONTAL_END, unsigned_geometry);
        self.roi_vertical_region_1_start =
            r.u16_or_i16(ROI_VERTICAL_REGION_1_START, unsigned_geometry);
        self.roi_vertical_region_1_end = r.u16_or_i16(ROI_VERTICAL_REGION_1_END, unsigned_geometry);
        self.roi_vertical_region_2_start =
            r.u16_or_i16(ROI_VERTICAL_REGION_2_START, unsigned_geometry);
        self.roi_vertical_region_2_end = r.u16_or_i16(ROI_VERTICAL_REGION_2_END, unsigned_geometry);
        self.roi_vertical_region_3_start =
            r.u16_or_i16(ROI_VERTICAL_REGION_3_START, unsigned_geometry);
        self.roi_vertical_region_3_end = r.u16_or_i16(ROI_VERTICAL_REGION_3_END, unsigned_geometry);
        self.linearity_coeffs = read_coeffs(r, &LINEARITY_COEFFS);

        // page 3
        self.laser_power_coeffs = read_coeffs(r, &LASER_POWER_COEFFS);
        self.max_laser_power_mw = r.f32(MAX_LASER_POWER_MW);
        self.min_laser_power_mw = r.f32(MIN_LASER_POWER_MW);
        self.excitation_nm_float = r.f32(EXCITATION_NM_FLOAT);
        if self.format < FORMAT_UNSIGNED_GEOMETRY {
            // no independent float calibration before format 4
            self.excitation_nm_float = self.excitation_nm as f32;
        }
        if self.format >= FORMAT_WIDE_INTEGRATION {
            self.min_integration_time_ms = r.u32(MIN_INTEGRATION_TIME_MS_U32);
            self.max_integration_time_ms = r.u32(MAX_INTEGRATION_TIME_MS_U32);
        }

        // page 4
        self.user_data = r.bytes(USER_DATA);
        self.user_text = printable(&self.user_data);

        // page 5
        let bad: BTreeSet<i16> = (0..BAD_PIXEL_SLOTS)
            .map(|i| r.i16(bad_pixel(i)))
            .filter(|&pixel| pixel != BAD_PIXEL_UNUSED)
            .collect();
        self.bad_pixels = bad.into_iter().collect();
        self.product_configuration = r.string(PRODUCT_CONFIGURATION);
    }

    /// Encode the record into six new pages.
    ///
    /// Every page gets its revision byte; with `latest_revision` page 0 is
    /// stamped as format 5, which is also the layout written here.
    pub fn generate_write_buffers(&self, latest_revision: bool) -> AppResult<WriteBuffers> {
        let mut revisions = PAGE_REVISIONS;
        if latest_revision {
            revisions[0] = LATEST_PAGE0_REVISION;
        }
        let mut w = PageWriter::new(revisions);

        // page 0
        w.put_string(MODEL, &self.model)?;
        w.put_string(SERIAL_NUMBER, &self.serial_number)?;
        w.put_u32(BAUD_RATE, i64::from(self.baud_rate))?;
        w.put_bool(HAS_COOLING, self.has_cooling)?;
        w.put_bool(HAS_BATTERY, self.has_battery)?;
        w.put_bool(HAS_LASER, self.has_laser)?;
        w.put_u16(EXCITATION_NM, i64::from(self.excitation_nm))?;
        w.put_u16(SLIT_SIZE_UM, i64::from(self.slit_size_um))?;
        w.put_u16(
            STARTUP_INTEGRATION_TIME_MS,
            i64::from(self.startup_integration_time_ms),
        )?;
        w.put_i16(STARTUP_TEMP_DEGC, self.startup_temp_degc)?;
        w.put_u8(STARTUP_TRIGGERING_SCHEME, self.startup_triggering_scheme)?;
        w.put_f32(DETECTOR_GAIN, self.detector_gain)?;
        w.put_i16(DETECTOR_OFFSET, self.detector_offset)?;
        w.put_f32(DETECTOR_GAIN_ODD, self.detector_gain_odd)?;
        w.put_i16(DETECTOR_OFFSET_ODD, self.detector_offset_odd)?;

        // page 1
        write_coeffs(&mut w, &WAVELENGTH_COEFFS, &self.wavelength_coeffs, "wavelength_coeffs")?;
        write_coeffs(&mut w, &DEGC_TO_DAC_COEFFS, &self.degc_to_dac_coeffs, "degc_to_dac_coeffs")?;
        write_coeffs(&mut w, &ADC_TO_DEGC_COEFFS, &self.adc_to_degc_coeffs, "adc_to_degc_coeffs")?;
        w.put_i16(MAX_TEMP_DEGC, self.max_temp_degc)?;
        w.put_i16(MIN_TEMP_DEGC, self.min_temp_degc)?;
        w.put_i16(TEC_R298, self.tec_r298)?;
        w.put_i16(TEC_BETA, self.tec_beta)?;
        w.put_string(CALIBRATION_DATE, &self.calibration_date)?;
        w.put_string(CALIBRATED_BY, &self.calibrated_by)?;

        // page 2
        w.put_string(DETECTOR, &self.detector)?;
        w.put_u16(
            ACTIVE_PIXELS_HORIZONTAL,
            i64::from(self.active_pixels_horizontal),
        )?;
        w.put_u16(ACTIVE_PIXELS_VERTICAL, i64::from(self.active_pixels_vertical))?;
        // legacy readers still look here; keep them populated, saturated to 16 bits
        w.put_u16(
            MIN_INTEGRATION_TIME_MS_U16,
            i64::from(self.min_integration_time_ms.min(u32::from(u16::MAX))),
        )?;
        w.put_u16(
            MAX_INTEGRATION_TIME_MS_U16,
            i64::from(self.max_integration_time_ms.min(u32::from(u16::MAX))),
        )?;
        w.put_u16(ACTUAL_HORIZONTAL, i64::from(self.actual_horizontal))?;
        w.put_u16(ROI_HORIZONTAL_START, i64::from(self.roi_horizontal_start))?;
        w.put_u16(ROI_HORIZONTAL_END, i64::from(self.roi_horizontal_end))?;
        w.put_u16(
            ROI_VERTICAL_REGION_1_START,
            i64::from(self.roi_vertical_region_1_start),
        )?;
        w.put_u16(
            ROI_VERTICAL_REGION_1_END,
            i64::from(self.roi_vertical_region_1_end),
        )?;
        w.put_u16(
            ROI_VERTICAL_REGION_2_START,
            i64::from(self.roi_vertical_region_2_start),
        )?;
        w.put_u16(
            ROI_VERTICAL_REGION_2_END,
            i64::from(self.roi_vertical_region_2_end),
        )?;
        w.put_u16(
            ROI_VERTICAL_REGION_3_START,
            i64::from(self.roi_vertical_region_3_start),
        )?;
        w.put_u16(
            ROI_VERTICAL_REGION_3_END,
            i64::from(self.roi_vertical_region_3_end),
        )?;
        write_coeffs(&mut w, &LINEARITY_COEFFS, &self.linearity_coeffs, "linearity_coeffs")?;

        // page 3
        write_coeffs(&mut w, &LASER_POWER_COEFFS, &self.laser_power_coeffs, "laser_power_coeffs")?;
        w.put_f32(MAX_LASER_POWER_MW, self.max_laser_power_mw)?;
        w.put_f32(MIN_LASER_POWER_MW, self.min_laser_power_mw)?;
        w.put_f32(EXCITATION_NM_FLOAT, self.excitation_nm_float)?;
        w.put_u32(
            MIN_INTEGRATION_TIME_MS_U32,
            i64::from(self.min_integration_time_ms),
        )?;
        w.put_u32(
            MAX_INTEGRATION_TIME_MS_U32,
            i64::from(self.max_integration_time_ms),
        )?;

        // page 4
        w.put_string(USER_DATA, &self.user_text)?;

        // page 5
        let bad: BTreeSet<i16> = self.bad_pixels.iter().copied().filter(|&p| p >= 0).collect();
        if bad.len() > BAD_PIXEL_SLOTS {
            warn!(
                count = bad.len(),
                slots = BAD_PIXEL_SLOTS,
                "too many bad pixels, keeping the lowest"
            );
        }
        let mut bad = bad.into_iter();
        for slot in 0..BAD_PIXEL_SLOTS {
            w.put_i16(bad_pixel(slot), bad.next().unwrap_or(BAD_PIXEL_UNUSED))?;
        }
        w.put_string(PRODUCT_CONFIGURATION, &self.product_configuration)?;

        let (pages, truncated) = w.finish();
        Ok(WriteBuffers { pages, truncated })
    }

    /// Case-insensitive membership in [`EDITABLE_FIELDS`].
    pub fn is_editable(name: &str) -> bool {
        EDITABLE_FIELDS
            .iter()
            .any(|field| field.eq_ignore_ascii_case(name))
    }

    /// Horizontal ROI as `(start, end)` with `end` inclusive, clipped to the
    /// active pixel count. `None` when the stored ROI is not usable.
    pub fn horizontal_roi(&self) -> Option<(i32, i32)> {
        let start = self.roi_horizontal_start;
        let end = self.roi_horizontal_end;
        let pixels = i32::from(self.active_pixels_horizontal);

        if start >= 0 && start < pixels && end >= start && end <= pixels {
            Some((start, start.max(end.min(pixels - 1))))
        } else {
            None
        }
    }

    /// A positive max power and four plausible coefficients.
    pub fn has_laser_power_calibration(&self) -> bool {
        if self.max_laser_power_mw <= 0.0 {
            return false;
        }
        coeffs_look_valid(&self.laser_power_coeffs, Some(4))
    }

    /// Convert laser output power in milliwatts to a percentage using the
    /// cubic laser-power calibration. Returns 0 when no calibration is present.
    pub fn laser_power_mw_to_percent(&self, mw: f32) -> f32 {
        if !self.has_laser_power_calibration() {
            return 0.0;
        }
        let c = &self.laser_power_coeffs;
        c[0] + c[1] * mw + c[2] * mw * mw + c[3] * mw * mw * mw
    }

    /// Pretty-printed JSON, as `decode` prints it.
    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Log every field at debug level.
    pub fn dump(&self) {
        debug!("EEPROM settings:");
        debug!("  Model:            {}", self.model);
        debug!("  Serial Number:    {}", self.serial_number);
        debug!("  Format:           {}", self.format);
        debug!("  Baud Rate:        {}", self.baud_rate);
        debug!("  Has Cooling:      {}", self.has_cooling);
        debug!("  Has Battery:      {}", self.has_battery);
        debug!("  Has Laser:        {}", self.has_laser);
        debug!("  Excitation:       {} nm", self.excitation_nm);
        debug!("  Excitation (f):   {:.2} nm", self.excitation_nm_float);
        debug!("  Slit size:        {} um", self.slit_size_um);
        debug!("  Start Integ Time: {} ms", self.startup_integration_time_ms);
        debug!("  Start Temp:       {} degC", self.startup_temp_degc);
        debug!("  Start Triggering: {:#04x}", self.startup_triggering_scheme);
        debug!("  Det Gain:         {}", self.detector_gain);
        debug!("  Det Offset:       {}", self.detector_offset);
        debug!("  Det Gain Odd:     {}", self.detector_gain_odd);
        debug!("  Det Offset Odd:   {}", self.detector_offset_odd);
        debug!("  Wavecal coeffs:   {:?}", self.wavelength_coeffs);
        debug!("  degCToDAC coeffs: {:?}", self.degc_to_dac_coeffs);
        debug!("  adcToDegC coeffs: {:?}", self.adc_to_degc_coeffs);
        debug!("  Det temp max:     {} degC", self.max_temp_degc);
        debug!("  Det temp min:     {} degC", self.min_temp_degc);
        debug!("  TEC R298:         {}", self.tec_r298);
        debug!("  TEC beta:         {}", self.tec_beta);
        debug!("  Calibration Date: {}", self.calibration_date);
        debug!("  Calibration By:   {}", self.calibrated_by);
        debug!("  Detector name:    {}", self.detector);
        debug!("  Active horiz:     {}", self.active_pixels_horizontal);
        debug!("  Active vertical:  {}", self.active_pixels_vertical);
        debug!("  Min integration:  {} ms", self.min_integration_time_ms);
        debug!("  Max integration:  {} ms", self.max_integration_time_ms);
        debug!("  Actual Horiz:     {}", self.actual_horizontal);
        debug!("  ROI Horiz:        ({}, {})", self.roi_horizontal_start, self.roi_horizontal_end);
        debug!(
            "  ROI Vert Reg 1:   ({}, {})",
            self.roi_vertical_region_1_start, self.roi_vertical_region_1_end
        );
        debug!(
            "  ROI Vert Reg 2:   ({}, {})",
            self.roi_vertical_region_2_start, self.roi_vertical_region_2_end
        );
        debug!(
            "  ROI Vert Reg 3:   ({}, {})",
            self.roi_vertical_region_3_start, self.roi_vertical_region_3_end
        );
        debug!("  Linearity Coeffs: {:?}", self.linearity_coeffs);
        debug!("  Laser coeffs:     {:?}", self.laser_power_coeffs);
        debug!("  Max Laser Power:  {} mW", self.max_laser_power_mw);
        debug!("  Min Laser Power:  {} mW", self.min_laser_power_mw);
        debug!("  User Text:        {}", self.user_text);
        debug!("  Bad Pixels:       {:?}", self.bad_pixels);
        debug!("  Product Config:   {}", self.product_configuration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_pages(format: u8) -> Vec<Vec<u8>> {
        let mut pages = vec![vec![0u8; PAGE_SIZE]; PAGE_COUNT];
        pages[0][63] = format;
        pages
    }

    #[test]
    fn printable_rendering() {
        assert_eq!(printable(&[72, 101, 0, 255, 65]), "He");
        assert_eq!(printable(&[200, 65]), ".A");
        assert_eq!(printable(&[]), "");
    }

    #[test]
    fn coefficient_validity() {
        assert!(!coeffs_look_valid(&[0.0, 1.0, 0.0, 0.0], None));
        assert!(!coeffs_look_valid(&[f32::NAN, 0.0, 0.0, 0.0], None));
        assert!(!coeffs_look_valid(&[-1.0, -1.0, -1.0, -1.0], None));
        assert!(!coeffs_look_valid(&[0.0, 0.0, 0.0, 0.0], None));
        assert!(coeffs_look_valid(&[0.1, -2.3, 0.0, 1e-5], None));
        assert!(coeffs_look_valid(&[0.1, -2.3, 0.0, 1e-5], Some(4)));
        assert!(!coeffs_look_valid(&[0.1, -2.3, 0.0], Some(4)));
        assert!(!coeffs_look_valid(&[0.1, f32::NAN, 0.0, 2.0], None));
    }

    #[test]
    fn too_few_pages_is_an_error() {
        let pages = vec![vec![0u8; PAGE_SIZE]; 5];
        let err = ConfigRecord::parse(&pages).unwrap_err();
        assert!(matches!(
            err,
            SpectroError::InsufficientPages {
                expected: 6,
                actual: 5
            }
        ));
    }

    #[test]
    fn short_page_only_loses_its_own_fields() {
        let mut pages = blank_pages(5);
        pages[0][0..4].copy_from_slice(b"WP-1");
        pages[2] = vec![0u8; 10];
        pages[5][0..2].copy_from_slice(&7i16.to_le_bytes());
        for slot in 1..15 {
            pages[5][slot * 2..slot * 2 + 2].copy_from_slice(&(-1i16).to_le_bytes());
        }

        let record = ConfigRecord::parse(&pages).unwrap();
        assert_eq!(record.model, "WP-1");
        assert_eq!(record.active_pixels_horizontal, 0);
        assert_eq!(record.linearity_coeffs, vec![0.0; 5]);
        assert_eq!(record.detector, "");
        assert_eq!(record.bad_pixels, vec![7]);
    }

    #[test]
    fn old_format_keeps_startup_defaults() {
        let mut pages = blank_pages(2);
        pages[0][43..45].copy_from_slice(&500u16.to_le_bytes());
        pages[0][48..52].copy_from_slice(&8.5f32.to_le_bytes());
        let record = ConfigRecord::parse(&pages).unwrap();
        assert_eq!(record.startup_integration_time_ms, 10);
        assert_eq!(record.detector_gain, 1.9);
        assert_eq!(record.startup_temp_degc, 15);
    }

    #[test]
    fn excitation_float_falls_back_before_format_4() {
        let mut pages = blank_pages(3);
        pages[0][39..41].copy_from_slice(&785u16.to_le_bytes());
        pages[3][36..40].copy_from_slice(&830.5f32.to_le_bytes());
        let record = ConfigRecord::parse(&pages).unwrap();
        assert_eq!(record.excitation_nm, 785);
        assert_eq!(record.excitation_nm_float, 785.0);

        pages[0][63] = 4;
        let record = ConfigRecord::parse(&pages).unwrap();
        assert_eq!(record.excitation_nm_float, 830.5);
    }

    #[test]
    fn editable_lookup_ignores_case() {
        assert!(ConfigRecord::is_editable("MAX_LASER_POWER_mW"));
        assert!(ConfigRecord::is_editable("bad_pixels"));
        assert!(!ConfigRecord::is_editable("serial_number"));
        assert!(!ConfigRecord::is_editable("format"));
    }

    #[test]
    fn horizontal_roi_clips_to_pixels() {
        let mut record = ConfigRecord {
            roi_horizontal_start: 100,
            roi_horizontal_end: 1024,
            ..ConfigRecord::default()
        };
        assert_eq!(record.horizontal_roi(), Some((100, 1023)));

        record.roi_horizontal_end = 50;
        assert_eq!(record.horizontal_roi(), None);

        record.roi_horizontal_start = -1;
        record.roi_horizontal_end = 10;
        assert_eq!(record.horizontal_roi(), None);
    }

    #[test]
    fn laser_power_conversion_requires_calibration() {
        let mut record = ConfigRecord {
            laser_power_coeffs: vec![1.0, 2.0, 0.5, 0.25],
            max_laser_power_mw: 0.0,
            ..ConfigRecord::default()
        };
        assert_eq!(record.laser_power_mw_to_percent(2.0), 0.0);

        record.max_laser_power_mw = 100.0;
        assert!(record.has_laser_power_calibration());
        // 1 + 2*2 + 0.5*4 + 0.25*8
        assert_eq!(record.laser_power_mw_to_percent(2.0), 9.0);

        record.laser_power_coeffs = vec![0.0, 1.0, 0.0, 0.0];
        assert_eq!(record.laser_power_mw_to_percent(2.0), 0.0);
    }

    #[test]
    fn encode_requires_full_coefficient_sets() {
        let record = ConfigRecord::default();
        let err = record.generate_write_buffers(true).unwrap_err();
        assert!(matches!(
            err,
            SpectroError::MissingCoefficient {
                field: "wavelength_coeffs",
                index: 0
            }
        ));
    }

    #[test]
    fn json_contains_fields() {
        let record = ConfigRecord {
            model: "WP-785".to_string(),
            ..ConfigRecord::default()
        };
        let json = record.to_json().unwrap();
        assert!(json.contains("\"model\": \"WP-785\""));
        assert!(json.contains("\"bad_pixels\""));
    }
}
