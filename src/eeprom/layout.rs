//! Byte layout of the six EEPROM pages.
//!
//! Offsets and widths are a compatibility contract with deployed instruments.
//! Fields whose signedness changed between formats are listed once; the
//! decoder picks the width from the format byte.

use super::codec::{Field, PAGE_COUNT};

/// Page revisions stamped on encode, indexed by page.
pub const PAGE_REVISIONS: [u8; PAGE_COUNT] = [1, 1, 2, 255, 1, 1];

/// Page 0 revision used when encoding in latest-revision mode.
pub const LATEST_PAGE0_REVISION: u8 = 5;

/// First format whose excitation (and startup/gain block) is stored unsigned / present.
pub const FORMAT_UNSIGNED_EXCITATION: u8 = 3;
/// First format with unsigned slit/geometry fields and an independent float excitation.
pub const FORMAT_UNSIGNED_GEOMETRY: u8 = 4;
/// First format storing integration limits as u32 on page 3.
pub const FORMAT_WIDE_INTEGRATION: u8 = 5;

/// Format version; decides how everything else is read.
pub const FORMAT: Field = Field::new(0, 63, 1, "format");

// page 0
/// `ConfigRecord::model`
pub const MODEL: Field = Field::new(0, 0, 16, "model");
/// `ConfigRecord::serial_number`
pub const SERIAL_NUMBER: Field = Field::new(0, 16, 16, "serial");
/// `ConfigRecord::baud_rate`
pub const BAUD_RATE: Field = Field::new(0, 32, 4, "baud");
/// `ConfigRecord::has_cooling`
pub const HAS_COOLING: Field = Field::new(0, 36, 1, "cooling");
/// `ConfigRecord::has_battery`
pub const HAS_BATTERY: Field = Field::new(0, 37, 1, "battery");
/// `ConfigRecord::has_laser`
pub const HAS_LASER: Field = Field::new(0, 38, 1, "laser");
/// Signed before format 3.
pub const EXCITATION_NM: Field = Field::new(0, 39, 2, "excitation");
/// Signed before format 4.
pub const SLIT_SIZE_UM: Field = Field::new(0, 41, 2, "slit");
/// Startup block, format 3 on.
pub const STARTUP_INTEGRATION_TIME_MS: Field = Field::new(0, 43, 2, "start_integ");
/// `ConfigRecord::startup_temp_degc`
pub const STARTUP_TEMP_DEGC: Field = Field::new(0, 45, 2, "start_temp");
/// `ConfigRecord::startup_triggering_scheme`
pub const STARTUP_TRIGGERING_SCHEME: Field = Field::new(0, 47, 1, "start_trigger");
/// `ConfigRecord::detector_gain`
pub const DETECTOR_GAIN: Field = Field::new(0, 48, 4, "gain");
/// `ConfigRecord::detector_offset`
pub const DETECTOR_OFFSET: Field = Field::new(0, 52, 2, "offset");
/// Gain for odd pixels on InGaAs detectors.
pub const DETECTOR_GAIN_ODD: Field = Field::new(0, 54, 4, "gain_odd");
/// `ConfigRecord::detector_offset_odd`
pub const DETECTOR_OFFSET_ODD: Field = Field::new(0, 58, 2, "offset_odd");

// page 1
/// Pixel to wavelength polynomial, constant term first.
pub const WAVELENGTH_COEFFS: [Field; 4] = [
    Field::new(1, 0, 4, "wavecal_coeff_0"),
    Field::new(1, 4, 4, "wavecal_coeff_1"),
    Field::new(1, 8, 4, "wavecal_coeff_2"),
    Field::new(1, 12, 4, "wavecal_coeff_3"),
];
/// TEC setpoint polynomial.
pub const DEGC_TO_DAC_COEFFS: [Field; 3] = [
    Field::new(1, 16, 4, "degCtoDAC_coeff_0"),
    Field::new(1, 20, 4, "degCtoDAC_coeff_1"),
    Field::new(1, 24, 4, "degCtoDAC_coeff_2"),
];
/// `ConfigRecord::max_temp_degc`
pub const MAX_TEMP_DEGC: Field = Field::new(1, 28, 2, "max_temp");
/// `ConfigRecord::min_temp_degc`
pub const MIN_TEMP_DEGC: Field = Field::new(1, 30, 2, "min_temp");
/// Thermistor ADC to temperature polynomial.
pub const ADC_TO_DEGC_COEFFS: [Field; 3] = [
    Field::new(1, 32, 4, "adcToDegC_coeff_0"),
    Field::new(1, 36, 4, "adcToDegC_coeff_1"),
    Field::new(1, 40, 4, "adcToDegC_coeff_2"),
];
/// Thermistor resistance at 298 K.
pub const TEC_R298: Field = Field::new(1, 44, 2, "r298");
/// `ConfigRecord::tec_beta`
pub const TEC_BETA: Field = Field::new(1, 46, 2, "beta");
/// `ConfigRecord::calibration_date`
pub const CALIBRATION_DATE: Field = Field::new(1, 48, 12, "date");
/// Technician initials.
pub const CALIBRATED_BY: Field = Field::new(1, 60, 3, "tech");

// page 2
/// `ConfigRecord::detector`
pub const DETECTOR: Field = Field::new(2, 0, 16, "detector");
/// `ConfigRecord::active_pixels_horizontal`
pub const ACTIVE_PIXELS_HORIZONTAL: Field = Field::new(2, 16, 2, "pixels");
// byte 18 is unused
/// Signed before format 4.
pub const ACTIVE_PIXELS_VERTICAL: Field = Field::new(2, 19, 2, "active_vertical");
/// Legacy integration limit; saturated on encode.
pub const MIN_INTEGRATION_TIME_MS_U16: Field = Field::new(2, 21, 2, "min_integ(ushort)");
/// Legacy integration limit; saturated on encode.
pub const MAX_INTEGRATION_TIME_MS_U16: Field = Field::new(2, 23, 2, "max_integ(ushort)");
/// `ConfigRecord::actual_horizontal`
pub const ACTUAL_HORIZONTAL: Field = Field::new(2, 25, 2, "actual_horiz");
/// Region of interest bounds, signed before format 4.
pub const ROI_HORIZONTAL_START: Field = Field::new(2, 27, 2, "roi_horiz_start");
/// `ConfigRecord::roi_horizontal_end`
pub const ROI_HORIZONTAL_END: Field = Field::new(2, 29, 2, "roi_horiz_end");
/// `ConfigRecord::roi_vertical_region_1_start`
pub const ROI_VERTICAL_REGION_1_START: Field = Field::new(2, 31, 2, "roi_vert_1_start");
/// `ConfigRecord::roi_vertical_region_1_end`
pub const ROI_VERTICAL_REGION_1_END: Field = Field::new(2, 33, 2, "roi_vert_1_end");
/// `ConfigRecord::roi_vertical_region_2_start`
pub const ROI_VERTICAL_REGION_2_START: Field = Field::new(2, 35, 2, "roi_vert_2_start");
/// `ConfigRecord::roi_vertical_region_2_end`
pub const ROI_VERTICAL_REGION_2_END: Field = Field::new(2, 37, 2, "roi_vert_2_end");
/// `ConfigRecord::roi_vertical_region_3_start`
pub const ROI_VERTICAL_REGION_3_START: Field = Field::new(2, 39, 2, "roi_vert_3_start");
/// `ConfigRecord::roi_vertical_region_3_end`
pub const ROI_VERTICAL_REGION_3_END: Field = Field::new(2, 41, 2, "roi_vert_3_end");
/// Non-linearity correction polynomial.
pub const LINEARITY_COEFFS: [Field; 5] = [
    Field::new(2, 43, 4, "linearity_coeff_0"),
    Field::new(2, 47, 4, "linearity_coeff_1"),
    Field::new(2, 51, 4, "linearity_coeff_2"),
    Field::new(2, 55, 4, "linearity_coeff_3"),
    Field::new(2, 59, 4, "linearity_coeff_4"),
];

// page 3
/// Milliwatts to percent polynomial.
pub const LASER_POWER_COEFFS: [Field; 4] = [
    Field::new(3, 12, 4, "laser_power_coeff_0"),
    Field::new(3, 16, 4, "laser_power_coeff_1"),
    Field::new(3, 20, 4, "laser_power_coeff_2"),
    Field::new(3, 24, 4, "laser_power_coeff_3"),
];
/// `ConfigRecord::max_laser_power_mw`
pub const MAX_LASER_POWER_MW: Field = Field::new(3, 28, 4, "max_laser_mW");
/// `ConfigRecord::min_laser_power_mw`
pub const MIN_LASER_POWER_MW: Field = Field::new(3, 32, 4, "min_laser_mW");
/// Read from format 4 on; earlier formats copy the integer form.
pub const EXCITATION_NM_FLOAT: Field = Field::new(3, 36, 4, "excitation(float)");
/// Integration limit, format 5 on.
pub const MIN_INTEGRATION_TIME_MS_U32: Field = Field::new(3, 40, 4, "min_integ(uint)");
/// Integration limit, format 5 on.
pub const MAX_INTEGRATION_TIME_MS_U32: Field = Field::new(3, 44, 4, "max_integ(uint)");

// page 4
/// Free-form page, one byte short of the revision.
pub const USER_DATA: Field = Field::new(4, 0, 63, "user_data");

// page 5
/// Number of i16 slots at the start of page 5.
pub const BAD_PIXEL_SLOTS: usize = 15;
/// Filler for unused slots.
pub const BAD_PIXEL_UNUSED: i16 = -1;
/// `ConfigRecord::product_configuration`
pub const PRODUCT_CONFIGURATION: Field = Field::new(5, 30, 16, "product_config");

/// Slot `index` of the bad-pixel table.
pub const fn bad_pixel(index: usize) -> Field {
    Field::new(5, index * 2, 2, "bad_pixel")
}
