//! EEPROM encode/decode against hand-built page images.

use serde_json::Value;
use spectro_daq::eeprom::codec::{PAGE_COUNT, PAGE_SIZE};
use spectro_daq::eeprom::{ConfigRecord, EDITABLE_FIELDS};
use spectro_daq::SpectroError;

fn user_data(text: &str) -> Vec<u8> {
    let mut data = text.as_bytes().to_vec();
    data.resize(63, 0);
    data
}

/// A format-5 unit with every field set to something non-default.
fn calibrated_unit() -> ConfigRecord {
    ConfigRecord {
        format: 5,
        model: "WP-785X-ILP".to_string(),
        serial_number: "WP-01234".to_string(),
        baud_rate: 115_200,
        has_cooling: true,
        has_battery: false,
        has_laser: true,
        excitation_nm: 785,
        excitation_nm_float: 785.25,
        slit_size_um: 50,
        startup_integration_time_ms: 250,
        startup_temp_degc: -10,
        startup_triggering_scheme: 2,
        detector_gain: 1.5,
        detector_offset: -12,
        detector_gain_odd: 1.75,
        detector_offset_odd: 7,
        wavelength_coeffs: vec![784.5, 0.125, -0.5, 0.25],
        degc_to_dac_coeffs: vec![3566.0, -127.5, 0.5],
        adc_to_degc_coeffs: vec![66.5, -0.25, 0.125],
        max_temp_degc: 25,
        min_temp_degc: -15,
        tec_r298: 6750,
        tec_beta: 3977,
        calibration_date: "2026-03-14".to_string(),
        calibrated_by: "ABC".to_string(),
        detector: "HAMA-S11510".to_string(),
        active_pixels_horizontal: 1024,
        active_pixels_vertical: 70,
        min_integration_time_ms: 1,
        max_integration_time_ms: 120_000,
        actual_horizontal: 1044,
        actual_vertical: 70,
        roi_horizontal_start: 10,
        roi_horizontal_end: 1010,
        roi_vertical_region_1_start: 20,
        roi_vertical_region_1_end: 40,
        roi_vertical_region_2_start: 41,
        roi_vertical_region_2_end: 50,
        roi_vertical_region_3_start: 51,
        roi_vertical_region_3_end: 60,
        linearity_coeffs: vec![0.5, 1.0, -0.25, 0.125, 0.0625],
        laser_power_coeffs: vec![0.5, 0.25, 0.0, 0.0],
        max_laser_power_mw: 450.5,
        min_laser_power_mw: 5.5,
        user_data: user_data("bench 3, fibre B"),
        user_text: "bench 3, fibre B".to_string(),
        bad_pixels: vec![3, 17, 900],
        product_configuration: "ILP-SN".to_string(),
    }
}

fn pages_of(record: &ConfigRecord) -> Vec<Vec<u8>> {
    record
        .generate_write_buffers(true)
        .unwrap()
        .pages
        .iter()
        .map(|page| page.to_vec())
        .collect()
}

#[test]
fn format_five_round_trip_is_lossless() {
    let record = calibrated_unit();
    let buffers = record.generate_write_buffers(true).unwrap();
    assert!(buffers.truncated.is_empty());
    assert_eq!(buffers.to_bytes().len(), PAGE_COUNT * PAGE_SIZE);

    let decoded = ConfigRecord::parse(&pages_of(&record)).unwrap();
    assert_eq!(decoded, record);
}

#[test]
fn revision_bytes_are_stamped() {
    let record = calibrated_unit();

    let latest = record.generate_write_buffers(true).unwrap();
    let revisions: Vec<u8> = latest.pages.iter().map(|p| p[PAGE_SIZE - 1]).collect();
    assert_eq!(revisions, vec![5, 1, 2, 255, 1, 1]);

    let legacy = record.generate_write_buffers(false).unwrap();
    assert_eq!(legacy.pages[0][PAGE_SIZE - 1], 1);
}

#[test]
fn integration_limits_follow_the_format() {
    let mut pages = vec![vec![0u8; PAGE_SIZE]; PAGE_COUNT];
    pages[2][21..23].copy_from_slice(&100u16.to_le_bytes());
    pages[2][23..25].copy_from_slice(&2000u16.to_le_bytes());
    pages[3][40..44].copy_from_slice(&77u32.to_le_bytes());
    pages[3][44..48].copy_from_slice(&99_999u32.to_le_bytes());
    pages[0][39..41].copy_from_slice(&[0xff, 0xff]);

    pages[0][63] = 2;
    let old = ConfigRecord::parse(&pages).unwrap();
    assert_eq!(old.min_integration_time_ms, 100);
    assert_eq!(old.max_integration_time_ms, 2000);
    assert_eq!(old.excitation_nm, -1);

    pages[0][63] = 5;
    let new = ConfigRecord::parse(&pages).unwrap();
    assert_eq!(new.min_integration_time_ms, 77);
    assert_eq!(new.max_integration_time_ms, 99_999);
    assert_eq!(new.excitation_nm, 65535);
}

#[test]
fn signedness_switches_at_formats_three_and_four() {
    let mut pages = vec![vec![0u8; PAGE_SIZE]; PAGE_COUNT];
    pages[0][39..41].copy_from_slice(&[0xff, 0xff]); // excitation
    pages[0][41..43].copy_from_slice(&[0xff, 0xff]); // slit
    pages[0][43..45].copy_from_slice(&250u16.to_le_bytes());
    pages[2][19..21].copy_from_slice(&[0xff, 0xff]); // active vertical
    pages[2][21..23].copy_from_slice(&100u16.to_le_bytes());
    pages[2][23..25].copy_from_slice(&2000u16.to_le_bytes());
    pages[2][27..29].copy_from_slice(&[0xff, 0xff]); // roi horizontal start
    pages[3][36..40].copy_from_slice(&532.5f32.to_le_bytes());
    pages[3][40..44].copy_from_slice(&77u32.to_le_bytes());

    pages[0][63] = 3;
    let three = ConfigRecord::parse(&pages).unwrap();
    assert_eq!(three.excitation_nm, 65535);
    assert_eq!(three.excitation_nm_float, 65535.0);
    assert_eq!(three.slit_size_um, -1);
    assert_eq!(three.active_pixels_vertical, -1);
    assert_eq!(three.actual_vertical, -1);
    assert_eq!(three.roi_horizontal_start, -1);
    assert_eq!(three.startup_integration_time_ms, 250);
    assert_eq!(three.min_integration_time_ms, 100);
    assert_eq!(three.max_integration_time_ms, 2000);

    pages[0][63] = 4;
    let four = ConfigRecord::parse(&pages).unwrap();
    assert_eq!(four.excitation_nm, 65535);
    assert_eq!(four.excitation_nm_float, 532.5);
    assert_eq!(four.slit_size_um, 65535);
    assert_eq!(four.active_pixels_vertical, 65535);
    assert_eq!(four.roi_horizontal_start, 65535);
    assert_eq!(four.min_integration_time_ms, 100);
    assert_eq!(four.max_integration_time_ms, 2000);
}

#[test]
fn startup_block_is_absent_before_format_three() {
    let mut pages = vec![vec![0u8; PAGE_SIZE]; PAGE_COUNT];
    pages[0][43..45].copy_from_slice(&250u16.to_le_bytes());
    pages[0][63] = 2;

    let record = ConfigRecord::parse(&pages).unwrap();
    assert_eq!(
        record.startup_integration_time_ms,
        ConfigRecord::default().startup_integration_time_ms
    );
}

#[test]
fn wide_integration_limits_keep_legacy_copy_saturated() {
    let record = calibrated_unit();
    let pages = pages_of(&record);

    assert_eq!(&pages[2][21..23], &1u16.to_le_bytes());
    assert_eq!(&pages[2][23..25], &u16::MAX.to_le_bytes());
    assert_eq!(&pages[3][44..48], &120_000u32.to_le_bytes());
}

#[test]
fn bad_pixels_are_sorted_unique_and_capped() {
    let mut record = calibrated_unit();
    record.bad_pixels = vec![
        900, 5, 3, 5, -1, -7, 100, 2, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51,
    ];
    let pages = pages_of(&record);

    let slots: Vec<i16> = pages[5][..30]
        .chunks(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    assert_eq!(
        slots,
        vec![2, 3, 5, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51]
    );

    let decoded = ConfigRecord::parse(&pages).unwrap();
    assert_eq!(decoded.bad_pixels, slots);
}

#[test]
fn unused_bad_pixel_slots_are_padded() {
    let mut record = calibrated_unit();
    record.bad_pixels = vec![12, 12, -3];
    let pages = pages_of(&record);

    assert_eq!(&pages[5][0..2], &12i16.to_le_bytes());
    for slot in 1..15 {
        assert_eq!(&pages[5][slot * 2..slot * 2 + 2], &(-1i16).to_le_bytes());
    }
    assert_eq!(ConfigRecord::parse(&pages).unwrap().bad_pixels, vec![12]);
}

#[test]
fn editable_merge_touches_only_whitelisted_fields() {
    let original = calibrated_unit();
    let mut edited = calibrated_unit();
    edited.model = "TAMPERED".to_string();
    edited.serial_number = "XX-99999".to_string();
    edited.format = 9;
    edited.active_pixels_horizontal = 2048;
    edited.max_integration_time_ms = 5;
    edited.has_laser = false;
    edited.product_configuration = "other".to_string();
    edited.wavelength_coeffs = vec![500.0, 1.0, 0.0, 0.0];
    edited.user_text = "moved to bench 4".to_string();
    edited.bad_pixels = vec![1];
    edited.roi_horizontal_end = 900;
    edited.max_laser_power_mw = 300.0;
    edited.calibrated_by = "XYZ".to_string();

    let mut merged = original.clone();
    merged.update_editable(&edited);

    let original = serde_json::to_value(&original).unwrap();
    let edited = serde_json::to_value(&edited).unwrap();
    let merged = serde_json::to_value(&merged).unwrap();
    let Value::Object(fields) = &merged else {
        panic!("record did not serialize to an object");
    };
    for (name, value) in fields {
        let expected = if EDITABLE_FIELDS.contains(&name.as_str()) {
            &edited[name]
        } else {
            &original[name]
        };
        assert_eq!(value, expected, "field {name}");
    }
}

#[test]
fn overlong_strings_are_reported() {
    let mut record = calibrated_unit();
    record.model = "WP-785X-ILP-EXTENDED-RANGE".to_string();
    record.calibrated_by = "ABCD".to_string();

    let buffers = record.generate_write_buffers(true).unwrap();
    assert_eq!(buffers.truncated, vec!["model", "tech"]);

    let pages: Vec<Vec<u8>> = buffers.pages.iter().map(|p| p.to_vec()).collect();
    let decoded = ConfigRecord::parse(&pages).unwrap();
    assert_eq!(decoded.model, "WP-785X-ILP-EXTE");
    assert_eq!(decoded.calibrated_by, "ABC");
}

#[test]
fn missing_pages_are_rejected() {
    let pages = pages_of(&calibrated_unit());
    assert!(matches!(
        ConfigRecord::parse(&pages[..4]),
        Err(SpectroError::InsufficientPages { actual: 4, .. })
    ));
}
