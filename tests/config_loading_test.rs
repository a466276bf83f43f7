//! Layered configuration loading from TOML files.

use std::io::Write;

use spectro_daq::balance::BalanceMode;
use spectro_daq::config::Settings;
use spectro_daq::SpectroError;
use tempfile::NamedTempFile;

fn toml_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn file_values_override_defaults() {
    let file = toml_file(
        r#"
[worker]
connect_timeout_ms = 1500
startup_delay_ms = 0

[balance]
mode = "laser_then_integration"
intensity = 30000.0
pixel = 512

[eeprom]
latest_revision = false

[logging]
level = "debug"
json = true
"#,
    );

    let settings = Settings::load_from(file.path()).unwrap();
    assert_eq!(settings.worker.connect_timeout_ms, 1500);
    assert_eq!(settings.worker.startup_delay_ms, 0);
    // untouched keys keep their defaults
    assert_eq!(settings.worker.poll_interval_ms, 50);
    assert_eq!(settings.worker.join_timeout_ms, 2000);

    assert_eq!(settings.balance.mode, BalanceMode::LaserThenIntegration);
    assert_eq!(settings.balance.intensity, 30_000.0);
    assert_eq!(settings.balance.threshold, 2_500.0);
    assert_eq!(settings.balance.pixel, Some(512));
    assert_eq!(settings.balance.max_iterations, None);

    assert!(!settings.eeprom.latest_revision);
    assert_eq!(settings.logging.level, "debug");
    assert!(settings.logging.json);
}

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();

    assert_eq!(settings.worker.connect_timeout_ms, 8000);
    assert_eq!(settings.balance.mode, BalanceMode::Integration);
    assert_eq!(settings.balance.intensity, 45_000.0);
    assert!(settings.eeprom.latest_revision);
    assert_eq!(settings.logging.level, "info");
}

#[test]
fn directive_log_levels_are_accepted() {
    let file = toml_file(
        r#"
[logging]
level = "spectro_daq::worker=trace,info"
"#,
    );
    let settings = Settings::load_from(file.path()).unwrap();
    assert_eq!(settings.logging.level, "spectro_daq::worker=trace,info");
}

#[test]
fn invalid_values_are_rejected_after_merge() {
    for contents in [
        "[logging]\nlevel = \"loud\"\n",
        "[worker]\npoll_interval_ms = 0\n",
        "[balance]\nintensity = -1.0\n",
    ] {
        let file = toml_file(contents);
        let result = Settings::load_from(file.path());
        assert!(
            matches!(result, Err(SpectroError::Configuration(_))),
            "accepted: {contents}"
        );
    }
}

#[test]
fn malformed_values_fail_to_extract() {
    let file = toml_file("[worker]\nconnect_timeout_ms = \"soon\"\n");
    assert!(Settings::load_from(file.path()).is_err());
}
