//! Connect/disconnect lifecycle of the acquisition worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use spectro_daq::config::WorkerConfig;
use spectro_daq::device::{BackendRegistry, SpectrometerBackend};
use spectro_daq::hardware::MockSpectrometer;
use spectro_daq::messages::{ControlObject, Setting, SettingValue};
use spectro_daq::reading::Reading;
use spectro_daq::worker::{AcquisitionMode, WorkerSession};
use spectro_daq::SpectroError;

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        connect_timeout_ms: 2000,
        poll_interval_ms: 10,
        join_timeout_ms: 1000,
        connect_failure_grace_ms: 20,
        startup_delay_ms: 0,
    }
}

fn registry() -> Arc<BackendRegistry> {
    let mut registry = BackendRegistry::with_defaults();
    registry.register("flaky", |id| {
        Ok(Box::new(MockSpectrometer::new(&id.address).fail_after(3)) as Box<dyn SpectrometerBackend>)
    });
    registry.register("broken", |id| {
        Ok(Box::new(MockSpectrometer::new(&id.address).error_after(2)) as Box<dyn SpectrometerBackend>)
    });
    Arc::new(registry)
}

fn session(device: &str, config: WorkerConfig) -> WorkerSession {
    WorkerSession::new(device.parse().unwrap(), config, registry())
}

/// Poll until `accept` matches a reading or two seconds pass.
async fn wait_for(
    session: &mut WorkerSession,
    mode: AcquisitionMode,
    accept: impl Fn(&Reading) -> bool,
) -> Reading {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Some(reading) = session.acquire_data(mode).unwrap() {
            if accept(&reading) {
                return reading;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no matching reading within 2s");
}

/// Collect readings until the worker reports termination.
async fn drain_until_terminated(session: &mut WorkerSession) -> Vec<Reading> {
    let mut readings = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        match session.acquire_data(AcquisitionMode::KeepAll) {
            Ok(Some(reading)) => readings.push(reading),
            Ok(None) => tokio::time::sleep(Duration::from_millis(5)).await,
            Err(SpectroError::WorkerTerminated) => return readings,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    panic!("worker did not terminate; got {} readings", readings.len());
}

#[tokio::test]
async fn connect_delivers_settings_then_readings() {
    let mut session = session("mock:WP-00001", fast_config());
    session.connect().await.unwrap();

    let settings = session.settings().unwrap();
    assert_eq!(settings.eeprom.serial_number, "WP-00001");
    assert_eq!(settings.device_id, "mock:WP-00001");

    let reading = wait_for(&mut session, AcquisitionMode::KeepAll, |_| true).await;
    assert_eq!(reading.session_count, 1);
    assert_eq!(reading.device_id, "mock:WP-00001");

    session.disconnect().await;
    assert!(session.is_closing());
    assert!(session
        .acquire_data(AcquisitionMode::Latest)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let mut session = session("mock:WP-00002", fast_config());
    session.connect().await.unwrap();
    assert!(matches!(
        session.connect().await,
        Err(SpectroError::AlreadyRunning(_))
    ));
    session.disconnect().await;
}

#[tokio::test]
async fn connect_times_out_on_hung_worker() {
    let config = WorkerConfig {
        connect_timeout_ms: 300,
        ..fast_config()
    };
    let mut session = session("mock:hang", config);

    let start = Instant::now();
    let result = session.connect().await;
    assert!(matches!(result, Err(SpectroError::ConnectFailed(_))));
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "connect took too long: {:?}",
        start.elapsed()
    );
    assert!(session.is_closing());

    let cleanup = tokio::time::timeout(Duration::from_secs(3), session.disconnect()).await;
    assert!(cleanup.is_ok(), "disconnect hung after failed connect");
}

#[tokio::test]
async fn worker_reported_failure_fails_fast() {
    let config = WorkerConfig {
        connect_timeout_ms: 5000,
        ..fast_config()
    };

    for device in ["mock:fail-connect", "usb:0x24aa:0x1000"] {
        let mut session = session(device, config.clone());
        let start = Instant::now();
        assert!(matches!(
            session.connect().await,
            Err(SpectroError::ConnectFailed(_))
        ));
        assert!(start.elapsed() < Duration::from_secs(2), "{device} waited for the timeout");
        session.disconnect().await;
    }
}

#[tokio::test]
async fn failure_flag_ends_worker_with_poison() {
    let mut session = session("flaky:WP-3", fast_config());
    session.connect().await.unwrap();

    let readings = drain_until_terminated(&mut session).await;
    assert_eq!(readings.len(), 3);
    assert!(readings.iter().all(|r| r.failure.is_none()));
    assert_eq!(
        readings.iter().map(|r| r.session_count).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(session.is_terminated());
    assert!(matches!(
        session.set("laser_enable", "true"),
        Err(SpectroError::WorkerTerminated)
    ));

    session.disconnect().await;
}

#[tokio::test]
async fn hardware_error_ends_worker_with_poison() {
    let mut session = session("broken:WP-4", fast_config());
    session.connect().await.unwrap();

    let readings = drain_until_terminated(&mut session).await;
    assert_eq!(readings.len(), 2);
    session.disconnect().await;
}

#[tokio::test]
async fn queued_settings_reach_the_device() {
    let mut session = session("mock:WP-5", fast_config());
    session.connect().await.unwrap();

    // only the last integration time should stick
    for ms in ["50", "60", "200"] {
        session.set("integration_time_ms", ms).unwrap();
    }

    let reading = wait_for(&mut session, AcquisitionMode::Latest, |r| {
        r.integration_time_ms == 200
    })
    .await;
    // mock default: 10 counts per ms, laser off
    assert_eq!(reading.peak(None), Some(2000.0));

    session.disconnect().await;
}

#[tokio::test]
async fn malformed_coefficients_do_not_reach_the_worker() {
    let mut session = session("mock:WP-8", fast_config());
    session.connect().await.unwrap();

    for raw in ["800,0.2", "1,,2", ""] {
        assert!(
            matches!(
                session.set("wavelength_coeffs", raw),
                Err(SpectroError::InvalidSettingValue { .. })
            ),
            "accepted {raw:?}"
        );
    }

    // a hand-built command skips parsing; the worker must reject it and carry on
    session
        .change_setting(ControlObject {
            setting: Setting::WavelengthCoeffs,
            value: SettingValue::FloatArray(vec![1.0]),
        })
        .unwrap();
    session.set("integration_time_ms", "200").unwrap();

    let reading = wait_for(&mut session, AcquisitionMode::Latest, |r| {
        r.integration_time_ms == 200
    })
    .await;
    assert_eq!(reading.peak(None), Some(2000.0));
    assert!(!session.is_closing());

    session.disconnect().await;
}

#[tokio::test]
async fn keep_complete_returns_finished_averages() {
    let mut session = session("mock:WP-6", fast_config());
    session.connect().await.unwrap();
    session.set("scans_to_average", "3").unwrap();

    let reading = wait_for(&mut session, AcquisitionMode::KeepComplete, |r| {
        r.averaged && r.sum_count == 3
    })
    .await;
    assert!(reading.timestamp_complete.is_some());

    session.disconnect().await;
}

#[tokio::test]
async fn disconnect_is_bounded() {
    let mut session = session("mock:WP-7", fast_config());
    session.connect().await.unwrap();

    let start = Instant::now();
    session.disconnect().await;
    assert!(start.elapsed() < Duration::from_secs(2));

    // a second disconnect is harmless
    session.disconnect().await;
}
