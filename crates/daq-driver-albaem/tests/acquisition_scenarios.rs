//! Scan scenarios driven through the capability traits, as a host would,
//! against a mock-mode driver.

use daq_core::capabilities::{
    AcquisitionState, ChannelControl, MultiChannelAcquisition, Synchronization,
};
use daq_core::error::DaqError;
use daq_driver_albaem::mock::MockEm2;
use daq_driver_albaem::{AlbaEmConfig, AlbaEmDriver};
use std::sync::Arc;

async fn mock_driver() -> Arc<AlbaEmDriver> {
    let config = AlbaEmConfig {
        mock: true,
        timeout_ms: 300,
        ..AlbaEmConfig::new("mock")
    };
    let driver = AlbaEmDriver::new_async(&config).await.unwrap();
    device(&driver).clear_command_log().await;
    driver
}

fn device(driver: &AlbaEmDriver) -> &MockEm2 {
    driver.mock().unwrap()
}

fn daq_error(err: &anyhow::Error) -> &DaqError {
    err.downcast_ref::<DaqError>().unwrap()
}

#[tokio::test]
async fn test_software_trigger_scan() {
    let driver = mock_driver().await;
    let mock = device(&driver);

    driver
        .set_synchronization(Synchronization::SoftwareTrigger)
        .await
        .unwrap();
    driver.prepare(1.1, 1, 0.0, 10).await.unwrap();

    assert_eq!(
        mock.command_log().await,
        [
            "ACQU:STAT?",
            "ACQU:TIME 1100",
            "ACQU:NTRIG 10",
            "TRIG:MODE SOFTWARE",
            "TMST 0",
            "ACQU:START",
        ]
    );
    assert_eq!(driver.status().await.unwrap().0, AcquisitionState::Armed);

    for step in 0..10 {
        driver.start().await.unwrap();

        let (state, _) = driver.status().await.unwrap();
        if step < 9 {
            assert_eq!(state, AcquisitionState::Acquiring);
        } else {
            // Device already back to ON: status pulled the last point itself
            assert_eq!(state, AcquisitionState::Idle);
        }

        let readout = driver.read().await.unwrap();
        assert_eq!(readout.time, vec![1.1]);
        assert_eq!(readout.channel("CHAN01"), Some(&[1.0][..]));
        assert_eq!(readout.channel("CHAN04"), Some(&[4.0][..]));
        assert_eq!(driver.status().await.unwrap().0, AcquisitionState::Idle);
    }

    let session = driver.session().await;
    assert_eq!(session.points_delivered, 10);
    assert_eq!(session.last_read_index, 10);
    assert_eq!(mock.count_commands("TRIG:SWSE True").await, 10);

    let err = driver.start().await.unwrap_err();
    assert!(matches!(daq_error(&err), DaqError::Configuration(_)));
}

#[tokio::test]
async fn test_hardware_trigger_with_formula() {
    let driver = mock_driver().await;
    let mock = device(&driver);

    driver.set_formula(1, "value*2").await.unwrap();
    mock.set_channel_value(1, 1.5).await;
    driver
        .set_synchronization(Synchronization::HardwareTrigger)
        .await
        .unwrap();
    driver.prepare(0.5, 8, 0.0, 1).await.unwrap();

    let log = mock.command_log().await;
    assert!(log.contains(&"ACQU:NTRIG 8".to_string()));
    assert!(log.contains(&"TRIG:MODE HARDWARE".to_string()));
    assert!(log.contains(&"TRIG:INPU DIO_1".to_string()));

    driver.start().await.unwrap();
    assert_eq!(mock.count_commands("TRIG:SWSE").await, 0);
    assert!(driver.read().await.unwrap().is_empty());

    mock.external_trigger(5).await;
    let first = driver.read().await.unwrap();
    assert_eq!(first.len(), 5);
    assert_eq!(first.channel("CHAN01"), Some(&[3.0; 5][..]));
    assert_eq!(first.channel("CHAN02"), Some(&[2.0; 5][..]));

    mock.external_trigger(3).await;
    let second = driver.read().await.unwrap();
    assert!(mock
        .command_log()
        .await
        .contains(&"ACQU:MEAS? 4,3".to_string()));
    assert_eq!(second.len(), 3);
    assert_eq!(second.channel("CHAN01"), Some(&[3.0; 3][..]));
    assert_eq!(second.time, vec![0.5; 3]);

    assert_eq!(driver.status().await.unwrap().0, AcquisitionState::Idle);
}

#[tokio::test]
async fn test_points_per_step_replaces_single_repetition() {
    let driver = mock_driver().await;
    let mock = device(&driver);

    driver.set_points_per_step(4).await.unwrap();
    driver.set_trigger_input("DIFF_IO_1").await.unwrap();
    driver
        .set_synchronization(Synchronization::HardwareGate)
        .await
        .unwrap();
    driver.prepare(0.1, 1, 0.0, 2).await.unwrap();

    let log = mock.command_log().await;
    assert!(log.contains(&"ACQU:NTRIG 8".to_string()));
    assert!(log.contains(&"TRIG:MODE GATE".to_string()));
    assert!(log.contains(&"TRIG:INPU DIFF_IO_1".to_string()));

    // Software synchronizations ignore it
    driver
        .set_synchronization(Synchronization::SoftwareGate)
        .await
        .unwrap();
    mock.clear_command_log().await;
    driver.prepare(0.1, 50, 0.0, 2).await.unwrap();
    let log = mock.command_log().await;
    assert!(log.contains(&"ACQU:NTRIG 2".to_string()));
    assert!(!log.iter().any(|c| c.starts_with("TRIG:INPU")));
}

#[tokio::test]
async fn test_hardware_trigger_multiple_starts() {
    let driver = mock_driver().await;
    let mock = device(&driver);

    driver
        .set_synchronization(Synchronization::HardwareTrigger)
        .await
        .unwrap();
    driver.prepare(0.1, 2, 0.0, 2).await.unwrap();
    driver.start().await.unwrap();

    // Edges for both starts arrive before the host reads the first one
    mock.external_trigger(4).await;
    assert_eq!(driver.read().await.unwrap().len(), 4);
    assert_eq!(driver.status().await.unwrap().0, AcquisitionState::Idle);
    assert_eq!(driver.session().await.surplus, 2);

    driver.start().await.unwrap();
    assert_eq!(driver.status().await.unwrap().0, AcquisitionState::Idle);
    assert!(driver.read().await.unwrap().is_empty());

    let session = driver.session().await;
    assert_eq!(session.points_read_per_start, 2);
    assert_eq!(session.surplus, 0);
    assert_eq!(session.points_delivered, 4);

    let err = driver.start().await.unwrap_err();
    assert!(matches!(daq_error(&err), DaqError::Configuration(_)));
}

#[tokio::test]
async fn test_failed_arm_leaves_nothing_to_start() {
    let driver = mock_driver().await;
    let mock = device(&driver);

    driver
        .set_synchronization(Synchronization::HardwareTrigger)
        .await
        .unwrap();
    mock.fail_command("ACQU:START", "busy").await;

    let err = driver.prepare(0.1, 2, 0.0, 1).await.unwrap_err();
    assert!(matches!(daq_error(&err), DaqError::Device(message) if message == "busy"));
    assert!(driver.session().await.plan.is_none());

    let err = driver.start().await.unwrap_err();
    assert!(matches!(daq_error(&err), DaqError::Configuration(_)));
    assert_eq!(driver.status().await.unwrap().0, AcquisitionState::Idle);

    // Retrying once the device accepts the start arms normally
    driver.prepare(0.1, 2, 0.0, 1).await.unwrap();
    assert_eq!(driver.status().await.unwrap().0, AcquisitionState::Armed);
}

#[tokio::test]
async fn test_abort_is_idempotent() {
    let driver = mock_driver().await;
    let mock = device(&driver);

    driver
        .set_synchronization(Synchronization::HardwareTrigger)
        .await
        .unwrap();
    driver.prepare(0.1, 10, 0.0, 1).await.unwrap();
    driver.start().await.unwrap();
    mock.external_trigger(2).await;

    driver.abort().await.unwrap();
    driver.abort().await.unwrap();

    assert_eq!(mock.count_commands("ACQU:STOP").await, 1);
    assert!(driver.session().await.aborted);
    assert!(driver.read().await.unwrap().is_empty());
    assert_eq!(driver.status().await.unwrap().0, AcquisitionState::Idle);
    assert_eq!(mock.count_commands("ACQU:MEAS?").await, 0);

    // A new session starts clean
    driver.prepare(0.1, 10, 0.0, 1).await.unwrap();
    assert!(!driver.session().await.aborted);
}

#[tokio::test]
async fn test_read_never_repeats_points() {
    let driver = mock_driver().await;
    let mock = device(&driver);

    driver
        .set_synchronization(Synchronization::HardwareTrigger)
        .await
        .unwrap();
    driver.prepare(0.1, 3, 0.0, 1).await.unwrap();
    driver.start().await.unwrap();
    mock.external_trigger(3).await;

    assert_eq!(driver.read().await.unwrap().len(), 3);
    assert!(driver.read().await.unwrap().is_empty());
    assert!(driver.read().await.unwrap().is_empty());
    assert_eq!(mock.count_commands("ACQU:MEAS?").await, 1);
    assert_eq!(driver.session().await.points_read_per_start, 3);
}

#[tokio::test]
async fn test_short_integration_time_is_raised() {
    let driver = mock_driver().await;
    let mock = device(&driver);

    driver.prepare(1e-6, 1, 0.0, 1).await.unwrap();
    assert_eq!(driver.session().await.integration_time, 1e-4);
    assert!(mock
        .command_log()
        .await
        .contains(&"ACQU:TIME 0.1".to_string()));

    driver.start().await.unwrap();
    assert_eq!(driver.read().await.unwrap().time, vec![1e-4]);
}

#[tokio::test]
async fn test_rejected_prepare_sends_nothing() {
    let driver = mock_driver().await;
    let mock = device(&driver);

    for sync in [Synchronization::SoftwareStart, Synchronization::HardwareStart] {
        driver.set_synchronization(sync).await.unwrap();
        let err = driver.prepare(0.1, 1, 0.0, 1).await.unwrap_err();
        assert!(matches!(daq_error(&err), DaqError::Configuration(_)));
    }

    driver
        .set_synchronization(Synchronization::SoftwareTrigger)
        .await
        .unwrap();
    for time in [f64::NAN, f64::INFINITY] {
        let err = driver.prepare(time, 1, 0.0, 1).await.unwrap_err();
        assert!(matches!(daq_error(&err), DaqError::Configuration(_)));
    }

    assert!(mock.command_log().await.is_empty());
}

#[tokio::test]
async fn test_prepare_stops_a_running_device() {
    let driver = mock_driver().await;
    let mock = device(&driver);

    driver.prepare(0.1, 1, 0.0, 5).await.unwrap();
    mock.clear_command_log().await;

    driver.prepare(0.2, 1, 0.0, 5).await.unwrap();
    let log = mock.command_log().await;
    assert_eq!(&log[..2], ["ACQU:STAT?", "ACQU:STOP"]);
    assert_eq!(log.last().map(String::as_str), Some("ACQU:START"));
}

#[tokio::test]
async fn test_status_reports_faults() {
    let driver = mock_driver().await;
    let mock = device(&driver);

    mock.force_state(Some("STATE_FAULT")).await;
    assert_eq!(driver.status().await.unwrap().0, AcquisitionState::Fault);

    mock.force_state(Some("STATE_CALIBRATING")).await;
    let (state, message) = driver.status().await.unwrap();
    assert_eq!(state, AcquisitionState::Fault);
    assert!(message.contains("STATE_CALIBRATING"));

    mock.force_state(None).await;
    mock.drop_next(2).await;
    let (state, message) = driver.status().await.unwrap();
    assert_eq!(state, AcquisitionState::Fault);
    assert!(message.contains("ACQU:STAT?"));

    // Link is back on the next poll
    assert_eq!(driver.status().await.unwrap().0, AcquisitionState::Idle);
}

#[tokio::test]
async fn test_failing_formula_keeps_points_for_retry() {
    let driver = mock_driver().await;
    let mock = device(&driver);

    driver.set_formula(2, "1.0 / value").await.unwrap();
    mock.set_channel_value(2, 0.0).await;
    driver
        .set_synchronization(Synchronization::HardwareTrigger)
        .await
        .unwrap();
    driver.prepare(0.1, 2, 0.0, 1).await.unwrap();
    driver.start().await.unwrap();
    mock.external_trigger(2).await;

    let err = driver.read().await.unwrap_err();
    assert!(matches!(daq_error(&err), DaqError::Formula { .. }));
    assert_eq!(driver.session().await.points_delivered, 0);

    driver.set_formula(2, "value").await.unwrap();
    let readout = driver.read().await.unwrap();
    assert_eq!(readout.channel("CHAN02"), Some(&[0.0, 0.0][..]));
    assert_eq!(driver.session().await.points_delivered, 2);
}

#[tokio::test]
async fn test_channel_control() {
    let driver = mock_driver().await;

    assert_eq!(driver.channel_count(), 4);
    driver.set_range(3, "100pA").await.unwrap();
    assert_eq!(driver.range(3).await.unwrap(), "100pA");

    driver.set_inversion(3, true).await.unwrap();
    assert!(driver.inversion(3).await.unwrap());
    assert_eq!(driver.instant_current(3).await.unwrap(), -3.0);

    let err = driver.set_formula(3, "value +").await.unwrap_err();
    assert!(matches!(daq_error(&err), DaqError::Formula { .. }));
    assert_eq!(driver.formula(3).await.unwrap(), "value");
}
