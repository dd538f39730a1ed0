//! Transport tests for the Em# line client against the simulated device.
//!
//! These exercise the real socket path: lazy connection, request pipelining,
//! reply clean-up, and the single reconnect-and-retry on transport faults.

use daq_core::error::DaqError;
use daq_driver_albaem::mock::MockEm2;
use daq_driver_albaem::Em2;

async fn setup() -> (MockEm2, Em2) {
    let mock = MockEm2::start().await.unwrap();
    let em = Em2::new(mock.line_client());
    (mock, em)
}

#[tokio::test]
async fn test_connects_lazily() {
    let (mock, em) = setup().await;
    assert!(!em.client().is_open().await);
    assert_eq!(mock.connections().await, 0);

    em.idn().await.unwrap();
    em.idn().await.unwrap();

    assert!(em.client().is_open().await);
    assert_eq!(mock.connections().await, 1);
    assert_eq!(em.client().reconnect_count(), 0);
}

#[tokio::test]
async fn test_single_failure_is_recovered() {
    let (mock, em) = setup().await;
    em.idn().await.unwrap();

    mock.drop_next(1).await;
    let state = em.acquisition_state().await.unwrap();

    assert_eq!(state.to_string(), "ON");
    assert_eq!(em.client().reconnect_count(), 1);
    assert_eq!(mock.connections().await, 2);
    // The request was replayed once on the new connection
    assert_eq!(mock.count_commands("ACQU:STAT?").await, 2);
}

#[tokio::test]
async fn test_two_failures_surface_as_communication_error() {
    let (mock, em) = setup().await;

    mock.drop_next(2).await;
    let err = em.nb_points_ready().await.unwrap_err();

    assert!(err.is_transport());
    assert!(matches!(
        &err,
        DaqError::Communication { command, .. } if command == "ACQU:NDAT?"
    ));
    assert_eq!(em.client().reconnect_count(), 1);
    assert!(!em.client().is_open().await);

    // Next request opens a fresh connection
    assert_eq!(em.nb_points_ready().await.unwrap(), 0);
}

#[tokio::test]
async fn test_stalled_reply_times_out_and_retries() {
    let (mock, em) = setup().await;

    mock.stall_next(1).await;
    assert_eq!(em.trigger_mode().await.unwrap().to_string(), "SOFTWARE");
    assert_eq!(em.client().reconnect_count(), 1);
}

#[tokio::test]
async fn test_error_burst_keeps_last_segment() {
    let (mock, em) = setup().await;

    mock.error_burst("stale error from previous request").await;
    let range = em.channel(1).unwrap().range().await.unwrap();

    assert_eq!(range, "1mA");
    assert_eq!(em.client().reconnect_count(), 0);
}

#[tokio::test]
async fn test_device_errors_are_not_retried() {
    let (mock, em) = setup().await;

    mock.fail_command("ACQU:TIME", "acquisition running").await;
    let err = em.set_acquisition_time(0.5).await.unwrap_err();

    assert!(matches!(&err, DaqError::Device(msg) if msg == "acquisition running"));
    assert_eq!(mock.count_commands("ACQU:TIME").await, 1);
    assert_eq!(em.client().reconnect_count(), 0);
}

#[tokio::test]
async fn test_pipelined_replies_stay_in_order() {
    let (_mock, em) = setup().await;

    let replies = em
        .commands(&["ACQU:NTRIG 5", "ACQU:NTRIG?", "TRIG:MODE GATE", "TRIG:MODE?"])
        .await
        .unwrap();

    assert_eq!(
        replies,
        ["ACQU:NTRIG 5", "5", "TRIG:MODE GATE", "GATE"]
    );
}

#[tokio::test]
async fn test_pipelined_batch_reports_first_device_error() {
    let (mock, em) = setup().await;

    let err = em
        .commands(&["CHAN01:CABO:RANGE 2A", "CHAN02:CABO:RANGE 10uA"])
        .await
        .unwrap_err();
    assert!(matches!(&err, DaqError::Device(msg) if msg == "invalid range"));

    // Both replies were consumed; the stream is still aligned
    assert_eq!(em.channel(2).unwrap().range().await.unwrap(), "10uA");
    assert_eq!(mock.count_commands("CHAN").await, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_never_interleave() {
    let (_mock, em) = setup().await;
    let ranges = ["1mA", "100nA", "1nA", "100pA"];
    for (i, range) in ranges.iter().enumerate() {
        em.channel(i + 1).unwrap().set_range(range).await.unwrap();
    }

    let mut tasks = Vec::new();
    for task in 0..16 {
        let em = em.clone();
        tasks.push(tokio::spawn(async move {
            let number = task % 4 + 1;
            for _ in 0..10 {
                let range = em.channel(number).unwrap().range().await.unwrap();
                assert_eq!(range, ranges[number - 1]);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(em.client().reconnect_count(), 0);
}
