mod common;

use common::{start_manager, stock, wait_for_status};
use pillbox_lib::commands;
use pillbox_lib::device::{CalibrationRejection, ErrorKind};
use pillbox_lib::serial::loopback::LoopbackHandle;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refresh_updates_active_record() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, false).await;
    stock(&manager, "Aspirin", 0.5, 20).await;
    handle.reply_to("GET_WEIGHT", &["WEIGHT:5.00"]);

    let reading = manager.force_refresh_weight(false).await.unwrap();
    assert_eq!(reading.weight, 5.0);
    assert_eq!(reading.attempt, Some(1));

    let status = manager.status().await;
    assert_eq!(status.device.total_weight_in_box, 5.0);
    assert_eq!(status.medications["Aspirin"].total_weight_in_box, 5.0);
    assert_eq!(status.medications["Aspirin"].count_in_box, 10);
    assert_eq!(manager.listener_metrics().queries_completed, 1);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refresh_tares_first_when_asked() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, false).await;
    handle.reply_to("GET_WEIGHT", &["WEIGHT:0.00"]);

    let reading = manager.force_refresh_weight(true).await.unwrap();
    assert_eq!(reading.weight, 0.0);
    assert_eq!(handle.written(), vec!["TARE_SIM", "GET_WEIGHT"]);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_device_exhausts_attempts() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, false).await;

    let err = manager.force_refresh_weight(false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LinkUnavailable);
    assert!(err.to_string().contains("3 attempts"));
    assert_eq!(manager.listener_metrics().query_timeouts, 3);
    let sent = handle.written();
    assert_eq!(sent.iter().filter(|l| *l == "GET_WEIGHT").count(), 3);

    let reply = commands::force_refresh_weight(&manager, false).await;
    assert!(!reply.is_success());
    assert_eq!(reply.http_status, 500);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_negative_reading_is_retried_then_rejected() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, false).await;
    stock(&manager, "Aspirin", 0.5, 20).await;
    handle.reply_to("GET_WEIGHT", &["WEIGHT:-1.00"]);

    let err = manager.force_refresh_weight(false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LinkUnavailable);
    assert_eq!(manager.listener_metrics().queries_completed, 3);
    assert_eq!(manager.status().await.medications["Aspirin"].count_in_box, 20);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_telemetry_between_replies_is_still_applied() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, false).await;
    handle.reply_to("GET_WEIGHT", &["DATA:RUN,4.00,8,Aspirin,0.50", "WEIGHT:4.10"]);

    let reading = manager.force_refresh_weight(false).await.unwrap();
    assert_eq!(reading.weight, 4.1);
    assert_eq!(manager.status().await.device.stage_name, "RUN");

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_simulation_returns_cached_weight() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;
    handle.push_line("DATA:SIM,7.50,15,Aspirin,0.50");
    assert!(wait_for_status(&manager, |s| s.device.total_weight_in_box == 7.5).await);

    let reading = manager.force_refresh_weight(false).await.unwrap();
    assert_eq!(reading.weight, 7.5);
    assert_eq!(reading.attempt, None);
    assert!(handle.written().is_empty());

    let reply = commands::current_weight(&manager).await;
    assert!(reply.is_success());
    assert_eq!(reply.data["weight"], 7.5);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_measure_single_pill_needs_real_mode() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;
    stock(&manager, "Aspirin", 0.5, 20).await;

    let err = manager.measure_single_pill().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModeMismatch);
    assert_eq!(commands::measure_single_pill(&manager).await.http_status, 403);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_measure_single_pill_retries_silent_device() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, false).await;
    stock(&manager, "Aspirin", 0.5, 20).await;
    handle.clear_written();

    let err = manager.measure_single_pill().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LinkUnavailable);
    assert!(err.to_string().contains("3 attempts"));
    let sent = handle.written();
    assert_eq!(
        sent.iter()
            .filter(|l| *l == "MEASURE_SINGLE_PILL_WEIGHT")
            .count(),
        3
    );
    assert_eq!(manager.status().await.medications["Aspirin"].weight_per_pill, 0.5);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_measure_single_pill_reports_invalid_weight() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, false).await;
    stock(&manager, "Aspirin", 0.5, 20).await;
    handle.reply_to(
        "MEASURE_SINGLE_PILL_WEIGHT",
        &["DATA:MEASURE,10.00,20,Aspirin,0.00", "Measured single pill weight: 0g"],
    );

    let result = manager.measure_single_pill().await.unwrap();
    assert!(!result.adopted);
    assert_eq!(result.rejection, Some(CalibrationRejection::InvalidMeasurement));
    assert_eq!(result.weight_per_pill, 0.5);

    let reply = commands::measure_single_pill(&manager).await;
    assert!(reply.message.contains("invalid pill weight"), "{}", reply.message);
    assert_eq!(reply.data["rejection"]["reason"], "invalid_measurement");

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_measure_single_pill_on_other_medication() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, false).await;
    stock(&manager, "Aspirin", 0.5, 20).await;
    handle.reply_to(
        "MEASURE_SINGLE_PILL_WEIGHT",
        &["DATA:MEASURE,10.00,20,Ibuprofen,0.30", "Measured single pill weight: 0.30g"],
    );

    let result = manager.measure_single_pill().await.unwrap();
    assert!(!result.adopted);
    assert_eq!(
        result.rejection,
        Some(CalibrationRejection::OtherMedication {
            on_device: "Ibuprofen".to_string()
        })
    );

    let reply = commands::measure_single_pill(&manager).await;
    assert!(reply.message.contains("'Ibuprofen', not 'Aspirin'"), "{}", reply.message);

    manager.shutdown().await;
}
