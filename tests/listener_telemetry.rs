mod common;

use common::{start_manager, stock, wait_for_status, wait_until};
use pillbox_lib::serial::loopback::LoopbackHandle;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_data_line_reaches_status() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;

    handle.push_line("DATA:RUN,12.50,25,Aspirin,0.50");
    assert!(wait_for_status(&manager, |s| s.device.stage_name == "RUN").await);

    let status = manager.status().await;
    assert_eq!(status.device.total_weight_in_box, 12.5);
    assert_eq!(status.device.pill_count_on_device, 25);
    assert_eq!(status.device.current_medication_on_device, "Aspirin");
    assert_eq!(status.device.weight_per_pill, 0.5);
    assert_eq!(status.device.lid_distance_cm, None);
    assert!(status.is_simulation);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_field_keeps_previous_value() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;

    handle.push_line("DATA:IDLE,3.00,6,Ibuprofen,0.50,4.5,1");
    assert!(wait_for_status(&manager, |s| s.device.stage_name == "IDLE").await);
    handle.push_line("DATA:RUN,abc,25,Aspirin,0.50");
    assert!(wait_for_status(&manager, |s| s.device.stage_name == "RUN").await);

    let status = manager.status().await;
    assert_eq!(status.device.total_weight_in_box, 3.0);
    assert_eq!(status.device.pill_count_on_device, 25);
    assert_eq!(status.device.current_medication_on_device, "Aspirin");
    // A 5 field line leaves the lid fields alone
    assert_eq!(status.device.lid_distance_cm, Some(4.5));
    assert!(status.device.lid_open);
    assert!(wait_until(|| manager.listener_metrics().parse_warnings >= 1).await);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lines_split_across_reads() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;

    handle.push_raw(b"DATA:IDLE,3.0");
    handle.push_raw(b"0,6,Ibuprofen,0.50\r\n");
    handle.push_raw(b"hello from device\r\n");
    assert!(wait_for_status(&manager, |s| s.device.raw_last_line == "hello from device").await);

    let status = manager.status().await;
    assert_eq!(status.device.stage_name, "IDLE");
    assert_eq!(status.device.total_weight_in_box, 3.0);
    assert!(manager.listener_metrics().lines_read >= 2);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_any_line_refreshes_liveness() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;
    let before = manager.status().await.device.last_update;

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    handle.push_line("Arduino Pillbox Ready");
    assert!(wait_for_status(&manager, |s| s.device.last_update > before).await);
    assert_eq!(manager.status().await.device.stage_name, "Initializing");

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_calibration_updates_active_record() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, false).await;
    stock(&manager, "Aspirin", 0.5, 20).await;

    handle.push_line("DATA:MEASURE,10.00,20,Aspirin,0.40");
    handle.push_line("Measured single pill weight: 0.40g");
    assert!(
        wait_for_status(&manager, |s| s.medications["Aspirin"].weight_per_pill == 0.4).await
    );
    assert_eq!(manager.status().await.medications["Aspirin"].count_in_box, 25);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_measure_single_pill_round_trip() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, false).await;
    stock(&manager, "Aspirin", 0.5, 20).await;
    handle.reply_to(
        "MEASURE_SINGLE_PILL_WEIGHT",
        &[
            "Start measuring, sample 1/5",
            "DATA:MEASURE,10.00,20,Aspirin,0.42",
            "Measured single pill weight: 0.42g",
        ],
    );

    let result = manager.measure_single_pill().await.unwrap();
    assert!(result.adopted);
    assert_eq!(result.medication, "Aspirin");
    assert_eq!(result.weight_per_pill, 0.42);
    assert_eq!(manager.status().await.medications["Aspirin"].weight_per_pill, 0.42);

    manager.shutdown().await;
}
