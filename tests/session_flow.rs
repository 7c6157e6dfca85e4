mod common;

use common::{start_manager, stock, wait_for_status};
use pillbox_lib::commands;
use pillbox_lib::device::ErrorKind;
use pillbox_lib::serial::loopback::LoopbackHandle;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_real_mode_session_charges_ledger() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, false).await;
    stock(&manager, "Aspirin", 0.5, 20).await;
    let mut records = manager.subscribe_consumption();
    handle.clear_written();

    let session = manager.start_session("Aspirin").await.unwrap();
    assert_eq!(session.start_weight, 0.0);
    assert_eq!(
        handle.written(),
        vec!["SELECT_MEDICATION:Aspirin", "SET_PILL_WEIGHT:0.5000", "BOX_TARE"]
    );

    manager.unlock_compartment().await.unwrap();
    handle.push_line("DATA:RUN,-1.46,0,Aspirin,0.50");
    assert!(wait_for_status(&manager, |s| s.device.total_weight_in_box == -1.46).await);

    let summary = manager.lock_and_record().await.unwrap();
    assert_eq!(summary.pills_consumed, 3);
    assert!((summary.weight_consumed - 1.46).abs() < 1e-9);
    assert_eq!(summary.end_weight, -1.46);
    assert!(handle.written().iter().any(|l| l == "LOCK_COMPARTMENT:1"));

    let record = manager.status().await.medications["Aspirin"];
    assert!((record.total_weight_in_box - 8.5).abs() < 1e-9);
    assert_eq!(record.count_in_box, 17);
    assert!(manager.session_status().await.is_none());

    let published = records.recv().await.unwrap();
    assert_eq!(published.medication, "Aspirin");
    assert_eq!(published.pills_consumed, 3);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_rules_through_replies() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;
    stock(&manager, "Aspirin", 0.5, 20).await;

    let reply = commands::start_session(&manager, "Aspirin").await;
    assert!(reply.is_success());
    assert_eq!(reply.data["session_data"]["medication"], "Aspirin");

    let reply = commands::start_session(&manager, "Aspirin").await;
    assert_eq!(reply.kind, Some(ErrorKind::State));

    let reply = commands::lock_and_record(&manager).await;
    assert_eq!(reply.kind, Some(ErrorKind::State));

    let reply = commands::session_status(&manager).await;
    assert_eq!(reply.data["session_active"], true);

    let reply = commands::cancel_session(&manager).await;
    assert!(reply.is_success());
    let reply = commands::session_status(&manager).await;
    assert_eq!(reply.data["session_active"], false);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_simulation_session_pushes_new_weight() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;
    stock(&manager, "Aspirin", 0.5, 20).await;

    manager.start_session("Aspirin").await.unwrap();
    manager.unlock_compartment().await.unwrap();
    handle.push_line("DATA:SIM,-1.00,0,Aspirin,0.50");
    assert!(wait_for_status(&manager, |s| s.device.total_weight_in_box == -1.0).await);
    handle.clear_written();

    let summary = manager.lock_and_record().await.unwrap();
    assert_eq!(summary.pills_consumed, 2);
    assert_eq!(handle.written(), vec!["SET_WEIGHT:9.00"]);

    manager.shutdown().await;
}
