mod common;

use std::sync::Arc;

use common::{start_manager, stock};
use pillbox_lib::commands::{self, ReplyStatus};
use pillbox_lib::device::{ErrorKind, OperatingMode};
use pillbox_lib::serial::loopback::LoopbackHandle;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_write_rolls_back_ledger() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;
    stock(&manager, "Aspirin", 0.5, 20).await;

    handle.set_fail_writes(true);
    let err = manager.consume_by_count(2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceSyncFailure);

    let record = manager.status().await.medications["Aspirin"];
    assert_eq!(record.total_weight_in_box, 10.0);
    assert_eq!(record.count_in_box, 20);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_consumption_is_serialized() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;
    stock(&manager, "Aspirin", 0.5, 20).await;
    handle.clear_written();

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.consume_by_count(1).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let record = manager.status().await.medications["Aspirin"];
    assert_eq!(record.total_weight_in_box, 5.0);
    assert_eq!(record.count_in_box, 10);

    let sent = handle.written();
    assert_eq!(sent.iter().filter(|l| *l == "CONSUME_PILLS:1").count(), 10);
    // Each consumption pushes its resync immediately before CONSUME_PILLS
    let weights: Vec<&String> = sent.iter().filter(|l| l.starts_with("SET_WEIGHT:")).collect();
    assert_eq!(weights.first().map(|s| s.as_str()), Some("SET_WEIGHT:9.50"));
    assert_eq!(weights.last().map(|s| s.as_str()), Some("SET_WEIGHT:5.00"));
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_insufficient_inventory() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;
    stock(&manager, "Aspirin", 0.5, 2).await;

    let reply = commands::consume_pills(&manager, 5).await;
    assert_eq!(reply.kind, Some(ErrorKind::InsufficientInventory));
    assert_eq!(reply.http_status, 400);
    assert_eq!(manager.status().await.medications["Aspirin"].count_in_box, 2);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_consume_by_weight() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;
    stock(&manager, "Aspirin", 0.5, 20).await;
    handle.clear_written();

    let reply = commands::consume_by_weight(&manager, 0.2).await;
    assert_eq!(reply.status, ReplyStatus::Info);
    assert!(handle.written().is_empty());

    let reply = commands::consume_by_weight(&manager, 1.4).await;
    assert!(reply.is_success());
    assert_eq!(reply.data["consumed_count"], 3);
    assert!(handle.written().iter().any(|l| l == "CONSUME_PILLS:3"));
    assert_eq!(manager.status().await.medications["Aspirin"].count_in_box, 17);

    manager.set_mode(OperatingMode::Real).await.unwrap();
    let reply = commands::consume_by_weight(&manager, 1.0).await;
    assert_eq!(reply.kind, Some(ErrorKind::ModeMismatch));
    assert_eq!(reply.http_status, 403);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_simulated_weight_only_in_simulation() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, false).await;
    stock(&manager, "Aspirin", 0.5, 20).await;

    let reply = commands::set_simulated_weight(&manager, 3.0).await;
    assert_eq!(reply.http_status, 403);

    let reply = commands::set_mode(&manager, "simulation").await;
    assert!(reply.is_success());
    handle.clear_written();
    let reply = commands::set_simulated_weight(&manager, 3.0).await;
    assert!(reply.is_success());
    assert_eq!(handle.written(), vec!["SET_WEIGHT:3.00"]);
    assert_eq!(manager.status().await.medications["Aspirin"].count_in_box, 6);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stage_two_resets_everything() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;
    stock(&manager, "Aspirin", 0.5, 20).await;
    manager.start_session("Aspirin").await.unwrap();
    handle.clear_written();

    let reply = commands::set_stage(&manager, 2).await;
    assert!(reply.is_success());
    assert_eq!(handle.written(), vec!["SET_STAGE:2", "RESET_ALL"]);

    let status = manager.status().await;
    assert!(status.medications.is_empty());
    assert_eq!(status.active_medication, None);
    assert!(status.session.is_none());
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_other_stage_keeps_ledger() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;
    stock(&manager, "Aspirin", 0.5, 20).await;

    manager.set_stage(1).await.unwrap();
    assert_eq!(manager.status().await.medications.len(), 1);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reply_status_codes() {
    let handle = LoopbackHandle::new();
    let manager = start_manager(&handle, true).await;

    let reply = commands::start_session(&manager, "Nothing").await;
    assert_eq!(reply.kind, Some(ErrorKind::UnknownMedication));
    assert_eq!(reply.http_status, 404);

    let reply = commands::lock_and_record(&manager).await;
    assert_eq!(reply.kind, Some(ErrorKind::State));
    assert_eq!(reply.http_status, 400);

    let reply = commands::set_mode(&manager, "turbo").await;
    assert_eq!(reply.http_status, 400);

    let reply = commands::set_count(&manager, -1).await;
    assert_eq!(reply.kind, Some(ErrorKind::Validation));

    let reply = commands::consume_pills(&manager, 1).await;
    assert_eq!(reply.kind, Some(ErrorKind::State));
    manager.shutdown().await;
}
