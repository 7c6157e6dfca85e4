#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use pillbox_lib::config::Settings;
use pillbox_lib::device::DeviceManager;
use pillbox_lib::serial::loopback::LoopbackHandle;
use pillbox_lib::serial::LinkState;

const WAIT_LIMIT: Duration = Duration::from_secs(3);

/// Settings with every delay shortened so tests run in milliseconds.
pub fn fast_settings(simulation: bool) -> Settings {
    Settings {
        port_name: "loop0".to_string(),
        read_timeout_ms: 5,
        settle_ms: 0,
        stale_reconnect_secs: 3600,
        reconnect_interval_secs: 0,
        reconnect_penalty_ms: 10,
        command_gap_ms: 0,
        consume_gap_ms: 0,
        query_timeout_ms: 150,
        query_attempts: 3,
        query_retry_gap_ms: 10,
        tare_settle_ms: 0,
        start_in_simulation: simulation,
        ..Settings::default()
    }
}

/// Start a manager on a loopback link and wait for the first handshake.
pub async fn start_manager(handle: &LoopbackHandle, simulation: bool) -> Arc<DeviceManager> {
    let manager = Arc::new(DeviceManager::start(
        fast_settings(simulation),
        Arc::new(handle.opener()),
    ));
    let handshake = if simulation { "SET_MODE:1" } else { "SET_MODE:0" };
    assert!(
        wait_until(|| manager.link_state() == LinkState::Connected
            && handle.written().iter().any(|l| l == handshake))
        .await,
        "listener never connected"
    );
    handle.clear_written();
    manager
}

pub async fn wait_until<F: FnMut() -> bool>(condition: F) -> bool {
    wait_until_within(WAIT_LIMIT, condition).await
}

pub async fn wait_until_within<F: FnMut() -> bool>(limit: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Wait until `probe` on the manager's status returns true.
pub async fn wait_for_status<F>(manager: &DeviceManager, mut probe: F) -> bool
where
    F: FnMut(&pillbox_lib::device::StatusSnapshot) -> bool,
{
    let deadline = Instant::now() + WAIT_LIMIT;
    while Instant::now() < deadline {
        if probe(&manager.status().await) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Register `name`, make it active and give it `count` pills.
pub async fn stock(manager: &DeviceManager, name: &str, weight_per_pill: f64, count: i64) {
    manager.upsert_medication(name, weight_per_pill).await.unwrap();
    manager.set_active_medication(Some(name)).await.unwrap();
    manager.set_count(count).await.unwrap();
}
