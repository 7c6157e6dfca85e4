pub mod commands;
pub mod config;
pub mod device;
pub mod inventory;
pub mod serial;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;

use config::Settings;
use device::DeviceManager;
use serial::NativePortOpener;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Run the engine against the configured serial port until Ctrl-C.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let opener = Arc::new(NativePortOpener {
        read_timeout_ms: settings.read_timeout_ms,
    });
    let manager = Arc::new(DeviceManager::start(settings, opener));

    // History persistence lives outside the engine; until one subscribes, log the records.
    let mut records = manager.subscribe_consumption();
    tokio::spawn(async move {
        loop {
            match records.recv().await {
                Ok(record) => log::info!(
                    "Consumption: {} x{} ({:.2}g) at {}",
                    record.medication,
                    record.pills_consumed,
                    record.weight_consumed,
                    record.timestamp
                ),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Consumption log fell behind, {} records skipped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let status_manager = manager.clone();
    let status_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_LOG_INTERVAL);
        loop {
            interval.tick().await;
            let status = commands::get_status(&status_manager).await;
            let stage = status
                .data
                .get("device")
                .and_then(|device| device.get("stage_name"))
                .and_then(|stage| stage.as_str())
                .unwrap_or("unknown")
                .to_string();
            log::debug!(
                "Device stage: {} (link {:?})",
                stage,
                status_manager.link_state()
            );
        }
    });

    log::info!("Pillbox engine running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    log::info!("Shutting down");
    status_task.abort();
    manager.shutdown().await;
    Ok(())
}
