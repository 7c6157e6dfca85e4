use std::sync::Arc;
use std::time::Duration;

use super::models::{MedicationRecord, OperatingMode};
use super::{DeviceError, Result};
use crate::serial::unified::{CommandResponse, CommandSpec, ListenerHandle};
use crate::serial::{DeviceCommand, LinkManager, SerialError};

/// Best-effort command transmission on top of the link.
#[derive(Clone)]
pub struct CommandDispatcher {
    link: Arc<LinkManager>,
    command_gap: Duration,
}

impl CommandDispatcher {
    pub fn new(link: Arc<LinkManager>, command_gap: Duration) -> Self {
        Self { link, command_gap }
    }

    pub fn link(&self) -> &Arc<LinkManager> {
        &self.link
    }

    /// Fire and forget: success means the link accepted the bytes, not that the
    /// device acted on them.
    pub async fn send(&self, command: &DeviceCommand) -> std::result::Result<(), SerialError> {
        if !self.link.is_open() {
            log::warn!("Cannot send '{}': link to device is not open", command);
            return Err(SerialError::NotConnected);
        }
        log::info!("Sending to device: {}", command);
        self.link.send_line(&command.encode()).await
    }

    /// Push the active medication's calibration (and simulated weight) to the device.
    pub async fn resync(
        &self,
        name: &str,
        record: &MedicationRecord,
        mode: OperatingMode,
    ) -> std::result::Result<(), SerialError> {
        self.send(&DeviceCommand::SelectMedication(name.to_string())).await?;
        self.pause(self.command_gap).await;
        self.send(&DeviceCommand::SetPillWeight(record.weight_per_pill)).await?;
        if mode.is_simulation() {
            self.pause(self.command_gap).await;
            self.send(&DeviceCommand::SetWeight(record.total_weight_in_box)).await?;
        }
        log::debug!("Resynced '{}' to device", name);
        Ok(())
    }

    pub fn command_gap(&self) -> Duration {
        self.command_gap
    }

    pub async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }

    /// Issue a command that expects a reply, retrying until `accept` yields a
    /// value. Returns the value and the attempt that produced it.
    pub async fn poll<T>(
        &self,
        listener: &ListenerHandle,
        command: DeviceCommand,
        timeout: Duration,
        attempts: u32,
        retry_gap: Duration,
        accept: impl Fn(&CommandResponse) -> Option<T>,
    ) -> Result<(T, u32)> {
        let spec = CommandSpec::for_command(&command, timeout).ok_or_else(|| {
            DeviceError::Validation(format!("{} does not expect a reply", command))
        })?;

        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match listener.query(command.clone(), spec.clone()).await {
                Ok(response) => match accept(&response) {
                    Some(value) => return Ok((value, attempt)),
                    None => log::warn!(
                        "Attempt {}/{}: unusable reply to {}: {:?}",
                        attempt,
                        attempts,
                        command,
                        response.lines
                    ),
                },
                Err(e) => log::warn!("Attempt {}/{}: {} failed: {}", attempt, attempts, command, e),
            }
            if attempt < attempts {
                self.pause(retry_gap).await;
            }
        }

        log::error!("No valid response to {} after {} attempts", command, attempts);
        Err(DeviceError::NoResponse {
            command: command.to_string(),
            attempts,
        })
    }
}
