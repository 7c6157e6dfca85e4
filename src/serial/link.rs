use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::interface::{PortOpener, SerialInterface};
use super::{Result, SerialError};

/// Link lifecycle. Close is synchronous, so there is no closing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }
}

/// Owns the serial handle. Only the listener reads through it; writers go
/// through [`LinkManager::send_line`].
pub struct LinkManager {
    port_name: String,
    baud_rate: u32,
    settle: Duration,
    opener: Arc<dyn PortOpener>,
    interface: Mutex<Option<SerialInterface>>,
    state: AtomicU8,
}

impl LinkManager {
    pub fn new(
        port_name: impl Into<String>,
        baud_rate: u32,
        settle: Duration,
        opener: Arc<dyn PortOpener>,
    ) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            settle,
            opener,
            interface: Mutex::new(None),
            state: AtomicU8::new(LinkState::Disconnected as u8),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Connected
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Open the link and wait out the device's reset-on-open. Never errors:
    /// failure leaves the link closed and returns `false`.
    pub async fn connect(&self) -> bool {
        self.close().await;
        self.set_state(LinkState::Connecting);
        log::info!("Attempting to connect to device on {}...", self.port_name);

        let io = match self.opener.open(&self.port_name, self.baud_rate) {
            Ok(io) => io,
            Err(e) => {
                log::error!("Error connecting to device on {}: {}", self.port_name, e);
                self.set_state(LinkState::Disconnected);
                return false;
            }
        };

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        *self.interface.lock().await = Some(SerialInterface::from_io(self.port_name.clone(), io));
        self.set_state(LinkState::Connected);
        log::info!("Connected to device on {}", self.port_name);
        true
    }

    /// Flush pending output and drop the handle. A failed flush still closes.
    pub async fn close(&self) {
        let mut guard = self.interface.lock().await;
        if let Some(mut interface) = guard.take() {
            if let Err(e) = interface.flush().await {
                log::debug!("Flush on close of {} failed: {}", interface.port_name(), e);
            }
            log::info!("Closing link on {}", interface.port_name());
        }
        self.set_state(LinkState::Disconnected);
    }

    /// Write one line. An I/O failure closes the link so the listener reconnects.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut guard = self.interface.lock().await;
        let interface = guard.as_mut().ok_or(SerialError::NotConnected)?;
        match interface.send_line(line).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("Error writing to serial port: {}", e);
                guard.take();
                self.set_state(LinkState::Disconnected);
                Err(e)
            }
        }
    }

    /// Read one chunk. `Timeout` is the normal idle outcome.
    pub async fn read_chunk(&self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let mut guard = self.interface.lock().await;
        let interface = guard.as_mut().ok_or(SerialError::NotConnected)?;
        match interface.read_data(buffer, timeout_ms).await {
            Err(SerialError::Timeout) => Err(SerialError::Timeout),
            Err(e) => {
                log::error!("Serial communication error: {}. Closing port, will reconnect.", e);
                guard.take();
                self.set_state(LinkState::Disconnected);
                Err(e)
            }
            ok => ok,
        }
    }
}

/// Reconnect throttling: a lost link is retried at most once per `min_interval`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    stale_after: Duration,
    min_interval: Duration,
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
}

impl ReconnectPolicy {
    pub fn new(stale_after: Duration, min_interval: Duration) -> Self {
        Self {
            stale_after,
            min_interval,
            last_attempt: None,
            consecutive_failures: 0,
        }
    }

    pub fn connection_lost(&self, link_open: bool, since_update: Duration) -> bool {
        !link_open || since_update > self.stale_after
    }

    pub fn should_attempt(&self, link_open: bool, since_update: Duration, now: Instant) -> bool {
        self.connection_lost(link_open, since_update)
            && self
                .last_attempt
                .map_or(true, |last| now.saturating_duration_since(last) >= self.min_interval)
    }

    pub fn record_attempt(&mut self, now: Instant, succeeded: bool) {
        self.last_attempt = Some(now);
        if succeeded {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
