use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Runtime settings. Every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port_name: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    /// The device reboots when the port opens
    pub settle_ms: u64,
    pub stale_reconnect_secs: u64,
    pub stale_display_secs: u64,
    pub reconnect_interval_secs: u64,
    pub reconnect_penalty_ms: u64,
    pub command_gap_ms: u64,
    pub consume_gap_ms: u64,
    pub query_timeout_ms: u64,
    pub query_attempts: u32,
    pub query_retry_gap_ms: u64,
    pub tare_settle_ms: u64,
    pub start_in_simulation: bool,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port_name: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 25,
            settle_ms: 2000,
            stale_reconnect_secs: 10,
            stale_display_secs: 20,
            reconnect_interval_secs: 5,
            reconnect_penalty_ms: 1000,
            command_gap_ms: 50,
            consume_gap_ms: 100,
            query_timeout_ms: 2000,
            query_attempts: 3,
            query_retry_gap_ms: 200,
            tare_settle_ms: 500,
            start_in_simulation: true,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load from a JSON file. `None` when the file does not exist, so the
    /// caller can fall back to defaults and say so once logging is up.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        Ok(Some(settings))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn stale_reconnect(&self) -> Duration {
        Duration::from_secs(self.stale_reconnect_secs)
    }

    pub fn stale_display(&self) -> Duration {
        Duration::from_secs(self.stale_display_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn reconnect_penalty(&self) -> Duration {
        Duration::from_millis(self.reconnect_penalty_ms)
    }

    pub fn command_gap(&self) -> Duration {
        Duration::from_millis(self.command_gap_ms)
    }

    pub fn consume_gap(&self) -> Duration {
        Duration::from_millis(self.consume_gap_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn query_retry_gap(&self) -> Duration {
        Duration::from_millis(self.query_retry_gap_ms)
    }

    pub fn tare_settle(&self) -> Duration {
        Duration::from_millis(self.tare_settle_ms)
    }
}
