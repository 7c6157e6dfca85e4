//! Listener task types: queued queries, response matching and metrics.
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::serial::protocol::{DeviceCommand, InboundLine, DATA_PREFIX, WEIGHT_PREFIX};
use crate::serial::SerialError;

/// Decides when the lines collected for a query form a complete answer.
#[derive(Debug, Clone)]
pub enum ResponseMatcher {
    UntilPrefix(&'static str),
    ContainsIgnoreCase(&'static str),
}

impl ResponseMatcher {
    pub fn is_complete(&self, lines: &[String]) -> bool {
        match self {
            ResponseMatcher::UntilPrefix(p) => lines.iter().any(|l| l.starts_with(p)),
            ResponseMatcher::ContainsIgnoreCase(s) => {
                lines.iter().any(|l| l.to_lowercase().contains(s))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub timeout: Duration,
    pub matcher: ResponseMatcher,
}

impl CommandSpec {
    /// Reply rules for commands that answer; `None` for fire-and-forget ones.
    pub fn for_command(command: &DeviceCommand, timeout: Duration) -> Option<Self> {
        match command {
            DeviceCommand::GetWeight => Some(Self {
                name: "GET_WEIGHT",
                timeout,
                matcher: ResponseMatcher::UntilPrefix(WEIGHT_PREFIX),
            }),
            DeviceCommand::MeasureSinglePillWeight => Some(Self {
                name: "MEASURE_SINGLE_PILL_WEIGHT",
                timeout,
                matcher: ResponseMatcher::ContainsIgnoreCase("measured single pill weight"),
            }),
            _ => None,
        }
    }

    /// Periodic telemetry never belongs to a query's answer.
    pub fn accepts(&self, line: &str) -> bool {
        !line.starts_with(DATA_PREFIX)
    }
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub lines: Vec<String>,
    pub latency: Duration,
}

impl CommandResponse {
    /// First `WEIGHT:` value among the collected lines.
    pub fn weight(&self) -> Option<f64> {
        self.lines.iter().find_map(|line| {
            match crate::serial::protocol::decode_line(line) {
                InboundLine::Weight(w) => Some(w),
                _ => None,
            }
        })
    }
}

pub type QueryResponder = oneshot::Sender<Result<CommandResponse, SerialError>>;

pub struct PendingCommand {
    pub spec: CommandSpec,
    pub started: Instant,
    pub responder: QueryResponder,
    pub buffer: Vec<String>,
}

impl PendingCommand {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) > self.spec.timeout
    }
}

#[derive(Debug)]
pub enum SerialCommand {
    /// Write `command` and collect lines until `spec` is satisfied or times out.
    Query {
        command: DeviceCommand,
        spec: CommandSpec,
        responder: QueryResponder,
    },
    /// Reconnect now if the link is closed; answers whether the link is open afterwards.
    Reconnect { responder: oneshot::Sender<bool> },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListenerMetrics {
    pub lines_read: u64,
    pub parse_warnings: u64,
    pub chatter_lines: u64,
    pub reconnect_attempts: u64,
    pub reconnect_failures: u64,
    pub queries_completed: u64,
    pub query_timeouts: u64,
    pub last_query_latency_ms: Option<u64>,
    pub partial_buffer_trims: u64,
    pub utf8_decode_errors: u64,
    pub last_error: Option<String>,
}

/// What the listener feeds. Implemented by the device layer so the serial
/// layer never depends on it.
#[async_trait]
pub trait LinkObserver: Send + Sync + 'static {
    /// Called for every complete line, in arrival order.
    async fn on_line(&self, raw: &str, decoded: &InboundLine);

    /// Time since the last accepted line.
    async fn since_last_update(&self) -> Duration;

    /// Push host state after a fresh connect. `false` if the device could not be told.
    async fn on_connected(&self) -> bool;
}
