//! The listener: sole reader of the link.
//!
//! One task drains the link, hands every line to a [`LinkObserver`], runs the
//! reconnect policy and serves queries that expect a reply. Anything that
//! needs an immediate answer from the device goes through [`ListenerHandle`]
//! instead of reading the link itself.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::types::*;
use crate::serial::protocol::{decode_line, DeviceCommand, InboundLine};
use crate::serial::{LinkManager, ReconnectPolicy, SerialError};

const MAX_PARTIAL_BYTES: usize = 8192;
const IDLE_WHEN_CLOSED: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct ListenerHandle {
    cmd_tx: mpsc::Sender<SerialCommand>,
    metrics_rx: watch::Receiver<ListenerMetrics>,
}

impl ListenerHandle {
    pub fn metrics(&self) -> ListenerMetrics {
        self.metrics_rx.borrow().clone()
    }

    pub async fn query(
        &self,
        command: DeviceCommand,
        spec: CommandSpec,
    ) -> Result<CommandResponse, SerialError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SerialCommand::Query {
                command,
                spec,
                responder: tx,
            })
            .await
            .map_err(|_| SerialError::ProtocolError("Listener stopped".into()))?;
        rx.await
            .map_err(|_| SerialError::ProtocolError("Response dropped".into()))?
    }

    /// Ask the listener to reconnect if the link is closed. Returns whether it is open.
    pub async fn reconnect(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SerialCommand::Reconnect { responder: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SerialCommand::Shutdown).await;
    }
}

pub struct ListenerBuilder {
    link: Arc<LinkManager>,
    observer: Arc<dyn LinkObserver>,
    policy: ReconnectPolicy,
    read_timeout_ms: u64,
    reconnect_penalty: Duration,
    command_capacity: usize,
}

impl ListenerBuilder {
    pub fn new(link: Arc<LinkManager>, observer: Arc<dyn LinkObserver>) -> Self {
        Self {
            link,
            observer,
            policy: ReconnectPolicy::new(Duration::from_secs(10), Duration::from_secs(5)),
            read_timeout_ms: 25,
            reconnect_penalty: Duration::from_secs(1),
            command_capacity: 64,
        }
    }

    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn read_timeout_ms(mut self, read_timeout_ms: u64) -> Self {
        self.read_timeout_ms = read_timeout_ms;
        self
    }

    pub fn reconnect_penalty(mut self, penalty: Duration) -> Self {
        self.reconnect_penalty = penalty;
        self
    }

    pub fn spawn(self) -> (ListenerHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(self.command_capacity);
        let (metrics_tx, metrics_rx) = watch::channel(ListenerMetrics::default());

        let listener = Listener {
            link: self.link,
            observer: self.observer,
            policy: self.policy,
            read_timeout_ms: self.read_timeout_ms,
            reconnect_penalty: self.reconnect_penalty,
            metrics: ListenerMetrics::default(),
            metrics_tx,
            partial: String::new(),
            pending: None,
            waiting: VecDeque::new(),
        };
        let task = tokio::spawn(listener.run(cmd_rx));

        (ListenerHandle { cmd_tx, metrics_rx }, task)
    }
}

type QueuedQuery = (DeviceCommand, CommandSpec, QueryResponder);

struct Listener {
    link: Arc<LinkManager>,
    observer: Arc<dyn LinkObserver>,
    policy: ReconnectPolicy,
    read_timeout_ms: u64,
    reconnect_penalty: Duration,
    metrics: ListenerMetrics,
    metrics_tx: watch::Sender<ListenerMetrics>,
    partial: String,
    pending: Option<PendingCommand>,
    waiting: VecDeque<QueuedQuery>,
}

impl Listener {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SerialCommand>) {
        log::info!("Device listener started on {}", self.link.port_name());

        loop {
            let since_update = self.observer.since_last_update().await;
            if self
                .policy
                .should_attempt(self.link.is_open(), since_update, Instant::now())
            {
                if !self.link.is_open() {
                    log::warn!("Link to device is closed, reconnecting");
                } else {
                    log::warn!(
                        "No data from device for {:.1}s, reconnecting",
                        since_update.as_secs_f64()
                    );
                }
                // Requests are still served while the device is away.
                if !self.establish().await {
                    tokio::time::sleep(self.reconnect_penalty).await;
                }
            }

            self.expire_pending(Instant::now());
            self.start_next_query().await;

            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(SerialCommand::Query { command, spec, responder }) => {
                            self.waiting.push_back((command, spec, responder));
                            self.start_next_query().await;
                        }
                        Some(SerialCommand::Reconnect { responder }) => {
                            let open = self.link.is_open() || self.establish().await;
                            let _ = responder.send(open);
                        }
                        Some(SerialCommand::Shutdown) | None => break,
                    }
                }
                read = read_chunk(&self.link, self.read_timeout_ms) => {
                    match read {
                        Ok(bytes) => self.ingest(&bytes).await,
                        Err(SerialError::Timeout) | Err(SerialError::NotConnected) => {}
                        Err(e) => {
                            self.metrics.last_error = Some(e.to_string());
                            self.publish();
                        }
                    }
                }
            }
        }

        self.fail_all_queries("Listener terminated");
        self.link.close().await;
        log::info!("Device listener stopped");
    }

    /// Connect and replay host state. Failure is logged and counted, never raised.
    async fn establish(&mut self) -> bool {
        self.metrics.reconnect_attempts += 1;
        let open = self.link.connect().await && self.observer.on_connected().await;
        self.policy.record_attempt(Instant::now(), open);
        if !open {
            self.metrics.reconnect_failures += 1;
            log::warn!(
                "Reconnect to {} failed ({} in a row)",
                self.link.port_name(),
                self.policy.consecutive_failures()
            );
        }
        self.partial.clear();
        self.publish();
        open
    }

    async fn ingest(&mut self, bytes: &[u8]) {
        match std::str::from_utf8(bytes) {
            Ok(chunk) => self.partial.push_str(chunk),
            Err(_) => {
                self.metrics.utf8_decode_errors += 1;
                self.partial.push_str(&String::from_utf8_lossy(bytes));
            }
        }

        while let Some(pos) = self.partial.find(['\n', '\r']) {
            let line = self.partial[..pos].to_string();
            let mut advance = pos + 1;
            let raw = self.partial.as_bytes();
            while advance < raw.len() && (raw[advance] == b'\n' || raw[advance] == b'\r') {
                advance += 1;
            }
            self.partial.drain(..advance);

            if !line.trim().is_empty() {
                self.handle_line(line.trim()).await;
            }
        }

        if self.partial.len() > MAX_PARTIAL_BYTES {
            let mut cut = self.partial.len() - MAX_PARTIAL_BYTES / 2;
            while !self.partial.is_char_boundary(cut) {
                cut += 1;
            }
            self.partial.drain(..cut);
            self.metrics.partial_buffer_trims += 1;
            log::warn!("Discarded unterminated device output");
        }
        self.publish();
    }

    async fn handle_line(&mut self, line: &str) {
        self.metrics.lines_read += 1;
        let decoded = decode_line(line);
        self.observer.on_line(line, &decoded).await;

        match &decoded {
            InboundLine::Data(telemetry) if !telemetry.rejected_fields.is_empty() => {
                self.metrics.parse_warnings += 1;
            }
            InboundLine::Malformed { .. } => self.metrics.parse_warnings += 1,
            InboundLine::Ready => log::info!("Device reports ready"),
            InboundLine::Measurement(text) => log::info!("Measurement info: {}", text),
            InboundLine::Chatter(text) => {
                self.metrics.chatter_lines += 1;
                log::info!("Device message: {}", text);
            }
            _ => {}
        }

        let complete = match self.pending.as_mut() {
            Some(p) if p.spec.accepts(line) => {
                p.buffer.push(line.to_string());
                p.spec.matcher.is_complete(&p.buffer)
            }
            _ => false,
        };
        if complete {
            if let Some(done) = self.pending.take() {
                let latency = done.started.elapsed();
                self.metrics.queries_completed += 1;
                self.metrics.last_query_latency_ms = Some(latency.as_millis() as u64);
                log::debug!("{} answered in {:?}", done.spec.name, latency);
                self.publish();
                let _ = done.responder.send(Ok(CommandResponse {
                    lines: done.buffer,
                    latency,
                }));
            }
        }
    }

    fn expire_pending(&mut self, now: Instant) {
        let expired = self.pending.as_ref().is_some_and(|p| p.is_expired(now));
        if !expired {
            return;
        }
        if let Some(done) = self.pending.take() {
            self.metrics.query_timeouts += 1;
            if done.buffer.is_empty() {
                log::warn!("{} timed out after {:?}; no lines received", done.spec.name, done.spec.timeout);
            } else {
                log::warn!(
                    "{} timed out after {:?}; partial lines: {:?}",
                    done.spec.name,
                    done.spec.timeout,
                    done.buffer
                );
            }
            self.publish();
            let _ = done.responder.send(Err(SerialError::Timeout));
        }
    }

    /// Write the next queued query if none is in flight.
    async fn start_next_query(&mut self) {
        while self.pending.is_none() {
            let Some((command, spec, responder)) = self.waiting.pop_front() else {
                return;
            };
            if responder.is_closed() {
                continue;
            }
            match self.link.send_line(&command.encode()).await {
                Ok(()) => {
                    log::info!("Sending to device: {}", command);
                    self.pending = Some(PendingCommand {
                        spec,
                        started: Instant::now(),
                        responder,
                        buffer: Vec::new(),
                    });
                }
                Err(e) => {
                    let _ = responder.send(Err(e));
                }
            }
        }
    }

    fn fail_all_queries(&mut self, reason: &str) {
        if let Some(p) = self.pending.take() {
            let _ = p.responder.send(Err(SerialError::ProtocolError(reason.into())));
        }
        for (_, _, responder) in self.waiting.drain(..) {
            let _ = responder.send(Err(SerialError::ProtocolError(reason.into())));
        }
    }

    fn publish(&self) {
        let _ = self.metrics_tx.send(self.metrics.clone());
    }
}

/// One read from the link. The link lock is released before the bytes are used.
async fn read_chunk(link: &LinkManager, timeout_ms: u64) -> Result<Vec<u8>, SerialError> {
    if !link.is_open() {
        tokio::time::sleep(IDLE_WHEN_CLOSED).await;
        return Err(SerialError::NotConnected);
    }
    let mut buf = [0u8; 512];
    let n = link.read_chunk(&mut buf, timeout_ms).await?;
    Ok(buf[..n].to_vec())
}
