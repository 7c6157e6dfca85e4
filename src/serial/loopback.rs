//! Scripted in-memory link.
//!
//! Records every line the host writes and replays queued device output. Used by
//! the integration tests and handy for exercising the engine without hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::interface::{PortOpener, SerialPortIO};
use super::{Result, SerialError};

#[derive(Default)]
struct LoopbackInner {
    inbound: VecDeque<u8>,
    written: Vec<String>,
    partial_write: String,
    replies: Vec<(String, Vec<String>)>,
    fail_writes: bool,
    fail_open: bool,
    open_count: usize,
    flush_count: usize,
    generation: u64,
}

/// Shared control surface for the scripted port and its opener.
#[derive(Clone, Default)]
pub struct LoopbackHandle {
    inner: Arc<Mutex<LoopbackInner>>,
}

impl LoopbackHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue one device line (newline appended).
    pub fn push_line(&self, line: &str) {
        let mut inner = self.lock();
        inner.inbound.extend(line.as_bytes());
        inner.inbound.push_back(b'\n');
    }

    /// Queue raw bytes exactly as given.
    pub fn push_raw(&self, bytes: &[u8]) {
        self.lock().inbound.extend(bytes);
    }

    /// When the host writes a line starting with `prefix`, queue `lines` as the device's answer.
    pub fn reply_to(&self, prefix: &str, lines: &[&str]) {
        self.lock().replies.push((
            prefix.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        ));
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Invalidate every port opened so far, as if the cable was pulled.
    pub fn drop_link(&self) {
        self.lock().generation += 1;
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    /// Successful flushes across every port opened so far.
    pub fn flush_count(&self) -> usize {
        self.lock().flush_count
    }

    /// Lines written by the host so far, without terminators.
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    pub fn clear_written(&self) {
        self.lock().written.clear();
    }

    pub fn opener(&self) -> LoopbackOpener {
        LoopbackOpener {
            handle: self.clone(),
        }
    }
}

pub struct LoopbackPort {
    handle: LoopbackHandle,
    generation: u64,
}

impl LoopbackPort {
    fn check_alive(&self, inner: &LoopbackInner) -> Result<()> {
        if inner.generation != self.generation {
            return Err(SerialError::IoError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "loopback link dropped",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SerialPortIO for LoopbackPort {
    async fn send_data(&mut self, data: &[u8]) -> Result<usize> {
        let mut inner = self.handle.lock();
        self.check_alive(&inner)?;
        if inner.fail_writes {
            return Err(SerialError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "loopback write rejected",
            )));
        }
        inner.partial_write.push_str(&String::from_utf8_lossy(data));
        while let Some(pos) = inner.partial_write.find('\n') {
            let line: String = inner.partial_write.drain(..=pos).collect();
            let line = line.trim_end().to_string();
            let answers: Vec<String> = inner
                .replies
                .iter()
                .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
                .flat_map(|(_, lines)| lines.clone())
                .collect();
            for answer in answers {
                inner.inbound.extend(answer.as_bytes());
                inner.inbound.push_back(b'\n');
            }
            inner.written.push(line);
        }
        Ok(data.len())
    }

    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        {
            let mut inner = self.handle.lock();
            self.check_alive(&inner)?;
            if !inner.inbound.is_empty() {
                let n = buffer.len().min(inner.inbound.len());
                for (slot, byte) in buffer.iter_mut().zip(inner.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        tokio::time::sleep(Duration::from_millis(timeout_ms.clamp(1, 5))).await;
        Err(SerialError::Timeout)
    }

    async fn flush(&mut self) -> Result<()> {
        let mut inner = self.handle.lock();
        self.check_alive(&inner)?;
        inner.flush_count += 1;
        Ok(())
    }
}

pub struct LoopbackOpener {
    handle: LoopbackHandle,
}

impl PortOpener for LoopbackOpener {
    fn open(&self, port_name: &str, _baud_rate: u32) -> Result<Box<dyn SerialPortIO>> {
        let mut inner = self.handle.lock();
        if inner.fail_open {
            return Err(SerialError::ConnectionFailed(format!(
                "{} refused to open",
                port_name
            )));
        }
        inner.open_count += 1;
        Ok(Box::new(LoopbackPort {
            handle: self.handle.clone(),
            generation: inner.generation,
        }))
    }
}
