use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{SerialPort, SerialPortType};
use tokio::time::timeout;

use super::{Result, SerialError, SerialPortInfo};

/// Byte-level access to an open serial link.
#[async_trait]
pub trait SerialPortIO: Send {
    async fn send_data(&mut self, data: &[u8]) -> Result<usize>;
    /// Read whatever is available, waiting at most `timeout_ms`.
    /// Returns `SerialError::Timeout` when nothing arrived.
    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize>;
    async fn flush(&mut self) -> Result<()>;
}

/// Opens links by port name. Swapped out in tests for a scripted port.
pub trait PortOpener: Send + Sync {
    fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPortIO>>;
}

/// `serialport`-backed link
pub struct NativePort {
    port: Box<dyn SerialPort>,
}

#[async_trait]
impl SerialPortIO for NativePort {
    async fn send_data(&mut self, data: &[u8]) -> Result<usize> {
        let bytes_written = self.port.write(data).map_err(SerialError::IoError)?;
        self.port.flush().map_err(SerialError::IoError)?;
        Ok(bytes_written)
    }

    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let port = &mut self.port;
        let read_operation = async {
            let mut total_read = 0;
            let mut attempts = 0;
            const MAX_ATTEMPTS: usize = 100;

            while total_read == 0 && attempts < MAX_ATTEMPTS {
                match port.bytes_to_read() {
                    Ok(0) => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        attempts += 1;
                    }
                    Ok(_) => match port.read(&mut buffer[total_read..]) {
                        Ok(bytes_read) => {
                            total_read += bytes_read;
                            break;
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                            attempts += 1;
                        }
                        Err(e) => return Err(SerialError::IoError(e)),
                    },
                    Err(e) => return Err(SerialError::SerialportError(e)),
                }
            }

            if total_read == 0 {
                Err(SerialError::Timeout)
            } else {
                Ok(total_read)
            }
        };

        timeout(Duration::from_millis(timeout_ms), read_operation)
            .await
            .map_err(|_| SerialError::Timeout)?
    }

    async fn flush(&mut self) -> Result<()> {
        self.port.flush().map_err(SerialError::IoError)
    }
}

/// Opens real serial ports through the `serialport` crate.
#[derive(Debug, Clone, Default)]
pub struct NativePortOpener {
    pub read_timeout_ms: u64,
}

impl PortOpener for NativePortOpener {
    fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPortIO>> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(self.read_timeout_ms.max(1)))
            .open()
            .map_err(|e| SerialError::ConnectionFailed(e.to_string()))?;
        Ok(Box::new(NativePort { port }))
    }
}

/// An open link plus the name it was opened under.
pub struct SerialInterface {
    port_name: String,
    io: Box<dyn SerialPortIO>,
}

impl SerialInterface {
    pub fn from_io(port_name: impl Into<String>, io: Box<dyn SerialPortIO>) -> Self {
        Self {
            port_name: port_name.into(),
            io,
        }
    }

    /// Enumerate serial ports visible to the host
    pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => SerialPortInfo {
                    port_name: port.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                },
                _ => SerialPortInfo {
                    port_name: port.port_name,
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                },
            })
            .collect())
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Write one protocol line; the terminating newline is added here.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let framed = format!("{}\n", line);
        self.io.send_data(framed.as_bytes()).await?;
        Ok(())
    }

    pub async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        self.io.read_data(buffer, timeout_ms).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.io.flush().await
    }
}
