use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPortType;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::SerialPortBuilderExt;

use super::{Result, SerialDeviceInfo, SerialError};

/// Byte-level duplex the dispatch loop talks through.
///
/// `read_data` must return [`SerialError::Timeout`] when nothing arrives within
/// `timeout_ms`, so callers can poll a shutdown flag between reads.
#[async_trait]
pub trait SerialPortIO: Send {
    async fn send_data(&mut self, data: &[u8]) -> Result<usize>;
    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize>;
}

/// Adapts any tokio duplex stream (a native serial stream, a pty, an in-memory
/// pipe) to [`SerialPortIO`].
pub struct StreamIO<S> {
    stream: S,
}

impl<S> StreamIO<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> SerialPortIO for StreamIO<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_data(&mut self, data: &[u8]) -> Result<usize> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(data.len())
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        match timeout(Duration::from_millis(timeout_ms), self.stream.read(buf)).await {
            Ok(Ok(0)) => Err(SerialError::IoError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "transport closed by peer",
            ))),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => Err(SerialError::Timeout),
            Ok(Err(e)) => Err(SerialError::IoError(e)),
            Err(_) => Err(SerialError::Timeout),
        }
    }
}

/// The single point-to-point connection to the device under test.
pub struct SerialInterface {
    io: Option<Box<dyn SerialPortIO>>,
    port_name: String,
}

impl SerialInterface {
    /// Open a native serial port. Must be called from within a tokio runtime.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let stream = tokio_serial::new(port_name, baud_rate)
            .timeout(Duration::from_millis(1000))
            .open_native_async()
            .map_err(|e| match e.kind {
                serialport::ErrorKind::NoDevice => SerialError::PortNotFound(port_name.to_string()),
                _ => SerialError::ConnectionFailed(e.to_string()),
            })?;

        log::info!("Opened serial port {} at {} baud", port_name, baud_rate);
        Ok(Self::from_io(port_name, Box::new(StreamIO::new(stream))))
    }

    /// Wrap an already-open transport, e.g. an in-memory duplex in tests.
    pub fn from_io(port_name: impl Into<String>, io: Box<dyn SerialPortIO>) -> Self {
        Self {
            io: Some(io),
            port_name: port_name.into(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub async fn send_data(&mut self, data: &[u8]) -> Result<usize> {
        let io = self.io.as_mut().ok_or(SerialError::NotConnected)?;
        io.send_data(data).await
    }

    /// Write `line` followed by a single `\n`.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let framed = format!("{}\n", line);
        self.send_data(framed.as_bytes()).await?;
        Ok(())
    }

    pub async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let io = self.io.as_mut().ok_or(SerialError::NotConnected)?;
        io.read_data(buffer, timeout_ms).await
    }

    /// Release the underlying transport. Safe to call more than once.
    pub fn close(&mut self) {
        if self.io.take().is_some() {
            log::info!("Closed transport {}", self.port_name);
        }
    }
}

impl Drop for SerialInterface {
    fn drop(&mut self) {
        self.close();
    }
}

/// List every serial endpoint the OS currently exposes.
pub fn discover_ports() -> Result<Vec<SerialDeviceInfo>> {
    let ports = serialport::available_ports()?;

    let devices = ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                port_name: port.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                serial_number: usb_info.serial_number,
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            },
            _ => SerialDeviceInfo {
                port_name: port.port_name,
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            },
        })
        .collect();

    Ok(devices)
}
