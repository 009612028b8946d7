pub mod dispatch;
pub mod interface;
pub mod protocol;

pub use dispatch::{DispatchMetrics, Dispatcher, ServerBuilder, ServerError, ServerState, VirtualSensorServer};
pub use interface::{discover_ports, SerialInterface, SerialPortIO, StreamIO};
pub use protocol::{Command, CommandName, Frame, ProtocolConfig, ProtocolError, Reply};

use serde::{Deserialize, Serialize};

pub const DEFAULT_BAUD_RATE: u32 = 115200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Transport not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
