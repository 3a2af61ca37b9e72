pub mod codec;
pub mod engine;
pub mod interface;
pub mod port;
pub mod protocol;

pub use interface::{Connection, LinkState, SerialInterface, TransportEvent};
pub use port::{NativePortOpener, PortOpener, PortStream};
pub use protocol::OdriveProtocol;

use serde::{Deserialize, Serialize};

/// Fixed line settings of the ODrive USB CDC / UART shell: 115200 8N1.
pub const BAUD_RATE: u32 = 115200;

/// One enumerated serial port. USB fields are `None` for non-USB ports or
/// ports known only by path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl PortDescriptor {
    /// Descriptor carrying only a path, used when the port is not listed by
    /// the OS enumeration (manual connect by path).
    pub fn from_path(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Device reported failure: {0}")]
    Device(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Command error: {0}")]
    Command(#[from] crate::catalog::CatalogError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
