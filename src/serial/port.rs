//! Port enumeration and the opener seam used by [`SerialInterface`].
//!
//! [`SerialInterface`]: super::SerialInterface

use std::collections::HashMap;

use serialport::{SerialPortInfo, SerialPortType};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

use super::{PortDescriptor, Result, SerialError, BAUD_RATE};

/// Byte stream of an open port.
pub trait PortStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> PortStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens ports and lists what is attached.
///
/// The transport actor only talks to hardware through this trait, so tests can
/// hand it in-memory streams.
#[async_trait::async_trait]
pub trait PortOpener: Send + Sync {
    /// List serial ports currently present. Never fails: enumeration errors
    /// yield an empty list.
    fn enumerate(&self) -> Vec<PortDescriptor>;

    /// Open `port_name` with the fixed 8N1 framing. Returns once the OS open
    /// call has completed.
    async fn open(&self, port_name: &str) -> Result<Box<dyn PortStream>>;
}

impl From<SerialPortInfo> for PortDescriptor {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb_info) => Self {
                port_name: info.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                serial_number: usb_info.serial_number,
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            },
            _ => Self::from_path(info.port_name),
        }
    }
}

/// Sort key placing ttyACM* first, then ttyUSB*, then everything else.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        return (0, rest.parse().unwrap_or(usize::MAX), basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        return (1, rest.parse().unwrap_or(usize::MAX), basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all serial ports known to the OS in a deterministic order.
pub fn enumerate_ports() -> Vec<PortDescriptor> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            log::warn!("Serial port enumeration failed: {}", e);
            Vec::new()
        }
    };

    let mut by_name: HashMap<String, PortDescriptor> = HashMap::new();
    for info in ports {
        let descriptor = PortDescriptor::from(info);
        by_name.entry(descriptor.port_name.clone()).or_insert(descriptor);
    }

    let mut descriptors: Vec<PortDescriptor> = by_name.into_values().collect();
    descriptors.sort_by_key(|d| port_sort_key(&d.port_name));
    descriptors
}

/// Real hardware opener backed by `tokio-serial`.
#[derive(Debug, Clone)]
pub struct NativePortOpener {
    baud_rate: u32,
}

impl NativePortOpener {
    pub fn new() -> Self {
        Self { baud_rate: BAUD_RATE }
    }
}

impl Default for NativePortOpener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PortOpener for NativePortOpener {
    fn enumerate(&self) -> Vec<PortDescriptor> {
        enumerate_ports()
    }

    async fn open(&self, port_name: &str) -> Result<Box<dyn PortStream>> {
        let stream = tokio_serial::new(port_name, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", port_name, e)))?;

        Ok(Box::new(stream))
    }
}
