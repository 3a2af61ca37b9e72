use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::serial::PortDescriptor;

/// Device connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Link dropped; the transport is retrying
    Reconnecting,
    Error(String),
}

/// A discovered (or manually added) controller port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: Uuid,
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub connection_state: ConnectionState,
    pub firmware_version: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn from_descriptor(descriptor: &PortDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            port_name: descriptor.port_name.clone(),
            vid: descriptor.vid,
            pid: descriptor.pid,
            serial_number: descriptor.serial_number.clone(),
            manufacturer: descriptor.manufacturer.clone(),
            product: descriptor.product.clone(),
            connection_state: ConnectionState::Disconnected,
            firmware_version: None,
            last_seen: Utc::now(),
        }
    }

    /// Refresh USB details from a newer enumeration, keeping identity and
    /// connection state.
    pub fn refresh(&mut self, descriptor: &PortDescriptor) {
        self.vid = descriptor.vid;
        self.pid = descriptor.pid;
        self.serial_number = descriptor.serial_number.clone();
        self.manufacturer = descriptor.manufacturer.clone();
        self.product = descriptor.product.clone();
        self.last_seen = Utc::now();
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state, ConnectionState::Connected)
    }

    pub fn update_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        self.last_seen = Utc::now();
    }
}
