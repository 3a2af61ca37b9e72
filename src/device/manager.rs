use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use super::identify::is_candidate;
use super::{ConnectionState, Device, DeviceError, Result};
use crate::config::AppSettings;
use crate::serial::engine::EngineEvent;
use crate::serial::{OdriveProtocol, PortDescriptor, PortOpener, SerialInterface};

/// Central device management system.
///
/// Owns the transport and protocol engine for the single serial link and
/// tracks every port that looks like a controller.
pub struct DeviceManager {
    devices: Arc<RwLock<HashMap<Uuid, Device>>>,
    connected_device: Arc<Mutex<Option<Uuid>>>,
    protocol: OdriveProtocol,
}

impl DeviceManager {
    /// Spawn the transport and protocol engine. The returned receiver is the
    /// engine's event stream; pass each event back through
    /// [`DeviceManager::apply_event`] to keep device states current.
    pub fn new(opener: Arc<dyn PortOpener>, settings: &AppSettings) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (interface, transport_rx) = SerialInterface::spawn(opener, settings.serial.clone());
        let (protocol, events_rx) = OdriveProtocol::spawn(
            interface,
            transport_rx,
            settings.protocol.clone(),
            settings.telemetry.max_rate_hz,
        );

        let manager = Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            connected_device: Arc::new(Mutex::new(None)),
            protocol,
        };
        (manager, events_rx)
    }

    pub fn protocol(&self) -> &OdriveProtocol {
        &self.protocol
    }

    /// Enumerate ports and record every candidate. Known ports keep their id
    /// and connection state.
    pub async fn discover_devices(&self) -> Vec<Device> {
        let ports = self.protocol.interface().enumerate();
        let mut devices_guard = self.devices.write().await;
        let mut discovered = Vec::new();

        for port in ports.iter().filter(|p| is_candidate(p)) {
            let device = upsert(&mut devices_guard, port);
            discovered.push(device);
        }

        log::info!("Discovered {} candidate device(s) among {} port(s)", discovered.len(), ports.len());
        discovered
    }

    /// Get all known devices
    pub async fn get_devices(&self) -> Vec<Device> {
        let devices_guard = self.devices.read().await;
        let mut devices: Vec<Device> = devices_guard.values().cloned().collect();
        devices.sort_by(|a, b| a.port_name.cmp(&b.port_name));
        devices
    }

    pub async fn get_device(&self, device_id: &Uuid) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn get_connected_device_id(&self) -> Option<Uuid> {
        *self.connected_device.lock().await
    }

    /// Register a port by path (it need not pass the candidate heuristic).
    pub async fn add_port(&self, port_name: &str) -> Device {
        let descriptor = self
            .protocol
            .interface()
            .enumerate()
            .into_iter()
            .find(|p| p.port_name == port_name)
            .unwrap_or_else(|| PortDescriptor::from_path(port_name));
        let mut devices_guard = self.devices.write().await;
        upsert(&mut devices_guard, &descriptor)
    }

    /// Connect to a known device, replacing any current link.
    pub async fn connect_device(&self, device_id: &Uuid) -> Result<Device> {
        let device = self.get_device(device_id).await.ok_or(DeviceError::NotFound)?;

        let mut connected_guard = self.connected_device.lock().await;
        if let Some(previous) = connected_guard.take() {
            if previous != *device_id {
                self.update_device_connection_state(&previous, ConnectionState::Disconnected).await;
            }
        }

        self.update_device_connection_state(device_id, ConnectionState::Connecting).await;
        log::info!("Attempting to connect to port: {}", device.port_name);

        match self.protocol.interface().connect(&device.port_name).await {
            Ok(descriptor) => {
                {
                    let mut devices_guard = self.devices.write().await;
                    if let Some(device) = devices_guard.get_mut(device_id) {
                        device.refresh(&descriptor);
                        device.update_connection_state(ConnectionState::Connected);
                    }
                }
                *connected_guard = Some(*device_id);
                drop(connected_guard);

                match self.protocol.firmware_version().await {
                    Ok(version) => {
                        log::info!("{} runs firmware {}", device.port_name, version);
                        if let Some(device) = self.devices.write().await.get_mut(device_id) {
                            device.firmware_version = Some(version);
                        }
                    }
                    Err(e) => log::warn!("Could not read firmware version from {}: {}", device.port_name, e),
                }

                log::info!("Successfully connected to device: {}", device.port_name);
                self.get_device(device_id).await.ok_or(DeviceError::NotFound)
            }
            Err(e) => {
                let error_msg = format!("Connection failed: {}", e);
                log::error!("{}", error_msg);
                self.update_device_connection_state(device_id, ConnectionState::Error(error_msg)).await;
                Err(DeviceError::SerialError(e))
            }
        }
    }

    /// Disconnect from the currently connected device
    pub async fn disconnect_device(&self) -> Result<()> {
        let mut connected_guard = self.connected_device.lock().await;
        let Some(device_id) = connected_guard.take() else {
            return Err(DeviceError::NotConnected);
        };

        self.protocol.interface().disconnect().await;
        self.update_device_connection_state(&device_id, ConnectionState::Disconnected).await;
        log::info!("Disconnected from device");
        Ok(())
    }

    /// Mirror link events from the engine into device connection states.
    pub async fn apply_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Connected(descriptor) => {
                self.update_port_state(&descriptor.port_name, ConnectionState::Connected).await;
            }
            EngineEvent::Disconnected { port, unexpected: true } => {
                self.update_port_state(port, ConnectionState::Reconnecting).await;
            }
            EngineEvent::ReconnectExhausted { attempts } => {
                let mut connected_guard = self.connected_device.lock().await;
                if let Some(device_id) = connected_guard.take() {
                    let message = format!("Link lost, {} reconnect attempts failed", attempts);
                    self.update_device_connection_state(&device_id, ConnectionState::Error(message)).await;
                }
            }
            _ => {}
        }
    }

    async fn update_port_state(&self, port_name: &str, state: ConnectionState) {
        let mut devices_guard = self.devices.write().await;
        if let Some(device) = devices_guard.values_mut().find(|d| d.port_name == port_name) {
            device.update_connection_state(state);
        }
    }

    /// Helper method to update device connection state
    async fn update_device_connection_state(&self, device_id: &Uuid, state: ConnectionState) {
        let mut devices_guard = self.devices.write().await;
        if let Some(device) = devices_guard.get_mut(device_id) {
            device.update_connection_state(state);
        }
    }
}

fn upsert(devices: &mut HashMap<Uuid, Device>, port: &PortDescriptor) -> Device {
    if let Some(existing) = devices.values_mut().find(|d| d.port_name == port.port_name) {
        existing.refresh(port);
        return existing.clone();
    }
    let device = Device::from_descriptor(port);
    devices.insert(device.id, device.clone());
    device
}
