use std::fmt::Display;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout};

use super::engine::reader::Engine;
use super::engine::{DeviceResponse, EngineCommand, EngineEvent, EngineMetrics, ResponseValue};
use super::{Result, SerialError, SerialInterface, TransportEvent};
use crate::catalog::{CommandInterpreter, ParamMap};
use crate::config::ProtocolSettings;
use crate::telemetry::AxisState;

const CONTROL_MODE_PATH: &str = "axis0.controller.config.control_mode";
const REQUESTED_STATE_PATH: &str = "axis0.requested_state";
const CURRENT_STATE_PATH: &str = "axis0.current_state";

/// ODrive ASCII shell protocol.
///
/// Cloneable handle to the protocol engine task. Every request is tagged with
/// a correlation id so concurrent callers (and the telemetry poll loop) can
/// share one serial link.
#[derive(Clone)]
pub struct OdriveProtocol {
    interface: SerialInterface,
    cmd_tx: mpsc::Sender<EngineCommand>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    metrics_rx: watch::Receiver<EngineMetrics>,
    settings: ProtocolSettings,
}

impl OdriveProtocol {
    /// Spawn the engine on top of a transport. `transport_rx` must be the
    /// event receiver returned by [`SerialInterface::spawn`].
    pub fn spawn(
        interface: SerialInterface,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        settings: ProtocolSettings,
        max_telemetry_rate_hz: f64,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = watch::channel(EngineMetrics::default());

        let engine = Engine::new(
            interface.clone(),
            events_tx.clone(),
            metrics_tx,
            settings.request_timeout(),
            max_telemetry_rate_hz,
        );
        tokio::spawn(engine.run(cmd_rx, transport_rx));

        (Self { interface, cmd_tx, events_tx, metrics_rx, settings }, events_rx)
    }

    /// Get reference to the serial interface
    pub fn interface(&self) -> &SerialInterface {
        &self.interface
    }

    pub fn is_connected(&self) -> bool {
        self.interface.is_connected()
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.metrics_rx.borrow().clone()
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<EngineMetrics> {
        self.metrics_rx.clone()
    }

    /// Send one raw shell command with a correlation tag and wait for its reply.
    pub async fn send_command(&self, command: &str) -> Result<DeviceResponse> {
        let (tx, rx) = oneshot::channel();
        self.request(EngineCommand::Request { command: command.to_string(), responder: tx }).await?;
        rx.await.map_err(|_| engine_stopped())?
    }

    pub async fn read_property(&self, path: &str) -> Result<DeviceResponse> {
        self.send_command(&format!("r {}", path)).await
    }

    /// Write a property. A reply carrying an error marker becomes
    /// [`SerialError::Device`].
    pub async fn write_property(&self, path: &str, value: impl Display) -> Result<()> {
        let command = format!("w {} {}", path, value);
        match self.send_command(command.trim_end()).await? {
            DeviceResponse::Success(_) => Ok(()),
            DeviceResponse::Failure(text) => Err(SerialError::Device(text)),
        }
    }

    pub async fn request_axis_state(&self, state: &str) -> Result<()> {
        self.write_property(CONTROL_MODE_PATH, state).await
    }

    /// Put the axis into idle and clear errors.
    ///
    /// Never refuses: when disconnected it only announces the stop. Both steps
    /// run even if the first fails, the event is always emitted, and the first
    /// error (if any) is returned afterwards.
    pub async fn emergency_stop(&self) -> Result<()> {
        if !self.is_connected() {
            log::warn!("Emergency stop requested while disconnected");
            self.emit(EngineEvent::EmergencyStop);
            return Ok(());
        }

        log::warn!("Emergency stop");
        let idle = self.request_axis_state("idle").await;
        if let Err(e) = &idle {
            log::error!("Emergency stop: idle request failed: {}", e);
        }
        let cleared = self.write_property("axis0.clear_errors", "").await;
        if let Err(e) = &cleared {
            log::error!("Emergency stop: clearing errors failed: {}", e);
        }

        self.emit(EngineEvent::EmergencyStop);
        idle.and(cleared)
    }

    pub async fn calibrate_motor(&self) -> Result<()> {
        self.calibrate("motor_calibration", EngineEvent::MotorCalibrated).await
    }

    pub async fn calibrate_encoder(&self) -> Result<()> {
        self.calibrate("encoder_offset_calibration", EngineEvent::EncoderCalibrated).await
    }

    async fn calibrate(&self, state: &str, done: EngineEvent) -> Result<()> {
        log::info!("Starting {}", state);
        self.write_property(REQUESTED_STATE_PATH, state).await?;

        timeout(self.settings.calibration_timeout(), self.wait_for_idle())
            .await
            .map_err(|_| {
                log::warn!("{} did not finish within {:?}", state, self.settings.calibration_timeout());
                SerialError::Timeout
            })??;

        log::info!("{} complete", state);
        self.emit(done);
        Ok(())
    }

    async fn wait_for_idle(&self) -> Result<()> {
        loop {
            sleep(self.settings.state_poll_interval()).await;
            match self.read_property(CURRENT_STATE_PATH).await? {
                DeviceResponse::Success(value) if reads_idle(&value) => return Ok(()),
                DeviceResponse::Success(_) => {}
                DeviceResponse::Failure(text) => return Err(SerialError::Device(text)),
            }
        }
    }

    /// Start (or restart) the telemetry poll loop. Returns the effective rate.
    pub async fn start_telemetry(&self, keys: Vec<String>, rate_hz: f64) -> Result<f64> {
        let (tx, rx) = oneshot::channel();
        self.request(EngineCommand::StartTelemetry { keys, rate_hz, responder: tx }).await?;
        rx.await.map_err(|_| engine_stopped())?
    }

    pub async fn stop_telemetry(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(EngineCommand::StopTelemetry { responder: tx }).await?;
        rx.await.map_err(|_| engine_stopped())
    }

    /// Expand a catalog command and send it.
    pub async fn dispatch(&self, interpreter: &CommandInterpreter, key: &str, params: &ParamMap) -> Result<DeviceResponse> {
        let command = interpreter.expand(key, params)?;
        log::debug!("Dispatching '{}' as '{}'", key, command);
        self.send_command(&command).await
    }

    /// Firmware version as `v<major>.<minor>.<revision>`
    pub async fn firmware_version(&self) -> Result<String> {
        let major = self.read_number("fw_version_major").await?;
        let minor = self.read_number("fw_version_minor").await?;
        let revision = self.read_number("fw_version_revision").await?;
        Ok(format!("v{}.{}.{}", major as i64, minor as i64, revision as i64))
    }

    async fn read_number(&self, path: &str) -> Result<f64> {
        match self.read_property(path).await? {
            DeviceResponse::Success(ResponseValue::Number(n)) => Ok(n),
            DeviceResponse::Success(other) => {
                Err(SerialError::ProtocolError(format!("Expected a number for {}, got '{}'", path, other)))
            }
            DeviceResponse::Failure(text) => Err(SerialError::Device(text)),
        }
    }

    /// Stop the engine. Outstanding requests fail with a protocol error.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Shutdown).await;
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn request(&self, cmd: EngineCommand) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| engine_stopped())
    }
}

fn engine_stopped() -> SerialError {
    SerialError::ProtocolError("engine stopped".into())
}

fn reads_idle(value: &ResponseValue) -> bool {
    match value {
        ResponseValue::Number(code) => AxisState::from_code(*code) == AxisState::Idle,
        ResponseValue::Text(text) => AxisState::from_name(text) == Some(AxisState::Idle),
        ResponseValue::Bool(_) => false,
    }
}
