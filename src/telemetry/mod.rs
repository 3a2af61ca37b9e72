//! Periodic multi-key polling and positional decoding of telemetry frames.
//!
//! The scheduler is plain state owned by the protocol engine task: the engine
//! awaits [`TelemetryScheduler::tick`] in its select loop, writes the batch
//! request, and hands comma-separated lines to [`TelemetryScheduler::decode`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::serial::{Result, SerialError};

/// Marker appended to batch requests instead of a correlation tag
pub const TELEMETRY_MARKER: &str = "#telemetry";

/// Axis state machine as reported by `axis0.current_state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisState {
    #[default]
    Idle,
    StartupCalibration,
    FullCalibrationSequence,
    MotorCalibration,
    SensorlessControl,
    EncoderIndexSearch,
    EncoderOffsetCalibration,
    ClosedLoopControl,
    LockinSpin,
    Escaping,
}

impl AxisState {
    /// Unknown codes fall back to `Idle`.
    pub fn from_code(code: f64) -> Self {
        match code.round() as i64 {
            1 => AxisState::StartupCalibration,
            2 => AxisState::FullCalibrationSequence,
            3 => AxisState::MotorCalibration,
            4 => AxisState::SensorlessControl,
            5 => AxisState::EncoderIndexSearch,
            6 => AxisState::EncoderOffsetCalibration,
            7 => AxisState::ClosedLoopControl,
            8 => AxisState::LockinSpin,
            9 => AxisState::Escaping,
            _ => AxisState::Idle,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let state = match name.trim().to_ascii_lowercase().as_str() {
            "idle" => AxisState::Idle,
            "startup_calibration" => AxisState::StartupCalibration,
            "full_calibration_sequence" => AxisState::FullCalibrationSequence,
            "motor_calibration" => AxisState::MotorCalibration,
            "sensorless_control" => AxisState::SensorlessControl,
            "encoder_index_search" => AxisState::EncoderIndexSearch,
            "encoder_offset_calibration" => AxisState::EncoderOffsetCalibration,
            "closed_loop_control" => AxisState::ClosedLoopControl,
            "lockin_spin" => AxisState::LockinSpin,
            "escaping" => AxisState::Escaping,
            _ => return None,
        };
        Some(state)
    }
}

/// Controller mode as reported by `axis0.control_mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Voltage,
    Current,
    Velocity,
    Position,
    #[default]
    Idle,
}

impl ControlMode {
    pub fn from_code(code: f64) -> Self {
        match code.round() as i64 {
            0 => ControlMode::Voltage,
            1 => ControlMode::Current,
            2 => ControlMode::Velocity,
            3 => ControlMode::Position,
            _ => ControlMode::Idle,
        }
    }
}

/// One decoded telemetry frame. Fields whose key was not polled stay at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub bus_voltage: f64,
    pub bus_current: f64,
    pub iq: f64,
    pub vq: f64,
    pub velocity: f64,
    pub position: f64,
    pub temperature: f64,
    pub axis_state: AxisState,
    pub control_mode: ControlMode,
}

impl TelemetrySample {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            bus_voltage: 0.0,
            bus_current: 0.0,
            iq: 0.0,
            vq: 0.0,
            velocity: 0.0,
            position: 0.0,
            temperature: 0.0,
            axis_state: AxisState::default(),
            control_mode: ControlMode::default(),
        }
    }

    /// Store `value` under the attribute polled by `key`. Returns false for
    /// keys with no attribute.
    fn apply(&mut self, key: &str, value: f64) -> bool {
        match key {
            "vbus_voltage" => self.bus_voltage = value,
            "ibus" => self.bus_current = value,
            "iq" => self.iq = value,
            "vq" => self.vq = value,
            "vel_estimate" => self.velocity = value,
            "pos_estimate" => self.position = value,
            "temperature" => self.temperature = value,
            "current_state" => self.axis_state = AxisState::from_code(value),
            "control_mode" => self.control_mode = ControlMode::from_code(value),
            _ => return false,
        }
        true
    }
}

/// True for lines shaped like a telemetry frame: a field separator and no
/// tag marker.
pub fn is_telemetry_frame(line: &str) -> bool {
    line.contains(',') && !line.contains('#')
}

/// `r axis0.<k1> ; r axis0.<k2> ... #telemetry\n`
pub fn build_batch_request(keys: &[String]) -> String {
    let reads: Vec<String> = keys.iter().map(|key| format!("r axis0.{}", key)).collect();
    format!("{} {}\n", reads.join(" ; "), TELEMETRY_MARKER)
}

/// Map a comma-separated frame onto a sample by key position.
///
/// The frame is rejected unless it has exactly one field per key. Fields that
/// do not parse (or parse to NaN) leave their attribute at zero.
pub fn decode_frame(keys: &[String], line: &str, timestamp: DateTime<Utc>) -> Option<TelemetrySample> {
    let fields: Vec<&str> = line.split(',').collect();
    if keys.is_empty() || fields.len() != keys.len() {
        return None;
    }

    let mut sample = TelemetrySample::new(timestamp);
    for (key, field) in keys.iter().zip(fields) {
        let Ok(value) = field.trim().parse::<f64>() else { continue };
        if value.is_nan() {
            continue;
        }
        sample.apply(key, value);
    }
    Some(sample)
}

/// Telemetry poll loop state
pub struct TelemetryScheduler {
    keys: Vec<String>,
    rate_hz: f64,
    max_rate_hz: f64,
    interval: Option<Interval>,
    /// Bumped on every start; identifies which key set a batch was built for
    generation: u64,
    awaiting_first_batch: bool,
}

impl TelemetryScheduler {
    pub fn new(max_rate_hz: f64) -> Self {
        Self {
            keys: Vec::new(),
            rate_hz: 0.0,
            max_rate_hz,
            interval: None,
            generation: 0,
            awaiting_first_batch: false,
        }
    }

    /// Replace the poll configuration and (re)start the loop. Returns the
    /// effective rate after clamping to the ceiling.
    ///
    /// The first batch goes out one period after this call.
    pub fn start(&mut self, keys: Vec<String>, rate_hz: f64) -> Result<f64> {
        if keys.is_empty() {
            return Err(SerialError::InvalidArgument("telemetry key list is empty".into()));
        }
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(SerialError::InvalidArgument(format!("telemetry rate must be positive, got {}", rate_hz)));
        }

        self.stop();
        let rate = rate_hz.min(self.max_rate_hz);
        let period = Duration::from_secs_f64(1.0 / rate);
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.keys = keys;
        self.rate_hz = rate;
        self.interval = Some(interval);
        self.generation = self.generation.wrapping_add(1);
        self.awaiting_first_batch = true;
        Ok(rate)
    }

    /// Cancel the loop. Returns whether it was running. The key list is kept
    /// so frames still in flight decode against it.
    pub fn stop(&mut self) -> bool {
        self.interval.take().is_some()
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn rate_hz(&self) -> f64 {
        self.rate_hz
    }

    /// Resolves at the next poll instant; never resolves while stopped.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    pub fn batch_request(&self) -> String {
        build_batch_request(&self.keys)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Record that a batch built under `generation` reached the wire. Batches
    /// for a replaced key set leave the gate closed.
    pub fn batch_sent(&mut self, generation: u64) {
        if generation == self.generation {
            self.awaiting_first_batch = false;
        }
    }

    /// Decode a frame against the active key set. Frames arriving after a
    /// restart but before the new configuration's first batch was written
    /// answer the previous key set and are dropped.
    pub fn decode(&self, line: &str) -> Option<TelemetrySample> {
        if self.awaiting_first_batch {
            return None;
        }
        decode_frame(&self.keys, line, Utc::now())
    }
}
