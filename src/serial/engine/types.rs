//! Records shared by the protocol engine task and its handle.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::serial::{PortDescriptor, Result};
use crate::telemetry::TelemetrySample;

/// Parsed value of a successful reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for ResponseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseValue::Number(n) => write!(f, "{}", n),
            ResponseValue::Bool(b) => write!(f, "{}", b),
            ResponseValue::Text(t) => f.write_str(t),
        }
    }
}

/// Outcome reported by the device for one correlated request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceResponse {
    Success(ResponseValue),
    /// Reply text containing an error marker, tag removed
    Failure(String),
}

impl DeviceResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, DeviceResponse::Success(_))
    }

    pub fn value(&self) -> Option<&ResponseValue> {
        match self {
            DeviceResponse::Success(value) => Some(value),
            DeviceResponse::Failure(_) => None,
        }
    }
}

/// Events delivered to the single consumer of the protocol engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connected(PortDescriptor),
    Disconnected { port: String, unexpected: bool },
    TransportError(String),
    Reconnecting { attempt: u32, max: u32 },
    ReconnectFailed { attempt: u32, error: String },
    ReconnectExhausted { attempts: u32 },
    Telemetry(TelemetrySample),
    TelemetryStarted { keys: Vec<String>, rate_hz: f64 },
    TelemetryStopped,
    EmergencyStop,
    MotorCalibrated,
    EncoderCalibrated,
}

#[derive(Debug)]
pub enum EngineCommand {
    Request { command: String, responder: oneshot::Sender<Result<DeviceResponse>> },
    StartTelemetry { keys: Vec<String>, rate_hz: f64, responder: oneshot::Sender<Result<f64>> },
    StopTelemetry { responder: oneshot::Sender<()> },
    Shutdown,
}

/// Counters published by the engine task after every change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub lines_read: u64,
    pub requests_sent: u64,
    pub replies_matched: u64,
    /// Replies whose tag had no pending request (late or unknown)
    pub stray_replies: u64,
    pub timeouts: u64,
    pub telemetry_frames: u64,
    pub telemetry_dropped: u64,
    pub unclassified_lines: u64,
    pub pending: usize,
}

/// Routing decision for one inbound line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Reply { tag: String, body: String },
    Telemetry,
    Unrecognized,
}

const TAG_MARKER: &str = "#req_";

/// Classify a trimmed line from the wire.
///
/// A `#req_<digits>` marker anywhere in the line makes it a reply; the body is
/// the line with the marker removed. Otherwise a comma without any `#` makes
/// it a telemetry frame.
pub fn classify_line(line: &str) -> LineKind {
    let mut search_from = 0;
    while let Some(offset) = line[search_from..].find(TAG_MARKER) {
        let start = search_from + offset;
        let digits_start = start + TAG_MARKER.len();
        let digits = line[digits_start..].bytes().take_while(u8::is_ascii_digit).count();
        if digits > 0 {
            let end = digits_start + digits;
            let body = format!("{} {}", line[..start].trim(), line[end..].trim());
            return LineKind::Reply {
                tag: line[start + 1..end].to_string(),
                body: body.trim().to_string(),
            };
        }
        search_from = digits_start;
    }

    if crate::telemetry::is_telemetry_frame(line) {
        LineKind::Telemetry
    } else {
        LineKind::Unrecognized
    }
}

/// Interpret a reply body with its tag already stripped.
pub fn parse_response(body: &str) -> DeviceResponse {
    let text = body.trim();
    let lower = text.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("failed") {
        return DeviceResponse::Failure(text.to_string());
    }

    if let Ok(number) = text.parse::<f64>() {
        if !number.is_nan() {
            return DeviceResponse::Success(ResponseValue::Number(number));
        }
    }

    match lower.as_str() {
        "true" => DeviceResponse::Success(ResponseValue::Bool(true)),
        "false" => DeviceResponse::Success(ResponseValue::Bool(false)),
        _ => DeviceResponse::Success(ResponseValue::Text(text.to_string())),
    }
}
