//! Application settings, stored as JSON next to the binary or at a path
//! given on the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// `env_logger` filter used when `RUST_LOG` is unset
    pub log_level: String,
    pub auto_connect: bool,
    /// Port to connect to; the first candidate device is used when unset
    pub port: Option<String>,
    pub catalog_path: PathBuf,
    pub serial: SerialSettings,
    pub protocol: ProtocolSettings,
    pub telemetry: TelemetrySettings,
    pub flow: FlowSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            auto_connect: true,
            port: None,
            catalog_path: PathBuf::from("catalog/odrive_commands.json"),
            serial: SerialSettings::default(),
            protocol: ProtocolSettings::default(),
            telemetry: TelemetrySettings::default(),
            flow: FlowSettings::default(),
        }
    }
}

/// Transport behaviour: reconnection and line framing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// A re-established link that stays up this long earns a fresh reconnect budget
    pub reconnect_stable_after_ms: u64,
    pub max_line_length: usize,
    /// A write the port has not accepted within this bound counts as link loss
    pub write_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 5,
            reconnect_stable_after_ms: 10_000,
            max_line_length: crate::serial::codec::DEFAULT_MAX_LINE_LENGTH,
            write_timeout_ms: 2000,
        }
    }
}

impl SerialSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reconnect_stable_after(&self) -> Duration {
        Duration::from_millis(self.reconnect_stable_after_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }
}

/// Request/reply timing of the protocol engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    pub request_timeout_ms: u64,
    pub calibration_timeout_ms: u64,
    pub state_poll_interval_ms: u64,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            calibration_timeout_ms: 30_000,
            state_poll_interval_ms: 100,
        }
    }
}

impl ProtocolSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn calibration_timeout(&self) -> Duration {
        Duration::from_millis(self.calibration_timeout_ms)
    }

    pub fn state_poll_interval(&self) -> Duration {
        Duration::from_millis(self.state_poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Keys polled under `axis0.` by the console entry point
    pub keys: Vec<String>,
    pub rate_hz: f64,
    /// Hard ceiling applied to every requested rate
    pub max_rate_hz: f64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            keys: ["vbus_voltage", "ibus", "vel_estimate", "pos_estimate", "current_state"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            rate_hz: 50.0,
            max_rate_hz: 100.0,
        }
    }
}

/// Flow worker process supervision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    pub worker_program: PathBuf,
    pub worker_args: Vec<String>,
    pub stop_grace_ms: u64,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            worker_program: PathBuf::from("odrive-flow-worker"),
            worker_args: Vec::new(),
            stop_grace_ms: 5000,
        }
    }
}

impl FlowSettings {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl AppSettings {
    /// Read settings from `path`; a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::info!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings = serde_json::from_str(&content)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write settings file {}", path.display()))?;
        Ok(())
    }
}
