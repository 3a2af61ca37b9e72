//! On-disk catalog format.
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_newline() -> String {
    "\n".to_string()
}

/// A whole catalog file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gui_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default = "default_newline")]
    pub newline: String,
    pub commands: Vec<CommandDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    /// Wire text with `{name}` placeholders
    pub template: String,
    #[serde(default)]
    pub params: Vec<CommandParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandParameter {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<ParamOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamOption {
    pub value: String,
    pub label: String,
}

/// Outcome of checking parameters against a command definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub(crate) fn from_findings(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self { valid: errors.is_empty(), errors, warnings }
    }
}
