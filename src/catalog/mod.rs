//! Declarative command catalog: templates plus parameter schemas, loaded from
//! JSON and expanded into shell command lines.

pub mod definition;
pub mod interpreter;
pub mod rules;

pub use definition::{CommandConfig, CommandDefinition, CommandParameter, ParamOption, ValidationResult};
pub use interpreter::CommandInterpreter;

/// Parameter values supplied by a caller, keyed by parameter name
pub type ParamMap = serde_json::Map<String, serde_json::Value>;

/// Emitted by [`CommandInterpreter`] loads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    Loaded { command_count: usize, category_count: usize },
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to load command catalog: {0}")]
    Load(String),

    #[error("Command '{0}' does not exist")]
    UnknownKey(String),

    #[error("Parameter validation failed: {}", .0.join(", "))]
    ValidationFailed(Vec<String>),

    #[error("Command '{key}' left placeholder '{{{placeholder}}}' unresolved")]
    UnresolvedPlaceholder { key: String, placeholder: String },

    #[error("Catalog I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CatalogError>;
