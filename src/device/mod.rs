pub mod identify;
pub mod manager;
pub mod models;

pub use identify::{discover_candidates, is_candidate};
pub use manager::DeviceManager;
pub use models::*;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found")]
    NotFound,

    #[error("Device not connected")]
    NotConnected,

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
