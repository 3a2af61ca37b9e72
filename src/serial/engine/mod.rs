pub mod pending;
pub mod reader;
pub mod types;

pub use pending::{PendingTable, TagAllocator};
pub use types::{
    classify_line, parse_response, DeviceResponse, EngineCommand, EngineEvent, EngineMetrics, LineKind,
    ResponseValue,
};
