/// Per-generation characteristics, handshake encoding and record timestamps
pub mod dialect;
mod machine;

pub use dialect::DeviceDialect;
pub use machine::{progress_percent, HistoryService};
