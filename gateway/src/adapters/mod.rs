//! In-process transports and stores
//!
//! These implement the plugin traits from `kanava-core` without any
//! external broker or database, so both pipelines can run end to end in one
//! process. Production deployments swap them for real adapters.

pub mod channel;
pub mod fleet;
pub mod jsonl;
pub mod memory_log;

pub use channel::ChannelSource;
pub use fleet::{FleetConfig, SimulatedFleet};
pub use jsonl::JsonLinesStore;
pub use memory_log::{LogReader, MemoryLog};
