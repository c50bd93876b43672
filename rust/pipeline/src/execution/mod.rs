pub(crate) mod aggregator;
pub(crate) mod backpressure;
pub mod memory;
pub(crate) mod producer;
pub(crate) mod tracker;
pub(crate) mod transform;

pub use backpressure::ChunkStream;
pub use memory::{ManualMemoryProbe, MemoryProbe};
