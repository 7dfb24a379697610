//! Host component adapters, one per role.
//!
//! Each adapter implements exactly one host trait and forwards to a script
//! instance held in an [`InstanceSlot`]. Calls before setup or after
//! cleanup fail with a binding error.

pub mod comparator;
pub mod input_format;
pub mod mapper;
pub mod partitioner;
pub mod reducer;
pub mod slot;

pub use comparator::ComparatorProxy;
pub use input_format::{InputFormatProxy, RecordReaderProxy};
pub use mapper::MapperProxy;
pub use partitioner::PartitionerProxy;
pub use reducer::ReducerProxy;
pub use slot::InstanceSlot;
