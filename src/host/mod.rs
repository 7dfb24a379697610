//! The batch framework's side of the contract.
//!
//! Component traits, the record value type, job configuration and a small
//! sequential engine that runs jobs in-process.

pub mod api;
pub mod conf;
pub mod datum;
pub mod local;

pub use api::{
    Configurable, InputFormat, JobContext, Mapper, Partitioner, RawComparator, RecordReader,
    Reducer, TaskContext, TaskError, TaskResult,
};
pub use conf::Configuration;
pub use datum::Datum;
