//! Component contracts of the batch framework.
//!
//! The framework instantiates one component per task attempt and drives it
//! through a fixed lifecycle. Script-backed adapters implement these traits;
//! so do the native components in [`crate::host::local`].

use std::error::Error;
use std::fmt;

use crate::bridge::BridgeError;
use crate::host::conf::Configuration;
use crate::host::datum::Datum;

/// Error type declared by every fallible host method
#[derive(Debug)]
pub struct TaskError {
    message: String,
    source: Option<Box<dyn Error + Send + Sync>>,
}

pub type TaskResult<T> = Result<T, TaskError>;

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The bridge error this task error wraps, if any
    pub fn bridge_error(&self) -> Option<&BridgeError> {
        self.source.as_ref()?.downcast_ref::<BridgeError>()
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for TaskError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

impl From<BridgeError> for TaskError {
    fn from(err: BridgeError) -> Self {
        Self {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        Self {
            message: format!("I/O error: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

/// Per-attempt services handed to components
pub trait TaskContext {
    fn configuration(&self) -> &Configuration;

    fn task_attempt_id(&self) -> &str;

    /// Emit one output record
    fn write(&mut self, key: Datum, value: Datum) -> TaskResult<()>;

    fn increment_counter(&mut self, group: &str, name: &str, amount: i64);

    fn set_status(&mut self, status: &str);
}

/// Job-level view used while planning input splits
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub job_name: String,
    pub configuration: Configuration,
}

impl JobContext {
    pub fn new(job_name: impl Into<String>, configuration: Configuration) -> Self {
        Self {
            job_name: job_name.into(),
            configuration,
        }
    }
}

/// Map-side component
pub trait Mapper {
    fn setup(&mut self, _ctx: &mut dyn TaskContext) -> TaskResult<()> {
        Ok(())
    }

    fn map(&mut self, key: Datum, value: Datum, ctx: &mut dyn TaskContext) -> TaskResult<()>;

    fn cleanup(&mut self, _ctx: &mut dyn TaskContext) -> TaskResult<()> {
        Ok(())
    }

    /// Drive the whole lifecycle over every record of `reader`.
    ///
    /// `cleanup` runs even when a `map` call fails; the first error wins.
    fn run(&mut self, reader: &mut dyn RecordReader, ctx: &mut dyn TaskContext) -> TaskResult<()> {
        self.setup(ctx)?;
        let mapped = map_records(self, reader, ctx);
        let cleaned = self.cleanup(ctx);
        mapped.and(cleaned)
    }
}

fn map_records<M: Mapper + ?Sized>(
    mapper: &mut M,
    reader: &mut dyn RecordReader,
    ctx: &mut dyn TaskContext,
) -> TaskResult<()> {
    while reader.next_key_value()? {
        let key = reader.current_key()?;
        let value = reader.current_value()?;
        mapper.map(key, value, ctx)?;
    }
    Ok(())
}

/// Reduce-side component, also used for combiners
pub trait Reducer {
    fn setup(&mut self, _ctx: &mut dyn TaskContext) -> TaskResult<()> {
        Ok(())
    }

    /// Reduce one key group. `values` is single pass.
    fn reduce(
        &mut self,
        key: Datum,
        values: &mut dyn Iterator<Item = Datum>,
        ctx: &mut dyn TaskContext,
    ) -> TaskResult<()>;

    fn cleanup(&mut self, _ctx: &mut dyn TaskContext) -> TaskResult<()> {
        Ok(())
    }
}

/// Components the framework configures after construction
pub trait Configurable {
    fn set_conf(&mut self, conf: &Configuration) -> TaskResult<()>;

    fn conf(&self) -> Option<&Configuration>;
}

pub trait Partitioner {
    /// Partition for a record; the framework expects `0..num_partitions`
    fn get_partition(&mut self, key: &Datum, value: &Datum, num_partitions: i32) -> TaskResult<i32>;

    fn close(&mut self) -> TaskResult<()> {
        Ok(())
    }
}

/// Ordering over keys, in object and serialized form
pub trait RawComparator {
    fn compare(&mut self, a: &Datum, b: &Datum) -> TaskResult<i32>;

    /// Compare `b1[s1..s1 + l1]` against `b2[s2..s2 + l2]`
    fn compare_raw(
        &mut self,
        b1: &[u8],
        s1: usize,
        l1: usize,
        b2: &[u8],
        s2: usize,
        l2: usize,
    ) -> TaskResult<i32>;

    fn close(&mut self) -> TaskResult<()> {
        Ok(())
    }
}

pub trait RecordReader: Send {
    fn initialize(&mut self, split: &Datum, ctx: &mut dyn TaskContext) -> TaskResult<()>;

    /// Advance to the next record, `false` at end of input
    fn next_key_value(&mut self) -> TaskResult<bool>;

    fn current_key(&mut self) -> TaskResult<Datum>;

    fn current_value(&mut self) -> TaskResult<Datum>;

    /// Fraction of the split consumed, in `0.0..=1.0`
    fn progress(&mut self) -> TaskResult<f64>;

    fn close(&mut self) -> TaskResult<()>;
}

pub trait InputFormat {
    fn get_splits(&mut self, job: &JobContext) -> TaskResult<Vec<Datum>>;

    fn create_record_reader(
        &mut self,
        split: &Datum,
        ctx: &mut dyn TaskContext,
    ) -> TaskResult<Box<dyn RecordReader>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_exposes_bridge_error() {
        let err: TaskError = BridgeError::invocation("map", "boom").into();
        assert_eq!(err.to_string(), "Invocation of 'map' failed: boom");
        let inner = err.bridge_error().unwrap();
        assert!(inner.is_invocation());
        assert!(err.source().is_some());
    }

    #[test]
    fn test_plain_task_error_has_no_bridge_error() {
        let err = TaskError::new("disk full");
        assert!(err.bridge_error().is_none());

        let io: TaskError = std::io::Error::new(std::io::ErrorKind::Other, "nope").into();
        assert!(io.bridge_error().is_none());
        assert!(io.message().contains("nope"));
    }
}
