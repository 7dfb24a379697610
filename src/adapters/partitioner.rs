//! Partitioner backed by a script class.

use std::sync::Arc;

use crate::adapters::slot::InstanceSlot;
use crate::bridge::{Arg, InterpreterHandle, Role};
use crate::host::api::{Configurable, Partitioner, TaskResult};
use crate::host::conf::Configuration;
use crate::host::datum::Datum;

/// Host partitioner delegating `partition(key, value, n)` to a script.
///
/// The script's integer is returned as is, only truncated to `i32` width.
/// Range checking is the framework's business.
pub struct PartitionerProxy {
    slot: InstanceSlot,
    conf: Option<Configuration>,
}

impl PartitionerProxy {
    pub fn new() -> Self {
        Self {
            slot: InstanceSlot::new(Role::Partitioner),
            conf: None,
        }
    }

    pub fn with_interpreter(interpreter: Arc<InterpreterHandle>) -> Self {
        Self {
            slot: InstanceSlot::with_interpreter(Role::Partitioner, interpreter),
            conf: None,
        }
    }
}

impl Default for PartitionerProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl Configurable for PartitionerProxy {
    fn set_conf(&mut self, conf: &Configuration) -> TaskResult<()> {
        self.conf = Some(conf.clone());
        let instance = self.slot.bind(conf)?;
        instance.call_if_supported::<()>("setup", vec![Arg::Conf(conf)])?;
        Ok(())
    }

    fn conf(&self) -> Option<&Configuration> {
        self.conf.as_ref()
    }
}

impl Partitioner for PartitionerProxy {
    fn get_partition(&mut self, key: &Datum, value: &Datum, num_partitions: i32) -> TaskResult<i32> {
        let partition: i64 = self.slot.active("partition")?.call(
            "partition",
            vec![
                Arg::Datum(key),
                Arg::Datum(value),
                Arg::Int(i64::from(num_partitions)),
            ],
        )?;
        Ok(partition as i32)
    }

    fn close(&mut self) -> TaskResult<()> {
        self.slot.finish(vec![])?;
        Ok(())
    }
}
