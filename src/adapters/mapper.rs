//! Mapper backed by a script class.

use std::sync::Arc;

use crate::adapters::slot::InstanceSlot;
use crate::bridge::{Arg, InterpreterHandle, ManagedInstance, Role};
use crate::host::api::{Mapper, TaskContext, TaskResult};
use crate::host::datum::Datum;

/// Host mapper delegating to the class named by `luadoop.mapper`.
///
/// Script side:
///
/// ```lua
/// local Mapper = luadoop.class()
/// function Mapper:setup(ctx) end            -- optional
/// function Mapper:map(key, value, ctx) ctx:write(value, 1) end
/// function Mapper:cleanup(ctx) end          -- optional
/// ```
pub struct MapperProxy {
    slot: InstanceSlot,
}

impl MapperProxy {
    pub fn new() -> Self {
        Self {
            slot: InstanceSlot::new(Role::Mapper),
        }
    }

    pub fn with_interpreter(interpreter: Arc<InterpreterHandle>) -> Self {
        Self {
            slot: InstanceSlot::with_interpreter(Role::Mapper, interpreter),
        }
    }

    pub fn instance(&self) -> Option<&ManagedInstance> {
        self.slot.instance()
    }
}

impl Default for MapperProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl Mapper for MapperProxy {
    fn setup(&mut self, ctx: &mut dyn TaskContext) -> TaskResult<()> {
        let conf = ctx.configuration().clone();
        let instance = self.slot.bind(&conf)?;
        instance.call_if_supported::<()>("setup", vec![Arg::Context(ctx)])?;
        Ok(())
    }

    fn map(&mut self, key: Datum, value: Datum, ctx: &mut dyn TaskContext) -> TaskResult<()> {
        self.slot
            .active("map")?
            .call::<()>("map", vec![Arg::Datum(&key), Arg::Datum(&value), Arg::Context(ctx)])?;
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut dyn TaskContext) -> TaskResult<()> {
        self.slot.finish(vec![Arg::Context(ctx)])?;
        Ok(())
    }
}
