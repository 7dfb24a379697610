//! Reducer and combiner backed by a script class.

use std::sync::Arc;

use crate::adapters::slot::InstanceSlot;
use crate::bridge::{Arg, InterpreterHandle, ManagedInstance, Role};
use crate::host::api::{Reducer, TaskContext, TaskResult};
use crate::host::datum::Datum;

/// Host reducer delegating to `luadoop.reducer` or `luadoop.combiner`.
///
/// The script receives values as an iterator function, pulled one at a
/// time from the host:
///
/// ```lua
/// function Sum:reduce(key, values, ctx)
///   local total = 0
///   for v in values do total = total + v end
///   ctx:write(key, total)
/// end
/// ```
pub struct ReducerProxy {
    slot: InstanceSlot,
}

impl ReducerProxy {
    pub fn reducer() -> Self {
        Self {
            slot: InstanceSlot::new(Role::Reducer),
        }
    }

    pub fn combiner() -> Self {
        Self {
            slot: InstanceSlot::new(Role::Combiner),
        }
    }

    /// `role` must be `Role::Reducer` or `Role::Combiner`
    pub fn with_interpreter(role: Role, interpreter: Arc<InterpreterHandle>) -> Self {
        Self {
            slot: InstanceSlot::with_interpreter(role, interpreter),
        }
    }

    pub fn role(&self) -> Role {
        self.slot.role()
    }

    pub fn instance(&self) -> Option<&ManagedInstance> {
        self.slot.instance()
    }
}

impl Reducer for ReducerProxy {
    fn setup(&mut self, ctx: &mut dyn TaskContext) -> TaskResult<()> {
        let conf = ctx.configuration().clone();
        let instance = self.slot.bind(&conf)?;
        instance.call_if_supported::<()>("setup", vec![Arg::Context(ctx)])?;
        Ok(())
    }

    fn reduce(
        &mut self,
        key: Datum,
        values: &mut dyn Iterator<Item = Datum>,
        ctx: &mut dyn TaskContext,
    ) -> TaskResult<()> {
        self.slot.active("reduce")?.call::<()>(
            "reduce",
            vec![Arg::Datum(&key), Arg::Values(values), Arg::Context(ctx)],
        )?;
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut dyn TaskContext) -> TaskResult<()> {
        self.slot.finish(vec![Arg::Context(ctx)])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::JOB_SETUP_SCRIPT_KEY;
    use crate::host::conf::Configuration;
    use crate::host::local::MemoryContext;
    use std::fs;
    use tempfile::TempDir;

    const SCRIPT: &str = r#"
Count = luadoop.class()
function Count:reduce(key, values, ctx) ctx:write(key, luadoop.count(values)) end

Sum = luadoop.class()
function Sum:reduce(key, values, ctx)
  local total = 0
  for v in values do total = total + v end
  ctx:write(key, total)
end
"#;

    fn context(dir: &TempDir, pairs: &[(&str, &str)]) -> MemoryContext {
        let path = dir.path().join("setup.lua");
        fs::write(&path, SCRIPT).unwrap();
        let mut conf = Configuration::new();
        conf.set(JOB_SETUP_SCRIPT_KEY, path.display().to_string());
        for (k, v) in pairs {
            conf.set(*k, *v);
        }
        MemoryContext::new(conf)
    }

    #[test]
    fn test_reduce_counts_values() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, &[("luadoop.reducer", "Count")]);
        let mut reducer =
            ReducerProxy::with_interpreter(Role::Reducer, InterpreterHandle::isolated().unwrap());

        reducer.setup(&mut ctx).unwrap();
        let mut values = vec![Datum::Int(1), Datum::Null, Datum::Int(3)].into_iter();
        reducer.reduce(Datum::text("k"), &mut values, &mut ctx).unwrap();
        reducer.cleanup(&mut ctx).unwrap();

        assert_eq!(ctx.output(), &[(Datum::text("k"), Datum::Int(3))]);
    }

    #[test]
    fn test_combiner_reads_its_own_key() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, &[("luadoop.reducer", "Count"), ("luadoop.combiner", "Sum")]);
        let mut combiner =
            ReducerProxy::with_interpreter(Role::Combiner, InterpreterHandle::isolated().unwrap());
        assert_eq!(combiner.role(), Role::Combiner);

        combiner.setup(&mut ctx).unwrap();
        assert_eq!(combiner.instance().unwrap().class_name(), "Sum");
        let mut values = vec![Datum::Int(2), Datum::Int(5)].into_iter();
        combiner.reduce(Datum::text("k"), &mut values, &mut ctx).unwrap();
        assert_eq!(ctx.output(), &[(Datum::text("k"), Datum::Int(7))]);
    }
}
