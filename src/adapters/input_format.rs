//! Input formats and record readers backed by script classes.

use std::sync::Arc;

use crate::bridge::{
    Arg, BridgeError, ConfigurationResolver, InterpreterHandle, ManagedInstance, OpaqueValue, Role,
};
use crate::host::api::{InputFormat, JobContext, RecordReader, TaskContext, TaskResult};
use crate::host::conf::{Configuration, INPUT_PATHS_KEY};
use crate::host::datum::Datum;

/// Host input format delegating to the class named by `luadoop.input_format`.
///
/// Each host call binds a fresh instance and releases it afterwards.
///
/// ```lua
/// function Lines:splits(job) return { 'a.txt', 'b.txt' } end
/// function Lines:create_record_reader(split, ctx) return Reader:new() end
/// ```
///
/// `create_record_reader` may also return `luadoop.native.line_reader()` to
/// hand reading back to the host.
pub struct InputFormatProxy {
    interpreter: Option<Arc<InterpreterHandle>>,
}

impl InputFormatProxy {
    pub fn new() -> Self {
        Self { interpreter: None }
    }

    pub fn with_interpreter(interpreter: Arc<InterpreterHandle>) -> Self {
        Self {
            interpreter: Some(interpreter),
        }
    }

    fn interpreter(&self) -> Result<Arc<InterpreterHandle>, BridgeError> {
        match &self.interpreter {
            Some(interpreter) => Ok(Arc::clone(interpreter)),
            None => InterpreterHandle::acquire(),
        }
    }

    fn instance(&self, conf: &Configuration) -> Result<ManagedInstance, BridgeError> {
        ManagedInstance::for_role(self.interpreter()?, conf, Role::InputFormat)
    }

    /// Register input paths on a job configuration.
    ///
    /// When an input format class is configured and defines
    /// `set_input_paths(job, paths)` at class level, that method decides
    /// what to store. Otherwise the paths go to `luadoop.input.paths`.
    pub fn set_input_paths(&self, conf: &mut Configuration, paths: &str) -> Result<(), BridgeError> {
        if !conf.contains_key(Role::InputFormat.config_key()) {
            conf.set(INPUT_PATHS_KEY, paths);
            return Ok(());
        }

        let interpreter = self.interpreter()?;
        let resolver = ConfigurationResolver::new(Arc::clone(&interpreter));
        let class = resolver.resolve_class(conf, Role::InputFormat)?;
        let mut class_handle = ManagedInstance::wrap(interpreter, class.value, class.name)?;

        let outcome =
            class_handle.call_if_supported::<()>("set_input_paths", vec![Arg::Job(&mut *conf), Arg::Text(paths)]);
        class_handle.release();

        if outcome?.is_none() {
            conf.set(INPUT_PATHS_KEY, paths);
        }
        Ok(())
    }
}

impl Default for InputFormatProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl InputFormat for InputFormatProxy {
    fn get_splits(&mut self, job: &JobContext) -> TaskResult<Vec<Datum>> {
        let mut instance = self.instance(&job.configuration)?;
        let mut scratch = job.configuration.clone();
        let splits = instance.call::<Datum>("splits", vec![Arg::Job(&mut scratch)]);
        instance.release();

        match splits? {
            Datum::List(items) => Ok(items),
            Datum::Null => Ok(Vec::new()),
            other => Err(BridgeError::invocation(
                "splits",
                format!("expected a list of splits, got {}", other),
            )
            .into()),
        }
    }

    fn create_record_reader(
        &mut self,
        split: &Datum,
        ctx: &mut dyn TaskContext,
    ) -> TaskResult<Box<dyn RecordReader>> {
        let conf = ctx.configuration().clone();
        let mut instance = self.instance(&conf)?;
        let interpreter = Arc::clone(instance.interpreter());
        let reader = instance.call::<Option<OpaqueValue>>(
            "create_record_reader",
            vec![Arg::Datum(split), Arg::Context(ctx)],
        );
        let class_name = instance.class_name().to_string();
        instance.release();

        let reader = reader?.ok_or_else(|| {
            BridgeError::invocation("create_record_reader", format!("{} returned nil", class_name))
        })?;

        if let Some(native) = interpreter.take_native_reader(&reader)? {
            tracing::debug!(class = %class_name, "using host-native record reader");
            return Ok(native);
        }

        let label = format!("{} record reader", class_name);
        Ok(Box::new(RecordReaderProxy::new(interpreter, reader, label)?))
    }
}

/// Host record reader wrapping a script reader object.
///
/// Every method is required on the script side. `close` also releases the
/// binding; the reader can't be used afterwards.
pub struct RecordReaderProxy {
    instance: Option<ManagedInstance>,
}

impl RecordReaderProxy {
    pub fn new(
        interpreter: Arc<InterpreterHandle>,
        reader: OpaqueValue,
        label: impl Into<String>,
    ) -> Result<Self, BridgeError> {
        Ok(Self {
            instance: Some(ManagedInstance::wrap(interpreter, reader, label)?),
        })
    }

    fn active(&self, method: &str) -> Result<&ManagedInstance, BridgeError> {
        self.instance.as_ref().ok_or_else(|| {
            tracing::error!(method, "record reader used after close");
            BridgeError::binding(format!("record reader called ('{}') after close", method))
        })
    }
}

impl RecordReader for RecordReaderProxy {
    fn initialize(&mut self, split: &Datum, ctx: &mut dyn TaskContext) -> TaskResult<()> {
        self.active("initialize")?
            .call::<()>("initialize", vec![Arg::Datum(split), Arg::Context(ctx)])?;
        Ok(())
    }

    fn next_key_value(&mut self) -> TaskResult<bool> {
        Ok(self.active("next_key_value")?.call("next_key_value", vec![])?)
    }

    fn current_key(&mut self) -> TaskResult<Datum> {
        Ok(self.active("current_key")?.call("current_key", vec![])?)
    }

    fn current_value(&mut self) -> TaskResult<Datum> {
        Ok(self.active("current_value")?.call("current_value", vec![])?)
    }

    fn progress(&mut self) -> TaskResult<f64> {
        Ok(self.active("progress")?.call("progress", vec![])?)
    }

    fn close(&mut self) -> TaskResult<()> {
        let Some(mut instance) = self.instance.take() else {
            return Ok(());
        };
        let closed = instance.call::<()>("close", vec![]);
        instance.release();
        closed?;
        Ok(())
    }
}
