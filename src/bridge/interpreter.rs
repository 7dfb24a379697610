//! Managed handle to the embedded Lua runtime.
//!
//! One runtime is shared by every component of the process. It is created
//! lazily by the first [`InterpreterHandle::acquire`] call, under a mutex, so
//! concurrent first use still constructs exactly one runtime. Isolated
//! handles can be built explicitly for the job driver or for tests.
//!
//! The Lua state itself is guarded by a second, reentrant mutex: each
//! evaluation or method call holds it for its whole duration, and host
//! callbacks running inside a call (`ctx:write`, value iterators) may call
//! back into the same handle from the same thread. Lock order is the Lua
//! state, then the setup script latch.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use mlua::{FromLua, FromLuaMulti, Function, Lua, MultiValue, RegistryKey, Scope, Table, UserData, Value};

use crate::bridge::convert::{conf_to_table, datum_to_lua, datum_to_lua_element, lua_to_datum};
use crate::bridge::error::BridgeError;
use crate::bridge::resolver::{Role, JOB_SETUP_SCRIPT_KEY};
use crate::host::api::{RecordReader, TaskContext};
use crate::host::conf::{Configuration, INPUT_PATHS_KEY, OUTPUT_PATH_KEY, REDUCE_TASKS_KEY};
use crate::host::datum::Datum;
use crate::host::local::LineRecordReader;

/// Environment variable listing extra Lua module directories
pub const LOAD_PATH_ENV: &str = "LUADOOP_PATH";

const PRELUDE: &str = include_str!("prelude.lua");

const INVOKER: &str = "return function(method, ...) return method(...) end";

static PROCESS_HANDLE: Mutex<Option<Arc<InterpreterHandle>>> = Mutex::new(None);
static RUNTIMES_CREATED: AtomicUsize = AtomicUsize::new(0);
static NEXT_HANDLE_ID: AtomicUsize = AtomicUsize::new(1);

/// Options for building an interpreter
#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    /// Task interpreters are embedded: `luadoop.run` does nothing in them
    pub embedded: bool,
    /// Directories prepended to `package.path`
    pub load_path: Vec<PathBuf>,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            embedded: true,
            load_path: load_path_from_env(),
        }
    }
}

fn load_path_from_env() -> Vec<PathBuf> {
    std::env::var_os(LOAD_PATH_ENV)
        .map(|raw| {
            std::env::split_paths(&raw)
                .filter(|p| !p.as_os_str().is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Reference to a value living inside an interpreter
#[derive(Debug)]
pub struct OpaqueValue {
    key: RegistryKey,
    type_name: &'static str,
}

impl OpaqueValue {
    /// Lua type of the referenced value ("table", "function", ...)
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl<'lua> FromLua<'lua> for OpaqueValue {
    fn from_lua(value: Value<'lua>, lua: &'lua Lua) -> mlua::Result<Self> {
        let type_name = value.type_name();
        Ok(Self {
            key: lua.create_registry_value(value)?,
            type_name,
        })
    }
}

/// A host-native record reader handed to Lua as userdata
pub(crate) struct NativeReader(Box<dyn RecordReader>);

impl UserData for NativeReader {}

/// Argument passed to a script method
///
/// `Context`, `Values` and `Job` are exposed to Lua through callbacks that
/// are only valid during the call.
pub enum Arg<'a> {
    Datum(&'a Datum),
    Int(i64),
    Float(f64),
    Text(&'a str),
    Bytes(&'a [u8]),
    Object(&'a OpaqueValue),
    /// Read-only configuration snapshot
    Conf(&'a Configuration),
    /// `ctx:write(k, v)`, `ctx:increment_counter(group, name, n)`, `ctx:set_status(s)`
    Context(&'a mut dyn TaskContext),
    /// Lazy single-pass iterator function
    Values(&'a mut dyn Iterator<Item = Datum>),
    /// `job:get(k)` and `job:set(k, v)` over a mutable configuration
    Job(&'a mut Configuration),
}

enum Staged<'a> {
    Plain(Arg<'a>),
    Context(RefCell<&'a mut dyn TaskContext>),
    Values(RefCell<&'a mut dyn Iterator<Item = Datum>>),
    Job(RefCell<&'a mut Configuration>),
}

impl<'a> From<Arg<'a>> for Staged<'a> {
    fn from(arg: Arg<'a>) -> Self {
        match arg {
            Arg::Context(ctx) => Staged::Context(RefCell::new(ctx)),
            Arg::Values(values) => Staged::Values(RefCell::new(values)),
            Arg::Job(conf) => Staged::Job(RefCell::new(conf)),
            plain => Staged::Plain(plain),
        }
    }
}

fn busy(what: &str) -> mlua::Error {
    mlua::Error::runtime(format!("{} is already in use", what))
}

impl<'a> Staged<'a> {
    fn to_lua<'lua, 'scope>(
        &'scope self,
        lua: &'lua Lua,
        scope: &Scope<'lua, 'scope>,
    ) -> mlua::Result<Value<'lua>> {
        match self {
            Staged::Plain(Arg::Datum(datum)) => datum_to_lua(lua, datum),
            Staged::Plain(Arg::Int(i)) => Ok(Value::Integer(*i)),
            Staged::Plain(Arg::Float(f)) => Ok(Value::Number(*f)),
            Staged::Plain(Arg::Text(s)) => Ok(Value::String(lua.create_string(s)?)),
            Staged::Plain(Arg::Bytes(b)) => Ok(Value::String(lua.create_string(b)?)),
            Staged::Plain(Arg::Object(object)) => lua.registry_value(&object.key),
            Staged::Plain(Arg::Conf(conf)) => Ok(Value::Table(conf_to_table(lua, conf)?)),
            // Scoped kinds are always staged into their own variants
            Staged::Plain(_) => Ok(Value::Nil),
            Staged::Context(cell) => {
                let table = lua.create_table()?;
                {
                    let ctx = cell.try_borrow().map_err(|_| busy("context"))?;
                    table.raw_set("configuration", conf_to_table(lua, ctx.configuration())?)?;
                    table.raw_set("task_attempt_id", ctx.task_attempt_id())?;
                }
                table.raw_set(
                    "write",
                    scope.create_function(move |_, (_this, key, value): (Value, Datum, Datum)| {
                        let mut ctx = cell.try_borrow_mut().map_err(|_| busy("context"))?;
                        ctx.write(key, value).map_err(mlua::Error::external)
                    })?,
                )?;
                table.raw_set(
                    "increment_counter",
                    scope.create_function(
                        move |_, (_this, group, name, amount): (Value, String, String, Option<i64>)| {
                            let mut ctx = cell.try_borrow_mut().map_err(|_| busy("context"))?;
                            ctx.increment_counter(&group, &name, amount.unwrap_or(1));
                            Ok(())
                        },
                    )?,
                )?;
                table.raw_set(
                    "set_status",
                    scope.create_function(move |_, (_this, status): (Value, String)| {
                        let mut ctx = cell.try_borrow_mut().map_err(|_| busy("context"))?;
                        ctx.set_status(&status);
                        Ok(())
                    })?,
                )?;
                Ok(Value::Table(table))
            }
            Staged::Values(cell) => {
                let next = scope.create_function(move |lua, ()| {
                    let mut values = cell.try_borrow_mut().map_err(|_| busy("value iterator"))?;
                    match values.next() {
                        Some(datum) => datum_to_lua_element(lua, &datum),
                        None => Ok(Value::Nil),
                    }
                })?;
                Ok(Value::Function(next))
            }
            Staged::Job(cell) => {
                let table = lua.create_table()?;
                table.raw_set(
                    "get",
                    scope.create_function(move |_, (_this, key): (Value, String)| {
                        let conf = cell.try_borrow().map_err(|_| busy("job"))?;
                        Ok(conf.get(&key).map(str::to_string))
                    })?,
                )?;
                table.raw_set(
                    "set",
                    scope.create_function(move |_, (_this, key, value): (Value, String, Datum)| {
                        let mut conf = cell.try_borrow_mut().map_err(|_| busy("job"))?;
                        conf.set(key, value.to_string());
                        Ok(())
                    })?,
                )?;
                Ok(Value::Table(table))
            }
        }
    }
}

/// Text of an interpreter error without the Rust-side wrapping
pub(crate) fn describe_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => describe_error(cause),
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::ExternalError(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

/// Split `A.B.C` or `A::B::C` into segments
pub(crate) fn split_class_path(name: &str) -> Vec<&str> {
    name.split("::").flat_map(|part| part.split('.')).collect()
}

fn is_callable(value: &Value<'_>) -> bool {
    match value {
        Value::Function(_) => true,
        Value::Table(table) => table
            .get_metatable()
            .map(|meta| matches!(meta.raw_get::<_, Value>("__call"), Ok(Value::Function(_))))
            .unwrap_or(false),
        _ => false,
    }
}

fn method_of<'lua>(receiver: &Value<'lua>, method: &str) -> mlua::Result<Option<Value<'lua>>> {
    match receiver {
        Value::Table(table) => {
            let value: Value = table.get(method)?;
            Ok(if is_callable(&value) { Some(value) } else { None })
        }
        _ => Ok(None),
    }
}

/// Shared owner of one Lua runtime
pub struct InterpreterHandle {
    id: usize,
    lua: ReentrantMutex<Lua>,
    invoker: RegistryKey,
    embedded: bool,
    live_bindings: AtomicUsize,
    loaded_scripts: parking_lot::Mutex<HashSet<PathBuf>>,
}

impl fmt::Debug for InterpreterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterpreterHandle")
            .field("id", &self.id)
            .field("embedded", &self.embedded)
            .field("live_bindings", &self.live_bindings())
            .finish()
    }
}

impl InterpreterHandle {
    /// Get the process-wide interpreter, creating it on first use.
    ///
    /// Every caller, including callers racing on first use, receives the
    /// same handle.
    ///
    /// # Example
    /// ```
    /// use std::sync::Arc;
    /// use luadoop::bridge::InterpreterHandle;
    ///
    /// let a = InterpreterHandle::acquire().unwrap();
    /// let b = InterpreterHandle::acquire().unwrap();
    /// assert!(Arc::ptr_eq(&a, &b));
    /// ```
    pub fn acquire() -> Result<Arc<InterpreterHandle>, BridgeError> {
        let mut slot = PROCESS_HANDLE.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let handle = Arc::new(Self::with_options(InterpreterOptions::default())?);
        RUNTIMES_CREATED.fetch_add(1, Ordering::SeqCst);
        tracing::info!(handle = handle.id, "created process-wide interpreter");
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Number of process-wide runtimes constructed so far
    pub fn runtimes_created() -> usize {
        RUNTIMES_CREATED.load(Ordering::SeqCst)
    }

    /// Release the process-wide runtime.
    ///
    /// Returns `Ok(false)` when no runtime was acquired, and a binding error
    /// while any instance is still bound to it.
    pub fn teardown() -> Result<bool, BridgeError> {
        let mut slot = PROCESS_HANDLE.lock().unwrap_or_else(PoisonError::into_inner);
        let live = match slot.as_ref() {
            None => return Ok(false),
            Some(handle) => handle.live_bindings(),
        };

        if live > 0 {
            tracing::error!(live_bindings = live, "refusing interpreter teardown");
            return Err(BridgeError::binding(format!(
                "Cannot tear down interpreter with {} live binding(s)",
                live
            )));
        }

        *slot = None;
        tracing::info!("released process-wide interpreter");
        Ok(true)
    }

    /// Build an interpreter that is not shared through `acquire`
    pub fn isolated() -> Result<Arc<InterpreterHandle>, BridgeError> {
        Ok(Arc::new(Self::with_options(InterpreterOptions::default())?))
    }

    pub fn with_options(options: InterpreterOptions) -> Result<InterpreterHandle, BridgeError> {
        let lua = Lua::new();
        let invoker = bootstrap(&lua, &options).map_err(|e| {
            BridgeError::configuration(format!(
                "Failed to bootstrap interpreter: {}",
                describe_error(&e)
            ))
        })?;

        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(handle = id, embedded = options.embedded, "bootstrapped interpreter");

        Ok(Self {
            id,
            lua: ReentrantMutex::new(lua),
            invoker,
            embedded: options.embedded,
            live_bindings: AtomicUsize::new(0),
            loaded_scripts: parking_lot::Mutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    pub fn live_bindings(&self) -> usize {
        self.live_bindings.load(Ordering::SeqCst)
    }

    pub(crate) fn register_binding(&self) {
        self.live_bindings.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_binding(&self) {
        let _ = self
            .live_bindings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Lock the Lua state. The same thread may lock again, so host
    /// callbacks running inside a script call can invoke other instances
    /// bound to this handle.
    fn lock(&self) -> ReentrantMutexGuard<'_, Lua> {
        self.lua.lock()
    }

    /// Evaluate a snippet and keep a reference to its result
    pub fn evaluate(&self, source: &str) -> Result<OpaqueValue, BridgeError> {
        let lua = self.lock();
        lua.load(source)
            .set_name("=evaluate")
            .eval::<OpaqueValue>()
            .map_err(|e| BridgeError::invocation("evaluate", describe_error(&e)))
    }

    /// Evaluate a snippet and convert its result into a `Datum`
    pub fn evaluate_datum(&self, source: &str) -> Result<Datum, BridgeError> {
        let lua = self.lock();
        lua.load(source)
            .set_name("=evaluate")
            .eval::<Datum>()
            .map_err(|e| BridgeError::invocation("evaluate", describe_error(&e)))
    }

    pub fn to_datum(&self, value: &OpaqueValue) -> Result<Datum, BridgeError> {
        let lua = self.lock();
        let value: Value = lua
            .registry_value(&value.key)
            .map_err(|e| BridgeError::invocation("to_datum", describe_error(&e)))?;
        lua_to_datum(value).map_err(|e| BridgeError::invocation("to_datum", describe_error(&e)))
    }

    /// Set `luadoop.<name>` to a host value
    pub fn set_library_field(&self, name: &str, value: &Datum) -> Result<(), BridgeError> {
        let lua = self.lock();
        let result = (|| -> mlua::Result<()> {
            let library: Table = lua.globals().get("luadoop")?;
            library.set(name, datum_to_lua(&lua, value)?)
        })();
        result.map_err(|e| BridgeError::configuration(describe_error(&e)))
    }

    /// Expose job arguments as `luadoop.arguments`
    pub fn set_arguments(&self, arguments: &[String]) -> Result<(), BridgeError> {
        let list = Datum::List(arguments.iter().cloned().map(Datum::Text).collect());
        self.set_library_field("arguments", &list)
    }

    /// Prepend a directory to `package.path`
    pub fn add_load_path(&self, dir: &Path) -> Result<(), BridgeError> {
        let lua = self.lock();
        prepend_package_path(&lua, &[dir.to_path_buf()])
            .map_err(|e| BridgeError::configuration(describe_error(&e)))
    }

    /// Execute a Lua file in the global environment
    pub fn exec_file(&self, path: &Path) -> Result<(), BridgeError> {
        let source = fs::read_to_string(path).map_err(|e| {
            BridgeError::configuration(format!("Could not read {}: {}", path.display(), e))
        })?;

        let lua = self.lock();
        lua.load(&source)
            .set_name(format!("@{}", path.display()))
            .exec()
            .map_err(|e| BridgeError::configuration(describe_error(&e)))
    }

    /// Execute the job setup script unless this handle already ran it.
    ///
    /// Returns whether the script was executed by this call. A failed load
    /// is not remembered, so a later call retries it.
    pub fn load_setup_script_once(&self, path: &Path) -> Result<bool, BridgeError> {
        let load_error = |reason: String| {
            BridgeError::configuration(format!(
                "Could not load job setup script ({}): {}",
                path.display(),
                reason
            ))
        };

        let canonical = fs::canonicalize(path).map_err(|e| load_error(e.to_string()))?;

        let _lua = self.lock();
        let mut loaded = self.loaded_scripts.lock();
        if loaded.contains(&canonical) {
            return Ok(false);
        }

        if let Some(dir) = canonical.parent() {
            self.add_load_path(dir)?;
        }
        self.exec_file(&canonical)
            .map_err(|e| load_error(e.message().to_string()))?;

        tracing::info!(handle = self.id, script = %canonical.display(), "loaded job setup script");
        loaded.insert(canonical);
        Ok(true)
    }

    /// Walk a dotted (`A.B`) or scoped (`A::B`) name from the globals table
    pub fn lookup_path(&self, name: &str) -> Result<OpaqueValue, BridgeError> {
        let lua = self.lock();
        let mut current = Value::Table(lua.globals());
        let mut walked: Vec<&str> = Vec::new();

        for segment in split_class_path(name) {
            let table = match current {
                Value::Table(table) => table,
                other => {
                    return Err(BridgeError::configuration(format!(
                        "{} is a {}, not a namespace",
                        walked.join("."),
                        other.type_name()
                    )))
                }
            };
            let next: Value = table
                .get(segment)
                .map_err(|e| BridgeError::configuration(describe_error(&e)))?;
            walked.push(segment);
            if next.is_nil() {
                return Err(BridgeError::configuration(format!(
                    "uninitialized constant {}",
                    walked.join(".")
                )));
            }
            current = next;
        }

        OpaqueValue::from_lua(current, &lua)
            .map_err(|e| BridgeError::configuration(describe_error(&e)))
    }

    /// Whether `target` has a callable `method`
    pub fn responds_to(&self, target: &OpaqueValue, method: &str) -> Result<bool, BridgeError> {
        let lua = self.lock();
        let receiver: Value = lua
            .registry_value(&target.key)
            .map_err(|e| BridgeError::invocation(method, describe_error(&e)))?;
        method_of(&receiver, method)
            .map(|found| found.is_some())
            .map_err(|e| BridgeError::invocation(method, describe_error(&e)))
    }

    /// Call `target:method(args...)` and convert the result.
    ///
    /// A missing method, an error raised by the script, or a result that
    /// can't be converted to `R` all surface as `BridgeError::Invocation`.
    pub fn invoke<R>(&self, target: &OpaqueValue, method: &str, args: Vec<Arg<'_>>) -> Result<R, BridgeError>
    where
        R: for<'lua> FromLuaMulti<'lua>,
    {
        let staged: Vec<Staged<'_>> = args.into_iter().map(Staged::from).collect();

        let guard = self.lock();
        let lua: &Lua = &guard;
        let fail = |e: mlua::Error| BridgeError::invocation(method, describe_error(&e));

        let receiver: Value = lua.registry_value(&target.key).map_err(fail)?;
        let function = match method_of(&receiver, method).map_err(fail)? {
            Some(function) => function,
            None => {
                return Err(BridgeError::invocation(
                    method,
                    format!("undefined method '{}' for {}", method, target.type_name),
                ))
            }
        };
        let invoker: Function = lua.registry_value(&self.invoker).map_err(fail)?;

        lua.scope(|scope| {
            let mut values = Vec::with_capacity(staged.len() + 2);
            values.push(function.clone());
            values.push(receiver.clone());
            for arg in &staged {
                values.push(arg.to_lua(lua, scope)?);
            }
            invoker.call::<_, R>(MultiValue::from_vec(values))
        })
        .map_err(fail)
    }

    /// Take ownership of a host-native reader created by `luadoop.native`
    pub fn take_native_reader(
        &self,
        value: &OpaqueValue,
    ) -> Result<Option<Box<dyn RecordReader>>, BridgeError> {
        let lua = self.lock();
        let value: Value = lua
            .registry_value(&value.key)
            .map_err(|e| BridgeError::invocation("create_record_reader", describe_error(&e)))?;
        match value {
            Value::UserData(data) if data.is::<NativeReader>() => {
                let reader = data.take::<NativeReader>().map_err(|e| {
                    BridgeError::invocation("create_record_reader", describe_error(&e))
                })?;
                Ok(Some(reader.0))
            }
            _ => Ok(None),
        }
    }
}

fn prepend_package_path(lua: &Lua, dirs: &[PathBuf]) -> mlua::Result<()> {
    let package: Table = lua.globals().get("package")?;
    let current: String = package.get("path")?;
    let mut entries: Vec<String> = Vec::new();
    for dir in dirs {
        let dir = dir.display();
        for pattern in [format!("{}/?.lua", dir), format!("{}/?/init.lua", dir)] {
            if !current.split(';').any(|existing| existing == pattern) {
                entries.push(pattern);
            }
        }
    }
    if entries.is_empty() {
        return Ok(());
    }
    entries.push(current);
    package.set("path", entries.join(";"))
}

fn bootstrap(lua: &Lua, options: &InterpreterOptions) -> mlua::Result<RegistryKey> {
    prepend_package_path(lua, &options.load_path)?;

    let library: Table = lua.load(PRELUDE).set_name("=luadoop").eval()?;
    library.set("embedded", options.embedded)?;
    library.set("null", Value::NULL)?;

    let keys = lua.create_table()?;
    for role in Role::ALL {
        keys.set(role.name(), role.config_key())?;
    }
    keys.set("job_setup_script", JOB_SETUP_SCRIPT_KEY)?;
    keys.set("input_paths", INPUT_PATHS_KEY)?;
    keys.set("output_path", OUTPUT_PATH_KEY)?;
    keys.set("reduce_tasks", REDUCE_TASKS_KEY)?;
    library.set("keys", keys)?;

    let native = lua.create_table()?;
    native.set(
        "line_reader",
        lua.create_function(|_, ()| Ok(NativeReader(Box::new(LineRecordReader::new()))))?,
    )?;
    library.set("native", native)?;

    let loaded: Table = lua.globals().get::<_, Table>("package")?.get("loaded")?;
    loaded.set("luadoop", library.clone())?;
    lua.globals().set("luadoop", library)?;

    let invoker: Function = lua.load(INVOKER).set_name("=invoker").eval()?;
    lua.create_registry_value(invoker)
}
