//! One script object bound to an interpreter.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use mlua::FromLuaMulti;

use crate::bridge::error::BridgeError;
use crate::bridge::interpreter::{Arg, InterpreterHandle, OpaqueValue};
use crate::bridge::resolver::{ClassRef, ConfigurationResolver, Role};
use crate::host::conf::Configuration;

/// Optional hooks looked up once when an instance is bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Setup,
    Cleanup,
    CompareRaw,
    CompareObjects,
    SetInputPaths,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Setup,
        Capability::Cleanup,
        Capability::CompareRaw,
        Capability::CompareObjects,
        Capability::SetInputPaths,
    ];

    pub fn method_name(self) -> &'static str {
        match self {
            Capability::Setup => "setup",
            Capability::Cleanup => "cleanup",
            Capability::CompareRaw => "compare_raw",
            Capability::CompareObjects => "compare",
            Capability::SetInputPaths => "set_input_paths",
        }
    }

    pub fn for_method(method: &str) -> Option<Capability> {
        Self::ALL.into_iter().find(|cap| cap.method_name() == method)
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of capabilities an instance supports
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|cap| self.contains(*cap))
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.iter().map(Capability::method_name))
            .finish()
    }
}

/// A script object plus the interpreter it lives in.
///
/// Binding registers with the interpreter so it can't be torn down while
/// the instance is alive; `release` (or drop) undoes that.
pub struct ManagedInstance {
    interpreter: Arc<InterpreterHandle>,
    class_name: String,
    factory: String,
    object: Option<OpaqueValue>,
    capabilities: CapabilitySet,
    method_cache: RefCell<HashMap<String, bool>>,
}

impl fmt::Debug for ManagedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedInstance")
            .field("class_name", &self.class_name)
            .field("factory", &self.factory)
            .field("bound", &self.is_bound())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl ManagedInstance {
    /// Create an instance of `class` through its `factory`.
    ///
    /// # Errors
    /// - `Configuration` if the class has no such factory or it returns nil
    /// - `Invocation` if the factory raises
    pub fn bind(
        interpreter: Arc<InterpreterHandle>,
        class: &ClassRef,
        factory: &str,
        conf: &Configuration,
    ) -> Result<Self, BridgeError> {
        if !interpreter.responds_to(&class.value, factory)? {
            return Err(BridgeError::configuration(format!(
                "Class {} does not define factory '{}'",
                class.name, factory
            )));
        }

        let object: Option<OpaqueValue> =
            interpreter.invoke(&class.value, factory, vec![Arg::Conf(conf)])?;
        let object = object.ok_or_else(|| {
            BridgeError::configuration(format!(
                "Factory '{}' of {} returned nil",
                factory, class.name
            ))
        })?;

        Self::attach(interpreter, object, class.name.clone(), factory.to_string())
    }

    /// Resolve the class configured for `role` and bind an instance of it
    pub fn for_role(
        interpreter: Arc<InterpreterHandle>,
        conf: &Configuration,
        role: Role,
    ) -> Result<Self, BridgeError> {
        let resolver = ConfigurationResolver::new(Arc::clone(&interpreter));
        let class = resolver.resolve_class(conf, role)?;
        let factory = ConfigurationResolver::factory_for(conf, role);
        Self::bind(interpreter, &class, &factory, conf)
    }

    /// Bind an object the script already created
    pub fn wrap(
        interpreter: Arc<InterpreterHandle>,
        object: OpaqueValue,
        label: impl Into<String>,
    ) -> Result<Self, BridgeError> {
        Self::attach(interpreter, object, label.into(), String::new())
    }

    fn attach(
        interpreter: Arc<InterpreterHandle>,
        object: OpaqueValue,
        class_name: String,
        factory: String,
    ) -> Result<Self, BridgeError> {
        let mut capabilities = CapabilitySet::empty();
        for capability in Capability::ALL {
            if interpreter.responds_to(&object, capability.method_name())? {
                capabilities.insert(capability);
            }
        }

        interpreter.register_binding();
        tracing::debug!(class = %class_name, capabilities = ?capabilities, "bound script instance");

        Ok(Self {
            interpreter,
            class_name,
            factory,
            object: Some(object),
            capabilities,
            method_cache: RefCell::new(HashMap::new()),
        })
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn factory(&self) -> &str {
        &self.factory
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn interpreter(&self) -> &Arc<InterpreterHandle> {
        &self.interpreter
    }

    pub fn object(&self) -> Option<&OpaqueValue> {
        self.object.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.object.is_some()
    }

    /// Whether the bound object responds to `method`; cached per instance.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Invocation` when looking the method up raises
    /// a script error (for example from an `__index` metamethod). Failed
    /// lookups are not cached.
    pub fn responds_to(&self, method: &str) -> Result<bool, BridgeError> {
        let Some(object) = self.object.as_ref() else {
            return Ok(false);
        };
        if let Some(capability) = Capability::for_method(method) {
            return Ok(self.capabilities.contains(capability));
        }
        if let Some(found) = self.method_cache.borrow().get(method) {
            return Ok(*found);
        }

        let found = self.interpreter.responds_to(object, method)?;
        self.method_cache.borrow_mut().insert(method.to_string(), found);
        Ok(found)
    }

    /// Like [`responds_to`](Self::responds_to), treating a failed lookup as absent
    pub fn supports(&self, method: &str) -> bool {
        self.responds_to(method).unwrap_or(false)
    }

    /// Call a method that must exist
    pub fn call<R>(&self, method: &str, args: Vec<Arg<'_>>) -> Result<R, BridgeError>
    where
        R: for<'lua> FromLuaMulti<'lua>,
    {
        let object = self.object.as_ref().ok_or_else(|| {
            BridgeError::binding(format!(
                "Instance of {} is not bound; cannot call '{}'",
                self.class_name, method
            ))
        })?;
        self.interpreter.invoke(object, method, args)
    }

    /// Call an optional hook; `Ok(None)` without side effects when absent
    pub fn call_if_supported<R>(&self, method: &str, args: Vec<Arg<'_>>) -> Result<Option<R>, BridgeError>
    where
        R: for<'lua> FromLuaMulti<'lua>,
    {
        if !self.responds_to(method)? {
            return Ok(None);
        }
        self.call(method, args).map(Some)
    }

    /// Drop the binding. Idempotent.
    pub fn release(&mut self) {
        if self.object.take().is_some() {
            self.interpreter.release_binding();
            tracing::debug!(class = %self.class_name, "released script instance");
        }
    }
}

impl Drop for ManagedInstance {
    fn drop(&mut self) {
        self.release();
    }
}
