//! Lifecycle state shared by every adapter.

use std::sync::Arc;

use crate::bridge::{Arg, BridgeError, InterpreterHandle, ManagedInstance, Role};
use crate::host::conf::Configuration;

enum SlotState {
    Unbound,
    Active(ManagedInstance),
    Released,
}

/// Holds an adapter's instance through `Unbound → Active → Released`
pub struct InstanceSlot {
    role: Role,
    interpreter: Option<Arc<InterpreterHandle>>,
    state: SlotState,
}

impl InstanceSlot {
    /// Slot that binds in the process-wide interpreter
    pub fn new(role: Role) -> Self {
        Self {
            role,
            interpreter: None,
            state: SlotState::Unbound,
        }
    }

    /// Slot that binds in a specific interpreter
    pub fn with_interpreter(role: Role, interpreter: Arc<InterpreterHandle>) -> Self {
        Self {
            role,
            interpreter: Some(interpreter),
            state: SlotState::Unbound,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn interpreter(&self) -> Result<Arc<InterpreterHandle>, BridgeError> {
        match &self.interpreter {
            Some(interpreter) => Ok(Arc::clone(interpreter)),
            None => InterpreterHandle::acquire(),
        }
    }

    /// Resolve and bind the role's class
    pub fn bind(&mut self, conf: &Configuration) -> Result<&ManagedInstance, BridgeError> {
        match self.state {
            SlotState::Unbound => {}
            SlotState::Active(_) => {
                return Err(self.contract_violation(format!("{} adapter is already set up", self.role)))
            }
            SlotState::Released => {
                return Err(self.contract_violation(format!(
                    "{} adapter was cleaned up and can't be set up again",
                    self.role
                )))
            }
        }

        let instance = ManagedInstance::for_role(self.interpreter()?, conf, self.role)?;
        tracing::debug!(role = %self.role, class = instance.class_name(), "adapter set up");
        self.state = SlotState::Active(instance);
        match &self.state {
            SlotState::Active(instance) => Ok(instance),
            _ => Err(BridgeError::binding("instance vanished during setup")),
        }
    }

    /// The bound instance, for a call to `method`
    pub fn active(&self, method: &str) -> Result<&ManagedInstance, BridgeError> {
        match &self.state {
            SlotState::Active(instance) => Ok(instance),
            SlotState::Unbound => Err(self.contract_violation(format!(
                "{} adapter called ('{}') before setup",
                self.role, method
            ))),
            SlotState::Released => Err(self.contract_violation(format!(
                "{} adapter called ('{}') after cleanup",
                self.role, method
            ))),
        }
    }

    pub fn instance(&self) -> Option<&ManagedInstance> {
        match &self.state {
            SlotState::Active(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SlotState::Active(_))
    }

    /// Run the optional `cleanup` hook, then release.
    ///
    /// The release happens even if the hook fails; the hook's error is
    /// returned afterwards. Finishing a slot that was never set up, or was
    /// already finished, does nothing.
    pub fn finish(&mut self, args: Vec<Arg<'_>>) -> Result<(), BridgeError> {
        let mut instance = match std::mem::replace(&mut self.state, SlotState::Released) {
            SlotState::Active(instance) => instance,
            SlotState::Unbound => {
                self.state = SlotState::Unbound;
                return Ok(());
            }
            SlotState::Released => return Ok(()),
        };

        let hook = instance.call_if_supported::<()>("cleanup", args);
        instance.release();
        tracing::debug!(role = %self.role, "adapter cleaned up");
        hook.map(|_| ())
    }

    fn contract_violation(&self, message: String) -> BridgeError {
        tracing::error!(role = %self.role, "{}", message);
        BridgeError::binding(message)
    }
}
