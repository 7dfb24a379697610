//! Grouping and sort comparators backed by a script class.

use std::sync::Arc;

use crate::adapters::slot::InstanceSlot;
use crate::bridge::{Arg, BridgeError, Capability, InterpreterHandle, ManagedInstance, Role};
use crate::host::api::{Configurable, RawComparator, TaskResult};
use crate::host::conf::Configuration;
use crate::host::datum::Datum;

/// Host comparator for the grouping or sort comparator role.
///
/// A script may implement `compare(a, b)`, `compare_raw(b1, s1, l1, b2, s2, l2)`
/// or both. Each host entry point requires its own method; there is no
/// fallback from one form to the other.
pub struct ComparatorProxy {
    slot: InstanceSlot,
    conf: Option<Configuration>,
}

impl ComparatorProxy {
    pub fn grouping() -> Self {
        Self::from_slot(InstanceSlot::new(Role::GroupingComparator))
    }

    pub fn sort() -> Self {
        Self::from_slot(InstanceSlot::new(Role::SortComparator))
    }

    /// `role` must be `Role::GroupingComparator` or `Role::SortComparator`
    pub fn with_interpreter(role: Role, interpreter: Arc<InterpreterHandle>) -> Self {
        Self::from_slot(InstanceSlot::with_interpreter(role, interpreter))
    }

    fn from_slot(slot: InstanceSlot) -> Self {
        Self { slot, conf: None }
    }

    pub fn role(&self) -> Role {
        self.slot.role()
    }

    pub fn instance(&self) -> Option<&ManagedInstance> {
        self.slot.instance()
    }

    pub fn supports_raw(&self) -> bool {
        self.supports(Capability::CompareRaw)
    }

    pub fn supports_objects(&self) -> bool {
        self.supports(Capability::CompareObjects)
    }

    fn supports(&self, capability: Capability) -> bool {
        self.slot
            .instance()
            .map(|instance| instance.capabilities().contains(capability))
            .unwrap_or(false)
    }

    fn call_capability(&self, capability: Capability, args: Vec<Arg<'_>>) -> Result<i32, BridgeError> {
        let method = capability.method_name();
        let instance = self.slot.active(method)?;
        if !instance.capabilities().contains(capability) {
            return Err(BridgeError::invocation(
                method,
                format!("{} does not implement {}", instance.class_name(), method),
            ));
        }
        let result: i64 = instance.call(method, args)?;
        Ok(result.signum() as i32)
    }
}

impl Configurable for ComparatorProxy {
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

impl RawComparator for ComparatorProxy {
    fn compare(&mut self, a: &Datum, b: &Datum) -> TaskResult<i32> {
        Ok(self.call_capability(
            Capability::CompareObjects,
            vec![Arg::Datum(a), Arg::Datum(b)],
        )?)
    }

    fn compare_raw(
        &mut self,
        b1: &[u8],
        s1: usize,
        l1: usize,
        b2: &[u8],
        s2: usize,
        l2: usize,
    ) -> TaskResult<i32> {
        Ok(self.call_capability(
            Capability::CompareRaw,
            vec![
                Arg::Bytes(b1),
                Arg::Int(s1 as i64),
                Arg::Int(l1 as i64),
                Arg::Bytes(b2),
                Arg::Int(s2 as i64),
                Arg::Int(l2 as i64),
            ],
        )?)
    }

    fn close(&mut self) -> TaskResult<()> {
        self.slot.finish(vec![])?;
        Ok(())
    }
}
