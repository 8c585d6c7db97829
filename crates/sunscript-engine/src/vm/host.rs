//! Host handler boundary
//!
//! External functions dispatch to a caller-supplied [`HostHandler`]. The
//! handler reads its arguments through the [`CallContext`] left-to-right
//! and may set one return value, which the dispatcher pushes after the
//! call completes.

use crate::memory::{ManagedPtr, MemoryManager};
use crate::vm::value::Value;
use crate::vm::{Status, VmError, VmResult};
use sunscript_bytecode::{Real, TypeTag};

/// Host-side dispatcher for external function calls
pub trait HostHandler {
    /// Handle one external call. Return [`Status::Ok`] when handled;
    /// anything else fails the run with the call as the failure site.
    fn on_call(&mut self, ctx: &mut CallContext<'_>) -> Status;
}

/// Call state handed to a [`HostHandler`]
pub struct CallContext<'a> {
    name: &'a str,
    args: Vec<Value>,
    next: usize,
    ret: Option<Value>,
    memory: &'a mut MemoryManager,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(name: &'a str, args: Vec<Value>, memory: &'a mut MemoryManager) -> Self {
        CallContext {
            name,
            args,
            next: 0,
            ret: None,
            memory,
        }
    }

    /// Name of the external function being called.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Number of arguments at the call site.
    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Type tag of the next unread argument, if any.
    pub fn param_tag(&self) -> Option<TypeTag> {
        self.args.get(self.next).map(|v| v.tag())
    }

    fn next_arg(&mut self, expected: TypeTag) -> VmResult<Value> {
        let value = self
            .args
            .get(self.next)
            .copied()
            .ok_or(VmError::StackUnderflow)?;
        if value.tag() != expected {
            return Err(VmError::TypeMismatch {
                expected,
                found: value.tag(),
            });
        }
        self.next += 1;
        Ok(value)
    }

    /// Consume the next argument as an integer.
    pub fn param_int(&mut self) -> VmResult<i32> {
        match self.next_arg(TypeTag::Int)? {
            Value::Int(v) => Ok(v),
            _ => unreachable!("tag checked"),
        }
    }

    /// Consume the next argument as a real.
    pub fn param_real(&mut self) -> VmResult<Real> {
        match self.next_arg(TypeTag::Real)? {
            Value::Real(v) => Ok(v),
            _ => unreachable!("tag checked"),
        }
    }

    /// Consume the next argument as a string, copying it out of managed
    /// memory.
    pub fn param_string(&mut self) -> VmResult<String> {
        match self.next_arg(TypeTag::String)? {
            Value::Str(ptr) => Ok(unsafe { ptr.payload::<String>() }.clone()),
            _ => unreachable!("tag checked"),
        }
    }

    /// Consume the next argument as a table pointer. The pointer is only
    /// valid for the duration of the call.
    pub fn param_table(&mut self) -> VmResult<ManagedPtr> {
        match self.next_arg(TypeTag::Object)? {
            Value::Table(ptr) => Ok(ptr),
            _ => unreachable!("tag checked"),
        }
    }

    /// Set an integer return value.
    pub fn return_int(&mut self, value: i32) {
        self.ret = Some(Value::Int(value));
    }

    /// Set a real return value.
    pub fn return_real(&mut self, value: Real) {
        self.ret = Some(Value::Real(value));
    }

    /// Set a string return value, allocated in managed memory.
    pub fn return_string(&mut self, value: &str) {
        let ptr = self.memory.alloc_string(value.to_string());
        self.ret = Some(Value::Str(ptr));
    }

    pub(crate) fn finish(self) -> (Vec<Value>, Option<Value>) {
        (self.args, self.ret)
    }
}
