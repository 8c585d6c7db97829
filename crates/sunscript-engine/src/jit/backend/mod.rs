//! Back-end boundary
//!
//! The VM drives a pluggable trace compiler through [`TraceBackend`]:
//! `compile_trace` turns a completed recording into an executable entry,
//! `execute` runs it against live interpreter state and reports the exit
//! through a [`TraceExit`], and `resume`/`shutdown` round out the
//! lifecycle. The VM operates fully without a back-end — a
//! [`NullBackend`] declines every compile and the dispatcher keeps
//! interpreting.

mod interp;

pub use interp::InterpBackend;

use crate::jit::recorder::TraceRecording;
use crate::memory::MemoryManager;
use crate::vm::frame::ActivationRecord;
use crate::vm::host::HostHandler;
use crate::vm::value::Value;
use crate::vm::Status;
use std::time::Instant;
use thiserror::Error;

/// Opaque handle to a compiled trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHandle(pub usize);

/// Trace compilation errors
#[derive(Debug, Error)]
pub enum CompileError {
    /// The recording uses operations this back-end does not implement
    #[error("Unsupported trace: {0}")]
    Unsupported(String),

    /// The back-end cannot compile anything
    #[error("No trace compiler available")]
    Unavailable,
}

/// Interpreter state a trace executes against
pub struct TraceContext<'a> {
    /// Locals of the frame the trace was recorded in.
    pub record: &'a mut ActivationRecord,
    /// The VM's memory manager.
    pub memory: &'a mut MemoryManager,
    /// Host handler for external calls inside the trace.
    pub handler: Option<&'a mut dyn HostHandler>,
    /// Deadline from `run_with_timeout`, checked at the back-edge.
    pub deadline: Option<Instant>,
}

/// How a trace execution left the compiled code
#[derive(Debug, Default)]
pub struct TraceExit {
    /// Snapshot the exit went through.
    pub snap_id: u16,
    /// Materialized (slot, value) pairs for that snapshot.
    pub slots: Vec<(u8, Value)>,
}

/// A pluggable trace compiler and executor
pub trait TraceBackend {
    /// Back-end name, for diagnostics.
    fn name(&self) -> &str;

    /// One-time setup before the first compile.
    fn initialize(&mut self) {}

    /// Compile a completed recording into an executable entry.
    fn compile_trace(&mut self, recording: &TraceRecording) -> Result<TraceHandle, CompileError>;

    /// Execute a compiled trace. Fills `exit` with the snapshot taken
    /// and the values to restore, then returns `Ok` for a guard exit,
    /// `Timeout` when the deadline passed at the back-edge, or `Error`
    /// when a call inside the trace failed. A back-end that suspends
    /// (`Yielded`/`Paused`) must also fill `exit` so the interpreter
    /// holds the suspended state.
    fn execute(
        &mut self,
        handle: TraceHandle,
        ctx: &mut TraceContext<'_>,
        exit: &mut TraceExit,
    ) -> Status;

    /// Continue a paused execution, for back-ends that suspend.
    fn resume(&mut self) -> Status {
        Status::Ok
    }

    /// Release compiled code and other back-end state.
    fn shutdown(&mut self);
}

/// Back-end that declines every compilation
///
/// Installing it (or no back-end at all) leaves the VM a plain
/// interpreter; markers are still observed, but every recording is
/// discarded at the compile step.
pub struct NullBackend;

impl TraceBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn compile_trace(&mut self, _recording: &TraceRecording) -> Result<TraceHandle, CompileError> {
        Err(CompileError::Unavailable)
    }

    fn execute(
        &mut self,
        _handle: TraceHandle,
        _ctx: &mut TraceContext<'_>,
        _exit: &mut TraceExit,
    ) -> Status {
        Status::Error
    }

    fn shutdown(&mut self) {}
}
