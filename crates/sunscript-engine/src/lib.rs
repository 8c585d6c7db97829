//! SunScript VM Runtime
//!
//! This crate provides the execution engine for SunScript programs:
//! - Bytecode interpreter with call/return, yield/resume, and timeouts
//! - Arena memory manager with reference-counted, type-tagged blocks
//! - Table object with dual array/hash storage
//! - Trace recorder lifting hot loops into a linear typed IR
//! - Streaming IR optimizer (guard coalescing, folding, dead-code
//!   elimination)
//! - Back-end boundary for a pluggable trace compiler

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod jit;
pub mod memory;
pub mod vm;

pub use jit::backend::{
    CompileError, InterpBackend, NullBackend, TraceBackend, TraceContext, TraceExit, TraceHandle,
};
pub use jit::ir::{IrBuffer, IrError, IrIns, IrOp, IrRef, TracePool};
pub use jit::pipeline::{OptLevel, Optimizer};
pub use jit::recorder::{ArithOp, TraceEvent, TraceRecorder, TraceRecording, TraceSink};
pub use jit::snapshot::Snapshot;
pub use jit::JitRuntime;
pub use memory::{ManagedPtr, MemoryError, MemoryManager};
pub use sunscript_bytecode::{Real, TypeTag, REAL_SIZE};
pub use vm::frame::{ActivationRecord, CallFrame};
pub use vm::host::{CallContext, HostHandler};
pub use vm::interpreter::Vm;
pub use vm::table::Table;
pub use vm::value::Value;
pub use vm::{CallstackEntry, Status, VmError, VmResult};
