//! VM runtime: value model, table object, stacks, frames, host boundary,
//! and the bytecode interpreter.

pub mod frame;
pub mod host;
pub mod interpreter;
pub mod stack;
pub mod table;
pub mod value;

use crate::memory::MemoryError;
use sunscript_bytecode::{ProgramError, TypeTag, VerifyError};

/// Host-facing execution status
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Execution completed normally.
    Ok = 0,
    /// Execution failed; details via [`interpreter::Vm::last_error`].
    Error = 1,
    /// Execution suspended at a yield; continue with `resume`.
    Yielded = 2,
    /// Execution suspended by the back-end; continue with `resume`.
    Paused = 3,
    /// The deadline passed; state is preserved, continue with `resume`.
    Timeout = 4,
}

/// VM execution errors
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Operation on incompatible tagged values
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// The type the operation needed.
        expected: TypeTag,
        /// The type actually observed.
        found: TypeTag,
    },

    /// Integer division by zero
    #[error("Divide by zero")]
    DivideByZero,

    /// Pop or peek on an empty operand stack
    #[error("Stack underflow")]
    StackUnderflow,

    /// Managed pointer failed validation
    #[error("Bad pointer: {0}")]
    BadPointer(#[from] MemoryError),

    /// Call names an id missing from the function table
    #[error("Unknown function {0}")]
    UnknownFunction(u32),

    /// Local index outside the activation record
    #[error("Unknown local {0}")]
    UnknownLocal(u8),

    /// The host handler reported failure
    #[error("Handler error in {0}")]
    Handler(String),

    /// The image failed to load or validate
    #[error("Malformed program: {0}")]
    ProgramMalformed(String),

    /// Byte is not a known opcode
    #[error("Invalid opcode {0:#04x} at pc {1:#x}")]
    InvalidOpcode(u8, usize),

    /// No program is loaded
    #[error("No program loaded")]
    NoProgram,
}

impl From<ProgramError> for VmError {
    fn from(err: ProgramError) -> Self {
        VmError::ProgramMalformed(err.to_string())
    }
}

impl From<VerifyError> for VmError {
    fn from(err: VerifyError) -> Self {
        VmError::ProgramMalformed(err.to_string())
    }
}

impl From<sunscript_bytecode::DecodeError> for VmError {
    fn from(err: sunscript_bytecode::DecodeError) -> Self {
        VmError::ProgramMalformed(err.to_string())
    }
}

/// Result alias for VM operations
pub type VmResult<T> = Result<T, VmError>;

/// One host-visible call stack entry, captured when a run fails
#[derive(Debug, Clone)]
pub struct CallstackEntry {
    /// Name of the function executing in this frame.
    pub function_name: String,
    /// Arguments the frame was entered with.
    pub num_args: u8,
    /// Source line from the debug sidecar, 0 when absent.
    pub debug_line: u32,
    /// Code offset the frame was executing.
    pub program_counter: usize,
}
