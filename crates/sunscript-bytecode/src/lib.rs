//! SunScript VM Bytecode Definitions
//!
//! This crate provides the instruction set, program image format, and
//! emitter for the SunScript virtual machine. A program image is a flat
//! byte buffer: build flags, a function table, then concatenated function
//! bodies of raw opcodes. The engine crate decodes and executes images
//! produced here (or by an external front-end emitting the same format).

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builder;
pub mod encoder;
pub mod opcode;
pub mod program;
pub mod verify;

pub use builder::{BlockBuilder, BuildError, Label, ProgramBuilder};
pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use opcode::{JumpKind, Markers, Opcode, TypeTag, MK_LOOPSTART, MK_TRACESTART};
pub use program::{
    flags, DebugInfo, FunctionInfo, FunctionKind, LineEntry, Program, ProgramError,
};
pub use verify::{verify_program, VerifyError};

/// Scalar type for script reals. 8 bytes by default; the `single-real`
/// feature narrows it to 4, matching the `REAL_SINGLE` build flag.
#[cfg(not(feature = "single-real"))]
pub type Real = f64;

/// Scalar type for script reals (single precision build).
#[cfg(feature = "single-real")]
pub type Real = f32;

/// Encoded size in bytes of a [`Real`] immediate or constant.
pub const REAL_SIZE: usize = std::mem::size_of::<Real>();
