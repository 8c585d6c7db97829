//! Load-time program validation
//!
//! Walks every internal function body, decoding each instruction and its
//! operands, and checks the structural invariants the dispatcher relies
//! on: jump targets stay inside the body they jump from, every static
//! call names a function present in the table, and no operand runs off
//! the end of the code section.

use crate::encoder::{BytecodeReader, DecodeError};
use crate::opcode::{JumpKind, Opcode, TypeTag};
use crate::program::{FunctionKind, Program};
use thiserror::Error;

/// Validation failures
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Operand or opcode decoding failed
    #[error("Decode error in function {function}: {source}")]
    Decode {
        /// Function id being walked.
        function: u32,
        /// Underlying decode failure.
        #[source]
        source: DecodeError,
    },

    /// A jump lands outside its function body
    #[error("Jump at {pc:#x} in function {function} targets {target:#x}, outside the body")]
    JumpOutOfBody {
        /// Function id being walked.
        function: u32,
        /// Offset of the jump instruction.
        pc: usize,
        /// Resolved target offset.
        target: i64,
    },

    /// A call names an id missing from the function table
    #[error("Call at {pc:#x} in function {function} names unknown function {callee}")]
    UnknownCallee {
        /// Function id being walked.
        function: u32,
        /// Offset of the call instruction.
        pc: usize,
        /// The missing callee id.
        callee: u32,
    },
}

/// Validate a decoded program image.
pub fn verify_program(program: &Program) -> Result<(), VerifyError> {
    let mut entries: Vec<usize> = program
        .functions
        .iter()
        .filter(|f| f.kind == FunctionKind::Internal)
        .map(|f| f.entry as usize)
        .collect();
    entries.sort_unstable();

    for func in &program.functions {
        if func.kind != FunctionKind::Internal {
            continue;
        }
        let start = func.entry as usize;
        let end = entries
            .iter()
            .find(|&&e| e > start)
            .copied()
            .unwrap_or(program.code.len());
        verify_body(program, func.id, start, end)?;
    }
    Ok(())
}

fn verify_body(
    program: &Program,
    function: u32,
    start: usize,
    end: usize,
) -> Result<(), VerifyError> {
    let decode = |source| VerifyError::Decode { function, source };
    let mut reader = BytecodeReader::at(&program.code[..end], start);

    while !reader.is_at_end() {
        let pc = reader.pos();
        let raw = reader.read_u8().map_err(decode)?;
        let (op, _) = Opcode::from_byte(raw)
            .ok_or_else(|| decode(DecodeError::InvalidOpcode(raw, pc)))?;

        match op {
            Opcode::Push => {
                read_tagged_immediate(&mut reader).map_err(decode)?;
            }
            Opcode::Set => {
                reader.read_u8().map_err(decode)?;
                read_tagged_immediate(&mut reader).map_err(decode)?;
            }
            Opcode::Pop | Opcode::PushLocal => {
                reader.read_u8().map_err(decode)?;
            }
            Opcode::Call | Opcode::CallD | Opcode::Yield => {
                let callee = reader.read_u32().map_err(decode)?;
                reader.read_u8().map_err(decode)?;
                if program.find_function(callee).is_none() {
                    return Err(VerifyError::UnknownCallee {
                        function,
                        pc,
                        callee,
                    });
                }
            }
            Opcode::PushFunc => {
                let callee = reader.read_u32().map_err(decode)?;
                if program.find_function(callee).is_none() {
                    return Err(VerifyError::UnknownCallee {
                        function,
                        pc,
                        callee,
                    });
                }
            }
            Opcode::CallO => {
                reader.read_u8().map_err(decode)?;
            }
            Opcode::CallM => {
                reader.read_str().map_err(decode)?;
                reader.read_u8().map_err(decode)?;
            }
            Opcode::Jump => {
                let kind = reader.read_u8().map_err(decode)?;
                JumpKind::from_byte(kind)
                    .ok_or_else(|| decode(DecodeError::InvalidJumpKind(kind, pc)))?;
                let offset = reader.read_i16().map_err(decode)?;
                let target = reader.pos() as i64 + offset as i64;
                if target < start as i64 || target >= end as i64 {
                    return Err(VerifyError::JumpOutOfBody {
                        function,
                        pc,
                        target,
                    });
                }
            }
            // No operands.
            Opcode::Local
            | Opcode::Done
            | Opcode::TableNew
            | Opcode::TableGet
            | Opcode::TableSet
            | Opcode::UnaryMinus
            | Opcode::Increment
            | Opcode::Decrement
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Dup
            | Opcode::Format
            | Opcode::Cmp
            | Opcode::Return => {}
        }
    }
    Ok(())
}

fn read_tagged_immediate(reader: &mut BytecodeReader<'_>) -> Result<(), DecodeError> {
    let pos = reader.pos();
    let raw = reader.read_u8()?;
    let tag = TypeTag::from_byte(raw).ok_or(DecodeError::InvalidTypeTag(raw, pos))?;
    match tag {
        TypeTag::Int => {
            reader.read_i32()?;
        }
        TypeTag::Real => {
            reader.read_real()?;
        }
        TypeTag::String => {
            reader.read_str()?;
        }
        // Only int, real, and string immediates are emitted.
        other => return Err(DecodeError::InvalidTypeTag(other as u8, pos)),
    }
    Ok(())
}
