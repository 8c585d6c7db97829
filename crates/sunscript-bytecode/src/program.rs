//! Program image format
//!
//! A program image is the unit the VM loads: a `u32` of build flags, a
//! function table, then the concatenated function bodies. Entry offsets in
//! the table are relative to the start of the code section.

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use crate::REAL_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Build flag constants carried in the image header
pub mod flags {
    /// Image was emitted for 32-bit reals.
    pub const REAL_SINGLE: u32 = 0x1;
    /// Image was emitted for 64-bit reals.
    pub const REAL_DOUBLE: u32 = 0x2;

    /// The flag matching this build's [`crate::Real`] width.
    pub fn current() -> u32 {
        if crate::REAL_SIZE == 4 {
            REAL_SINGLE
        } else {
            REAL_DOUBLE
        }
    }
}

/// Program image encoding/decoding errors
#[derive(Debug, Error)]
pub enum ProgramError {
    /// Decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Image real precision does not match this build
    #[error("Build flags {flags:#x} do not match a {REAL_SIZE}-byte real build")]
    RealSizeMismatch {
        /// Flags read from the image header.
        flags: u32,
    },

    /// Structural validation failed
    #[error("Malformed program: {0}")]
    Malformed(String),
}

/// Whether a function body lives in the image or in the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Body is bytecode inside this image.
    Internal,
    /// Calls dispatch to the host handler by name.
    External,
}

/// One entry in the image's function table
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// Internal (bytecode) or external (host) function.
    pub kind: FunctionKind,
    /// Function id used by call instructions.
    pub id: u32,
    /// Body offset relative to the code section (internal only).
    pub entry: u32,
    /// Declared parameter count.
    pub arity: u8,
    /// Function name; external dispatch key.
    pub name: String,
}

/// A loadable SunScript program image
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// Build flags (real precision).
    pub build_flags: u32,
    /// Function table.
    pub functions: Vec<FunctionInfo>,
    /// Concatenated function bodies.
    pub code: Vec<u8>,
}

impl Program {
    /// Look up a function table entry by id.
    pub fn find_function(&self, id: u32) -> Option<&FunctionInfo> {
        self.functions.iter().find(|f| f.id == id)
    }

    /// Encode the image into its byte layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BytecodeWriter::new();
        writer.emit_u32(self.build_flags);
        writer.emit_u32(self.functions.len() as u32);
        for func in &self.functions {
            writer.emit_u8(match func.kind {
                FunctionKind::Internal => 0,
                FunctionKind::External => 1,
            });
            writer.emit_u32(func.id);
            writer.emit_u32(func.entry);
            writer.emit_u8(func.arity);
            writer.emit_str(&func.name);
        }
        writer.emit_bytes(&self.code);
        writer.into_bytes()
    }

    /// Decode an image, checking the build flags against this build's
    /// real precision.
    pub fn decode(bytes: &[u8]) -> Result<Program, ProgramError> {
        let mut reader = BytecodeReader::new(bytes);
        let build_flags = reader.read_u32()?;

        if build_flags & flags::current() == 0 {
            return Err(ProgramError::RealSizeMismatch { flags: build_flags });
        }

        let count = reader.read_u32()? as usize;
        let mut functions = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = match reader.read_u8()? {
                0 => FunctionKind::Internal,
                1 => FunctionKind::External,
                other => {
                    return Err(ProgramError::Malformed(format!(
                        "unknown function kind {other}"
                    )))
                }
            };
            let id = reader.read_u32()?;
            let entry = reader.read_u32()?;
            let arity = reader.read_u8()?;
            let name = reader.read_str()?;
            functions.push(FunctionInfo {
                kind,
                id,
                entry,
                arity,
                name,
            });
        }

        let code = bytes[reader.pos()..].to_vec();
        for func in &functions {
            if func.kind == FunctionKind::Internal && func.entry as usize >= code.len() {
                return Err(ProgramError::Malformed(format!(
                    "function {} entry {:#x} outside code section",
                    func.id, func.entry
                )));
            }
        }

        Ok(Program {
            build_flags,
            functions,
            code,
        })
    }
}

/// One pc → source line mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    /// Offset into the code section.
    pub pc: u32,
    /// Source line the emitter recorded.
    pub line: u32,
}

/// Optional debug sidecar emitted next to an image
///
/// Serialized as JSON; the layout is not part of the image format and may
/// change between releases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugInfo {
    /// pc → line entries, sorted by pc.
    pub lines: Vec<LineEntry>,
    /// Declared local names per function id.
    pub locals: Vec<(u32, Vec<String>)>,
}

impl DebugInfo {
    /// Serialize to the sidecar byte form.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("debug info serialization cannot fail")
    }

    /// Parse a sidecar produced by [`DebugInfo::encode`].
    pub fn decode(bytes: &[u8]) -> Result<DebugInfo, ProgramError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProgramError::Malformed(format!("debug info: {e}")))
    }

    /// Source line in effect at `pc`, if any entry covers it.
    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        self.lines
            .iter()
            .take_while(|entry| entry.pc <= pc)
            .last()
            .map(|entry| entry.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    fn sample_program() -> Program {
        Program {
            build_flags: flags::current(),
            functions: vec![
                FunctionInfo {
                    kind: FunctionKind::Internal,
                    id: 0,
                    entry: 0,
                    arity: 0,
                    name: "main".to_string(),
                },
                FunctionInfo {
                    kind: FunctionKind::External,
                    id: 1,
                    entry: 0,
                    arity: 1,
                    name: "Print".to_string(),
                },
            ],
            code: vec![Opcode::Done.to_u8()],
        }
    }

    #[test]
    fn test_image_roundtrip() {
        let program = sample_program();
        let bytes = program.encode();
        let decoded = Program::decode(&bytes).unwrap();

        assert_eq!(decoded.build_flags, program.build_flags);
        assert_eq!(decoded.functions.len(), 2);
        assert_eq!(decoded.functions[0].name, "main");
        assert_eq!(decoded.functions[1].kind, FunctionKind::External);
        assert_eq!(decoded.code, program.code);
    }

    #[test]
    fn test_real_size_mismatch() {
        let mut program = sample_program();
        program.build_flags = if flags::current() == flags::REAL_DOUBLE {
            flags::REAL_SINGLE
        } else {
            flags::REAL_DOUBLE
        };
        let bytes = program.encode();
        assert!(matches!(
            Program::decode(&bytes),
            Err(ProgramError::RealSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_entry_outside_code() {
        let mut program = sample_program();
        program.functions[0].entry = 100;
        let bytes = program.encode();
        assert!(matches!(
            Program::decode(&bytes),
            Err(ProgramError::Malformed(_))
        ));
    }

    #[test]
    fn test_debug_line_lookup() {
        let debug = DebugInfo {
            lines: vec![
                LineEntry { pc: 0, line: 1 },
                LineEntry { pc: 10, line: 4 },
                LineEntry { pc: 25, line: 9 },
            ],
            locals: vec![],
        };
        assert_eq!(debug.line_for_pc(0), Some(1));
        assert_eq!(debug.line_for_pc(12), Some(4));
        assert_eq!(debug.line_for_pc(30), Some(9));

        let roundtrip = DebugInfo::decode(&debug.encode()).unwrap();
        assert_eq!(roundtrip.lines, debug.lines);
    }
}
