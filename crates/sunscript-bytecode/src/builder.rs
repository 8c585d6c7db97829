//! Program emitter
//!
//! Builds program images instruction by instruction. A [`ProgramBuilder`]
//! owns the function table; each function body is emitted through a
//! [`BlockBuilder`] and handed back with [`ProgramBuilder::define`]. The
//! top-level block is placed first in the code section, so execution
//! begins at code offset 0.
//!
//! Jumps go through [`Label`]s: emit the jump against a label, mark the
//! label at its target, and the builder back-patches the relative offset.

use crate::encoder::BytecodeWriter;
use crate::opcode::{JumpKind, Opcode, TypeTag, MK_LOOPSTART, MK_TRACESTART};
use crate::program::{flags, DebugInfo, FunctionInfo, FunctionKind, LineEntry, Program};
use crate::Real;
use thiserror::Error;

/// Errors raised while assembling a program
#[derive(Debug, Error)]
pub enum BuildError {
    /// A label was jumped to but never marked
    #[error("Label {0} was never marked")]
    UnresolvedLabel(usize),

    /// A jump target does not fit the signed 16-bit offset encoding
    #[error("Jump offset {0} out of range")]
    JumpOutOfRange(i64),

    /// No block was flagged top-level
    #[error("Program has no top-level block")]
    NoTopLevel,

    /// More than one block was flagged top-level
    #[error("Program has more than one top-level block")]
    MultipleTopLevel,
}

/// A branch target within one function body
///
/// Holds the marked position and the jump sites waiting on it.
#[derive(Debug, Default)]
pub struct Label {
    pos: Option<usize>,
    jumps: Vec<usize>,
}

/// Emitter for one function body
pub struct BlockBuilder {
    id: u32,
    name: String,
    arity: u8,
    top_level: bool,
    writer: BytecodeWriter,
    labels: Vec<Label>,
    pending_markers: u8,
    lines: Vec<LineEntry>,
    local_names: Vec<String>,
    overflowed_jump: Option<i64>,
}

impl BlockBuilder {
    fn new(id: u32, name: &str, arity: u8, top_level: bool) -> Self {
        Self {
            id,
            name: name.to_string(),
            arity,
            top_level,
            writer: BytecodeWriter::new(),
            labels: Vec::new(),
            pending_markers: 0,
            lines: Vec::new(),
            local_names: Vec::new(),
            overflowed_jump: None,
        }
    }

    /// Function id assigned to this block.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current body offset; useful for tests asserting layout.
    pub fn offset(&self) -> usize {
        self.writer.offset()
    }

    fn emit_op(&mut self, op: Opcode) {
        self.writer.emit_u8(op.to_u8() | self.pending_markers);
        self.pending_markers = 0;
    }

    /// Mark the next emitted instruction as a loop head.
    pub fn loop_start(&mut self) {
        self.pending_markers |= MK_LOOPSTART;
    }

    /// Mark the next emitted instruction as a trace start.
    pub fn trace_start(&mut self) {
        self.pending_markers |= MK_TRACESTART;
    }

    /// Record the source line for instructions emitted from here on.
    pub fn debug_line(&mut self, line: u32) {
        self.lines.push(LineEntry {
            pc: self.writer.offset() as u32,
            line,
        });
    }

    /// Push an integer immediate.
    pub fn push_int(&mut self, value: i32) {
        self.emit_op(Opcode::Push);
        self.writer.emit_u8(TypeTag::Int as u8);
        self.writer.emit_i32(value);
    }

    /// Push a real immediate.
    pub fn push_real(&mut self, value: Real) {
        self.emit_op(Opcode::Push);
        self.writer.emit_u8(TypeTag::Real as u8);
        self.writer.emit_real(value);
    }

    /// Push a string immediate.
    pub fn push_string(&mut self, value: &str) {
        self.emit_op(Opcode::Push);
        self.writer.emit_u8(TypeTag::String as u8);
        self.writer.emit_str(value);
    }

    /// Push a function value.
    pub fn push_func(&mut self, id: u32) {
        self.emit_op(Opcode::PushFunc);
        self.writer.emit_u32(id);
    }

    /// Push a local onto the operand stack.
    pub fn push_local(&mut self, local: u8) {
        self.emit_op(Opcode::PushLocal);
        self.writer.emit_u8(local);
    }

    /// Pop the top of stack into a local.
    pub fn pop_local(&mut self, local: u8) {
        self.emit_op(Opcode::Pop);
        self.writer.emit_u8(local);
    }

    /// Declare one local slot; the name only reaches the debug sidecar.
    pub fn local(&mut self, name: &str) {
        self.local_names.push(name.to_string());
        self.emit_op(Opcode::Local);
    }

    /// Record a parameter name for the debug sidecar. Parameters occupy
    /// the first `arity` slots and need no declaration opcode.
    pub fn parameter(&mut self, name: &str) {
        self.local_names.push(name.to_string());
    }

    /// Store an integer immediate into a local.
    pub fn set_int(&mut self, local: u8, value: i32) {
        self.emit_op(Opcode::Set);
        self.writer.emit_u8(local);
        self.writer.emit_u8(TypeTag::Int as u8);
        self.writer.emit_i32(value);
    }

    /// Store a string immediate into a local.
    pub fn set_string(&mut self, local: u8, value: &str) {
        self.emit_op(Opcode::Set);
        self.writer.emit_u8(local);
        self.writer.emit_u8(TypeTag::String as u8);
        self.writer.emit_str(value);
    }

    /// Pop two values, push their sum.
    pub fn add(&mut self) {
        self.emit_op(Opcode::Add);
    }

    /// Pop two values, push their difference.
    pub fn sub(&mut self) {
        self.emit_op(Opcode::Sub);
    }

    /// Pop two values, push their product.
    pub fn mul(&mut self) {
        self.emit_op(Opcode::Mul);
    }

    /// Pop two values, push their quotient.
    pub fn div(&mut self) {
        self.emit_op(Opcode::Div);
    }

    /// Negate the top of stack.
    pub fn unary_minus(&mut self) {
        self.emit_op(Opcode::UnaryMinus);
    }

    /// Increment the top of stack.
    pub fn increment(&mut self) {
        self.emit_op(Opcode::Increment);
    }

    /// Decrement the top of stack.
    pub fn decrement(&mut self) {
        self.emit_op(Opcode::Decrement);
    }

    /// Pop two values, push their string concatenation.
    pub fn format(&mut self) {
        self.emit_op(Opcode::Format);
    }

    /// Duplicate the top of stack.
    pub fn dup(&mut self) {
        self.emit_op(Opcode::Dup);
    }

    /// Pop two values and set the comparison flag.
    pub fn compare(&mut self) {
        self.emit_op(Opcode::Cmp);
    }

    /// Allocate a fresh table and push it.
    pub fn table_new(&mut self) {
        self.emit_op(Opcode::TableNew);
    }

    /// Pop key and table, push the slot value.
    pub fn table_get(&mut self) {
        self.emit_op(Opcode::TableGet);
    }

    /// Pop value, key, and table, store into the slot.
    pub fn table_set(&mut self) {
        self.emit_op(Opcode::TableSet);
    }

    /// Call a function by id.
    pub fn call(&mut self, id: u32, num_args: u8) {
        self.emit_op(Opcode::Call);
        self.writer.emit_u32(id);
        self.writer.emit_u8(num_args);
    }

    /// Direct call by id.
    pub fn call_direct(&mut self, id: u32, num_args: u8) {
        self.emit_op(Opcode::CallD);
        self.writer.emit_u32(id);
        self.writer.emit_u8(num_args);
    }

    /// Call through a `Func` value on the operand stack.
    pub fn call_operand(&mut self, num_args: u8) {
        self.emit_op(Opcode::CallO);
        self.writer.emit_u8(num_args);
    }

    /// Call a method resolved from the receiver table on the stack.
    pub fn call_method(&mut self, name: &str, num_args: u8) {
        self.emit_op(Opcode::CallM);
        self.writer.emit_str(name);
        self.writer.emit_u8(num_args);
    }

    /// Call an external function, then suspend the VM.
    pub fn yield_call(&mut self, id: u32, num_args: u8) {
        self.emit_op(Opcode::Yield);
        self.writer.emit_u32(id);
        self.writer.emit_u8(num_args);
    }

    /// Return from the current function.
    pub fn ret(&mut self) {
        self.emit_op(Opcode::Return);
    }

    /// End top-level execution.
    pub fn done(&mut self) {
        self.emit_op(Opcode::Done);
    }

    /// Create a fresh, unmarked label.
    pub fn create_label(&mut self) -> usize {
        self.labels.push(Label::default());
        self.labels.len() - 1
    }

    fn patch_jump(&mut self, site: usize, target: usize) {
        let offset = target as i64 - (site as i64 + 2);
        if i16::try_from(offset).is_err() {
            self.overflowed_jump.get_or_insert(offset);
            return;
        }
        self.writer.patch_i16(site, offset as i16);
    }

    /// Emit a jump against `label`, patched once the label is marked.
    pub fn jump(&mut self, kind: JumpKind, label: usize) {
        self.emit_op(Opcode::Jump);
        self.writer.emit_u8(kind as u8);
        let site = self.writer.offset();
        self.writer.emit_i16(0);
        match self.labels[label].pos {
            // Backward jump: target already known.
            Some(pos) => self.patch_jump(site, pos),
            None => self.labels[label].jumps.push(site),
        }
    }

    /// Mark `label` at the current position and patch pending jumps.
    pub fn mark_label(&mut self, label: usize) {
        let pos = self.writer.offset();
        self.labels[label].pos = Some(pos);
        let jumps = std::mem::take(&mut self.labels[label].jumps);
        for site in jumps {
            self.patch_jump(site, pos);
        }
    }

    fn finish(self) -> Result<FinishedBlock, BuildError> {
        if let Some(offset) = self.overflowed_jump {
            return Err(BuildError::JumpOutOfRange(offset));
        }
        for (idx, label) in self.labels.iter().enumerate() {
            if label.pos.is_none() && !label.jumps.is_empty() {
                return Err(BuildError::UnresolvedLabel(idx));
            }
        }
        Ok(FinishedBlock {
            id: self.id,
            name: self.name,
            arity: self.arity,
            top_level: self.top_level,
            code: self.writer.into_bytes(),
            lines: self.lines,
            local_names: self.local_names,
        })
    }
}

struct FinishedBlock {
    id: u32,
    name: String,
    arity: u8,
    top_level: bool,
    code: Vec<u8>,
    lines: Vec<LineEntry>,
    local_names: Vec<String>,
}

/// Builder for a whole program image
pub struct ProgramBuilder {
    next_id: u32,
    blocks: Vec<FinishedBlock>,
    externals: Vec<(u32, u8, String)>,
}

impl ProgramBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            next_id: 0,
            blocks: Vec::new(),
            externals: Vec::new(),
        }
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Begin a function body. Exactly one block per program must be
    /// `top_level`; it is placed at code offset 0.
    pub fn begin_function(&mut self, name: &str, arity: u8, top_level: bool) -> BlockBuilder {
        let id = self.alloc_id();
        BlockBuilder::new(id, name, arity, top_level)
    }

    /// Finish a body and add it to the function table.
    pub fn define(&mut self, block: BlockBuilder) -> Result<u32, BuildError> {
        let finished = block.finish()?;
        let id = finished.id;
        self.blocks.push(finished);
        Ok(id)
    }

    /// Register a host function; calls to the returned id dispatch to the
    /// host handler under `name`.
    pub fn external(&mut self, name: &str, arity: u8) -> u32 {
        let id = self.alloc_id();
        self.externals.push((id, arity, name.to_string()));
        id
    }

    /// Assemble the image and its debug sidecar.
    pub fn build(mut self) -> Result<(Program, DebugInfo), BuildError> {
        let top_count = self.blocks.iter().filter(|b| b.top_level).count();
        match top_count {
            0 => return Err(BuildError::NoTopLevel),
            1 => {}
            _ => return Err(BuildError::MultipleTopLevel),
        }
        // Top-level body first: execution starts at code offset 0.
        self.blocks.sort_by_key(|b| !b.top_level);

        let mut program = Program {
            build_flags: flags::current(),
            ..Program::default()
        };
        let mut debug = DebugInfo::default();
        let mut code = Vec::new();

        for block in &self.blocks {
            let entry = code.len() as u32;
            program.functions.push(FunctionInfo {
                kind: FunctionKind::Internal,
                id: block.id,
                entry,
                arity: block.arity,
                name: block.name.clone(),
            });
            for line in &block.lines {
                debug.lines.push(LineEntry {
                    pc: entry + line.pc,
                    line: line.line,
                });
            }
            if !block.local_names.is_empty() {
                debug.locals.push((block.id, block.local_names.clone()));
            }
            code.extend_from_slice(&block.code);
        }
        for (id, arity, name) in &self.externals {
            program.functions.push(FunctionInfo {
                kind: FunctionKind::External,
                id: *id,
                entry: 0,
                arity: *arity,
                name: name.clone(),
            });
        }

        debug.lines.sort_by_key(|entry| entry.pc);
        program.code = code;
        Ok((program, debug))
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::BytecodeReader;

    #[test]
    fn test_top_level_first() {
        let mut program = ProgramBuilder::new();

        let mut helper = program.begin_function("helper", 1, false);
        helper.push_local(0);
        helper.ret();
        let helper_id = program.define(helper).unwrap();

        let mut main = program.begin_function("main", 0, true);
        main.push_int(1);
        main.call(helper_id, 1);
        main.done();
        let main_id = program.define(main).unwrap();

        let (image, _) = program.build().unwrap();
        let main_info = image.find_function(main_id).unwrap();
        assert_eq!(main_info.entry, 0);
        assert!(image.find_function(helper_id).unwrap().entry > 0);
    }

    #[test]
    fn test_forward_jump_patching() {
        let mut program = ProgramBuilder::new();
        let mut main = program.begin_function("main", 0, true);

        main.push_int(1);
        main.push_int(1);
        main.compare();
        let skip = main.create_label();
        main.jump(JumpKind::Ne, skip);
        let jump_end = main.offset();
        main.push_int(42);
        main.mark_label(skip);
        main.done();
        let target = main.offset() - 1;

        program.define(main).unwrap();
        let (image, _) = program.build().unwrap();

        // The offset operand sits two bytes before the end of the jump.
        let mut reader = BytecodeReader::at(&image.code, jump_end - 2);
        let offset = reader.read_i16().unwrap();
        assert_eq!(jump_end as i64 + offset as i64, target as i64);
    }

    #[test]
    fn test_backward_jump() {
        let mut program = ProgramBuilder::new();
        let mut main = program.begin_function("main", 0, true);

        let head = main.create_label();
        main.mark_label(head);
        let head_pos = main.offset();
        main.push_int(0);
        main.jump(JumpKind::Always, head);
        let jump_end = main.offset();
        main.done();

        program.define(main).unwrap();
        let (image, _) = program.build().unwrap();

        let mut reader = BytecodeReader::at(&image.code, jump_end - 2);
        let offset = reader.read_i16().unwrap();
        assert_eq!(jump_end as i64 + offset as i64, head_pos as i64);
    }

    #[test]
    fn test_unresolved_label() {
        let mut program = ProgramBuilder::new();
        let mut main = program.begin_function("main", 0, true);
        let label = main.create_label();
        main.jump(JumpKind::Always, label);
        assert!(matches!(
            program.define(main),
            Err(BuildError::UnresolvedLabel(_))
        ));
    }

    #[test]
    fn test_marker_applies_to_next_op() {
        let mut program = ProgramBuilder::new();
        let mut main = program.begin_function("main", 0, true);
        main.loop_start();
        main.trace_start();
        main.push_int(7);
        main.done();
        program.define(main).unwrap();
        let (image, _) = program.build().unwrap();

        assert_eq!(
            image.code[0],
            Opcode::Push.to_u8() | MK_LOOPSTART | MK_TRACESTART
        );
        // Marker is one-shot.
        assert_eq!(image.code[6], Opcode::Done.to_u8());
    }

    #[test]
    fn test_missing_top_level() {
        let mut program = ProgramBuilder::new();
        let block = program.begin_function("f", 0, false);
        program.define(block).unwrap();
        assert!(matches!(program.build(), Err(BuildError::NoTopLevel)));
    }

    #[test]
    fn test_debug_lines_rebased() {
        let mut program = ProgramBuilder::new();

        let mut helper = program.begin_function("helper", 0, false);
        helper.debug_line(10);
        helper.ret();
        program.define(helper).unwrap();

        let mut main = program.begin_function("main", 0, true);
        main.debug_line(1);
        main.done();
        program.define(main).unwrap();

        let (image, debug) = program.build().unwrap();
        let helper_entry = image.functions.iter().find(|f| f.name == "helper").unwrap().entry;
        assert_eq!(debug.line_for_pc(0), Some(1));
        assert_eq!(debug.line_for_pc(helper_entry), Some(10));
    }
}
