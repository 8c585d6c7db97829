//! Dead-code elimination stage
//!
//! Buffers the whole trace in its ring, then walks backward from the
//! sinks (guards, snapshots, table stores, calls, loop structure) plus
//! every reference named by a snapshot. Producers not reached by the
//! walk become `Nop`, preserving stream positions so downstream
//! references stay valid.

#[cfg(test)]
use crate::jit::ir::buffer::BUFFER_SIZE;
use crate::jit::ir::{IrBuffer, IrError, IrIns};
use crate::jit::snapshot::Snapshot;
use rustc_hash::FxHashSet;

/// Liveness-based dead-code elimination
pub struct DeadCodeElim {
    buffer: IrBuffer,
}

impl DeadCodeElim {
    /// Create an empty stage.
    pub fn new() -> Self {
        DeadCodeElim {
            buffer: IrBuffer::new(),
        }
    }

    /// Accept one instruction into the ring. A trace longer than
    /// [`BUFFER_SIZE`] fails with `BufferFull` and aborts recording.
    pub fn accept(&mut self, ins: IrIns) -> Result<(), IrError> {
        self.buffer.write(ins)?;
        Ok(())
    }

    /// Run the liveness walk (when `enabled`) and emit the final stream.
    pub fn drain(
        mut self,
        snapshots: &[Snapshot],
        enabled: bool,
    ) -> Result<Vec<IrIns>, IrError> {
        let len = self.buffer.len();
        let mut stream = Vec::with_capacity(len);
        while let Some(ins) = self.buffer.read() {
            stream.push(ins);
        }
        if !enabled {
            return Ok(stream);
        }

        let mut live: FxHashSet<usize> = FxHashSet::default();
        let mut worklist: Vec<usize> = Vec::new();

        for (idx, ins) in stream.iter().enumerate() {
            if ins.op.is_sink() && live.insert(idx) {
                worklist.push(idx);
            }
        }
        for snapshot in snapshots {
            for (_, reference) in snapshot.slots() {
                if reference.is_some() && live.insert(reference.index()) {
                    worklist.push(reference.index());
                }
            }
        }

        while let Some(idx) = worklist.pop() {
            for operand in stream[idx].operands() {
                if operand.is_some()
                    && operand.index() < stream.len()
                    && live.insert(operand.index())
                {
                    worklist.push(operand.index());
                }
            }
        }

        for (idx, ins) in stream.iter_mut().enumerate() {
            if !live.contains(&idx) {
                *ins = IrIns::default();
            }
        }
        Ok(stream)
    }
}

impl Default for DeadCodeElim {
    fn default() -> Self {
        Self::new()
    }
}
