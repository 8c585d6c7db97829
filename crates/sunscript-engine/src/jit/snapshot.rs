//! Deoptimization snapshots
//!
//! A snapshot is the minimal set of (local slot → IR reference) pairs a
//! guard needs to rebuild interpreter state: the locals the trace has
//! redefined, plus the bytecode pc to resume at. Snapshots are keyed by a
//! monotonically increasing id assigned at recording time.

use crate::jit::ir::IrRef;

/// State map for one guard exit
#[derive(Debug, Clone)]
pub struct Snapshot {
    id: u16,
    pc: usize,
    slots: Vec<(u8, IrRef)>,
}

impl Snapshot {
    /// Create a snapshot anchored at bytecode `pc`.
    pub fn new(id: u16, pc: usize, slots: Vec<(u8, IrRef)>) -> Self {
        Snapshot { id, pc, slots }
    }

    /// Snapshot id, as referenced by `Snap`/`Guard` instructions.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Bytecode offset interpretation resumes at after this exit.
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// The (slot, reference) pairs to restore.
    pub fn slots(&self) -> &[(u8, IrRef)] {
        &self.slots
    }

    /// Number of restored slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the snapshot restores nothing.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Rewrite slot references (optimizer aliasing).
    pub fn remap(&mut self, mut remap: impl FnMut(IrRef) -> IrRef) {
        for (_, reference) in &mut self.slots {
            *reference = remap(*reference);
        }
    }
}
