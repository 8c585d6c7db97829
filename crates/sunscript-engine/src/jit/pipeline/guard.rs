//! Guard coalescing stage
//!
//! In a straight-line trace an earlier guard dominates every later one,
//! so a guard repeating an identical check on the same reference can
//! never fire and is rewritten to `Nop`, together with the snapshot
//! that precedes it. The stage holds each `Snap` back until it sees the
//! instruction that follows, which is how a snapshot/guard pair is
//! dropped as a unit.

use crate::jit::ir::{IrIns, IrOp};
use rustc_hash::FxHashSet;

/// Key identifying a guard's check: (guarded ref, c, b) — for type
/// guards the expected tag, for branch guards the jump kind and
/// recorded direction.
type GuardKey = (i32, u8, i16);

/// Streaming guard deduplication
pub struct GuardCoalesce {
    seen: FxHashSet<GuardKey>,
    held_snap: Option<IrIns>,
}

impl GuardCoalesce {
    /// Create an empty stage.
    pub fn new() -> Self {
        GuardCoalesce {
            seen: FxHashSet::default(),
            held_snap: None,
        }
    }

    /// Push one instruction; emits zero, one, or two instructions into
    /// `out` in their original order.
    pub fn push(&mut self, ins: IrIns, out: &mut Vec<IrIns>) {
        match ins.op {
            IrOp::Snap => {
                if let Some(held) = self.held_snap.replace(ins) {
                    out.push(held);
                }
            }
            IrOp::Guard => {
                let key: GuardKey = (ins.left.0, ins.c, ins.b);
                if self.seen.insert(key) {
                    if let Some(held) = self.held_snap.take() {
                        out.push(held);
                    }
                    out.push(ins);
                } else {
                    // Dominated duplicate: drop the pair, keep positions.
                    if self.held_snap.take().is_some() {
                        out.push(IrIns::default());
                    }
                    out.push(IrIns::default());
                }
            }
            _ => {
                if let Some(held) = self.held_snap.take() {
                    out.push(held);
                }
                out.push(ins);
            }
        }
    }

    /// Flush the held snapshot, if any.
    pub fn drain(&mut self, out: &mut Vec<IrIns>) {
        if let Some(held) = self.held_snap.take() {
            out.push(held);
        }
    }
}

impl Default for GuardCoalesce {
    fn default() -> Self {
        Self::new()
    }
}
