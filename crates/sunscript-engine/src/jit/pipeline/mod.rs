//! Streaming IR optimizer
//!
//! The pipeline is `recorder → guard → fold → dead → output`. Every stage
//! rewrites instructions in place — a removed instruction becomes `Nop` —
//! so stream positions, and with them every outstanding [`IrRef`], stay
//! valid across all stages. [`Optimizer::push_forward`] moves one
//! instruction through the enabled stages; [`Optimizer::drain`] flushes
//! held state, runs the backward liveness walk, and yields the final
//! stream.
//!
//! Side-effectful instructions (calls, yields, table stores) are never
//! dropped or reordered relative to one another or to guards.

mod dce;
mod fold;
mod guard;

pub use dce::DeadCodeElim;
pub use fold::ConstantFold;
pub use guard::GuardCoalesce;

use crate::jit::ir::{IrError, IrIns, IrRef, TracePool};
use crate::jit::snapshot::Snapshot;

/// Which stages run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    /// Pass-through: the stream is emitted exactly as recorded.
    None,
    /// Guard coalescing and constant folding.
    Basic,
    /// Everything, including dead-code elimination.
    Full,
}

impl OptLevel {
    /// Map a host-supplied level number; values past 2 clamp to `Full`.
    pub fn from_u8(level: u8) -> OptLevel {
        match level {
            0 => OptLevel::None,
            1 => OptLevel::Basic,
            _ => OptLevel::Full,
        }
    }
}

/// The three-stage streaming optimizer
pub struct Optimizer {
    guard: GuardCoalesce,
    fold: ConstantFold,
    dead: DeadCodeElim,
    guard_enabled: bool,
    fold_enabled: bool,
    dead_enabled: bool,
    count: usize,
}

impl Optimizer {
    /// Create a pipeline with stages enabled per `level`.
    pub fn new(level: OptLevel) -> Self {
        Optimizer {
            guard: GuardCoalesce::new(),
            fold: ConstantFold::new(),
            dead: DeadCodeElim::new(),
            guard_enabled: level >= OptLevel::Basic,
            fold_enabled: level >= OptLevel::Basic,
            dead_enabled: level >= OptLevel::Full,
            count: 0,
        }
    }

    /// Number of instructions accepted so far; the next instruction's
    /// reference.
    pub fn next_ref(&self) -> IrRef {
        IrRef(self.count as i32)
    }

    /// Push one instruction through the enabled stages. Returns the
    /// instruction's stream reference.
    pub fn push_forward(&mut self, ins: IrIns, pool: &mut TracePool) -> Result<IrRef, IrError> {
        let assigned = IrRef(self.count as i32);
        self.count += 1;

        let mut staged = Vec::with_capacity(2);
        if self.guard_enabled {
            self.guard.push(ins, &mut staged);
        } else {
            staged.push(ins);
        }
        for one in staged {
            let folded = if self.fold_enabled {
                self.fold.push(one, pool)
            } else {
                one
            };
            self.dead.accept(folded)?;
        }
        Ok(assigned)
    }

    /// Flush every stage and produce the final stream. Snapshot slot
    /// references are rewritten through the fold alias map before the
    /// liveness walk uses them as roots.
    pub fn drain(
        mut self,
        pool: &mut TracePool,
        snapshots: &mut [Snapshot],
    ) -> Result<Vec<IrIns>, IrError> {
        let mut staged = Vec::with_capacity(1);
        if self.guard_enabled {
            self.guard.drain(&mut staged);
        }
        for one in staged {
            let folded = if self.fold_enabled {
                self.fold.push(one, pool)
            } else {
                one
            };
            self.dead.accept(folded)?;
        }

        if self.fold_enabled {
            for snapshot in snapshots.iter_mut() {
                snapshot.remap(|r| self.fold.resolve(r));
            }
        }

        self.dead.drain(snapshots, self.dead_enabled)
    }

    /// Convenience for the whole-stream laws: run a finished stream
    /// through a fresh pipeline at `level`.
    pub fn run(
        level: OptLevel,
        stream: &[IrIns],
        pool: &mut TracePool,
        snapshots: &mut [Snapshot],
    ) -> Result<Vec<IrIns>, IrError> {
        let mut opt = Optimizer::new(level);
        for ins in stream {
            opt.push_forward(*ins, pool)?;
        }
        opt.drain(pool, snapshots)
    }
}
