//! Constant folding and algebraic simplification
//!
//! Tracks which references hold known constants and rewrites arithmetic
//! whose operands are all known into a fresh constant load. Identity
//! operations (`x + 0`, `x - 0`, `x * 1`) become `Nop` with the result
//! reference aliased to the surviving operand; incoming instructions have
//! their operands rewritten through the alias map first, so downstream
//! consumers never observe the folded-away reference.
//!
//! Integer division by a constant zero is left untouched — the runtime
//! error must still happen — and the result is marked non-foldable.

use crate::jit::ir::{IrIns, IrOp, IrRef, TracePool};
use rustc_hash::FxHashMap;
use sunscript_bytecode::{Real, TypeTag};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Known {
    Int(i32),
    Real(Real),
    Str(u32),
}

/// Streaming constant folder
pub struct ConstantFold {
    consts: FxHashMap<IrRef, Known>,
    aliases: FxHashMap<IrRef, IrRef>,
    position: i32,
}

impl ConstantFold {
    /// Create an empty stage.
    pub fn new() -> Self {
        ConstantFold {
            consts: FxHashMap::default(),
            aliases: FxHashMap::default(),
            position: 0,
        }
    }

    /// Resolve a reference through the alias chain.
    pub fn resolve(&self, mut reference: IrRef) -> IrRef {
        while let Some(&target) = self.aliases.get(&reference) {
            reference = target;
        }
        reference
    }

    fn known(&self, reference: IrRef) -> Option<Known> {
        self.consts.get(&reference).copied()
    }

    fn alias(&mut self, from: IrRef, to: IrRef) -> IrIns {
        let resolved = self.resolve(to);
        self.aliases.insert(from, resolved);
        if let Some(value) = self.known(resolved) {
            self.consts.insert(from, value);
        }
        IrIns::default()
    }

    fn fold_int(&mut self, at: IrRef, value: i32, pool: &mut TracePool) -> IrIns {
        self.consts.insert(at, Known::Int(value));
        IrIns::load(IrOp::LoadInt, pool.push_int(value), TypeTag::Int)
    }

    fn fold_real(&mut self, at: IrRef, value: Real, pool: &mut TracePool) -> IrIns {
        self.consts.insert(at, Known::Real(value));
        IrIns::load(IrOp::LoadReal, pool.push_real(value), TypeTag::Real)
    }

    /// Push one instruction; returns its (possibly rewritten) form for
    /// the same stream position.
    pub fn push(&mut self, mut ins: IrIns, pool: &mut TracePool) -> IrIns {
        let at = IrRef(self.position);
        self.position += 1;

        ins.remap_operands(|r| self.resolve(r));

        match ins.op {
            IrOp::LoadInt => {
                self.consts.insert(at, Known::Int(pool.read_int(ins.a as u32)));
                ins
            }
            IrOp::LoadReal => {
                self.consts
                    .insert(at, Known::Real(pool.read_real(ins.a as u32)));
                ins
            }
            IrOp::LoadString => {
                self.consts.insert(at, Known::Str(ins.a as u32));
                ins
            }

            IrOp::AddInt | IrOp::SubInt | IrOp::MulInt | IrOp::DivInt => {
                let lhs = self.known(ins.left);
                let rhs = self.known(ins.right);
                match (ins.op, lhs, rhs) {
                    (IrOp::AddInt, Some(Known::Int(l)), Some(Known::Int(r))) => {
                        let value = l.wrapping_add(r);
                        self.fold_int(at, value, pool)
                    }
                    (IrOp::SubInt, Some(Known::Int(l)), Some(Known::Int(r))) => {
                        let value = l.wrapping_sub(r);
                        self.fold_int(at, value, pool)
                    }
                    (IrOp::MulInt, Some(Known::Int(l)), Some(Known::Int(r))) => {
                        let value = l.wrapping_mul(r);
                        self.fold_int(at, value, pool)
                    }
                    (IrOp::DivInt, Some(Known::Int(l)), Some(Known::Int(r))) if r != 0 => {
                        let value = l.wrapping_div(r);
                        self.fold_int(at, value, pool)
                    }
                    // Division by a constant zero stays as-is.
                    (IrOp::DivInt, _, Some(Known::Int(0))) => ins,

                    (IrOp::AddInt, _, Some(Known::Int(0))) => self.alias(at, ins.left),
                    (IrOp::AddInt, Some(Known::Int(0)), _) => self.alias(at, ins.right),
                    (IrOp::SubInt, _, Some(Known::Int(0))) => self.alias(at, ins.left),
                    (IrOp::MulInt, _, Some(Known::Int(1))) => self.alias(at, ins.left),
                    (IrOp::MulInt, Some(Known::Int(1)), _) => self.alias(at, ins.right),
                    (IrOp::MulInt, _, Some(Known::Int(0)))
                    | (IrOp::MulInt, Some(Known::Int(0)), _) => self.fold_int(at, 0, pool),
                    _ => ins,
                }
            }

            IrOp::AddReal | IrOp::SubReal | IrOp::MulReal | IrOp::DivReal => {
                match (self.known(ins.left), self.known(ins.right)) {
                    (Some(Known::Real(l)), Some(Known::Real(r))) => {
                        let value = match ins.op {
                            IrOp::AddReal => l + r,
                            IrOp::SubReal => l - r,
                            IrOp::MulReal => l * r,
                            _ => l / r,
                        };
                        self.fold_real(at, value, pool)
                    }
                    _ => ins,
                }
            }

            IrOp::NegInt => match self.known(ins.left) {
                Some(Known::Int(v)) => self.fold_int(at, v.wrapping_neg(), pool),
                _ => ins,
            },
            IrOp::IncInt => match self.known(ins.left) {
                Some(Known::Int(v)) => self.fold_int(at, v.wrapping_add(1), pool),
                _ => ins,
            },
            IrOp::DecInt => match self.known(ins.left) {
                Some(Known::Int(v)) => self.fold_int(at, v.wrapping_sub(1), pool),
                _ => ins,
            },

            IrOp::ConvIntToReal => match self.known(ins.left) {
                Some(Known::Int(v)) => self.fold_real(at, v as Real, pool),
                _ => ins,
            },

            IrOp::AppStringString => {
                match (self.known(ins.left), self.known(ins.right)) {
                    (Some(Known::Str(l)), Some(Known::Str(r))) => {
                        let folded = format!("{}{}", pool.read_str(l), pool.read_str(r));
                        let offset = pool.push_str(&folded);
                        self.consts.insert(at, Known::Str(offset));
                        IrIns::load(IrOp::LoadString, offset, TypeTag::String)
                    }
                    _ => ins,
                }
            }

            _ => ins,
        }
    }
}

impl Default for ConstantFold {
    fn default() -> Self {
        Self::new()
    }
}
