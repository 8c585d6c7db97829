//! Trace intermediate representation
//!
//! A trace is a linear stream of fixed-width instructions. Each
//! instruction's position in the stream is its reference; operands point
//! backward at earlier references. References are monotonically
//! increasing absolute positions and survive every optimizer stage —
//! stages rewrite instructions in place (to `Nop` when dead) rather than
//! removing them.
//!
//! Operand field use per opcode:
//!
//! | op                | a                 | b          | c          | left      | right     |
//! |-------------------|-------------------|------------|------------|-----------|-----------|
//! | `Load*`           | pool offset       |            |            |           |           |
//! | `Load*Local`      |                   |            | slot       |           |           |
//! | `Call`            | name pool offset  | arg count  |            |           |           |
//! | `Yield`           | name pool offset  | arg count  |            |           |           |
//! | `*Arg`            |                   |            |            | value     |           |
//! | arithmetic        |                   |            |            | lhs       | rhs       |
//! | `Inc*`/`Dec*`/`Neg*` |                |            |            | value     |           |
//! | `App*`            |                   |            |            | lhs       | rhs       |
//! | `Cmp*`            |                   |            |            | lhs       | rhs       |
//! | `Guard` (type)    | snapshot id       | type tag   | `0xFF`     | value     |           |
//! | `Guard` (branch)  | snapshot id       | taken flag | jump kind  | cmp       |           |
//! | `Snap`            | snapshot id       | slot count |            |           |           |
//! | `Phi`             |                   |            | slot       | pre       | post      |
//! | `ConvIntToReal`   |                   |            |            | value     |           |
//! | `Table[AH]Get`    |                   |            |            | table     | key       |
//! | `Table[AH]Ref`    |                   |            |            | table     | key       |
//! | `Table[AH]Set`    |                   |            |            | slot ref  | value     |

pub mod buffer;
pub mod display;
pub mod pool;

pub use buffer::IrBuffer;
pub use pool::TracePool;

use sunscript_bytecode::TypeTag;
use thiserror::Error;

/// IR stream errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IrError {
    /// The ring buffer is at capacity
    #[error("IR buffer full")]
    BufferFull,

    /// A reference points outside the buffered window
    #[error("IR reference {0} evicted or out of range")]
    BadRef(i32),
}

/// Reference to an instruction by absolute stream position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrRef(pub i32);

impl IrRef {
    /// Absent operand.
    pub const NONE: IrRef = IrRef(-1);

    /// Whether the reference names an instruction.
    pub fn is_some(self) -> bool {
        self.0 >= 0
    }

    /// Stream position as an index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for IrRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_some() {
            write!(f, "r{}", self.0)
        } else {
            write!(f, "-")
        }
    }
}

/// Marker in the guard `c` field distinguishing type guards from branch
/// guards (whose `c` is the jump kind).
pub const GUARD_TYPE: u8 = 0xFF;

/// Trace IR opcode
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum IrOp {
    LoadInt = 0x00,
    LoadString = 0x01,
    LoadReal = 0x02,
    LoadIntLocal = 0x10,
    LoadStringLocal = 0x11,
    LoadRealLocal = 0x12,
    LoadTableLocal = 0x13,
    Call = 0x20,
    Yield = 0x21,
    IntArg = 0x25,
    StringArg = 0x26,
    RealArg = 0x27,
    TableArg = 0x28,
    IncInt = 0x30,
    DecInt = 0x31,
    IncReal = 0x32,
    DecReal = 0x33,
    AddInt = 0x34,
    SubInt = 0x35,
    MulInt = 0x36,
    DivInt = 0x37,
    NegInt = 0x38,
    AddReal = 0x39,
    SubReal = 0x3A,
    MulReal = 0x3B,
    DivReal = 0x3C,
    NegReal = 0x3D,
    AppIntString = 0x47,
    AppStringInt = 0x48,
    AppStringString = 0x49,
    AppStringReal = 0x4A,
    AppRealString = 0x4B,
    Guard = 0x50,
    CmpInt = 0x51,
    CmpString = 0x52,
    CmpReal = 0x53,
    CmpTable = 0x54,
    Loopback = 0x60,
    Loopstart = 0x61,
    Phi = 0x63,
    Snap = 0x64,
    Nop = 0x66,
    ConvIntToReal = 0x70,
    TableNew = 0x80,
    TableHGet = 0x81,
    TableAGet = 0x82,
    TableHSet = 0x83,
    TableASet = 0x84,
    TableARef = 0x85,
    TableHRef = 0x86,
}

impl IrOp {
    /// Decode an op byte (used when parsing a dumped trace).
    pub fn from_byte(raw: u8) -> Option<IrOp> {
        use IrOp::*;
        Some(match raw {
            0x00 => LoadInt,
            0x01 => LoadString,
            0x02 => LoadReal,
            0x10 => LoadIntLocal,
            0x11 => LoadStringLocal,
            0x12 => LoadRealLocal,
            0x13 => LoadTableLocal,
            0x20 => Call,
            0x21 => Yield,
            0x25 => IntArg,
            0x26 => StringArg,
            0x27 => RealArg,
            0x28 => TableArg,
            0x30 => IncInt,
            0x31 => DecInt,
            0x32 => IncReal,
            0x33 => DecReal,
            0x34 => AddInt,
            0x35 => SubInt,
            0x36 => MulInt,
            0x37 => DivInt,
            0x38 => NegInt,
            0x39 => AddReal,
            0x3A => SubReal,
            0x3B => MulReal,
            0x3C => DivReal,
            0x3D => NegReal,
            0x47 => AppIntString,
            0x48 => AppStringInt,
            0x49 => AppStringString,
            0x4A => AppStringReal,
            0x4B => AppRealString,
            0x50 => Guard,
            0x51 => CmpInt,
            0x52 => CmpString,
            0x53 => CmpReal,
            0x54 => CmpTable,
            0x60 => Loopback,
            0x61 => Loopstart,
            0x63 => Phi,
            0x64 => Snap,
            0x66 => Nop,
            0x70 => ConvIntToReal,
            0x80 => TableNew,
            0x81 => TableHGet,
            0x82 => TableAGet,
            0x83 => TableHSet,
            0x84 => TableASet,
            0x85 => TableARef,
            0x86 => TableHRef,
            _ => return None,
        })
    }

    /// Whether this instruction is a liveness sink: it is observable on
    /// its own and anchors the dead-code walk. Every side-effectful
    /// instruction is a sink, plus the trace-structure ops (guards,
    /// snapshots, loop markers, phis) and call argument marshalling.
    pub fn is_sink(self) -> bool {
        self.has_side_effects()
            || matches!(
                self,
                IrOp::Guard
                    | IrOp::Snap
                    | IrOp::Loopback
                    | IrOp::Loopstart
                    | IrOp::Phi
                    | IrOp::IntArg
                    | IrOp::StringArg
                    | IrOp::RealArg
                    | IrOp::TableArg
            )
    }

    /// Whether the optimizer may never drop, duplicate, or reorder this
    /// instruction relative to other effects.
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            IrOp::Call | IrOp::Yield | IrOp::TableHSet | IrOp::TableASet
        )
    }
}

/// One fixed-width trace instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IrIns {
    /// Opcode.
    pub op: IrOp,
    /// Constant-pool offset, call name offset, or snapshot id.
    pub a: i32,
    /// Offset, argument count, slot count, type tag, or taken flag.
    pub b: i16,
    /// Slot, jump kind, or [`GUARD_TYPE`].
    pub c: u8,
    /// First operand reference.
    pub left: IrRef,
    /// Second operand reference.
    pub right: IrRef,
    /// Result type annotation.
    pub ty: TypeTag,
}

impl Default for IrIns {
    fn default() -> Self {
        IrIns::op0(IrOp::Nop, TypeTag::Void)
    }
}

impl IrIns {
    /// Instruction with no operands.
    pub fn op0(op: IrOp, ty: TypeTag) -> IrIns {
        IrIns {
            op,
            a: 0,
            b: 0,
            c: 0,
            left: IrRef::NONE,
            right: IrRef::NONE,
            ty,
        }
    }

    /// Constant load from the trace pool.
    pub fn load(op: IrOp, offset: u32, ty: TypeTag) -> IrIns {
        IrIns {
            a: offset as i32,
            ..IrIns::op0(op, ty)
        }
    }

    /// Local load from an activation record slot.
    pub fn load_local(op: IrOp, slot: u8, ty: TypeTag) -> IrIns {
        IrIns {
            c: slot,
            ..IrIns::op0(op, ty)
        }
    }

    /// Single-operand instruction.
    pub fn unary(op: IrOp, value: IrRef, ty: TypeTag) -> IrIns {
        IrIns {
            left: value,
            ..IrIns::op0(op, ty)
        }
    }

    /// Two-operand instruction.
    pub fn binary(op: IrOp, left: IrRef, right: IrRef, ty: TypeTag) -> IrIns {
        IrIns {
            left,
            right,
            ..IrIns::op0(op, ty)
        }
    }

    /// External call: `name_offset` into the pool, `args` preceding `*Arg`
    /// instructions.
    pub fn call(name_offset: u32, args: u8, ty: TypeTag) -> IrIns {
        IrIns {
            a: name_offset as i32,
            b: args as i16,
            ..IrIns::op0(IrOp::Call, ty)
        }
    }

    /// Snapshot marker: `count` (slot, ref) pairs recorded under `snap_id`.
    pub fn snap(snap_id: u16, count: u8) -> IrIns {
        IrIns {
            a: snap_id as i32,
            b: count as i16,
            ..IrIns::op0(IrOp::Snap, TypeTag::Void)
        }
    }

    /// Type guard: exit through `snap_id` unless `value` has `expected`.
    pub fn guard_type(snap_id: u16, value: IrRef, expected: TypeTag) -> IrIns {
        IrIns {
            a: snap_id as i32,
            b: expected as u8 as i16,
            c: GUARD_TYPE,
            left: value,
            ..IrIns::op0(IrOp::Guard, TypeTag::Void)
        }
    }

    /// Branch guard: exit through `snap_id` unless the comparison at
    /// `cmp` still resolves `kind` to `taken`.
    pub fn guard_branch(
        snap_id: u16,
        cmp: IrRef,
        kind: sunscript_bytecode::JumpKind,
        taken: bool,
    ) -> IrIns {
        IrIns {
            a: snap_id as i32,
            b: taken as i16,
            c: kind as u8,
            left: cmp,
            ..IrIns::op0(IrOp::Guard, TypeTag::Void)
        }
    }

    /// Loop-carried binding for the local in `slot`.
    pub fn phi(slot: u8, pre: IrRef, post: IrRef, ty: TypeTag) -> IrIns {
        IrIns {
            c: slot,
            left: pre,
            right: post,
            ..IrIns::op0(IrOp::Phi, ty)
        }
    }

    /// Whether this is a type guard (as opposed to a branch guard).
    pub fn is_type_guard(&self) -> bool {
        self.op == IrOp::Guard && self.c == GUARD_TYPE
    }

    /// Operand references, absent slots as [`IrRef::NONE`].
    pub fn operands(&self) -> [IrRef; 2] {
        [self.left, self.right]
    }

    /// Rewrite operand references through `remap`.
    pub fn remap_operands(&mut self, mut remap: impl FnMut(IrRef) -> IrRef) {
        if self.left.is_some() {
            self.left = remap(self.left);
        }
        if self.right.is_some() {
            self.right = remap(self.right);
        }
    }
}
