//! Bytecode opcodes for the SunScript VM
//!
//! All opcodes are single-byte instructions; operands follow the opcode
//! byte in little-endian order. The two high bits of the opcode byte are
//! reserved for markers: [`MK_LOOPSTART`] flags the head of a hot loop and
//! [`MK_TRACESTART`] asks the trace recorder to begin recording at this
//! instruction. Stripping the marker bits yields the base opcode.

/// Marker bit: this instruction is the head of a loop.
pub const MK_LOOPSTART: u8 = 0x80;

/// Marker bit: begin trace recording at this instruction.
pub const MK_TRACESTART: u8 = 0x40;

/// Marker bits decoded alongside an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Markers {
    /// The instruction carries [`MK_LOOPSTART`].
    pub loop_start: bool,
    /// The instruction carries [`MK_TRACESTART`].
    pub trace_start: bool,
}

impl Markers {
    /// No markers set.
    pub const NONE: Markers = Markers {
        loop_start: false,
        trace_start: false,
    };

    /// Render the markers back into their opcode bits.
    pub fn bits(self) -> u8 {
        let mut bits = 0;
        if self.loop_start {
            bits |= MK_LOOPSTART;
        }
        if self.trace_start {
            bits |= MK_TRACESTART;
        }
        bits
    }
}

/// Bytecode opcode enumeration
///
/// Operand encodings (all little-endian):
/// - `Push`: type tag (u8), then an int (i32), real (`REAL_SIZE` bytes),
///   or string (u16 length + UTF-8 bytes, no terminator)
/// - `Pop`, `PushLocal`: local id (u8)
/// - `Set`: local id (u8), then a tagged immediate as for `Push`
/// - `Call`, `CallD`, `Yield`: function id (u32), argument count (u8)
/// - `CallO`: argument count (u8); the callee is a `Func` operand on the stack
/// - `CallM`: method name (u16 length + UTF-8), argument count (u8); the
///   receiver table is on the stack above the arguments
/// - `PushFunc`: function id (u32)
/// - `Jump`: jump kind (u8), offset (i16, relative to the end of this
///   instruction)
/// - everything else: no operands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Push a tagged immediate constant
    Push = 0x00,
    /// Pop the top of stack into a local
    Pop = 0x01,
    /// Call a function by id
    Call = 0x02,
    /// Call an external function, then suspend the VM
    Yield = 0x03,
    /// Declare one local slot in the current activation record
    Local = 0x04,
    /// Store a tagged immediate directly into a local
    Set = 0x05,
    /// Direct call by id (emitter-resolved, validated at load)
    CallD = 0x06,
    /// End of top-level execution
    Done = 0x08,
    /// Push a local onto the operand stack
    PushLocal = 0x09,
    /// Allocate a fresh table and push it
    TableNew = 0x0A,
    /// Pop key and table, push the addressed slot's value
    TableGet = 0x0B,
    /// Pop value, key, and table, store value into the addressed slot
    TableSet = 0x0C,
    /// Arithmetic negation of the top of stack
    UnaryMinus = 0x0D,
    /// Increment the top of stack by one
    Increment = 0x0E,
    /// Decrement the top of stack by one
    Decrement = 0x0F,
    /// Pop two values, push their sum
    Add = 0x10,
    /// Pop two values, push their difference
    Sub = 0x1A,
    /// Pop two values, push their product
    Mul = 0x1B,
    /// Pop two values, push their quotient
    Div = 0x1C,
    /// Duplicate the top of stack
    Dup = 0x20,
    /// Push a function value by id
    PushFunc = 0x21,
    /// Pop two values, push their string concatenation
    Format = 0x22,
    /// Conditional or unconditional branch on the comparison flag
    Jump = 0x23,
    /// Pop two values and set the comparison flag
    Cmp = 0x24,
    /// Return from the current function
    Return = 0x25,
    /// Call through a function value on the operand stack
    CallO = 0x26,
    /// Call a method resolved from a receiver table
    CallM = 0x27,
}

impl Opcode {
    /// Decode a raw opcode byte, stripping and returning the marker bits.
    ///
    /// Returns `None` when the base opcode is not part of the instruction
    /// set.
    pub fn from_byte(raw: u8) -> Option<(Opcode, Markers)> {
        let markers = Markers {
            loop_start: raw & MK_LOOPSTART != 0,
            trace_start: raw & MK_TRACESTART != 0,
        };
        let op = match raw & !(MK_LOOPSTART | MK_TRACESTART) {
            0x00 => Opcode::Push,
            0x01 => Opcode::Pop,
            0x02 => Opcode::Call,
            0x03 => Opcode::Yield,
            0x04 => Opcode::Local,
            0x05 => Opcode::Set,
            0x06 => Opcode::CallD,
            0x08 => Opcode::Done,
            0x09 => Opcode::PushLocal,
            0x0A => Opcode::TableNew,
            0x0B => Opcode::TableGet,
            0x0C => Opcode::TableSet,
            0x0D => Opcode::UnaryMinus,
            0x0E => Opcode::Increment,
            0x0F => Opcode::Decrement,
            0x10 => Opcode::Add,
            0x1A => Opcode::Sub,
            0x1B => Opcode::Mul,
            0x1C => Opcode::Div,
            0x20 => Opcode::Dup,
            0x21 => Opcode::PushFunc,
            0x22 => Opcode::Format,
            0x23 => Opcode::Jump,
            0x24 => Opcode::Cmp,
            0x25 => Opcode::Return,
            0x26 => Opcode::CallO,
            0x27 => Opcode::CallM,
            _ => return None,
        };
        Some((op, markers))
    }

    /// The raw opcode byte without markers.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Runtime type tags
///
/// Tags appear in `Push`/`Set` immediates, in managed block headers, and
/// as IR result type annotations.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// No value
    Void = 0x0,
    /// 64-bit integer
    Int = 0x1,
    /// Managed string
    String = 0x2,
    /// Real ([`crate::Real`])
    Real = 0x3,
    /// Managed table
    Object = 0x4,
    /// Function id
    Func = 0x5,
}

impl TypeTag {
    /// Decode a tag byte.
    pub fn from_byte(raw: u8) -> Option<TypeTag> {
        match raw {
            0x0 => Some(TypeTag::Void),
            0x1 => Some(TypeTag::Int),
            0x2 => Some(TypeTag::String),
            0x3 => Some(TypeTag::Real),
            0x4 => Some(TypeTag::Object),
            0x5 => Some(TypeTag::Func),
            _ => None,
        }
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeTag::Void => write!(f, "void"),
            TypeTag::Int => write!(f, "int"),
            TypeTag::String => write!(f, "string"),
            TypeTag::Real => write!(f, "real"),
            TypeTag::Object => write!(f, "object"),
            TypeTag::Func => write!(f, "func"),
        }
    }
}

/// Branch condition for [`Opcode::Jump`]
///
/// Conditions other than `Always` consult the flag set by the most recent
/// `Cmp`: negative when left < right, zero when equal, positive when
/// left > right.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpKind {
    /// Unconditional branch
    Always = 0x0,
    /// Branch when equal
    Eq = 0x1,
    /// Branch when not equal
    Ne = 0x2,
    /// Branch when greater or equal
    Ge = 0x3,
    /// Branch when less or equal
    Le = 0x4,
    /// Branch when less
    Lt = 0x5,
    /// Branch when greater
    Gt = 0x6,
}

impl JumpKind {
    /// Decode a jump kind byte.
    pub fn from_byte(raw: u8) -> Option<JumpKind> {
        match raw {
            0x0 => Some(JumpKind::Always),
            0x1 => Some(JumpKind::Eq),
            0x2 => Some(JumpKind::Ne),
            0x3 => Some(JumpKind::Ge),
            0x4 => Some(JumpKind::Le),
            0x5 => Some(JumpKind::Lt),
            0x6 => Some(JumpKind::Gt),
            _ => None,
        }
    }

    /// Whether the branch is taken for a comparison flag value.
    pub fn taken(self, flag: i32) -> bool {
        match self {
            JumpKind::Always => true,
            JumpKind::Eq => flag == 0,
            JumpKind::Ne => flag != 0,
            JumpKind::Ge => flag >= 0,
            JumpKind::Le => flag <= 0,
            JumpKind::Lt => flag < 0,
            JumpKind::Gt => flag > 0,
        }
    }
}
