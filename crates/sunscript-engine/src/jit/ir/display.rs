//! Trace rendering and dump encoding
//!
//! `Display` output is for human inspection; [`dump_trace`] produces the
//! byte form a back-end consumes within a session, and [`parse_trace`]
//! reads it back. The dump is not a persistent format.

use super::{IrIns, IrOp, IrRef};
use std::fmt;
use sunscript_bytecode::TypeTag;

impl IrOp {
    /// Mnemonic used by `Display` output.
    pub fn name(self) -> &'static str {
        match self {
            IrOp::LoadInt => "load.int",
            IrOp::LoadString => "load.string",
            IrOp::LoadReal => "load.real",
            IrOp::LoadIntLocal => "load.int.local",
            IrOp::LoadStringLocal => "load.string.local",
            IrOp::LoadRealLocal => "load.real.local",
            IrOp::LoadTableLocal => "load.table.local",
            IrOp::Call => "call",
            IrOp::Yield => "yield",
            IrOp::IntArg => "arg.int",
            IrOp::StringArg => "arg.string",
            IrOp::RealArg => "arg.real",
            IrOp::TableArg => "arg.table",
            IrOp::IncInt => "inc.int",
            IrOp::DecInt => "dec.int",
            IrOp::IncReal => "inc.real",
            IrOp::DecReal => "dec.real",
            IrOp::AddInt => "add.int",
            IrOp::SubInt => "sub.int",
            IrOp::MulInt => "mul.int",
            IrOp::DivInt => "div.int",
            IrOp::NegInt => "neg.int",
            IrOp::AddReal => "add.real",
            IrOp::SubReal => "sub.real",
            IrOp::MulReal => "mul.real",
            IrOp::DivReal => "div.real",
            IrOp::NegReal => "neg.real",
            IrOp::AppIntString => "app.int.string",
            IrOp::AppStringInt => "app.string.int",
            IrOp::AppStringString => "app.string.string",
            IrOp::AppStringReal => "app.string.real",
            IrOp::AppRealString => "app.real.string",
            IrOp::Guard => "guard",
            IrOp::CmpInt => "cmp.int",
            IrOp::CmpString => "cmp.string",
            IrOp::CmpReal => "cmp.real",
            IrOp::CmpTable => "cmp.table",
            IrOp::Loopback => "loopback",
            IrOp::Loopstart => "loopstart",
            IrOp::Phi => "phi",
            IrOp::Snap => "snap",
            IrOp::Nop => "nop",
            IrOp::ConvIntToReal => "conv.int.real",
            IrOp::TableNew => "table.new",
            IrOp::TableHGet => "table.hget",
            IrOp::TableAGet => "table.aget",
            IrOp::TableHSet => "table.hset",
            IrOp::TableASet => "table.aset",
            IrOp::TableARef => "table.aref",
            IrOp::TableHRef => "table.href",
        }
    }
}

impl fmt::Display for IrIns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            IrOp::LoadInt | IrOp::LoadString | IrOp::LoadReal => {
                write!(f, "{} @{}", self.op.name(), self.a)
            }
            IrOp::LoadIntLocal
            | IrOp::LoadStringLocal
            | IrOp::LoadRealLocal
            | IrOp::LoadTableLocal => write!(f, "{} #{}", self.op.name(), self.c),
            IrOp::Call | IrOp::Yield => {
                write!(f, "{} @{} args={}", self.op.name(), self.a, self.b)
            }
            IrOp::Guard if self.is_type_guard() => {
                let tag = TypeTag::from_byte(self.b as u8).unwrap_or(TypeTag::Void);
                write!(f, "guard {} type={} snap={}", self.left, tag, self.a)
            }
            IrOp::Guard => write!(
                f,
                "guard {} jump={} taken={} snap={}",
                self.left, self.c, self.b, self.a
            ),
            IrOp::Snap => write!(f, "snap #{} count={}", self.a, self.b),
            IrOp::Phi => write!(f, "phi #{} {} {}", self.c, self.left, self.right),
            _ => {
                write!(f, "{}", self.op.name())?;
                if self.left.is_some() {
                    write!(f, " {}", self.left)?;
                }
                if self.right.is_some() {
                    write!(f, " {}", self.right)?;
                }
                Ok(())
            }
        }
    }
}

/// Render a whole trace, one numbered instruction per line.
pub fn format_trace(ins: &[IrIns]) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for (idx, instruction) in ins.iter().enumerate() {
        let _ = writeln!(out, "r{idx:<4} {instruction}");
    }
    out
}

const DUMP_INS_SIZE: usize = 17;

/// Encode a trace for back-end consumption.
pub fn dump_trace(ins: &[IrIns]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ins.len() * DUMP_INS_SIZE);
    for instruction in ins {
        out.push(instruction.op as u8);
        out.extend_from_slice(&instruction.a.to_le_bytes());
        out.extend_from_slice(&instruction.b.to_le_bytes());
        out.push(instruction.c);
        out.extend_from_slice(&instruction.left.0.to_le_bytes());
        out.extend_from_slice(&instruction.right.0.to_le_bytes());
        out.push(instruction.ty as u8);
    }
    out
}

/// Decode a dump produced by [`dump_trace`]. Returns `None` on a
/// malformed stream.
pub fn parse_trace(bytes: &[u8]) -> Option<Vec<IrIns>> {
    if bytes.len() % DUMP_INS_SIZE != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(bytes.len() / DUMP_INS_SIZE);
    for chunk in bytes.chunks_exact(DUMP_INS_SIZE) {
        let op = IrOp::from_byte(chunk[0])?;
        let a = i32::from_le_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]);
        let b = i16::from_le_bytes([chunk[5], chunk[6]]);
        let c = chunk[7];
        let left = IrRef(i32::from_le_bytes([chunk[8], chunk[9], chunk[10], chunk[11]]));
        let right = IrRef(i32::from_le_bytes([
            chunk[12], chunk[13], chunk[14], chunk[15],
        ]));
        let ty = TypeTag::from_byte(chunk[16])?;
        out.push(IrIns {
            op,
            a,
            b,
            c,
            left,
            right,
            ty,
        });
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<IrIns> {
        vec![
            IrIns::op0(IrOp::Loopstart, TypeTag::Void),
            IrIns::load(IrOp::LoadInt, 0, TypeTag::Int),
            IrIns::load_local(IrOp::LoadIntLocal, 1, TypeTag::Int),
            IrIns::snap(0, 1),
            IrIns::guard_type(0, IrRef(2), TypeTag::Int),
            IrIns::binary(IrOp::AddInt, IrRef(1), IrRef(2), TypeTag::Int),
            IrIns::phi(1, IrRef(2), IrRef(5), TypeTag::Int),
            IrIns::op0(IrOp::Loopback, TypeTag::Void),
        ]
    }

    #[test]
    fn test_dump_roundtrip() {
        let trace = sample();
        let bytes = dump_trace(&trace);
        let parsed = parse_trace(&bytes).unwrap();
        assert_eq!(parsed, trace);
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let bytes = dump_trace(&sample());
        assert!(parse_trace(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn test_format_mentions_each_op() {
        let text = format_trace(&sample());
        assert!(text.contains("loopstart"));
        assert!(text.contains("guard r2 type=int snap=0"));
        assert!(text.contains("add.int r1 r2"));
        assert!(text.contains("phi #1 r2 r5"));
        assert!(text.contains("loopback"));
    }
}
