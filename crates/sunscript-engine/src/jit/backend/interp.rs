//! IR-evaluating back-end
//!
//! Runs optimized traces by direct evaluation of the IR stream. It
//! exists to exercise the whole pipeline — recording, optimization,
//! guard exits, snapshot restoration — without native code generation;
//! a production back-end would lower the same stream to machine code.
//!
//! Only numeric traces are accepted: anything touching managed strings
//! or tables is declined at compile time, which keeps the evaluator free
//! of reference-count bookkeeping. Integer division is declined too —
//! the divisor would need a zero-check guard this back-end does not
//! synthesize — so the interpreter keeps such loops.

use super::{CompileError, TraceBackend, TraceContext, TraceExit, TraceHandle};
use crate::jit::ir::{IrIns, IrOp, TracePool};
use crate::jit::recorder::TraceRecording;
use crate::jit::snapshot::Snapshot;
use crate::vm::host::CallContext;
use crate::vm::value::Value;
use crate::vm::Status;
use rustc_hash::FxHashSet;
use sunscript_bytecode::{JumpKind, Real, TypeTag};

struct CompiledTrace {
    ins: Vec<IrIns>,
    pool: TracePool,
    snapshots: Vec<Snapshot>,
    head_snap: u16,
    loop_start: usize,
    phis: Vec<IrIns>,
    phi_pre: FxHashSet<usize>,
}

/// Trace evaluator back-end
pub struct InterpBackend {
    traces: Vec<CompiledTrace>,
}

impl InterpBackend {
    /// Create an empty back-end.
    pub fn new() -> Self {
        InterpBackend { traces: Vec::new() }
    }
}

impl Default for InterpBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn supported(op: IrOp) -> bool {
    matches!(
        op,
        IrOp::LoadInt
            | IrOp::LoadReal
            | IrOp::LoadIntLocal
            | IrOp::LoadRealLocal
            | IrOp::AddInt
            | IrOp::SubInt
            | IrOp::MulInt
            | IrOp::NegInt
            | IrOp::IncInt
            | IrOp::DecInt
            | IrOp::AddReal
            | IrOp::SubReal
            | IrOp::MulReal
            | IrOp::DivReal
            | IrOp::NegReal
            | IrOp::IncReal
            | IrOp::DecReal
            | IrOp::ConvIntToReal
            | IrOp::CmpInt
            | IrOp::CmpReal
            | IrOp::Guard
            | IrOp::Snap
            | IrOp::Phi
            | IrOp::Loopstart
            | IrOp::Loopback
            | IrOp::Nop
            | IrOp::IntArg
            | IrOp::RealArg
            | IrOp::Call
    )
}

/// Comparison flag with the same convention the dispatcher uses:
/// negative for less, zero for equal, positive for greater (NaN compares
/// greater).
fn real_flag(left: Real, right: Real) -> i32 {
    if left < right {
        -1
    } else if left == right {
        0
    } else {
        1
    }
}

impl TraceBackend for InterpBackend {
    fn name(&self) -> &str {
        "interp"
    }

    fn compile_trace(&mut self, recording: &TraceRecording) -> Result<TraceHandle, CompileError> {
        for ins in &recording.ins {
            if !supported(ins.op) {
                return Err(CompileError::Unsupported(format!("{}", ins.op.name())));
            }
        }
        let loop_start = recording
            .ins
            .iter()
            .position(|ins| ins.op == IrOp::Loopstart)
            .ok_or_else(|| CompileError::Unsupported("no loop header".to_string()))?;

        let phis: Vec<IrIns> = recording
            .ins
            .iter()
            .filter(|ins| ins.op == IrOp::Phi)
            .copied()
            .collect();
        let phi_pre: FxHashSet<usize> = phis
            .iter()
            .filter(|phi| phi.left.is_some())
            .map(|phi| phi.left.index())
            .collect();

        let handle = TraceHandle(self.traces.len());
        self.traces.push(CompiledTrace {
            ins: recording.ins.clone(),
            pool: recording.pool.clone(),
            snapshots: recording.snapshots.clone(),
            head_snap: recording.head_snap,
            loop_start,
            phis,
            phi_pre,
        });
        Ok(handle)
    }

    fn execute(
        &mut self,
        handle: TraceHandle,
        ctx: &mut TraceContext<'_>,
        exit: &mut TraceExit,
    ) -> Status {
        let trace = match self.traces.get(handle.0) {
            Some(trace) => trace,
            None => return Status::Error,
        };

        let mut values: Vec<Value> = vec![Value::Void; trace.ins.len()];
        let mut pending_args: Vec<Value> = Vec::new();
        let mut looping = false;
        let mut idx = 0usize;

        let materialize = |snapshot: &Snapshot, values: &[Value]| {
            snapshot
                .slots()
                .iter()
                .map(|(slot, reference)| (*slot, values[reference.index()]))
                .collect::<Vec<_>>()
        };

        macro_rules! int_of {
            ($r:expr) => {
                match values[$r.index()] {
                    Value::Int(v) => v,
                    _ => return Status::Error,
                }
            };
        }
        macro_rules! real_of {
            ($r:expr) => {
                match values[$r.index()] {
                    Value::Real(v) => v,
                    _ => return Status::Error,
                }
            };
        }

        while idx < trace.ins.len() {
            let ins = trace.ins[idx];
            match ins.op {
                IrOp::Nop | IrOp::Snap | IrOp::Loopstart | IrOp::Phi => {}

                IrOp::LoadInt => {
                    values[idx] = Value::Int(trace.pool.read_int(ins.a as u32));
                }
                IrOp::LoadReal => {
                    values[idx] = Value::Real(trace.pool.read_real(ins.a as u32));
                }
                IrOp::LoadIntLocal | IrOp::LoadRealLocal => {
                    // A loop-carried slot already holds the phi value.
                    if !(looping && trace.phi_pre.contains(&idx)) {
                        values[idx] = match ctx.record.get(ins.c) {
                            Ok(value) => value,
                            Err(_) => return Status::Error,
                        };
                    }
                }

                IrOp::AddInt => values[idx] = Value::Int(int_of!(ins.left).wrapping_add(int_of!(ins.right))),
                IrOp::SubInt => values[idx] = Value::Int(int_of!(ins.left).wrapping_sub(int_of!(ins.right))),
                IrOp::MulInt => values[idx] = Value::Int(int_of!(ins.left).wrapping_mul(int_of!(ins.right))),
                IrOp::NegInt => values[idx] = Value::Int(int_of!(ins.left).wrapping_neg()),
                IrOp::IncInt => values[idx] = Value::Int(int_of!(ins.left).wrapping_add(1)),
                IrOp::DecInt => values[idx] = Value::Int(int_of!(ins.left).wrapping_sub(1)),

                IrOp::AddReal => values[idx] = Value::Real(real_of!(ins.left) + real_of!(ins.right)),
                IrOp::SubReal => values[idx] = Value::Real(real_of!(ins.left) - real_of!(ins.right)),
                IrOp::MulReal => values[idx] = Value::Real(real_of!(ins.left) * real_of!(ins.right)),
                IrOp::DivReal => values[idx] = Value::Real(real_of!(ins.left) / real_of!(ins.right)),
                IrOp::NegReal => values[idx] = Value::Real(-real_of!(ins.left)),
                IrOp::IncReal => values[idx] = Value::Real(real_of!(ins.left) + 1.0),
                IrOp::DecReal => values[idx] = Value::Real(real_of!(ins.left) - 1.0),

                IrOp::ConvIntToReal => values[idx] = Value::Real(int_of!(ins.left) as Real),

                IrOp::CmpInt => {
                    let flag = match int_of!(ins.left).cmp(&int_of!(ins.right)) {
                        std::cmp::Ordering::Less => -1,
                        std::cmp::Ordering::Equal => 0,
                        std::cmp::Ordering::Greater => 1,
                    };
                    values[idx] = Value::Int(flag);
                }
                IrOp::CmpReal => {
                    values[idx] = Value::Int(real_flag(real_of!(ins.left), real_of!(ins.right)));
                }

                IrOp::Guard => {
                    let snap_id = ins.a as u16;
                    let holds = if ins.is_type_guard() {
                        let expected = TypeTag::from_byte(ins.b as u8).unwrap_or(TypeTag::Void);
                        values[ins.left.index()].tag() == expected
                    } else {
                        let kind = match JumpKind::from_byte(ins.c) {
                            Some(kind) => kind,
                            None => return Status::Error,
                        };
                        let flag = int_of!(ins.left);
                        kind.taken(flag) == (ins.b != 0)
                    };
                    if !holds {
                        let snapshot = &trace.snapshots[snap_id as usize];
                        exit.snap_id = snap_id;
                        exit.slots = materialize(snapshot, &values);
                        return Status::Ok;
                    }
                }

                IrOp::IntArg | IrOp::RealArg => {
                    pending_args.push(values[ins.left.index()]);
                }
                IrOp::Call => {
                    let name = trace.pool.read_str(ins.a as u32).to_string();
                    let args = std::mem::take(&mut pending_args);
                    let handler = match ctx.handler.as_mut() {
                        Some(handler) => &mut **handler,
                        None => return Status::Error,
                    };
                    let mut call = CallContext::new(&name, args, &mut *ctx.memory);
                    if handler.on_call(&mut call) != Status::Ok {
                        return Status::Error;
                    }
                }

                IrOp::Loopback => {
                    if let Some(deadline) = ctx.deadline {
                        if std::time::Instant::now() >= deadline {
                            let snapshot = &trace.snapshots[trace.head_snap as usize];
                            exit.snap_id = trace.head_snap;
                            exit.slots = materialize(snapshot, &values);
                            return Status::Timeout;
                        }
                    }
                    for phi in &trace.phis {
                        values[phi.left.index()] = values[phi.right.index()];
                    }
                    looping = true;
                    idx = trace.loop_start + 1;
                    continue;
                }

                // Declined at compile time.
                _ => return Status::Error,
            }
            idx += 1;
        }

        // Fell off the stream without a loop back-edge.
        Status::Error
    }

    fn shutdown(&mut self) {
        self.traces.clear();
    }
}
