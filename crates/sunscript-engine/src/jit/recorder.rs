//! Trace recorder
//!
//! When the dispatcher executes an instruction carrying the trace-start
//! marker, the recorder begins lifting every subsequently executed
//! opcode into typed IR, streamed through the optimizer pipeline as it
//! is produced. Recording ends on the loop back-edge (the trace
//! completes) or on any uncommon event — an unsupported opcode, a
//! handler error, a full buffer — which aborts and discards the partial
//! IR.
//!
//! The recorder mirrors the operand stack with a shadow stack of IR
//! references and tracks, per local slot, the reference currently
//! holding its value. Type guards are emitted at observation points
//! (local loads, table gets); branch guards at every conditional jump.
//! Each guard is preceded by a snapshot of the locals the trace has
//! redefined, anchored at a bytecode pc where the operand stack is
//! empty, so the interpreter can re-execute the current statement after
//! a guard exit.

use crate::jit::ir::{IrIns, IrOp, IrRef, TracePool};
use crate::jit::pipeline::{OptLevel, Optimizer};
use crate::jit::snapshot::Snapshot;
use rustc_hash::FxHashMap;
use sunscript_bytecode::{JumpKind, Real, TypeTag};

/// Arithmetic selector for [`TraceEvent::Binary`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
}

/// One executed-opcode notification from the dispatcher
#[derive(Debug, Clone, Copy)]
pub enum TraceEvent<'a> {
    /// Integer immediate pushed.
    PushInt(i32),
    /// Real immediate pushed.
    PushReal(Real),
    /// String immediate pushed.
    PushString(&'a str),
    /// Local loaded onto the stack; `tag` is the observed value type.
    PushLocal {
        /// Slot id.
        slot: u8,
        /// Observed value type.
        tag: TypeTag,
    },
    /// Top of stack stored into a local.
    PopLocal {
        /// Slot id.
        slot: u8,
        /// Type of the stored value.
        tag: TypeTag,
    },
    /// Integer immediate stored into a local.
    SetInt {
        /// Slot id.
        slot: u8,
        /// Immediate value.
        value: i32,
    },
    /// String immediate stored into a local.
    SetString {
        /// Slot id.
        slot: u8,
        /// Immediate value.
        value: &'a str,
    },
    /// Arithmetic on the two topmost values.
    Binary {
        /// Which operation.
        op: ArithOp,
        /// Observed left operand type.
        lhs: TypeTag,
        /// Observed right operand type.
        rhs: TypeTag,
    },
    /// Negation of the top of stack.
    UnaryMinus {
        /// Observed operand type.
        tag: TypeTag,
    },
    /// Increment of the top of stack.
    Increment {
        /// Observed operand type.
        tag: TypeTag,
    },
    /// Decrement of the top of stack.
    Decrement {
        /// Observed operand type.
        tag: TypeTag,
    },
    /// String concatenation of the two topmost values.
    Format {
        /// Observed left operand type.
        lhs: TypeTag,
        /// Observed right operand type.
        rhs: TypeTag,
    },
    /// Comparison setting the flag.
    Compare {
        /// Observed left operand type.
        lhs: TypeTag,
        /// Observed right operand type.
        rhs: TypeTag,
    },
    /// Branch, resolved.
    Jump {
        /// Branch condition.
        kind: JumpKind,
        /// Whether the branch was taken.
        taken: bool,
        /// Branch target offset.
        target: usize,
    },
    /// Top of stack duplicated.
    Dup,
    /// External call dispatched to the host.
    CallExternal {
        /// External function name.
        name: &'a str,
        /// Argument types, left to right.
        arg_tags: &'a [TypeTag],
        /// Whether the handler pushed a return value.
        returns_value: bool,
    },
    /// Fresh table pushed.
    TableNew,
    /// Table slot read.
    TableGet {
        /// Observed key type.
        key: TypeTag,
        /// Observed result type.
        result: TypeTag,
    },
    /// Table slot written.
    TableSet {
        /// Observed key type.
        key: TypeTag,
    },
    /// Anything the recorder does not lift (yield, internal calls,
    /// method dispatch, returns).
    Unsupported,
}

/// Receiver for per-opcode notifications from the dispatcher
pub trait TraceSink {
    /// Called after each executed opcode. `pc` is the instruction's
    /// offset, `next_pc` the offset of the next sequential instruction.
    fn record(&mut self, pc: usize, next_pc: usize, event: TraceEvent<'_>);
}

/// A completed trace, ready for a back-end
#[derive(Debug, Clone)]
pub struct TraceRecording {
    /// Loop-head pc the trace anchors at.
    pub start_pc: usize,
    /// Final optimized instruction stream; positions are references.
    pub ins: Vec<IrIns>,
    /// Constant pool referenced by the stream.
    pub pool: TracePool,
    /// Guard exit snapshots, indexed by id.
    pub snapshots: Vec<Snapshot>,
    /// Snapshot restoring loop-head state (timeout exits).
    pub head_snap: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecorderState {
    Idle,
    Recording,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy)]
struct LocalState {
    current: IrRef,
    ty: TypeTag,
    pre: Option<IrRef>,
    dirty: bool,
}

/// The trace recorder state machine
pub struct TraceRecorder {
    state: RecorderState,
    start_pc: usize,
    opt: Option<Optimizer>,
    pool: TracePool,
    shadow: Vec<IrRef>,
    locals: FxHashMap<u8, LocalState>,
    snapshots: Vec<Snapshot>,
    last_cmp: Option<IrRef>,
    anchor_pc: usize,
    effect_since_anchor: bool,
    level: OptLevel,
    head_snap_id: u16,
    finished: Option<TraceRecording>,
}

impl TraceRecorder {
    /// Create an idle recorder optimizing at `level`.
    pub fn new(level: OptLevel) -> Self {
        TraceRecorder {
            state: RecorderState::Idle,
            start_pc: 0,
            opt: None,
            pool: TracePool::new(),
            shadow: Vec::new(),
            locals: FxHashMap::default(),
            snapshots: Vec::new(),
            last_cmp: None,
            anchor_pc: 0,
            effect_since_anchor: false,
            level,
            head_snap_id: 0,
            finished: None,
        }
    }

    /// Change the optimization level for future recordings.
    pub fn set_level(&mut self, level: OptLevel) {
        self.level = level;
    }

    /// Whether a recording is in progress.
    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    /// Whether the recorder can start a new trace.
    pub fn is_idle(&self) -> bool {
        self.state == RecorderState::Idle
    }

    /// Whether the last recording aborted.
    pub fn is_aborted(&self) -> bool {
        self.state == RecorderState::Aborted
    }

    /// Pc of the trace being (or last) recorded.
    pub fn start_pc(&self) -> usize {
        self.start_pc
    }

    /// Begin recording a trace anchored at `pc`.
    pub fn start(&mut self, pc: usize) {
        self.reset();
        self.state = RecorderState::Recording;
        self.start_pc = pc;
        self.anchor_pc = pc;
        let mut opt = Optimizer::new(self.level);
        // The loop head opens every trace.
        if opt
            .push_forward(IrIns::op0(IrOp::Loopstart, TypeTag::Void), &mut self.pool)
            .is_err()
        {
            self.state = RecorderState::Aborted;
            return;
        }
        self.opt = Some(opt);
    }

    /// Return to idle, discarding any partial or finished state.
    pub fn reset(&mut self) {
        self.state = RecorderState::Idle;
        self.opt = None;
        self.pool = TracePool::new();
        self.shadow.clear();
        self.locals.clear();
        self.snapshots.clear();
        self.last_cmp = None;
        self.effect_since_anchor = false;
        self.head_snap_id = 0;
        self.finished = None;
    }

    /// Take the completed recording, if the last trace closed.
    pub fn take_recording(&mut self) -> Option<TraceRecording> {
        let recording = self.finished.take();
        if recording.is_some() {
            self.state = RecorderState::Idle;
        }
        recording
    }

    fn abort(&mut self) {
        self.state = RecorderState::Aborted;
        self.opt = None;
        self.shadow.clear();
        self.locals.clear();
        self.snapshots.clear();
        self.finished = None;
    }

    fn emit(&mut self, ins: IrIns) -> Option<IrRef> {
        let opt = self.opt.as_mut()?;
        match opt.push_forward(ins, &mut self.pool) {
            Ok(reference) => Some(reference),
            Err(_) => {
                self.abort();
                None
            }
        }
    }

    fn dirty_slots(&self) -> Vec<(u8, IrRef)> {
        let mut slots: Vec<(u8, IrRef)> = self
            .locals
            .iter()
            .filter(|(_, state)| state.dirty)
            .map(|(slot, state)| (*slot, state.current))
            .collect();
        slots.sort_by_key(|(slot, _)| *slot);
        slots
    }

    /// Emit a snapshot + guard pair. Returns `None` after an abort.
    fn emit_guard(&mut self, guard: impl FnOnce(u16) -> IrIns, exit_pc: usize) -> Option<()> {
        let slots = self.dirty_slots();
        let snap_id = self.snapshots.len() as u16;
        self.emit(IrIns::snap(snap_id, slots.len() as u8))?;
        self.emit(guard(snap_id))?;
        self.snapshots.push(Snapshot::new(snap_id, exit_pc, slots));
        Some(())
    }

    fn guard_type(&mut self, value: IrRef, tag: TypeTag) -> Option<()> {
        // The exit re-executes the current statement from its first
        // opcode; if an external call already ran inside it, replaying
        // is unsound, so give the trace up instead.
        if self.effect_since_anchor {
            self.abort();
            return None;
        }
        let exit_pc = self.anchor_pc;
        self.emit_guard(move |snap| IrIns::guard_type(snap, value, tag), exit_pc)
    }

    fn bind_local(&mut self, slot: u8, reference: IrRef, tag: TypeTag) {
        match self.locals.get_mut(&slot) {
            Some(state) => {
                state.current = reference;
                state.ty = tag;
                state.dirty = true;
            }
            None => {
                self.locals.insert(
                    slot,
                    LocalState {
                        current: reference,
                        ty: tag,
                        pre: None,
                        dirty: true,
                    },
                );
            }
        }
    }

    fn pop_shadow(&mut self) -> Option<IrRef> {
        match self.shadow.pop() {
            Some(reference) => Some(reference),
            None => {
                self.abort();
                None
            }
        }
    }

    fn numeric_pair(
        &mut self,
        lhs: TypeTag,
        rhs: TypeTag,
    ) -> Option<(IrRef, IrRef, TypeTag)> {
        let right = self.pop_shadow()?;
        let left = self.pop_shadow()?;
        match (lhs, rhs) {
            (TypeTag::Int, TypeTag::Int) => Some((left, right, TypeTag::Int)),
            (TypeTag::Real, TypeTag::Real) => Some((left, right, TypeTag::Real)),
            (TypeTag::Int, TypeTag::Real) => {
                let conv = self.emit(IrIns::unary(IrOp::ConvIntToReal, left, TypeTag::Real))?;
                Some((conv, right, TypeTag::Real))
            }
            (TypeTag::Real, TypeTag::Int) => {
                let conv = self.emit(IrIns::unary(IrOp::ConvIntToReal, right, TypeTag::Real))?;
                Some((left, conv, TypeTag::Real))
            }
            _ => {
                self.abort();
                None
            }
        }
    }

    fn complete(&mut self) {
        let opt = match self.opt.take() {
            Some(opt) => opt,
            None => {
                self.abort();
                return;
            }
        };
        match opt.drain(&mut self.pool, &mut self.snapshots) {
            Ok(ins) => {
                self.finished = Some(TraceRecording {
                    start_pc: self.start_pc,
                    ins,
                    pool: std::mem::take(&mut self.pool),
                    snapshots: std::mem::take(&mut self.snapshots),
                    head_snap: self.head_snap_id,
                });
                self.state = RecorderState::Completed;
                self.shadow.clear();
                self.locals.clear();
            }
            Err(_) => self.abort(),
        }
    }

    /// Process one executed opcode. `next_pc` is the offset of the next
    /// sequential instruction; jumps report their resolved target in the
    /// event itself.
    pub fn record(&mut self, next_pc: usize, event: TraceEvent<'_>) {
        if self.state != RecorderState::Recording {
            return;
        }

        match event {
            TraceEvent::PushInt(value) => {
                let offset = self.pool.push_int(value);
                if let Some(r) = self.emit(IrIns::load(IrOp::LoadInt, offset, TypeTag::Int)) {
                    self.shadow.push(r);
                }
            }
            TraceEvent::PushReal(value) => {
                let offset = self.pool.push_real(value);
                if let Some(r) = self.emit(IrIns::load(IrOp::LoadReal, offset, TypeTag::Real)) {
                    self.shadow.push(r);
                }
            }
            TraceEvent::PushString(value) => {
                let offset = self.pool.push_str(value);
                if let Some(r) = self.emit(IrIns::load(IrOp::LoadString, offset, TypeTag::String))
                {
                    self.shadow.push(r);
                }
            }
            TraceEvent::PushLocal { slot, tag } => {
                if let Some(state) = self.locals.get(&slot) {
                    self.shadow.push(state.current);
                } else {
                    let op = match tag {
                        TypeTag::Int => IrOp::LoadIntLocal,
                        TypeTag::Real => IrOp::LoadRealLocal,
                        TypeTag::String => IrOp::LoadStringLocal,
                        TypeTag::Object => IrOp::LoadTableLocal,
                        _ => {
                            self.abort();
                            return;
                        }
                    };
                    let loaded = match self.emit(IrIns::load_local(op, slot, tag)) {
                        Some(r) => r,
                        None => return,
                    };
                    if self.guard_type(loaded, tag).is_none() {
                        return;
                    }
                    self.locals.insert(
                        slot,
                        LocalState {
                            current: loaded,
                            ty: tag,
                            pre: Some(loaded),
                            dirty: false,
                        },
                    );
                    self.shadow.push(loaded);
                }
            }
            TraceEvent::PopLocal { slot, tag } => {
                if let Some(value) = self.pop_shadow() {
                    self.bind_local(slot, value, tag);
                }
            }
            TraceEvent::SetInt { slot, value } => {
                let offset = self.pool.push_int(value);
                if let Some(r) = self.emit(IrIns::load(IrOp::LoadInt, offset, TypeTag::Int)) {
                    self.bind_local(slot, r, TypeTag::Int);
                }
            }
            TraceEvent::SetString { slot, value } => {
                let offset = self.pool.push_str(value);
                if let Some(r) = self.emit(IrIns::load(IrOp::LoadString, offset, TypeTag::String))
                {
                    self.bind_local(slot, r, TypeTag::String);
                }
            }
            TraceEvent::Binary { op, lhs, rhs } => {
                if let Some((left, right, ty)) = self.numeric_pair(lhs, rhs) {
                    let ir_op = match (op, ty) {
                        (ArithOp::Add, TypeTag::Int) => IrOp::AddInt,
                        (ArithOp::Sub, TypeTag::Int) => IrOp::SubInt,
                        (ArithOp::Mul, TypeTag::Int) => IrOp::MulInt,
                        (ArithOp::Div, TypeTag::Int) => IrOp::DivInt,
                        (ArithOp::Add, _) => IrOp::AddReal,
                        (ArithOp::Sub, _) => IrOp::SubReal,
                        (ArithOp::Mul, _) => IrOp::MulReal,
                        (ArithOp::Div, _) => IrOp::DivReal,
                    };
                    if let Some(r) = self.emit(IrIns::binary(ir_op, left, right, ty)) {
                        self.shadow.push(r);
                    }
                }
            }
            TraceEvent::UnaryMinus { tag } => {
                let op = match tag {
                    TypeTag::Int => IrOp::NegInt,
                    TypeTag::Real => IrOp::NegReal,
                    _ => {
                        self.abort();
                        return;
                    }
                };
                if let Some(value) = self.pop_shadow() {
                    if let Some(r) = self.emit(IrIns::unary(op, value, tag)) {
                        self.shadow.push(r);
                    }
                }
            }
            TraceEvent::Increment { tag } => {
                self.step_op(tag, IrOp::IncInt, IrOp::IncReal);
            }
            TraceEvent::Decrement { tag } => {
                self.step_op(tag, IrOp::DecInt, IrOp::DecReal);
            }
            TraceEvent::Format { lhs, rhs } => {
                let op = match (lhs, rhs) {
                    (TypeTag::String, TypeTag::String) => IrOp::AppStringString,
                    (TypeTag::String, TypeTag::Int) => IrOp::AppStringInt,
                    (TypeTag::Int, TypeTag::String) => IrOp::AppIntString,
                    (TypeTag::String, TypeTag::Real) => IrOp::AppStringReal,
                    (TypeTag::Real, TypeTag::String) => IrOp::AppRealString,
                    _ => {
                        self.abort();
                        return;
                    }
                };
                let right = match self.pop_shadow() {
                    Some(r) => r,
                    None => return,
                };
                let left = match self.pop_shadow() {
                    Some(r) => r,
                    None => return,
                };
                if let Some(r) = self.emit(IrIns::binary(op, left, right, TypeTag::String)) {
                    self.shadow.push(r);
                }
            }
            TraceEvent::Compare { lhs, rhs } => {
                let cmp = match (lhs, rhs) {
                    (TypeTag::String, TypeTag::String) => {
                        let right = self.pop_shadow();
                        let left = self.pop_shadow();
                        match (left, right) {
                            (Some(l), Some(r)) => {
                                self.emit(IrIns::binary(IrOp::CmpString, l, r, TypeTag::Int))
                            }
                            _ => return,
                        }
                    }
                    (TypeTag::Object, TypeTag::Object) => {
                        let right = self.pop_shadow();
                        let left = self.pop_shadow();
                        match (left, right) {
                            (Some(l), Some(r)) => {
                                self.emit(IrIns::binary(IrOp::CmpTable, l, r, TypeTag::Int))
                            }
                            _ => return,
                        }
                    }
                    _ => match self.numeric_pair(lhs, rhs) {
                        Some((left, right, TypeTag::Int)) => {
                            self.emit(IrIns::binary(IrOp::CmpInt, left, right, TypeTag::Int))
                        }
                        Some((left, right, _)) => {
                            self.emit(IrIns::binary(IrOp::CmpReal, left, right, TypeTag::Int))
                        }
                        None => return,
                    },
                };
                self.last_cmp = cmp;
            }
            TraceEvent::Jump {
                kind,
                taken,
                target,
            } => {
                if kind != JumpKind::Always {
                    let cmp = match self.last_cmp {
                        Some(cmp) => cmp,
                        None => {
                            self.abort();
                            return;
                        }
                    };
                    // Exit continues where the untraced direction goes.
                    let exit_pc = if taken { next_pc } else { target };
                    if self
                        .emit_guard(
                            move |snap| IrIns::guard_branch(snap, cmp, kind, taken),
                            exit_pc,
                        )
                        .is_none()
                    {
                        return;
                    }
                }
                if taken && target == self.start_pc {
                    self.close_loop();
                    return;
                }
                if self.shadow.is_empty() {
                    self.anchor_pc = if taken { target } else { next_pc };
                    self.effect_since_anchor = false;
                }
                return;
            }
            TraceEvent::Dup => {
                match self.shadow.last().copied() {
                    Some(top) => self.shadow.push(top),
                    None => {
                        self.abort();
                        return;
                    }
                }
            }
            TraceEvent::CallExternal {
                name,
                arg_tags,
                returns_value,
            } => {
                // A call whose result feeds the trace cannot be replayed
                // from a statement anchor; only void calls are lifted.
                if returns_value {
                    self.abort();
                    return;
                }
                let mut args = Vec::with_capacity(arg_tags.len());
                for _ in arg_tags {
                    match self.pop_shadow() {
                        Some(r) => args.push(r),
                        None => return,
                    }
                }
                args.reverse();
                for (reference, tag) in args.iter().zip(arg_tags) {
                    let op = match tag {
                        TypeTag::Int => IrOp::IntArg,
                        TypeTag::Real => IrOp::RealArg,
                        TypeTag::String => IrOp::StringArg,
                        TypeTag::Object => IrOp::TableArg,
                        _ => {
                            self.abort();
                            return;
                        }
                    };
                    if self
                        .emit(IrIns::unary(op, *reference, TypeTag::Void))
                        .is_none()
                    {
                        return;
                    }
                }
                let name_offset = self.pool.push_str(name);
                if self
                    .emit(IrIns::call(name_offset, arg_tags.len() as u8, TypeTag::Void))
                    .is_none()
                {
                    return;
                }
                self.effect_since_anchor = true;
            }
            TraceEvent::TableNew => {
                if let Some(r) = self.emit(IrIns::op0(IrOp::TableNew, TypeTag::Object)) {
                    self.shadow.push(r);
                }
            }
            TraceEvent::TableGet { key, result } => {
                let op = match key {
                    TypeTag::Int => IrOp::TableAGet,
                    TypeTag::String => IrOp::TableHGet,
                    _ => {
                        self.abort();
                        return;
                    }
                };
                let key_ref = match self.pop_shadow() {
                    Some(r) => r,
                    None => return,
                };
                let table = match self.pop_shadow() {
                    Some(r) => r,
                    None => return,
                };
                let loaded = match self.emit(IrIns::binary(op, table, key_ref, result)) {
                    Some(r) => r,
                    None => return,
                };
                if self.guard_type(loaded, result).is_none() {
                    return;
                }
                self.shadow.push(loaded);
            }
            TraceEvent::TableSet { key } => {
                let (ref_op, set_op) = match key {
                    TypeTag::Int => (IrOp::TableARef, IrOp::TableASet),
                    TypeTag::String => (IrOp::TableHRef, IrOp::TableHSet),
                    _ => {
                        self.abort();
                        return;
                    }
                };
                let value = match self.pop_shadow() {
                    Some(r) => r,
                    None => return,
                };
                let key_ref = match self.pop_shadow() {
                    Some(r) => r,
                    None => return,
                };
                let table = match self.pop_shadow() {
                    Some(r) => r,
                    None => return,
                };
                let slot_ref = match self.emit(IrIns::binary(ref_op, table, key_ref, TypeTag::Void))
                {
                    Some(r) => r,
                    None => return,
                };
                if self
                    .emit(IrIns::binary(set_op, slot_ref, value, TypeTag::Void))
                    .is_none()
                {
                    return;
                }
            }
            TraceEvent::Unsupported => {
                self.abort();
                return;
            }
        }

        if self.state == RecorderState::Recording && self.shadow.is_empty() {
            self.anchor_pc = next_pc;
            self.effect_since_anchor = false;
        }
    }

    fn step_op(&mut self, tag: TypeTag, int_op: IrOp, real_op: IrOp) {
        let op = match tag {
            TypeTag::Int => int_op,
            TypeTag::Real => real_op,
            _ => {
                self.abort();
                return;
            }
        };
        if let Some(value) = self.pop_shadow() {
            if let Some(r) = self.emit(IrIns::unary(op, value, tag)) {
                self.shadow.push(r);
            }
        }
    }

    fn close_loop(&mut self) {
        // Loop-carried bindings: locals read before being rewritten.
        let mut carried: Vec<(u8, LocalState)> = self
            .locals
            .iter()
            .filter(|(_, state)| state.dirty && state.pre.is_some())
            .map(|(slot, state)| (*slot, *state))
            .collect();
        carried.sort_by_key(|(slot, _)| *slot);
        for (slot, state) in carried {
            let pre = match state.pre {
                Some(pre) => pre,
                None => continue,
            };
            if self
                .emit(IrIns::phi(slot, pre, state.current, state.ty))
                .is_none()
            {
                return;
            }
        }

        // Head snapshot: everything dirty, anchored back at the loop pc,
        // used when execution leaves the trace at the back-edge.
        let slots = self.dirty_slots();
        let head_id = self.snapshots.len() as u16;
        if self.emit(IrIns::snap(head_id, slots.len() as u8)).is_none() {
            return;
        }
        self.snapshots
            .push(Snapshot::new(head_id, self.start_pc, slots));
        self.head_snap_id = head_id;

        if self
            .emit(IrIns::op0(IrOp::Loopback, TypeTag::Void))
            .is_none()
        {
            return;
        }
        self.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive a `s += i; i += 1; while i < limit` iteration through the
    /// recorder, the shape of scenario bytecode the dispatcher feeds it.
    fn record_summing_loop(recorder: &mut TraceRecorder) {
        recorder.start(10);
        recorder.record(12, TraceEvent::PushLocal { slot: 0, tag: TypeTag::Int });
        recorder.record(14, TraceEvent::PushLocal { slot: 1, tag: TypeTag::Int });
        recorder.record(
            15,
            TraceEvent::Binary { op: ArithOp::Add, lhs: TypeTag::Int, rhs: TypeTag::Int },
        );
        recorder.record(17, TraceEvent::PopLocal { slot: 0, tag: TypeTag::Int });
        recorder.record(19, TraceEvent::PushLocal { slot: 1, tag: TypeTag::Int });
        recorder.record(20, TraceEvent::Increment { tag: TypeTag::Int });
        recorder.record(22, TraceEvent::PopLocal { slot: 1, tag: TypeTag::Int });
        recorder.record(24, TraceEvent::PushLocal { slot: 1, tag: TypeTag::Int });
        recorder.record(30, TraceEvent::PushInt(1000));
        recorder.record(31, TraceEvent::Compare { lhs: TypeTag::Int, rhs: TypeTag::Int });
        recorder.record(
            35,
            TraceEvent::Jump { kind: JumpKind::Lt, taken: true, target: 10 },
        );
    }

    #[test]
    fn test_loop_records_expected_shape() {
        let mut recorder = TraceRecorder::new(OptLevel::Full);
        record_summing_loop(&mut recorder);

        let recording = recorder.take_recording().expect("trace should complete");
        assert_eq!(recording.start_pc, 10);

        let ops: Vec<IrOp> = recording.ins.iter().map(|ins| ins.op).collect();
        assert_eq!(ops.first(), Some(&IrOp::Loopstart));
        assert_eq!(ops.last(), Some(&IrOp::Loopback));
        assert!(ops.contains(&IrOp::AddInt));
        assert!(ops.contains(&IrOp::IncInt));
        assert!(ops.contains(&IrOp::CmpInt));
        assert_eq!(ops.iter().filter(|&&op| op == IrOp::Phi).count(), 2);
        assert!(ops.iter().filter(|&&op| op == IrOp::Guard).count() >= 3);

        // Type guards bind the observed int type.
        let type_guards: Vec<_> = recording
            .ins
            .iter()
            .filter(|ins| ins.is_type_guard())
            .collect();
        assert!(!type_guards.is_empty());
        assert!(type_guards
            .iter()
            .all(|guard| guard.b == TypeTag::Int as u8 as i16));
    }

    #[test]
    fn test_snapshot_anchors() {
        let mut recorder = TraceRecorder::new(OptLevel::Full);
        record_summing_loop(&mut recorder);
        let recording = recorder.take_recording().unwrap();

        // Type guards at the first statement re-enter at the loop head.
        assert_eq!(recording.snapshots[0].pc(), 10);
        // The back-edge guard exits to the fallthrough after the jump.
        let branch_snap = recording
            .ins
            .iter()
            .find(|ins| ins.op == IrOp::Guard && !ins.is_type_guard())
            .map(|guard| guard.a as usize)
            .expect("branch guard");
        assert_eq!(recording.snapshots[branch_snap].pc(), 35);
        // The head snapshot restores both mutated locals at the head.
        let head = &recording.snapshots[recording.head_snap as usize];
        assert_eq!(head.pc(), 10);
        assert_eq!(head.len(), 2);
    }

    #[test]
    fn test_unsupported_aborts() {
        let mut recorder = TraceRecorder::new(OptLevel::Full);
        recorder.start(0);
        recorder.record(2, TraceEvent::PushInt(1));
        recorder.record(3, TraceEvent::Unsupported);
        assert!(recorder.is_aborted());
        assert!(recorder.take_recording().is_none());
    }

    #[test]
    fn test_buffer_full_aborts() {
        let mut recorder = TraceRecorder::new(OptLevel::Full);
        recorder.start(0);
        for i in 0..100 {
            recorder.record(i + 1, TraceEvent::PushInt(i as i32));
            if recorder.is_aborted() {
                break;
            }
        }
        assert!(recorder.is_aborted());
    }

    #[test]
    fn test_returning_call_aborts() {
        let mut recorder = TraceRecorder::new(OptLevel::Full);
        recorder.start(0);
        recorder.record(2, TraceEvent::PushInt(1));
        recorder.record(
            8,
            TraceEvent::CallExternal {
                name: "GetValue",
                arg_tags: &[TypeTag::Int],
                returns_value: true,
            },
        );
        assert!(recorder.is_aborted());
    }

    #[test]
    fn test_mixed_arithmetic_inserts_conversion() {
        let mut recorder = TraceRecorder::new(OptLevel::None);
        recorder.start(0);
        recorder.record(2, TraceEvent::PushLocal { slot: 0, tag: TypeTag::Int });
        recorder.record(4, TraceEvent::PushReal(0.5));
        recorder.record(
            5,
            TraceEvent::Binary { op: ArithOp::Add, lhs: TypeTag::Int, rhs: TypeTag::Real },
        );
        recorder.record(7, TraceEvent::PopLocal { slot: 0, tag: TypeTag::Real });
        recorder.record(
            9,
            TraceEvent::Jump { kind: JumpKind::Always, taken: true, target: 0 },
        );

        let recording = recorder.take_recording().unwrap();
        let ops: Vec<IrOp> = recording.ins.iter().map(|ins| ins.op).collect();
        assert!(ops.contains(&IrOp::ConvIntToReal));
        assert!(ops.contains(&IrOp::AddReal));
        assert!(!ops.contains(&IrOp::AddInt));
    }
}
