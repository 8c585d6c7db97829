//! Bytecode dispatcher
//!
//! Fetches one opcode at a time, strips the loop/trace markers, and
//! dispatches. The dispatcher owns the operand stack, the call stack,
//! and the program counter; it drives the host handler on external
//! calls, suspends on yields and timeouts, and tees every executed
//! opcode into the trace recorder. When a loop head has a compiled
//! trace, execution dispatches into the back-end instead and resumes
//! interpretation at the snapshot a guard exit restores.
//!
//! Reference counts move with values: a pop transfers the stack's
//! reference to the new holder, a load or dup adds one, and a displaced
//! or consumed value gives one back.

use crate::jit::backend::{TraceBackend, TraceContext, TraceExit};
use crate::jit::recorder::{ArithOp, TraceEvent, TraceSink};
use crate::jit::JitRuntime;
use crate::memory::{ManagedPtr, MemoryManager};
use crate::vm::frame::CallFrame;
use crate::vm::host::{CallContext, HostHandler};
use crate::vm::stack::OperandStack;
use crate::vm::table::Table;
use crate::vm::value::Value;
use crate::vm::{CallstackEntry, Status, VmError, VmResult};
use std::rc::Rc;
use std::time::{Duration, Instant};
use sunscript_bytecode::{
    verify_program, BytecodeReader, DebugInfo, FunctionInfo, FunctionKind, JumpKind, Opcode,
    Program, Real, TypeTag,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Idle,
    Suspended,
    Finished,
}

enum Flow {
    Continue,
    Yield,
    Done,
}

/// Comparison flag: negative for less, zero for equal, positive for
/// greater. NaN compares greater, on both the interpreter and trace
/// paths.
fn real_flag(left: Real, right: Real) -> i32 {
    if left < right {
        -1
    } else if left == right {
        0
    } else {
        1
    }
}

/// The SunScript virtual machine
pub struct Vm {
    memory: MemoryManager,
    program: Option<Rc<Program>>,
    debug: Option<DebugInfo>,
    stack: OperandStack,
    frames: Vec<CallFrame>,
    pc: usize,
    cmp_flag: i32,
    state: ExecState,
    handler: Option<Box<dyn HostHandler>>,
    jit: Option<JitRuntime>,
    last_error: Option<VmError>,
    stack_trace: Vec<CallstackEntry>,
}

impl Vm {
    /// Create a VM with no program, handler, or back-end.
    pub fn new() -> Self {
        Vm {
            memory: MemoryManager::new(),
            program: None,
            debug: None,
            stack: OperandStack::new(),
            frames: Vec::new(),
            pc: 0,
            cmp_flag: 0,
            state: ExecState::Idle,
            handler: None,
            jit: None,
            last_error: None,
            stack_trace: Vec::new(),
        }
    }

    /// Register the host handler for external function calls.
    pub fn set_handler(&mut self, handler: Box<dyn HostHandler>) {
        self.handler = Some(handler);
    }

    /// Install a trace back-end; without one, markers are observed but
    /// nothing is recorded.
    pub fn set_jit(&mut self, backend: Box<dyn TraceBackend>) {
        self.jit = Some(JitRuntime::new(backend));
    }

    /// Set the trace optimization level (0 none, 1 guard+fold, 2 full).
    pub fn set_optimization_level(&mut self, level: u8) {
        if let Some(jit) = self.jit.as_mut() {
            jit.set_optimization_level(level);
        }
    }

    /// The JIT driver, when a back-end is installed.
    pub fn jit(&self) -> Option<&JitRuntime> {
        self.jit.as_ref()
    }

    /// The VM's memory manager.
    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// The VM's memory manager, mutably (table helpers).
    pub fn memory_mut(&mut self) -> &mut MemoryManager {
        &mut self.memory
    }

    /// The error that failed the last run, if any.
    pub fn last_error(&self) -> Option<&VmError> {
        self.last_error.as_ref()
    }

    /// Allocate a fresh table for the host. The pointer is valid until
    /// the next run or load.
    pub fn create_table(&mut self) -> ManagedPtr {
        self.memory.alloc_table(Table::new())
    }

    fn checked_table(&self, table: ManagedPtr) -> VmResult<&Table> {
        match self.memory.tag(table)? {
            TypeTag::Object => Ok(unsafe { &*(table.payload::<Table>() as *const Table) }),
            other => Err(VmError::TypeMismatch {
                expected: TypeTag::Object,
                found: other,
            }),
        }
    }

    /// Read a table's array slot.
    pub fn table_array(&self, table: ManagedPtr, index: i32) -> VmResult<Value> {
        Ok(self.checked_table(table)?.get_array(index))
    }

    /// Write a table's array slot; the slot takes over `value`'s
    /// reference and the displaced value is released.
    pub fn set_table_array(&mut self, table: ManagedPtr, index: i32, value: Value) -> VmResult<()> {
        self.checked_table(table)?;
        let displaced = unsafe { table.payload_mut::<Table>() }.set_array(index, value);
        if let Some(old) = displaced {
            self.release_value(old)?;
        }
        Ok(())
    }

    /// Read a table's hash slot.
    pub fn table_hash(&self, table: ManagedPtr, key: &str) -> VmResult<Value> {
        Ok(self.checked_table(table)?.get_hash(key))
    }

    /// Write a table's hash slot; the slot takes over `value`'s
    /// reference and the displaced value is released.
    pub fn set_table_hash(&mut self, table: ManagedPtr, key: &str, value: Value) -> VmResult<()> {
        self.checked_table(table)?;
        let displaced = unsafe { table.payload_mut::<Table>() }.set_hash(key.to_string(), value);
        if let Some(old) = displaced {
            self.release_value(old)?;
        }
        Ok(())
    }

    /// Call stack captured at the last failure; cleared by the next
    /// `load_program`.
    pub fn call_stack(&self) -> &[CallstackEntry] {
        &self.stack_trace
    }

    /// Load an encoded program image.
    pub fn load_program(&mut self, bytes: &[u8]) -> Status {
        match Program::decode(bytes) {
            Ok(program) => self.load_image(program, None),
            Err(error) => {
                self.last_error = Some(error.into());
                Status::Error
            }
        }
    }

    /// Load an encoded program image plus its debug sidecar.
    pub fn load_program_with_debug(&mut self, bytes: &[u8], debug: &[u8]) -> Status {
        match (Program::decode(bytes), DebugInfo::decode(debug)) {
            (Ok(program), Ok(info)) => self.load_image(program, Some(info)),
            (Err(error), _) => {
                self.last_error = Some(error.into());
                Status::Error
            }
            (_, Err(error)) => {
                self.last_error = Some(error.into());
                Status::Error
            }
        }
    }

    /// Load an already-decoded image. The VM is left unloaded when
    /// validation fails.
    pub fn load_image(&mut self, program: Program, debug: Option<DebugInfo>) -> Status {
        if let Err(error) = verify_program(&program) {
            self.last_error = Some(error.into());
            return Status::Error;
        }
        self.clear_run_state();
        self.memory.reset();
        if let Some(jit) = self.jit.as_mut() {
            jit.clear();
        }
        self.program = Some(Rc::new(program));
        self.debug = debug;
        self.last_error = None;
        self.stack_trace.clear();
        self.state = ExecState::Idle;
        Status::Ok
    }

    /// Execute the loaded program from the top.
    pub fn run(&mut self) -> Status {
        match self.begin_run() {
            Ok(()) => self.execute(None),
            Err(error) => self.fail(error),
        }
    }

    /// Execute with a deadline; returns `Timeout` with state preserved
    /// when it passes.
    pub fn run_with_timeout(&mut self, timeout: Duration) -> Status {
        match self.begin_run() {
            Ok(()) => self.execute(Some(Instant::now() + timeout)),
            Err(error) => self.fail(error),
        }
    }

    /// Continue after `Yielded` or `Timeout`. A no-op returning `Ok`
    /// once execution finished.
    pub fn resume(&mut self) -> Status {
        match self.state {
            ExecState::Suspended => self.execute(None),
            ExecState::Finished => Status::Ok,
            ExecState::Idle => {
                self.last_error = Some(VmError::NoProgram);
                Status::Error
            }
        }
    }

    fn entry_function(program: &Program) -> VmResult<&FunctionInfo> {
        program
            .functions
            .iter()
            .find(|f| f.kind == FunctionKind::Internal && f.entry == 0)
            .ok_or_else(|| VmError::ProgramMalformed("no top-level function".to_string()))
    }

    fn clear_run_state(&mut self) {
        self.stack = OperandStack::new();
        self.frames.clear();
        self.pc = 0;
        self.cmp_flag = 0;
    }

    fn begin_run(&mut self) -> VmResult<()> {
        let program = self.program.clone().ok_or(VmError::NoProgram)?;
        let entry = Self::entry_function(&program)?;

        // A run owns the arena exclusively; earlier runs' blocks die here.
        self.clear_run_state();
        self.memory.reset();
        if let Some(jit) = self.jit.as_mut() {
            jit.reset_recording();
        }
        self.last_error = None;

        self.frames.push(CallFrame::new(
            entry.name.clone(),
            entry.id,
            usize::MAX,
            Vec::new(),
        ));
        self.pc = 0;
        Ok(())
    }

    fn execute(&mut self, deadline: Option<Instant>) -> Status {
        loop {
            if let Some(limit) = deadline {
                if Instant::now() >= limit {
                    self.state = ExecState::Suspended;
                    return Status::Timeout;
                }
            }

            match self.try_execute_trace(deadline) {
                Ok(None) => {}
                Ok(Some(status)) => {
                    self.state = ExecState::Suspended;
                    return status;
                }
                Err(error) => return self.fail(error),
            }

            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Yield) => {
                    self.state = ExecState::Suspended;
                    return Status::Yielded;
                }
                Ok(Flow::Done) => {
                    self.state = ExecState::Finished;
                    return Status::Ok;
                }
                Err(error) => return self.fail(error),
            }
        }
    }

    /// Dispatch into a compiled trace at the current pc, if one exists.
    /// `Ok(Some(_))` suspends the run (back-edge timeout); `Ok(None)`
    /// continues interpretation, possibly after a guard exit restored a
    /// snapshot.
    fn try_execute_trace(&mut self, deadline: Option<Instant>) -> VmResult<Option<Status>> {
        let jit = match self.jit.as_mut() {
            Some(jit) if !jit.is_recording() => jit,
            _ => return Ok(None),
        };
        if jit.trace_at(self.pc).is_none() {
            return Ok(None);
        }
        let frame = match self.frames.last_mut() {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let mut exit = TraceExit::default();
        let mut ctx = TraceContext {
            record: &mut frame.record,
            memory: &mut self.memory,
            handler: self
                .handler
                .as_mut()
                .map(|h| h.as_mut() as &mut dyn HostHandler),
            deadline,
        };
        let (status, resume_pc) = match jit.execute_at(self.pc, &mut ctx, &mut exit) {
            Some(result) => result,
            None => return Ok(None),
        };

        match status {
            Status::Ok | Status::Timeout | Status::Yielded | Status::Paused => {
                let entered_at = self.pc;
                let mut displaced = Vec::with_capacity(exit.slots.len());
                let frame = match self.frames.last_mut() {
                    Some(frame) => frame,
                    None => return Ok(None),
                };
                for (slot, value) in exit.slots {
                    displaced.push(frame.record.set(slot, value)?);
                }
                for old in displaced {
                    self.release_value(old)?;
                }
                self.pc = resume_pc;
                if status != Status::Ok {
                    return Ok(Some(status));
                }
                // A guard exit landing back on the loop head means the
                // trace's entry assumptions broke; drop it and keep
                // interpreting.
                if resume_pc == entered_at {
                    if let Some(jit) = self.jit.as_mut() {
                        jit.evict(entered_at);
                    }
                }
                Ok(None)
            }
            _ => Err(VmError::Handler(format!("trace at {:#x}", self.pc))),
        }
    }

    fn release_value(&mut self, value: Value) -> VmResult<()> {
        if let Some(ptr) = value.managed() {
            self.memory.release(ptr)?;
        }
        Ok(())
    }

    fn addref_value(&self, value: Value) -> VmResult<()> {
        if let Some(ptr) = value.managed() {
            self.memory.addref(ptr)?;
        }
        Ok(())
    }

    fn trace_event(&mut self, pc: usize, next_pc: usize, event: TraceEvent<'_>) {
        if let Some(jit) = self.jit.as_mut() {
            jit.record(pc, next_pc, event);
        }
    }

    fn store_local(&mut self, slot: u8, value: Value) -> VmResult<()> {
        let old = match self.frames.last_mut() {
            Some(frame) => frame.record.set(slot, value)?,
            None => return Err(VmError::NoProgram),
        };
        self.release_value(old)
    }

    fn coerce_string(&self, value: &Value) -> VmResult<String> {
        match value {
            Value::Int(v) => Ok(v.to_string()),
            Value::Real(v) => Ok(v.to_string()),
            Value::Str(ptr) => Ok(unsafe { ptr.payload::<String>() }.clone()),
            other => Err(VmError::TypeMismatch {
                expected: TypeTag::String,
                found: other.tag(),
            }),
        }
    }

    fn binary_arith(&mut self, op: ArithOp) -> VmResult<(TypeTag, TypeTag)> {
        let rhs = self.stack.pop()?;
        let lhs = self.stack.pop()?;
        let tags = (lhs.tag(), rhs.tag());

        let result = match (lhs, rhs) {
            (Value::Int(l), Value::Int(r)) => match op {
                ArithOp::Add => Value::Int(l.wrapping_add(r)),
                ArithOp::Sub => Value::Int(l.wrapping_sub(r)),
                ArithOp::Mul => Value::Int(l.wrapping_mul(r)),
                ArithOp::Div => {
                    if r == 0 {
                        return Err(VmError::DivideByZero);
                    }
                    Value::Int(l.wrapping_div(r))
                }
            },
            (Value::Real(l), Value::Real(r)) => Value::Real(Self::real_arith(op, l, r)),
            (Value::Int(l), Value::Real(r)) => Value::Real(Self::real_arith(op, l as Real, r)),
            (Value::Real(l), Value::Int(r)) => Value::Real(Self::real_arith(op, l, r as Real)),
            (l, r) => {
                self.release_value(l)?;
                self.release_value(r)?;
                return Err(VmError::TypeMismatch {
                    expected: TypeTag::Int,
                    found: if l.tag() == TypeTag::Int || l.tag() == TypeTag::Real {
                        r.tag()
                    } else {
                        l.tag()
                    },
                });
            }
        };
        self.stack.push(result);
        Ok(tags)
    }

    fn real_arith(op: ArithOp, l: Real, r: Real) -> Real {
        match op {
            ArithOp::Add => l + r,
            ArithOp::Sub => l - r,
            ArithOp::Mul => l * r,
            // Real division by zero follows IEEE (±inf, NaN).
            ArithOp::Div => l / r,
        }
    }

    fn call_external(
        &mut self,
        name: &str,
        function_id: u32,
        argc: u8,
        pc: usize,
        next_pc: usize,
    ) -> VmResult<()> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.stack.pop()?);
        }
        args.reverse();
        let arg_tags: Vec<TypeTag> = args.iter().map(|v| v.tag()).collect();

        let mut handler = match self.handler.take() {
            Some(handler) => handler,
            None => {
                for arg in args {
                    self.release_value(arg)?;
                }
                self.frames
                    .push(CallFrame::new(name.to_string(), function_id, pc, Vec::new()));
                return Err(VmError::Handler(name.to_string()));
            }
        };

        let mut ctx = CallContext::new(name, args, &mut self.memory);
        let status = handler.on_call(&mut ctx);
        let (args, ret) = ctx.finish();
        self.handler = Some(handler);

        if status != Status::Ok {
            for arg in args {
                self.release_value(arg)?;
            }
            self.frames
                .push(CallFrame::new(name.to_string(), function_id, pc, Vec::new()));
            return Err(VmError::Handler(name.to_string()));
        }

        let returns_value = ret.is_some();
        if let Some(value) = ret {
            self.stack.push(value);
        }
        for arg in args {
            self.release_value(arg)?;
        }
        self.trace_event(
            pc,
            next_pc,
            TraceEvent::CallExternal {
                name,
                arg_tags: &arg_tags,
                returns_value,
            },
        );
        Ok(())
    }

    fn call_function(
        &mut self,
        program: &Program,
        function_id: u32,
        argc: u8,
        extra_first_arg: Option<Value>,
        pc: usize,
    ) -> VmResult<()> {
        let func = program
            .find_function(function_id)
            .ok_or(VmError::UnknownFunction(function_id))?;

        match func.kind {
            FunctionKind::External => {
                if let Some(receiver) = extra_first_arg {
                    // Method receivers only bind to script functions.
                    self.release_value(receiver)?;
                    return Err(VmError::TypeMismatch {
                        expected: TypeTag::Func,
                        found: TypeTag::Void,
                    });
                }
                let name = func.name.clone();
                self.call_external(&name, function_id, argc, pc, self.pc)
            }
            FunctionKind::Internal => {
                self.trace_event(pc, self.pc, TraceEvent::Unsupported);
                let mut args = Vec::with_capacity(argc as usize + 1);
                for _ in 0..argc {
                    args.push(self.stack.pop()?);
                }
                args.reverse();
                if let Some(receiver) = extra_first_arg {
                    args.insert(0, receiver);
                }
                self.frames.push(CallFrame::new(
                    func.name.clone(),
                    function_id,
                    self.pc,
                    args,
                ));
                self.pc = func.entry as usize;
                Ok(())
            }
        }
    }

    fn step(&mut self) -> VmResult<Flow> {
        let program = self.program.clone().ok_or(VmError::NoProgram)?;
        let code = &program.code;
        if self.pc >= code.len() {
            return Err(VmError::ProgramMalformed(format!(
                "pc {:#x} outside code section",
                self.pc
            )));
        }

        let pc = self.pc;
        let mut reader = BytecodeReader::at(code, pc);
        let raw = reader.read_u8()?;
        let (op, markers) = Opcode::from_byte(raw).ok_or(VmError::InvalidOpcode(raw, pc))?;

        if markers.trace_start {
            if let Some(jit) = self.jit.as_mut() {
                jit.maybe_start_recording(pc);
            }
        }

        match op {
            Opcode::Push => {
                let tag_byte = reader.read_u8()?;
                match TypeTag::from_byte(tag_byte) {
                    Some(TypeTag::Int) => {
                        let value = reader.read_i32()?;
                        self.pc = reader.pos();
                        self.stack.push(Value::Int(value));
                        self.trace_event(pc, self.pc, TraceEvent::PushInt(value));
                    }
                    Some(TypeTag::Real) => {
                        let value = reader.read_real()?;
                        self.pc = reader.pos();
                        self.stack.push(Value::Real(value));
                        self.trace_event(pc, self.pc, TraceEvent::PushReal(value));
                    }
                    Some(TypeTag::String) => {
                        let value = reader.read_str()?;
                        self.pc = reader.pos();
                        let ptr = self.memory.alloc_string(value.clone());
                        self.stack.push(Value::Str(ptr));
                        self.trace_event(pc, self.pc, TraceEvent::PushString(&value));
                    }
                    _ => {
                        return Err(VmError::ProgramMalformed(format!(
                            "bad push tag {tag_byte:#x} at {pc:#x}"
                        )))
                    }
                }
            }

            Opcode::Pop => {
                let slot = reader.read_u8()?;
                self.pc = reader.pos();
                let value = self.stack.pop()?;
                let tag = value.tag();
                self.store_local(slot, value)?;
                self.trace_event(pc, self.pc, TraceEvent::PopLocal { slot, tag });
            }

            Opcode::PushLocal => {
                let slot = reader.read_u8()?;
                self.pc = reader.pos();
                let value = match self.frames.last() {
                    Some(frame) => frame.record.get(slot)?,
                    None => return Err(VmError::NoProgram),
                };
                self.addref_value(value)?;
                self.stack.push(value);
                self.trace_event(
                    pc,
                    self.pc,
                    TraceEvent::PushLocal {
                        slot,
                        tag: value.tag(),
                    },
                );
            }

            Opcode::Set => {
                let slot = reader.read_u8()?;
                let tag_byte = reader.read_u8()?;
                match TypeTag::from_byte(tag_byte) {
                    Some(TypeTag::Int) => {
                        let value = reader.read_i32()?;
                        self.pc = reader.pos();
                        self.store_local(slot, Value::Int(value))?;
                        self.trace_event(pc, self.pc, TraceEvent::SetInt { slot, value });
                    }
                    Some(TypeTag::Real) => {
                        let value = reader.read_real()?;
                        self.pc = reader.pos();
                        self.store_local(slot, Value::Real(value))?;
                        self.trace_event(pc, self.pc, TraceEvent::Unsupported);
                    }
                    Some(TypeTag::String) => {
                        let value = reader.read_str()?;
                        self.pc = reader.pos();
                        let ptr = self.memory.alloc_string(value.clone());
                        self.store_local(slot, Value::Str(ptr))?;
                        self.trace_event(pc, self.pc, TraceEvent::SetString { slot, value: &value });
                    }
                    _ => {
                        return Err(VmError::ProgramMalformed(format!(
                            "bad set tag {tag_byte:#x} at {pc:#x}"
                        )))
                    }
                }
            }

            Opcode::Local => {
                self.pc = reader.pos();
                match self.frames.last_mut() {
                    Some(frame) => frame.record.declare(),
                    None => return Err(VmError::NoProgram),
                }
                self.trace_event(pc, self.pc, TraceEvent::Unsupported);
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                self.pc = reader.pos();
                let arith = match op {
                    Opcode::Add => ArithOp::Add,
                    Opcode::Sub => ArithOp::Sub,
                    Opcode::Mul => ArithOp::Mul,
                    _ => ArithOp::Div,
                };
                let (lhs, rhs) = self.binary_arith(arith)?;
                self.trace_event(
                    pc,
                    self.pc,
                    TraceEvent::Binary {
                        op: arith,
                        lhs,
                        rhs,
                    },
                );
            }

            Opcode::UnaryMinus => {
                self.pc = reader.pos();
                let value = self.stack.pop()?;
                let tag = value.tag();
                let result = match value {
                    Value::Int(v) => Value::Int(v.wrapping_neg()),
                    Value::Real(v) => Value::Real(-v),
                    other => {
                        self.release_value(other)?;
                        return Err(VmError::TypeMismatch {
                            expected: TypeTag::Int,
                            found: tag,
                        });
                    }
                };
                self.stack.push(result);
                self.trace_event(pc, self.pc, TraceEvent::UnaryMinus { tag });
            }

            Opcode::Increment | Opcode::Decrement => {
                self.pc = reader.pos();
                let delta = if op == Opcode::Increment { 1 } else { -1 };
                let value = self.stack.pop()?;
                let tag = value.tag();
                let result = match value {
                    Value::Int(v) => Value::Int(v.wrapping_add(delta)),
                    Value::Real(v) => Value::Real(v + delta as Real),
                    other => {
                        self.release_value(other)?;
                        return Err(VmError::TypeMismatch {
                            expected: TypeTag::Int,
                            found: tag,
                        });
                    }
                };
                self.stack.push(result);
                let event = if op == Opcode::Increment {
                    TraceEvent::Increment { tag }
                } else {
                    TraceEvent::Decrement { tag }
                };
                self.trace_event(pc, self.pc, event);
            }

            Opcode::Format => {
                self.pc = reader.pos();
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                let tags = (lhs.tag(), rhs.tag());
                let left = self.coerce_string(&lhs);
                let right = self.coerce_string(&rhs);
                self.release_value(lhs)?;
                self.release_value(rhs)?;
                let text = format!("{}{}", left?, right?);
                let ptr = self.memory.alloc_string(text);
                self.stack.push(Value::Str(ptr));
                self.trace_event(
                    pc,
                    self.pc,
                    TraceEvent::Format {
                        lhs: tags.0,
                        rhs: tags.1,
                    },
                );
            }

            Opcode::Cmp => {
                self.pc = reader.pos();
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                let tags = (lhs.tag(), rhs.tag());
                let flag = match (&lhs, &rhs) {
                    (Value::Int(l), Value::Int(r)) => match l.cmp(r) {
                        std::cmp::Ordering::Less => -1,
                        std::cmp::Ordering::Equal => 0,
                        std::cmp::Ordering::Greater => 1,
                    },
                    (Value::Real(l), Value::Real(r)) => real_flag(*l, *r),
                    (Value::Int(l), Value::Real(r)) => real_flag(*l as Real, *r),
                    (Value::Real(l), Value::Int(r)) => real_flag(*l, *r as Real),
                    (Value::Str(l), Value::Str(r)) => {
                        let l = unsafe { l.payload::<String>() };
                        let r = unsafe { r.payload::<String>() };
                        match l.cmp(r) {
                            std::cmp::Ordering::Less => -1,
                            std::cmp::Ordering::Equal => 0,
                            std::cmp::Ordering::Greater => 1,
                        }
                    }
                    // Identity equality only.
                    (Value::Table(l), Value::Table(r)) => i32::from(l != r),
                    (Value::Func(l), Value::Func(r)) => i32::from(l != r),
                    _ => {
                        let found = rhs.tag();
                        self.release_value(lhs)?;
                        self.release_value(rhs)?;
                        return Err(VmError::TypeMismatch {
                            expected: tags.0,
                            found,
                        });
                    }
                };
                self.release_value(lhs)?;
                self.release_value(rhs)?;
                self.cmp_flag = flag;
                self.trace_event(
                    pc,
                    self.pc,
                    TraceEvent::Compare {
                        lhs: tags.0,
                        rhs: tags.1,
                    },
                );
            }

            Opcode::Jump => {
                let kind_byte = reader.read_u8()?;
                let kind = JumpKind::from_byte(kind_byte).ok_or_else(|| {
                    VmError::ProgramMalformed(format!("bad jump kind {kind_byte:#x} at {pc:#x}"))
                })?;
                let offset = reader.read_i16()?;
                let fallthrough = reader.pos();
                let target = (fallthrough as i64 + offset as i64) as usize;
                let taken = kind.taken(self.cmp_flag);
                self.pc = if taken { target } else { fallthrough };
                self.trace_event(
                    pc,
                    fallthrough,
                    TraceEvent::Jump {
                        kind,
                        taken,
                        target,
                    },
                );
            }

            Opcode::Dup => {
                self.pc = reader.pos();
                let top = self.stack.peek()?;
                self.addref_value(top)?;
                self.stack.push(top);
                self.trace_event(pc, self.pc, TraceEvent::Dup);
            }

            Opcode::PushFunc => {
                let function_id = reader.read_u32()?;
                self.pc = reader.pos();
                if program.find_function(function_id).is_none() {
                    return Err(VmError::UnknownFunction(function_id));
                }
                self.stack.push(Value::Func(function_id));
                self.trace_event(pc, self.pc, TraceEvent::Unsupported);
            }

            Opcode::Call | Opcode::CallD => {
                let function_id = reader.read_u32()?;
                let argc = reader.read_u8()?;
                self.pc = reader.pos();
                self.call_function(&program, function_id, argc, None, pc)?;
            }

            Opcode::CallO => {
                let argc = reader.read_u8()?;
                self.pc = reader.pos();
                let callee = self.stack.pop()?;
                let function_id = match callee {
                    Value::Func(id) => id,
                    other => {
                        let found = other.tag();
                        self.release_value(other)?;
                        return Err(VmError::TypeMismatch {
                            expected: TypeTag::Func,
                            found,
                        });
                    }
                };
                self.call_function(&program, function_id, argc, None, pc)?;
            }

            Opcode::CallM => {
                let method = reader.read_str()?;
                let argc = reader.read_u8()?;
                self.pc = reader.pos();
                let receiver = self.stack.pop()?;
                let table_ptr = match receiver {
                    Value::Table(ptr) => ptr,
                    other => {
                        let found = other.tag();
                        self.release_value(other)?;
                        return Err(VmError::TypeMismatch {
                            expected: TypeTag::Object,
                            found,
                        });
                    }
                };
                let bound = unsafe { table_ptr.payload::<Table>() }.get_hash(&method);
                let function_id = match bound {
                    Value::Func(id) => id,
                    other => {
                        self.release_value(receiver)?;
                        return Err(VmError::TypeMismatch {
                            expected: TypeTag::Func,
                            found: other.tag(),
                        });
                    }
                };
                // The receiver's stack reference moves into slot 0.
                self.call_function(&program, function_id, argc, Some(receiver), pc)?;
            }

            Opcode::Yield => {
                let function_id = reader.read_u32()?;
                let argc = reader.read_u8()?;
                self.pc = reader.pos();
                let name = program
                    .find_function(function_id)
                    .ok_or(VmError::UnknownFunction(function_id))?
                    .name
                    .clone();
                self.trace_event(pc, self.pc, TraceEvent::Unsupported);
                self.call_external(&name, function_id, argc, pc, self.pc)?;
                return Ok(Flow::Yield);
            }

            Opcode::Return => {
                self.pc = reader.pos();
                self.trace_event(pc, self.pc, TraceEvent::Unsupported);
                if self.frames.len() <= 1 {
                    return Ok(Flow::Done);
                }
                let frame = match self.frames.pop() {
                    Some(frame) => frame,
                    None => return Err(VmError::NoProgram),
                };
                for value in frame.record.iter() {
                    if let Some(ptr) = value.managed() {
                        self.memory.release(ptr)?;
                    }
                }
                self.pc = frame.return_pc;
            }

            Opcode::Done => {
                self.pc = reader.pos();
                self.trace_event(pc, self.pc, TraceEvent::Unsupported);
                return Ok(Flow::Done);
            }

            Opcode::TableNew => {
                self.pc = reader.pos();
                let ptr = self.memory.alloc_table(Table::new());
                self.stack.push(Value::Table(ptr));
                self.trace_event(pc, self.pc, TraceEvent::TableNew);
            }

            Opcode::TableGet => {
                self.pc = reader.pos();
                let key = self.stack.pop()?;
                let table = self.stack.pop()?;
                let table_ptr = match table {
                    Value::Table(ptr) => ptr,
                    other => {
                        let found = other.tag();
                        self.release_value(key)?;
                        self.release_value(other)?;
                        return Err(VmError::TypeMismatch {
                            expected: TypeTag::Object,
                            found,
                        });
                    }
                };
                let key_tag = key.tag();
                let value = match key {
                    Value::Int(index) => {
                        unsafe { table_ptr.payload::<Table>() }.get_array(index)
                    }
                    Value::Str(key_ptr) => {
                        let name = unsafe { key_ptr.payload::<String>() }.clone();
                        self.memory.release(key_ptr)?;
                        unsafe { table_ptr.payload::<Table>() }.get_hash(&name)
                    }
                    other => {
                        self.release_value(other)?;
                        self.memory.release(table_ptr)?;
                        return Err(VmError::TypeMismatch {
                            expected: TypeTag::Int,
                            found: key_tag,
                        });
                    }
                };
                self.addref_value(value)?;
                self.memory.release(table_ptr)?;
                self.stack.push(value);
                self.trace_event(
                    pc,
                    self.pc,
                    TraceEvent::TableGet {
                        key: key_tag,
                        result: value.tag(),
                    },
                );
            }

            Opcode::TableSet => {
                self.pc = reader.pos();
                let value = self.stack.pop()?;
                let key = self.stack.pop()?;
                let table = self.stack.pop()?;
                let table_ptr = match table {
                    Value::Table(ptr) => ptr,
                    other => {
                        let found = other.tag();
                        self.release_value(value)?;
                        self.release_value(key)?;
                        self.release_value(other)?;
                        return Err(VmError::TypeMismatch {
                            expected: TypeTag::Object,
                            found,
                        });
                    }
                };
                let key_tag = key.tag();
                let displaced = match key {
                    Value::Int(index) => {
                        unsafe { table_ptr.payload_mut::<Table>() }.set_array(index, value)
                    }
                    Value::Str(key_ptr) => {
                        let name = unsafe { key_ptr.payload::<String>() }.clone();
                        self.memory.release(key_ptr)?;
                        unsafe { table_ptr.payload_mut::<Table>() }.set_hash(name, value)
                    }
                    other => {
                        self.release_value(value)?;
                        self.release_value(other)?;
                        self.memory.release(table_ptr)?;
                        return Err(VmError::TypeMismatch {
                            expected: TypeTag::Int,
                            found: key_tag,
                        });
                    }
                };
                if let Some(old) = displaced {
                    self.release_value(old)?;
                }
                self.memory.release(table_ptr)?;
                self.trace_event(pc, self.pc, TraceEvent::TableSet { key: key_tag });
            }
        }

        Ok(Flow::Continue)
    }

    fn fail(&mut self, error: VmError) -> Status {
        let mut entries = Vec::with_capacity(self.frames.len());
        for index in (0..self.frames.len()).rev() {
            let frame = &self.frames[index];
            let frame_pc = if index == self.frames.len() - 1 {
                self.pc
            } else {
                self.frames[index + 1].return_pc
            };
            let debug_line = self
                .debug
                .as_ref()
                .and_then(|d| d.line_for_pc(frame_pc as u32))
                .unwrap_or(0);
            entries.push(CallstackEntry {
                function_name: frame.function_name.clone(),
                num_args: frame.num_args,
                debug_line,
                program_counter: frame_pc,
            });
        }
        self.stack_trace = entries;

        // Unwind: give every reference back before the arena survives to
        // the next run.
        while let Some(frame) = self.frames.pop() {
            for value in frame.record.iter() {
                if let Some(ptr) = value.managed() {
                    let _ = self.memory.release(ptr);
                }
            }
        }
        let values: Vec<Value> = self.stack.drain().collect();
        for value in values {
            if let Some(ptr) = value.managed() {
                let _ = self.memory.release(ptr);
            }
        }
        if let Some(jit) = self.jit.as_mut() {
            jit.reset_recording();
        }

        self.last_error = Some(error);
        self.state = ExecState::Finished;
        Status::Error
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
