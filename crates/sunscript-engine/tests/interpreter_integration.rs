//! End-to-end interpreter tests: emit a program, load it, run it, and
//! observe the host-handler side.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use sunscript_bytecode::{JumpKind, ProgramBuilder};
use sunscript_engine::{
    CallContext, HostHandler, ManagedPtr, Status, TypeTag, Value, Vm, VmError,
};

/// Handler that renders every call into a string like `Print(100)`.
struct RecordingHost {
    calls: Rc<RefCell<Vec<String>>>,
    fail_on: Option<String>,
}

impl RecordingHost {
    fn new() -> (Self, Rc<RefCell<Vec<String>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        (
            RecordingHost {
                calls: calls.clone(),
                fail_on: None,
            },
            calls,
        )
    }

    fn failing_on(name: &str) -> (Self, Rc<RefCell<Vec<String>>>) {
        let (mut host, calls) = Self::new();
        host.fail_on = Some(name.to_string());
        (host, calls)
    }
}

impl HostHandler for RecordingHost {
    fn on_call(&mut self, ctx: &mut CallContext<'_>) -> Status {
        if self.fail_on.as_deref() == Some(ctx.name()) {
            return Status::Error;
        }
        let mut parts = Vec::new();
        while let Some(tag) = ctx.param_tag() {
            let rendered = match tag {
                TypeTag::Int => ctx.param_int().map(|v| v.to_string()),
                TypeTag::Real => ctx.param_real().map(|v| v.to_string()),
                TypeTag::String => ctx.param_string(),
                TypeTag::Object => ctx.param_table().map(|_| "<table>".to_string()),
                _ => return Status::Error,
            };
            match rendered {
                Ok(text) => parts.push(text),
                Err(_) => return Status::Error,
            }
        }
        self.calls
            .borrow_mut()
            .push(format!("{}({})", ctx.name(), parts.join(",")));
        Status::Ok
    }
}

fn vm_with_host() -> (Vm, Rc<RefCell<Vec<String>>>) {
    let (host, calls) = RecordingHost::new();
    let mut vm = Vm::new();
    vm.set_handler(Box::new(host));
    (vm, calls)
}

#[test]
fn test_arithmetic_literal() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.push_int(10);
    main.push_int(10);
    main.mul();
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    assert_eq!(vm.load_program(&program.encode()), Status::Ok);
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(100)"]);
}

#[test]
fn test_conditional_prints_once() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.push_int(42);
    main.push_int(42);
    main.compare();
    let skip = main.create_label();
    main.jump(JumpKind::Ne, skip);
    main.push_string("eq");
    main.call(print, 1);
    main.mark_label(skip);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(eq)"]);
}

#[test]
fn test_yield_then_resume() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.push_string("A");
    main.yield_call(print, 1);
    main.push_string("B");
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Yielded);
    assert_eq!(calls.borrow().as_slice(), ["Print(A)"]);

    assert_eq!(vm.resume(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(A)", "Print(B)"]);

    // Further resumes are no-ops at the same terminal state.
    assert_eq!(vm.resume(), Status::Ok);
    assert_eq!(vm.resume(), Status::Ok);
    assert_eq!(calls.borrow().len(), 2);
}

#[test]
fn test_table_mixed_keys() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.local("t");
    main.table_new();
    main.pop_local(0);

    // t["x"] = 1
    main.push_local(0);
    main.push_string("x");
    main.push_int(1);
    main.table_set();
    // t[0] = 2
    main.push_local(0);
    main.push_int(0);
    main.push_int(2);
    main.table_set();
    // Print(t["x"] + t[0])
    main.push_local(0);
    main.push_string("x");
    main.table_get();
    main.push_local(0);
    main.push_int(0);
    main.table_get();
    main.add();
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(3)"]);
}

#[test]
fn test_internal_call() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);

    let mut sum = builder.begin_function("sum", 2, false);
    sum.push_local(0);
    sum.push_local(1);
    sum.add();
    sum.ret();
    let sum_id = builder.define(sum).unwrap();

    let mut main = builder.begin_function("main", 0, true);
    main.push_int(40);
    main.push_int(2);
    main.call(sum_id, 2);
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(42)"]);
}

#[test]
fn test_call_through_function_value() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);

    let mut double = builder.begin_function("double", 1, false);
    double.push_local(0);
    double.push_int(2);
    double.mul();
    double.ret();
    let double_id = builder.define(double).unwrap();

    let mut main = builder.begin_function("main", 0, true);
    main.push_int(21);
    main.push_func(double_id);
    main.call_operand(1);
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(42)"]);
}

#[test]
fn test_method_call_through_table() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);

    // Receiver arrives in slot 0; the method ignores it.
    let mut method = builder.begin_function("greet", 1, false);
    method.push_string("hello");
    method.call(print, 1);
    method.ret();
    let method_id = builder.define(method).unwrap();

    let mut main = builder.begin_function("main", 0, true);
    main.local("obj");
    main.table_new();
    main.pop_local(0);
    main.push_local(0);
    main.push_string("greet");
    main.push_func(method_id);
    main.table_set();
    main.push_local(0);
    main.call_method("greet", 0);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(hello)"]);
}

#[test]
fn test_format_coerces() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.push_string("a=");
    main.push_int(1);
    main.format();
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(a=1)"]);
}

#[test]
fn test_int_division_truncates_and_promotes() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.push_int(7);
    main.push_int(2);
    main.div();
    main.call(print, 1);
    main.push_int(1);
    main.push_real(0.5);
    main.add();
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(3)", "Print(1.5)"]);
}

#[test]
fn test_divide_by_zero_fails_with_callstack() {
    let mut builder = ProgramBuilder::new();
    let mut main = builder.begin_function("main", 0, true);
    main.debug_line(3);
    main.push_int(1);
    main.push_int(0);
    main.div();
    main.done();
    builder.define(main).unwrap();
    let (program, debug) = builder.build().unwrap();

    let (mut vm, _) = vm_with_host();
    vm.load_program_with_debug(&program.encode(), &debug.encode());
    assert_eq!(vm.run(), Status::Error);
    assert!(matches!(vm.last_error(), Some(VmError::DivideByZero)));

    let stack = vm.call_stack();
    assert_eq!(stack.len(), 1);
    assert_eq!(stack[0].function_name, "main");
    assert_eq!(stack[0].debug_line, 3);
}

#[test]
fn test_real_division_by_zero_is_ieee() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.push_real(1.0);
    main.push_real(0.0);
    main.div();
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(inf)"]);
}

#[test]
fn test_int_add_wraps() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.push_int(i32::MAX);
    main.push_int(1);
    main.add();
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), [format!("Print({})", i32::MIN)]);
}

#[test]
fn test_handler_error_propagates() {
    let mut builder = ProgramBuilder::new();
    let boom = builder.external("Boom", 0);
    let mut main = builder.begin_function("main", 0, true);
    main.call(boom, 0);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (host, _) = RecordingHost::failing_on("Boom");
    let mut vm = Vm::new();
    vm.set_handler(Box::new(host));
    vm.load_program(&program.encode());

    assert_eq!(vm.run(), Status::Error);
    assert!(matches!(vm.last_error(), Some(VmError::Handler(name)) if name == "Boom"));
    // The failing external call is the top of the captured stack.
    assert_eq!(vm.call_stack()[0].function_name, "Boom");
    assert_eq!(vm.call_stack()[1].function_name, "main");
}

#[test]
fn test_timeout_preserves_state() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.push_string("done");
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());

    // An already-expired deadline suspends before the first opcode.
    assert_eq!(vm.run_with_timeout(Duration::ZERO), Status::Timeout);
    assert!(calls.borrow().is_empty());

    assert_eq!(vm.resume(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(done)"]);
}

#[test]
fn test_run_twice_resets_state() {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.local("s");
    main.set_string(0, "x");
    main.push_local(0);
    main.push_local(0);
    main.format();
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(xx)", "Print(xx)"]);
}

#[test]
fn test_stack_underflow_surfaces() {
    let mut builder = ProgramBuilder::new();
    let mut main = builder.begin_function("main", 0, true);
    main.local("x");
    main.pop_local(0);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, _) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Error);
    assert!(matches!(vm.last_error(), Some(VmError::StackUnderflow)));
}

#[test]
fn test_unknown_callee_rejected_at_load() {
    let mut builder = ProgramBuilder::new();
    let mut main = builder.begin_function("main", 0, true);
    main.call(7, 0);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let mut vm = Vm::new();
    assert_eq!(vm.load_program(&program.encode()), Status::Error);
    assert!(matches!(
        vm.last_error(),
        Some(VmError::ProgramMalformed(_))
    ));
    // Unloaded: running reports the missing program.
    assert_eq!(vm.run(), Status::Error);
    assert!(matches!(vm.last_error(), Some(VmError::NoProgram)));
}

/// Handler that stashes a table argument for the host to use while the
/// VM is suspended.
struct SharingHost {
    shared: Rc<RefCell<Option<ManagedPtr>>>,
    calls: Rc<RefCell<Vec<String>>>,
}

impl HostHandler for SharingHost {
    fn on_call(&mut self, ctx: &mut CallContext<'_>) -> Status {
        match ctx.param_tag() {
            Some(TypeTag::Object) => {
                match ctx.param_table() {
                    Ok(ptr) => *self.shared.borrow_mut() = Some(ptr),
                    Err(_) => return Status::Error,
                }
                Status::Ok
            }
            Some(TypeTag::Int) => match ctx.param_int() {
                Ok(v) => {
                    self.calls.borrow_mut().push(format!("{}({v})", ctx.name()));
                    Status::Ok
                }
                Err(_) => Status::Error,
            },
            _ => Status::Error,
        }
    }
}

#[test]
fn test_host_table_helpers_across_yield() {
    let mut builder = ProgramBuilder::new();
    let share = builder.external("Share", 1);
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.local("t");
    main.table_new();
    main.pop_local(0);
    // t["x"] = 1, then hand the table to the host and suspend.
    main.push_local(0);
    main.push_string("x");
    main.push_int(1);
    main.table_set();
    main.push_local(0);
    main.yield_call(share, 1);
    // After resume, read back what the host wrote.
    main.push_local(0);
    main.push_string("y");
    main.table_get();
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let shared = Rc::new(RefCell::new(None));
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::new();
    vm.set_handler(Box::new(SharingHost {
        shared: shared.clone(),
        calls: calls.clone(),
    }));
    vm.load_program(&program.encode());

    assert_eq!(vm.run(), Status::Yielded);
    let table = shared.borrow_mut().take().expect("handler saw the table");

    // While suspended the host reads and extends the table.
    assert_eq!(vm.table_hash(table, "x").unwrap(), Value::Int(1));
    vm.set_table_hash(table, "y", Value::Int(2)).unwrap();
    assert_eq!(vm.table_array(table, 9).unwrap(), Value::Void);

    assert_eq!(vm.resume(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(2)"]);

    // A host-made table works through the same helpers.
    let fresh = vm.create_table();
    vm.set_table_array(fresh, 0, Value::Int(7)).unwrap();
    assert_eq!(vm.table_array(fresh, 0).unwrap(), Value::Int(7));
}

#[test]
fn test_looping_sum_interpreted() {
    // for i in 0..10: s += i, without any markers or back-end.
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.local("s");
    main.local("i");
    main.set_int(0, 0);
    main.set_int(1, 0);
    let head = main.create_label();
    main.mark_label(head);
    main.push_local(0);
    main.push_local(1);
    main.add();
    main.pop_local(0);
    main.push_local(1);
    main.increment();
    main.pop_local(1);
    main.push_local(1);
    main.push_int(10);
    main.compare();
    main.jump(JumpKind::Lt, head);
    main.push_local(0);
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_host();
    vm.load_program(&program.encode());
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(45)"]);
}
