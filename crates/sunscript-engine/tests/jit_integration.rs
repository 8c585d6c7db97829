//! Recording, optimization, trace execution, and deoptimization tests
//! driven through the full VM.

use std::cell::RefCell;
use std::rc::Rc;
use sunscript_bytecode::{JumpKind, Program, ProgramBuilder};
use sunscript_engine::{
    CallContext, HostHandler, InterpBackend, NullBackend, Status, TypeTag, Vm,
};

struct RecordingHost {
    calls: Rc<RefCell<Vec<String>>>,
}

impl HostHandler for RecordingHost {
    fn on_call(&mut self, ctx: &mut CallContext<'_>) -> Status {
        let mut parts = Vec::new();
        while let Some(tag) = ctx.param_tag() {
            let rendered = match tag {
                TypeTag::Int => ctx.param_int().map(|v| v.to_string()),
                TypeTag::Real => ctx.param_real().map(|v| v.to_string()),
                TypeTag::String => ctx.param_string(),
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

fn vm_with_backend(backend: Option<Box<dyn sunscript_engine::TraceBackend>>) -> (Vm, Rc<RefCell<Vec<String>>>) {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Vm::new();
    vm.set_handler(Box::new(RecordingHost {
        calls: calls.clone(),
    }));
    if let Some(backend) = backend {
        vm.set_jit(backend);
    }
    (vm, calls)
}

/// `for i in 0..limit: s += i`, with the loop head marked for tracing,
/// then `Print(s)`.
fn summing_loop(limit: i32) -> Program {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.local("s");
    main.local("i");
    main.set_int(0, 0);
    main.set_int(1, 0);

    let head = main.create_label();
    main.mark_label(head);
    main.loop_start();
    main.trace_start();
    main.push_local(0);
    main.push_local(1);
    main.add();
    main.pop_local(0);
    main.push_local(1);
    main.increment();
    main.pop_local(1);
    main.push_local(1);
    main.push_int(limit);
    main.compare();
    main.jump(JumpKind::Lt, head);

    main.push_local(0);
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();
    program
}

#[test]
fn test_hot_loop_compiles_and_matches_interpreter() {
    let (mut vm, calls) = vm_with_backend(Some(Box::new(InterpBackend::new())));
    vm.load_program(&summing_loop(1000).encode());

    assert_eq!(vm.run(), Status::Ok);
    // 0 + 1 + ... + 999
    assert_eq!(calls.borrow().as_slice(), ["Print(499500)"]);
    assert_eq!(vm.jit().unwrap().compiled_traces(), 1);
}

#[test]
fn test_trace_reused_across_runs() {
    let (mut vm, calls) = vm_with_backend(Some(Box::new(InterpBackend::new())));
    vm.load_program(&summing_loop(100).encode());

    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(4950)", "Print(4950)"]);
    // The second run reuses the trace instead of re-recording.
    assert_eq!(vm.jit().unwrap().compiled_traces(), 1);
}

#[test]
fn test_null_backend_falls_back_to_interpretation() {
    let (mut vm, calls) = vm_with_backend(Some(Box::new(NullBackend)));
    vm.load_program(&summing_loop(1000).encode());

    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(499500)"]);
    assert_eq!(vm.jit().unwrap().compiled_traces(), 0);
}

#[test]
fn test_no_backend_still_runs_markers() {
    let (mut vm, calls) = vm_with_backend(None);
    vm.load_program(&summing_loop(1000).encode());

    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(499500)"]);
    assert!(vm.jit().is_none());
}

#[test]
fn test_optimization_level_zero_records_raw() {
    let (mut vm, calls) = vm_with_backend(Some(Box::new(InterpBackend::new())));
    vm.set_optimization_level(0);
    vm.load_program(&summing_loop(500).encode());

    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(124750)"]);
    assert_eq!(vm.jit().unwrap().compiled_traces(), 1);
}

#[test]
fn test_guard_failure_deoptimizes() {
    // x starts as an int but turns real on the first iteration; the
    // compiled trace's int assumption fails on re-entry, the trace is
    // dropped, and the interpreter finishes with the real result.
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.local("x");
    main.local("i");
    main.set_int(0, 0);
    main.set_int(1, 0);

    let head = main.create_label();
    main.mark_label(head);
    main.loop_start();
    main.trace_start();
    // x = x + 0.5 — int on the recorded iteration, real afterwards.
    main.push_local(0);
    main.push_real(0.5);
    main.add();
    main.pop_local(0);
    main.push_local(1);
    main.increment();
    main.pop_local(1);
    main.push_local(1);
    main.push_int(4);
    main.compare();
    main.jump(JumpKind::Lt, head);

    main.push_local(0);
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_backend(Some(Box::new(InterpBackend::new())));
    vm.load_program(&program.encode());

    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(calls.borrow().as_slice(), ["Print(2)"]);
    // The deoptimized trace is gone.
    assert_eq!(vm.jit().unwrap().compiled_traces(), 0);
}

#[test]
fn test_external_call_in_loop_aborts_nothing() {
    // A void external call inside the loop is recordable IR, but the
    // evaluator back-end declines string arguments, so the VM falls
    // back to interpretation and still produces every call.
    let mut builder = ProgramBuilder::new();
    let tick = builder.external("Tick", 1);
    let print = builder.external("Print", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.local("i");
    main.set_int(0, 0);

    let head = main.create_label();
    main.mark_label(head);
    main.loop_start();
    main.trace_start();
    main.push_string("t");
    main.call(tick, 1);
    main.push_local(0);
    main.increment();
    main.pop_local(0);
    main.push_local(0);
    main.push_int(3);
    main.compare();
    main.jump(JumpKind::Lt, head);

    main.push_string("end");
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_backend(Some(Box::new(InterpBackend::new())));
    vm.load_program(&program.encode());

    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(
        calls.borrow().as_slice(),
        ["Tick(t)", "Tick(t)", "Tick(t)", "Print(end)"]
    );
    assert_eq!(vm.jit().unwrap().compiled_traces(), 0);
}

#[test]
fn test_trace_executes_calls() {
    // Int-only external calls survive compilation; the trace itself
    // drives the handler on every compiled iteration.
    let mut builder = ProgramBuilder::new();
    let tick = builder.external("Tick", 1);
    let mut main = builder.begin_function("main", 0, true);
    main.local("i");
    main.set_int(0, 0);

    let head = main.create_label();
    main.mark_label(head);
    main.loop_start();
    main.trace_start();
    main.push_local(0);
    main.call(tick, 1);
    main.push_local(0);
    main.increment();
    main.pop_local(0);
    main.push_local(0);
    main.push_int(5);
    main.compare();
    main.jump(JumpKind::Lt, head);
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let (mut vm, calls) = vm_with_backend(Some(Box::new(InterpBackend::new())));
    vm.load_program(&program.encode());

    assert_eq!(vm.run(), Status::Ok);
    assert_eq!(
        calls.borrow().as_slice(),
        ["Tick(0)", "Tick(1)", "Tick(2)", "Tick(3)", "Tick(4)"]
    );
    assert_eq!(vm.jit().unwrap().compiled_traces(), 1);
}
