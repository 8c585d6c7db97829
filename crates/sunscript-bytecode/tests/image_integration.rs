//! Integration tests for the program image: emit, encode, decode, verify.

use sunscript_bytecode::{
    flags, verify_program, FunctionKind, JumpKind, Opcode, Program, ProgramBuilder, ProgramError,
    MK_LOOPSTART,
};

#[test]
fn test_emit_encode_decode_verify() {
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
    let bytes = program.encode();
    let decoded = Program::decode(&bytes).unwrap();

    assert_eq!(decoded.build_flags, flags::current());
    assert_eq!(decoded.functions.len(), 3);
    assert_eq!(decoded.code, program.code);
    verify_program(&decoded).unwrap();

    let print_info = decoded.find_function(print).unwrap();
    assert_eq!(print_info.kind, FunctionKind::External);
    assert_eq!(print_info.name, "Print");
}

#[test]
fn test_loop_markers_survive_roundtrip() {
    let mut builder = ProgramBuilder::new();
    let mut main = builder.begin_function("main", 0, true);

    main.set_int(0, 0);
    let head = main.create_label();
    main.mark_label(head);
    main.loop_start();
    main.push_local(0);
    main.increment();
    main.pop_local(0);
    main.push_local(0);
    main.push_int(10);
    main.compare();
    main.jump(JumpKind::Lt, head);
    main.done();
    builder.define(main).unwrap();

    let (program, _) = builder.build().unwrap();
    let decoded = Program::decode(&program.encode()).unwrap();
    verify_program(&decoded).unwrap();

    let marked = decoded
        .code
        .iter()
        .filter(|&&byte| byte & MK_LOOPSTART != 0)
        .count();
    assert_eq!(marked, 1);
    let (op, markers) = Opcode::from_byte(decoded.code[7]).unwrap();
    assert_eq!(op, Opcode::PushLocal);
    assert!(markers.loop_start);
}

#[test]
fn test_truncated_image_rejected() {
    let mut builder = ProgramBuilder::new();
    let mut main = builder.begin_function("main", 0, true);
    main.push_string("hello");
    main.done();
    builder.define(main).unwrap();
    let (program, _) = builder.build().unwrap();

    let bytes = program.encode();
    let result = Program::decode(&bytes[..bytes.len() / 2]);
    assert!(matches!(
        result,
        Err(ProgramError::Decode(_)) | Err(ProgramError::Malformed(_))
    ));
}
