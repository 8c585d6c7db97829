use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sunscript_bytecode::{JumpKind, Program, ProgramBuilder};

fn build_image() -> Vec<u8> {
    let mut builder = ProgramBuilder::new();
    let print = builder.external("Print", 1);

    let mut main = builder.begin_function("main", 0, true);
    main.set_int(0, 0);
    main.set_int(1, 0);
    let head = main.create_label();
    main.mark_label(head);
    main.loop_start();
    main.push_local(1);
    main.push_local(0);
    main.add();
    main.pop_local(1);
    main.push_local(0);
    main.increment();
    main.pop_local(0);
    main.push_local(0);
    main.push_int(1000);
    main.compare();
    main.jump(JumpKind::Lt, head);
    main.push_local(1);
    main.call(print, 1);
    main.done();
    builder.define(main).unwrap();

    let (program, _) = builder.build().unwrap();
    program.encode()
}

fn bench_encode(c: &mut Criterion) {
    c.bench_function("image_encode", |b| {
        b.iter(|| black_box(build_image()));
    });
}

fn bench_decode(c: &mut Criterion) {
    let bytes = build_image();
    c.bench_function("image_decode", |b| {
        b.iter(|| Program::decode(black_box(&bytes)).unwrap());
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
