use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::Arc;

use tessera::ir::{Dst, IntBinOp, IntCmpOp, IntUnOp, LoadKind, Op, RegClass, Src, StoreKind, Width};
use tessera::module::{Function, Import};
use tessera::types::FuncType;
use tessera::{Config, Module, Pager, Runtime, SegmentedMemory, Trap, Val, ValType};

fn rt() -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::new(Config::default()).unwrap()
}

fn instantiate(module: &Module) -> tessera::Instance {
    rt().instantiate(module).unwrap()
}

/// `name(params) -> ret` with the frame window `[ret][args]` at base 0.
fn unary_i32(name: &str, ops: Vec<Op>) -> Module {
    let mut m = Module::new();
    let ty = m.add_type(FuncType::parse_signature("i(i)").unwrap());
    let f = m.add_function(Function::new(name, ty).ret_slots(1).arg_slots(1).code(ops));
    m.export(name, f);
    m
}

fn binary_i32(name: &str, ops: Vec<Op>) -> Module {
    let mut m = Module::new();
    let ty = m.add_type(FuncType::parse_signature("i(ii)").unwrap());
    let f = m.add_function(Function::new(name, ty).ret_slots(1).arg_slots(2).code(ops));
    m.export(name, f);
    m
}

#[test]
fn add_two_numbers() {
    let m = binary_i32(
        "add",
        vec![
            Op::IntBinary {
                width: Width::W32,
                op: IntBinOp::Add,
                lhs: Src::Slot(1),
                rhs: Src::Slot(2),
                dst: Dst::Slot(0),
            },
            Op::Return,
        ],
    );
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("add", &[Val::I32(3), Val::I32(4)]), Ok(Some(Val::I32(7))));
    assert_eq!(
        inst.call("add", &[Val::I32(i32::MAX), Val::I32(1)]),
        Ok(Some(Val::I32(i32::MIN)))
    );
}

#[test]
fn division_traps() {
    let div = |op| {
        binary_i32(
            "div",
            vec![
                Op::IntBinary {
                    width: Width::W32,
                    op,
                    lhs: Src::Slot(1),
                    rhs: Src::Slot(2),
                    dst: Dst::Slot(0),
                },
                Op::Return,
            ],
        )
    };

    let mut signed = instantiate(&div(IntBinOp::DivS));
    assert_eq!(signed.call("div", &[Val::I32(7), Val::I32(0)]), Err(Trap::DivisionByZero));
    assert_eq!(
        signed.call("div", &[Val::I32(i32::MIN), Val::I32(-1)]),
        Err(Trap::IntegerOverflow)
    );
    assert_eq!(signed.call("div", &[Val::I32(-7), Val::I32(2)]), Ok(Some(Val::I32(-3))));

    // Unsigned division traps on zero but never on overflow.
    let mut unsigned = instantiate(&div(IntBinOp::DivU));
    assert_eq!(unsigned.call("div", &[Val::I32(7), Val::I32(0)]), Err(Trap::DivisionByZero));
    assert_eq!(
        unsigned.call("div", &[Val::I32(i32::MIN), Val::I32(-1)]),
        Ok(Some(Val::I32(0)))
    );

    let mut rem = instantiate(&div(IntBinOp::RemS));
    assert_eq!(rem.call("div", &[Val::I32(i32::MIN), Val::I32(-1)]), Ok(Some(Val::I32(0))));
}

#[test]
fn clz_ctz_of_zero_is_the_width() {
    let m = unary_i32(
        "clz",
        vec![
            Op::IntUnary {
                width: Width::W32,
                op: IntUnOp::Clz,
                src: Src::Slot(1),
                dst: Dst::Slot(0),
            },
            Op::Return,
        ],
    );
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("clz", &[Val::I32(0)]), Ok(Some(Val::I32(32))));
    assert_eq!(inst.call("clz", &[Val::I32(1)]), Ok(Some(Val::I32(31))));

    let mut m = Module::new();
    let ty = m.add_type(FuncType::parse_signature("I(I)").unwrap());
    let f = m.add_function(Function::new("ctz", ty).ret_slots(1).arg_slots(1).code(vec![
        Op::IntUnary {
            width: Width::W64,
            op: IntUnOp::Ctz,
            src: Src::Slot(1),
            dst: Dst::Slot(0),
        },
        Op::Return,
    ]));
    m.export("ctz", f);
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("ctz", &[Val::I64(0)]), Ok(Some(Val::I64(64))));
}

#[test]
fn branch_table_clamps_to_default() {
    // Targets: two explicit arms and a trailing default.
    let m = unary_i32(
        "route",
        vec![
            Op::BranchTable {
                index: Src::Slot(1),
                targets: vec![2, 4, 6].into_boxed_slice(),
            },
            Op::Unreachable,
            Op::Const32 { slot: 0, value: 10 },
            Op::Return,
            Op::Const32 { slot: 0, value: 20 },
            Op::Return,
            Op::Const32 { slot: 0, value: 99 },
            Op::Return,
        ],
    );
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("route", &[Val::I32(0)]), Ok(Some(Val::I32(10))));
    // The last explicit target, not the default.
    assert_eq!(inst.call("route", &[Val::I32(1)]), Ok(Some(Val::I32(20))));
    // In-range end and far out-of-range both select the default.
    assert_eq!(inst.call("route", &[Val::I32(2)]), Ok(Some(Val::I32(99))));
    assert_eq!(inst.call("route", &[Val::I32(1000)]), Ok(Some(Val::I32(99))));
}

#[test]
fn loop_sums_a_range() {
    // Locals: slot 2 = i, slot 3 = acc, slot 4 = constant 1.
    let mut m = Module::new();
    let ty = m.add_type(FuncType::parse_signature("i(i)").unwrap());
    let f = m.add_function(
        Function::new("sum", ty).ret_slots(1).arg_slots(1).local_bytes(24).code(vec![
            Op::Const32 { slot: 4, value: 1 },
            Op::Loop,
            Op::IntBinary {
                width: Width::W32,
                op: IntBinOp::Add,
                lhs: Src::Slot(2),
                rhs: Src::Slot(4),
                dst: Dst::Slot(2),
            },
            Op::IntBinary {
                width: Width::W32,
                op: IntBinOp::Add,
                lhs: Src::Slot(3),
                rhs: Src::Slot(2),
                dst: Dst::Slot(3),
            },
            Op::IntCompare {
                width: Width::W32,
                op: IntCmpOp::LtS,
                lhs: Src::Slot(2),
                rhs: Src::Slot(1),
                dst: Dst::Reg,
            },
            Op::ContinueLoopIf { cond: Src::Reg, target: 2 },
            Op::CopySlot { width: Width::W32, dst: 0, src: 3 },
            Op::Return,
        ]),
    );
    m.export("sum", f);
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("sum", &[Val::I32(5)]), Ok(Some(Val::I32(15))));
    assert_eq!(inst.call("sum", &[Val::I32(1)]), Ok(Some(Val::I32(1))));
    assert_eq!(inst.call("sum", &[Val::I32(1000)]), Ok(Some(Val::I32(500500))));
}

#[test]
fn nested_direct_calls() {
    let mut m = Module::new();
    let ty = m.add_type(FuncType::parse_signature("i(i)").unwrap());
    let double = m.add_function(Function::new("double", ty).ret_slots(1).arg_slots(1).code(vec![
        Op::IntBinary {
            width: Width::W32,
            op: IntBinOp::Add,
            lhs: Src::Slot(1),
            rhs: Src::Slot(1),
            dst: Dst::Slot(0),
        },
        Op::Return,
    ]));
    let quad = m.add_function(Function::new("quad", ty).ret_slots(1).arg_slots(1).code(vec![
        Op::CopySlot { width: Width::W32, dst: 3, src: 1 },
        Op::Call { func: double, stack_offset: 2 },
        Op::CopySlot { width: Width::W32, dst: 3, src: 2 },
        Op::Call { func: double, stack_offset: 2 },
        Op::CopySlot { width: Width::W32, dst: 0, src: 2 },
        Op::Return,
    ]));
    m.export("quad", quad);
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("quad", &[Val::I32(3)]), Ok(Some(Val::I32(12))));
}

fn fib_module() -> (Module, u32) {
    let mut m = Module::new();
    let ty = m.add_type(FuncType::parse_signature("i(i)").unwrap());
    let fib = m.functions.len() as u32;
    // Frame: ret 0, arg 1, locals 2..=4; callee window at slot 5.
    let f = m.add_function(
        Function::new("fib", ty).ret_slots(1).arg_slots(1).local_bytes(24).code(vec![
            Op::Const32 { slot: 3, value: 2 },
            Op::IntCompare {
                width: Width::W32,
                op: IntCmpOp::LtS,
                lhs: Src::Slot(1),
                rhs: Src::Slot(3),
                dst: Dst::Reg,
            },
            Op::If { cond: Src::Reg, else_target: 5 },
            Op::CopySlot { width: Width::W32, dst: 0, src: 1 },
            Op::Return,
            Op::Const32 { slot: 3, value: 1 },
            Op::IntBinary {
                width: Width::W32,
                op: IntBinOp::Sub,
                lhs: Src::Slot(1),
                rhs: Src::Slot(3),
                dst: Dst::Slot(6),
            },
            Op::Call { func: fib, stack_offset: 5 },
            Op::CopySlot { width: Width::W32, dst: 2, src: 5 },
            Op::Const32 { slot: 3, value: 2 },
            Op::IntBinary {
                width: Width::W32,
                op: IntBinOp::Sub,
                lhs: Src::Slot(1),
                rhs: Src::Slot(3),
                dst: Dst::Slot(6),
            },
            Op::Call { func: fib, stack_offset: 5 },
            Op::IntBinary {
                width: Width::W32,
                op: IntBinOp::Add,
                lhs: Src::Slot(2),
                rhs: Src::Slot(5),
                dst: Dst::Slot(0),
            },
            Op::Return,
        ]),
    );
    m.export("fib", f);
    (m, f)
}

#[test]
fn recursive_fibonacci() {
    let (m, _) = fib_module();
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("fib", &[Val::I32(0)]), Ok(Some(Val::I32(0))));
    assert_eq!(inst.call("fib", &[Val::I32(1)]), Ok(Some(Val::I32(1))));
    assert_eq!(inst.call("fib", &[Val::I32(10)]), Ok(Some(Val::I32(55))));
}

fn memory_module(max_pages: Option<usize>) -> Module {
    let mut m = Module::new();
    m.set_memory(1, max_pages);
    let i_i = m.add_type(FuncType::parse_signature("i(i)").unwrap());
    let v_ii = m.add_type(FuncType::parse_signature("v(ii)").unwrap());
    let i_v = m.add_type(FuncType::parse_signature("i()").unwrap());

    let grow = m.add_function(Function::new("grow", i_i).ret_slots(1).arg_slots(1).code(vec![
        Op::MemGrow { delta: Src::Slot(1) },
        Op::SetSlot { class: RegClass::Int, width: Width::W32, slot: 0 },
        Op::Return,
    ]));
    m.export("grow", grow);

    let poke = m.add_function(Function::new("poke", v_ii).arg_slots(2).code(vec![
        Op::Store {
            kind: StoreKind::I32W8,
            addr: Src::Slot(0),
            value: Src::Slot(1),
            offset: 0,
        },
        Op::Return,
    ]));
    m.export("poke", poke);

    let peek = m.add_function(Function::new("peek", i_i).ret_slots(1).arg_slots(1).code(vec![
        Op::Load { kind: LoadKind::I32U8, addr: Src::Slot(1), offset: 0, dst: Dst::Slot(0) },
        Op::Return,
    ]));
    m.export("peek", peek);

    let size = m.add_function(Function::new("size", i_v).ret_slots(1).code(vec![
        Op::MemSize,
        Op::SetSlot { class: RegClass::Int, width: Width::W32, slot: 0 },
        Op::Return,
    ]));
    m.export("size", size);
    m
}

#[test]
fn growth_under_memory_pressure() {
    let mut inst = instantiate(&memory_module(None));

    // grow returns the previous page count.
    assert_eq!(inst.call("grow", &[Val::I32(1)]), Ok(Some(Val::I32(1))));
    assert_eq!(inst.call("size", &[]), Ok(Some(Val::I32(2))));

    // A write at 70000 lands in segment 17 (4096-byte segments); nothing
    // else gets backed.
    assert_eq!(inst.call("poke", &[Val::I32(70_000), Val::I32(0x5A)]), Ok(None));
    assert_eq!(inst.call("peek", &[Val::I32(70_000)]), Ok(Some(Val::I32(0x5A))));
    assert!(inst.memory().table().segment(17).is_allocated());
    for i in 0..17 {
        assert!(!inst.memory().table().segment(i).is_allocated(), "segment {i}");
    }

    // Out of bounds past the grown size still traps.
    assert!(matches!(
        inst.call("peek", &[Val::I32(2 * 65_536 + 1)]),
        Err(Trap::OutOfBounds { .. })
    ));
}

#[test]
fn failed_growth_is_minus_one() {
    let mut inst = instantiate(&memory_module(Some(2)));
    assert_eq!(inst.call("grow", &[Val::I32(5)]), Ok(Some(Val::I32(-1))));
    // The failed grow changed nothing.
    assert_eq!(inst.call("size", &[]), Ok(Some(Val::I32(1))));
    assert_eq!(inst.call("grow", &[Val::I32(0)]), Ok(Some(Val::I32(1))));
}

fn indirect_module() -> Module {
    let mut m = Module::new();
    let i_i = m.add_type(FuncType::parse_signature("i(i)").unwrap());
    let i_v = m.add_type(FuncType::parse_signature("i()").unwrap());
    let i_ii = m.add_type(FuncType::parse_signature("i(ii)").unwrap());

    let double = m.add_function(Function::new("double", i_i).ret_slots(1).arg_slots(1).code(vec![
        Op::IntBinary {
            width: Width::W32,
            op: IntBinOp::Add,
            lhs: Src::Slot(1),
            rhs: Src::Slot(1),
            dst: Dst::Slot(0),
        },
        Op::Return,
    ]));
    m.set_table(vec![Some(double), None]);

    // call_via(idx, x): dispatch through the table expecting "i(i)".
    let call_via = m.add_function(
        Function::new("call_via", i_ii).ret_slots(1).arg_slots(2).code(vec![
            Op::CopySlot { width: Width::W32, dst: 4, src: 2 },
            Op::CallIndirect { table_index: Src::Slot(1), type_index: i_i, stack_offset: 3 },
            Op::CopySlot { width: Width::W32, dst: 0, src: 3 },
            Op::Return,
        ]),
    );
    m.export("call_via", call_via);

    // Same table entry invoked through a call-site expecting "i()".
    let call_wrong = m.add_function(
        Function::new("call_wrong", i_i).ret_slots(1).arg_slots(1).code(vec![
            Op::CallIndirect { table_index: Src::Slot(1), type_index: i_v, stack_offset: 2 },
            Op::CopySlot { width: Width::W32, dst: 0, src: 2 },
            Op::Return,
        ]),
    );
    m.export("call_wrong", call_wrong);
    m
}

#[test]
fn indirect_call_trap_priority() {
    let mut inst = instantiate(&indirect_module());
    let mut call = |f: &str, idx: i32, x: i32| inst.call(f, &[Val::I32(idx), Val::I32(x)]);

    assert_eq!(call("call_via", 0, 21), Ok(Some(Val::I32(42))));
    assert_eq!(call("call_via", 1, 21), Err(Trap::NullTableElement));
    assert_eq!(call("call_via", 5, 21), Err(Trap::TableIndexOutOfRange));

    let mut inst = instantiate(&indirect_module());
    assert_eq!(
        inst.call("call_wrong", &[Val::I32(0)]),
        Err(Trap::IndirectCallTypeMismatch)
    );
}

fn import_module(signature: &str) -> Module {
    let mut m = Module::new();
    let i_i = m.add_type(FuncType::parse_signature("i(i)").unwrap());
    let add1 = m.add_import(Import {
        name: "host.add1".into(),
        signature: signature.into(),
        num_ret_slots: 1,
        num_arg_slots: 1,
    });
    let f = m.add_function(Function::new("bump", i_i).ret_slots(1).arg_slots(1).code(vec![
        Op::CopySlot { width: Width::W32, dst: 3, src: 1 },
        Op::CallImport { import: add1, stack_offset: 2 },
        Op::CopySlot { width: Width::W32, dst: 0, src: 2 },
        Op::Return,
    ]));
    m.export("bump", f);
    m
}

#[test]
fn native_imports_link_and_run() {
    let mut rt = rt();
    rt.register_native("host.add1", "i(i)", |args| {
        Ok(Some(Val::I32(args[0].as_i32().unwrap() + 1)))
    })
    .unwrap();
    let mut inst = rt.instantiate(&import_module("i(i)")).unwrap();
    assert_eq!(inst.call("bump", &[Val::I32(41)]), Ok(Some(Val::I32(42))));
}

#[test]
fn import_mismatch_is_a_link_error() {
    let mut rt = rt();
    rt.register_native("host.add1", "i(i)", |args| {
        Ok(Some(Val::I32(args[0].as_i32().unwrap() + 1)))
    })
    .unwrap();

    // Declared "I(i)", registered "i(i)": fails at instantiate, not at
    // call.
    match rt.instantiate(&import_module("I(i)")) {
        Err(Trap::ImportSignatureMismatch { name, declared, registered }) => {
            assert_eq!(name, "host.add1");
            assert_eq!(declared, "I(i)");
            assert_eq!(registered, "i(i)");
        }
        other => panic!("expected a signature mismatch, got {:?}", other.err()),
    }

    let bare = Runtime::new(Config::default()).unwrap();
    assert!(matches!(
        bare.instantiate(&import_module("i(i)")),
        Err(Trap::UnlinkedImport(_))
    ));
}

#[test]
fn lazy_compilation_on_first_call() {
    let mut m = Module::new();
    let i_v = m.add_type(FuncType::parse_signature("i()").unwrap());
    let f = m.add_function(Function::new("answer", i_v).ret_slots(1));
    m.export("answer", f);

    let mut rt = rt();
    rt.on_compile(|_f| {
        Ok(Arc::from(vec![Op::Const32 { slot: 0, value: 42 }, Op::Return]))
    });
    let mut inst = rt.instantiate(&m).unwrap();
    assert_eq!(inst.call("answer", &[]), Ok(Some(Val::I32(42))));
    assert_eq!(inst.call("answer", &[]), Ok(Some(Val::I32(42))));

    // Without a compile hook an uncompiled function traps.
    let mut inst = instantiate(&m);
    assert!(matches!(inst.call("answer", &[]), Err(Trap::NotCompiled(_))));
}

#[test]
fn yield_trap_aborts_the_call_chain() {
    let mut m = Module::new();
    let i_i = m.add_type(FuncType::parse_signature("i(i)").unwrap());
    let double = m.add_function(Function::new("double", i_i).ret_slots(1).arg_slots(1).code(vec![
        Op::IntBinary {
            width: Width::W32,
            op: IntBinOp::Add,
            lhs: Src::Slot(1),
            rhs: Src::Slot(1),
            dst: Dst::Slot(0),
        },
        Op::Return,
    ]));
    let quad = m.add_function(Function::new("quad", i_i).ret_slots(1).arg_slots(1).code(vec![
        Op::CopySlot { width: Width::W32, dst: 3, src: 1 },
        Op::Call { func: double, stack_offset: 2 },
        Op::CopySlot { width: Width::W32, dst: 3, src: 2 },
        Op::Call { func: double, stack_offset: 2 },
        Op::CopySlot { width: Width::W32, dst: 0, src: 2 },
        Op::Return,
    ]));
    m.export("quad", quad);

    let mut rt = rt();
    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    rt.on_yield(move || {
        let n = seen.get() + 1;
        seen.set(n);
        if n > 1 {
            Err(Trap::Host("preempted".into()))
        } else {
            Ok(())
        }
    });
    let mut inst = rt.instantiate(&m).unwrap();

    assert_eq!(
        inst.call("quad", &[Val::I32(3)]),
        Err(Trap::Host("preempted".into()))
    );
    // Outer frame, aborted mid-body, is on the backtrace.
    assert!(inst.backtrace().iter().any(|(_, name)| name == "quad"));
    assert_eq!(calls.get(), 2);
}

#[test]
fn deep_recursion_overflows_the_slot_budget() {
    let mut m = Module::new();
    let v_v = m.add_type(FuncType::parse_signature("v()").unwrap());
    m.add_function(Function::new("rec", v_v).local_bytes(32).code(vec![
        Op::Call { func: 0, stack_offset: 4 },
        Op::Return,
    ]));
    m.export("rec", 0);

    let cfg = Config { stack_slots: 16, ..Config::default() };
    let mut inst = Runtime::new(cfg).unwrap().instantiate(&m).unwrap();
    assert_eq!(inst.call("rec", &[]), Err(Trap::StackOverflow));

    // With the classic check bypassed, segment pre-allocation against the
    // arena's fixed logical size reports the same overflow.
    let cfg = Config { stack_slots: 16, skip_stack_check: true, ..Config::default() };
    let mut inst = Runtime::new(cfg).unwrap().instantiate(&m).unwrap();
    assert_eq!(inst.call("rec", &[]), Err(Trap::StackOverflow));
}

#[test]
fn frame_entry_zeroes_locals_across_segments() {
    let mut m = Module::new();
    let v_v = m.add_type(FuncType::parse_signature("v()").unwrap());
    let i_v = m.add_type(FuncType::parse_signature("i()").unwrap());
    let dirty = m.add_function(Function::new("dirty", v_v).code(vec![
        Op::Const64 { slot: 8, value: 0xDEAD_BEEF_DEAD_BEEF },
        Op::Return,
    ]));
    m.export("dirty", dirty);
    // 64 bytes of locals: slots 1..=8, crossing the 64-byte arena segment
    // boundary at slot 8.
    let clean = m.add_function(Function::new("clean", i_v).ret_slots(1).local_bytes(64).code(vec![
        Op::CopySlot { width: Width::W32, dst: 0, src: 8 },
        Op::Return,
    ]));
    m.export("clean", clean);

    let cfg = Config { segment_size: 64, stack_slots: 64, ..Config::default() };
    let mut inst = Runtime::new(cfg).unwrap().instantiate(&m).unwrap();
    inst.call("dirty", &[]).unwrap();
    assert_eq!(inst.call("clean", &[]), Ok(Some(Val::I32(0))));
}

#[test]
fn trunc_families_differ_on_nan() {
    let trunc = |saturating| {
        let mut m = Module::new();
        let ty = m.add_type(FuncType::parse_signature("i(F)").unwrap());
        let f = m.add_function(Function::new("to_i32", ty).ret_slots(1).arg_slots(1).code(vec![
            Op::Trunc {
                from: Width::W64,
                to: Width::W32,
                signed: true,
                saturating,
                src: Src::Slot(1),
                dst: Dst::Slot(0),
            },
            Op::Return,
        ]));
        m.export("to_i32", f);
        m
    };

    let mut sat = instantiate(&trunc(true));
    assert_eq!(sat.call("to_i32", &[Val::F64(f64::NAN)]), Ok(Some(Val::I32(0))));
    assert_eq!(sat.call("to_i32", &[Val::F64(3.0e10)]), Ok(Some(Val::I32(i32::MAX))));
    assert_eq!(sat.call("to_i32", &[Val::F64(-3.7)]), Ok(Some(Val::I32(-3))));

    let mut strict = instantiate(&trunc(false));
    assert_eq!(strict.call("to_i32", &[Val::F64(f64::NAN)]), Err(Trap::InvalidConversion));
    assert_eq!(strict.call("to_i32", &[Val::F64(3.0e10)]), Err(Trap::InvalidConversion));
    assert_eq!(strict.call("to_i32", &[Val::F64(-3.7)]), Ok(Some(Val::I32(-3))));
}

#[test]
fn select_picks_by_condition() {
    let m = unary_i32(
        "pick",
        vec![
            Op::Const32 { slot: 2, value: 111 },
            Op::Const32 { slot: 3, value: 222 },
            Op::Select {
                class: RegClass::Int,
                width: Width::W32,
                cond: Src::Slot(1),
                if_true: Src::Slot(2),
                if_false: Src::Slot(3),
                dst: Dst::Slot(0),
            },
            Op::Return,
        ],
    );
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("pick", &[Val::I32(1)]), Ok(Some(Val::I32(111))));
    assert_eq!(inst.call("pick", &[Val::I32(0)]), Ok(Some(Val::I32(222))));
}

#[test]
fn globals_persist_across_calls() {
    let mut m = Module::new();
    m.add_global(ValType::I32, Val::I32(7));
    let i_v = m.add_type(FuncType::parse_signature("i()").unwrap());
    let f = m.add_function(Function::new("bump", i_v).ret_slots(1).local_bytes(16).code(vec![
        Op::GetGlobal { index: 0, slot: 1 },
        Op::Const32 { slot: 2, value: 1 },
        Op::IntBinary {
            width: Width::W32,
            op: IntBinOp::Add,
            lhs: Src::Slot(1),
            rhs: Src::Slot(2),
            dst: Dst::Slot(0),
        },
        Op::SetGlobal { index: 0, class: RegClass::Int, width: Width::W32, src: Src::Slot(0) },
        Op::Return,
    ]));
    m.export("bump", f);

    let mut inst = instantiate(&m);
    assert_eq!(inst.call("bump", &[]), Ok(Some(Val::I32(8))));
    assert_eq!(inst.call("bump", &[]), Ok(Some(Val::I32(9))));
}

#[test]
fn unreachable_traps_and_records_a_backtrace() {
    let mut m = Module::new();
    let v_v = m.add_type(FuncType::parse_signature("v()").unwrap());
    let f = m.add_function(Function::new("boom", v_v).code(vec![Op::Unreachable]));
    m.export("boom", f);
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("boom", &[]), Err(Trap::Unreachable));
    assert_eq!(inst.backtrace().len(), 1);
    assert_eq!(inst.backtrace()[0].1, "boom");
}

// ── Paging ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct PagerState {
    pages: HashMap<u32, Vec<u8>>,
    outs: u32,
    ins: u32,
}

/// In-memory pager reporting constant memory pressure.
struct TestPager {
    state: Rc<RefCell<PagerState>>,
    available: usize,
}

impl Pager for TestPager {
    fn available_memory(&self) -> usize {
        self.available
    }

    fn page_out(&mut self, segment_id: u32, data: &[u8]) -> io::Result<()> {
        let mut s = self.state.borrow_mut();
        s.pages.insert(segment_id, data.to_vec());
        s.outs += 1;
        Ok(())
    }

    fn page_in(&mut self, segment_id: u32, buf: &mut [u8]) -> io::Result<()> {
        let mut s = self.state.borrow_mut();
        match s.pages.get(&segment_id) {
            Some(data) => {
                buf.copy_from_slice(data);
                s.ins += 1;
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such page")),
        }
    }

    fn discard(&mut self, segment_id: u32) {
        self.state.borrow_mut().pages.remove(&segment_id);
    }
}

#[test]
fn eviction_then_refault_roundtrips() {
    // Two 4096-byte segments; available memory pinned below the
    // quarter-capacity low-water mark so every access applies pressure.
    let mut mem = SegmentedMemory::with_byte_size(4096, 8192).unwrap();
    let state = Rc::new(RefCell::new(PagerState::default()));
    mem.set_pager(Box::new(TestPager { state: state.clone(), available: 0 }), 16_384);

    // Touch the cold segment once, then heat up segment 0 until the
    // running average rises above the cold segment's frequency.
    let pattern: Vec<u8> = (0u8..=255).cycle().take(100).collect();
    mem.write(4096 + 10, &pattern).unwrap();
    mem.write_u8(0, 1).unwrap();
    mem.write_u8(1, 2).unwrap();
    mem.write_u8(2, 3).unwrap();

    assert_eq!(state.borrow().outs, 1, "exactly one page-out");
    assert!(mem.table().segment(1).is_paged);
    assert!(!mem.table().segment(1).is_allocated());
    assert_eq!(mem.table().page_writes, 1);

    // Re-faulting restores the content byte-for-byte.
    let mut back = vec![0u8; pattern.len()];
    mem.read(4096 + 10, &mut back).unwrap();
    assert_eq!(back, pattern);
    assert_eq!(state.borrow().ins, 1, "exactly one page-in");
    assert!(!mem.table().segment(1).is_paged);
}

#[test]
fn lost_page_is_a_hard_trap() {
    let mut mem = SegmentedMemory::with_byte_size(4096, 8192).unwrap();
    let state = Rc::new(RefCell::new(PagerState::default()));
    mem.set_pager(Box::new(TestPager { state: state.clone(), available: 0 }), 16_384);

    mem.write_u8(4096, 9).unwrap();
    mem.write_u8(0, 1).unwrap();
    mem.write_u8(1, 2).unwrap();
    mem.write_u8(2, 3).unwrap();
    assert!(mem.table().segment(1).is_paged);

    // Drop the persisted image behind the table's back; the next access
    // must fail hard, not hand out zeros.
    state.borrow_mut().pages.clear();
    assert_eq!(mem.read_u8(4096), Err(Trap::PageInFailed(1)));
}
