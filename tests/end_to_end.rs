//! Integration tests for the six concrete scenarios in spec.md §8, each
//! built as a hand-assembled minimal `.wasm` image (no filesystem fixtures,
//! no WAT assembler dependency) and run under both dispatch modes to check
//! the "dispatch equivalence" invariant at the same time.

mod common;

use common::*;
use rwasm::vm::DispatchMode;
use rwasm::{Cell, Host, VmConfig};

/// Loads `bytes`, runs `_start` under both the switched and threaded
/// dispatchers with the same `args`, asserts they agree (dispatch
/// equivalence), disposes the module, and asserts the allocator balanced —
/// folding four of the spec's testable properties into every scenario.
fn eval_under_both_dispatchers(bytes: &[u8], args: &[Cell]) -> Vec<Cell> {
    let host = Host::default();
    let module = rwasm::load_module(bytes, &host).expect("module should decode");
    rwasm::virtual_machine_init(&module);

    let switched_config = VmConfig { dispatch: DispatchMode::Switched, ..VmConfig::default() };
    let threaded_config = VmConfig { dispatch: DispatchMode::Threaded, ..VmConfig::default() };

    let switched = rwasm::eval_module(&module, &host, switched_config, args).expect("switched dispatch should not trap");
    let threaded = rwasm::eval_module(&module, &host, threaded_config, args).expect("threaded dispatch should not trap");
    assert_eq!(switched, threaded, "switched and threaded dispatch produced different results");

    rwasm::module_dispose(module, &host);
    host.alloc.assert_balanced();
    switched
}

#[test]
fn constant_return() {
    let mut m = ModuleBuilder::new();
    let ty = m.add_type(&[], &[I32]);
    let f = m.add_function(ty, &[], &i32_const(42));
    m.export_func("_start", f);

    let results = eval_under_both_dispatchers(&m.build(), &[]);
    assert_eq!(results, vec![Cell::from_i32(42)]);
}

#[test]
fn recursive_factorial() {
    let mut m = ModuleBuilder::new();
    let ty = m.add_type(&[I32], &[I32]);
    // n <= 1 ? 1 : n * _start(n - 1), with `_start` calling itself (index 0).
    let body: Vec<u8> = [
        local_get(0),
        i32_const(1),
        vec![I32_LE_S],
        IF_I32.to_vec(),
        i32_const(1),
        vec![ELSE],
        local_get(0),
        local_get(0),
        i32_const(1),
        vec![I32_SUB],
        call(0),
        vec![I32_MUL],
        vec![END],
    ]
    .concat();
    let f = m.add_function(ty, &[], &body);
    m.export_func("_start", f);

    let results = eval_under_both_dispatchers(&m.build(), &[Cell::from_i32(10)]);
    assert_eq!(results, vec![Cell::from_i32(3_628_800)]);
}

#[test]
fn reinterpret_f32_bits_as_i32() {
    let mut m = ModuleBuilder::new();
    let ty = m.add_type(&[F32], &[I32]);
    let body: Vec<u8> = [local_get(0), vec![I32_REINTERPRET_F32]].concat();
    let f = m.add_function(ty, &[], &body);
    m.export_func("_start", f);

    let results = eval_under_both_dispatchers(&m.build(), &[Cell::from_f32(1.0)]);
    assert_eq!(results, vec![Cell::from_i32(0x3F800000u32 as i32)]);
}

#[test]
fn memory_store_load_round_trip() {
    let mut m = ModuleBuilder::new();
    m.set_memory(1, None);
    let ty = m.add_type(&[], &[I32]);
    let body: Vec<u8> = [
        i32_const(0),
        i32_const(0xDEADBEEFu32 as i32),
        mem_op(I32_STORE, 2, 0),
        i32_const(0),
        mem_op(I32_LOAD, 2, 0),
    ]
    .concat();
    let f = m.add_function(ty, &[], &body);
    m.export_func("_start", f);

    let results = eval_under_both_dispatchers(&m.build(), &[]);
    assert_eq!(results[0].as_u32(), 0xDEADBEEF);
}

#[test]
fn memory_grow_beyond_capacity_returns_sentinel_and_leaves_size_unchanged() {
    let mut m = ModuleBuilder::new();
    m.set_memory(1, Some(1));
    let ty = m.add_type(&[], &[I32, I32]);
    let body: Vec<u8> = [i32_const(1), memory_grow(), memory_size()].concat();
    let f = m.add_function(ty, &[], &body);
    m.export_func("_start", f);

    let results = eval_under_both_dispatchers(&m.build(), &[]);
    assert_eq!(results[0].as_u32(), u32::MAX, "a failed grow must return the sentinel, not a size");
    assert_eq!(results[1].as_i32(), 1, "size must be unchanged after a failed grow");
}

#[test]
fn memory_grow_by_zero_succeeds_as_a_no_op() {
    let mut m = ModuleBuilder::new();
    m.set_memory(1, Some(1));
    let ty = m.add_type(&[], &[I32]);
    let body: Vec<u8> = [i32_const(0), memory_grow()].concat();
    let f = m.add_function(ty, &[], &body);
    m.export_func("_start", f);

    let results = eval_under_both_dispatchers(&m.build(), &[]);
    assert_eq!(results[0].as_i32(), 1, "grow(0) returns the current page count, not a failure");
}

#[test]
fn signed_vs_unsigned_compare() {
    let mut m = ModuleBuilder::new();
    let ty = m.add_type(&[], &[I32, I32]);
    let body: Vec<u8> = [
        i32_const(-1),
        i32_const(1),
        vec![I32_LT_S],
        i32_const(-1),
        i32_const(1),
        vec![I32_LT_U],
    ]
    .concat();
    let f = m.add_function(ty, &[], &body);
    m.export_func("_start", f);

    let results = eval_under_both_dispatchers(&m.build(), &[]);
    assert_eq!(results[0].as_i32(), 1, "-1 <_s 1 is true");
    assert_eq!(results[1].as_i32(), 0, "-1 <_u 1 is false: -1 reinterpreted unsigned is huge");
}

#[test]
fn call_indirect_dispatches_through_the_table() {
    let mut m = ModuleBuilder::new();
    let ty_add = m.add_type(&[I32, I32], &[I32]);
    let ty_start = m.add_type(&[], &[I32]);
    let adder = m.add_function(ty_add, &[], &[local_get(0), local_get(1), vec![I32_ADD]].concat());
    let body: Vec<u8> = [i32_const(3), i32_const(4), i32_const(0), call_indirect(ty_add)].concat();
    let start = m.add_function(ty_start, &[], &body);
    m.export_func("_start", start);
    m.set_table(1, None);
    m.add_element(0, &[adder]);

    let results = eval_under_both_dispatchers(&m.build(), &[]);
    assert_eq!(results, vec![Cell::from_i32(7)]);
}

#[test]
fn call_indirect_re_resolves_when_the_same_call_site_sees_a_different_index() {
    // `dispatch` contains exactly one `call_indirect` instruction. `_start`
    // calls it twice with a different table index each time; a resolution
    // cached by call site alone (ignoring the runtime index) would make the
    // second call silently return the first call's function.
    let mut m = ModuleBuilder::new();
    let ty_binop = m.add_type(&[I32, I32], &[I32]);
    let ty_dispatch = m.add_type(&[I32], &[I32]);
    let ty_start = m.add_type(&[], &[I32, I32]);

    let adder = m.add_function(ty_binop, &[], &[local_get(0), local_get(1), vec![I32_ADD]].concat());
    let subber = m.add_function(ty_binop, &[], &[local_get(0), local_get(1), vec![I32_SUB]].concat());
    let dispatch_body: Vec<u8> = [i32_const(3), i32_const(4), local_get(0), call_indirect(ty_binop)].concat();
    let dispatch = m.add_function(ty_dispatch, &[], &dispatch_body);

    let start_body: Vec<u8> = [i32_const(0), call(dispatch), i32_const(1), call(dispatch)].concat();
    let start = m.add_function(ty_start, &[], &start_body);
    m.export_func("_start", start);
    m.set_table(2, None);
    m.add_element(0, &[adder, subber]);

    let results = eval_under_both_dispatchers(&m.build(), &[]);
    assert_eq!(results, vec![Cell::from_i32(7), Cell::from_i32(-1)], "second call must re-resolve against index 1, not reuse index 0's cached target");
}

#[test]
fn if_else_does_not_leak_the_untaken_branchs_register_onto_the_operand_stack() {
    // Regression test: a prior translator revision left the then-branch's
    // merge register live on the compile-time operand stack while the
    // else-branch was translated, so a second value computed after the
    // if/else would be read from the wrong register. `_start` returns two
    // values: the if/else result, and a value computed afterward — if the
    // leak is present the second result silently reads the stale register.
    let mut m = ModuleBuilder::new();
    let ty = m.add_type(&[I32], &[I32, I32]);
    let body: Vec<u8> = [
        local_get(0),
        IF_I32.to_vec(),
        i32_const(100),
        vec![ELSE],
        i32_const(200),
        vec![END],
        i32_const(7),
    ]
    .concat();
    let f = m.add_function(ty, &[], &body);
    m.export_func("_start", f);

    let taken = eval_under_both_dispatchers(&m.build(), &[Cell::from_i32(1)]);
    assert_eq!(taken, vec![Cell::from_i32(100), Cell::from_i32(7)]);

    let not_taken = eval_under_both_dispatchers(&m.build(), &[Cell::from_i32(0)]);
    assert_eq!(not_taken, vec![Cell::from_i32(200), Cell::from_i32(7)]);
}

#[test]
fn missing_start_export_is_reported_not_panicked() {
    let mut m = ModuleBuilder::new();
    let ty = m.add_type(&[], &[I32]);
    m.add_function(ty, &[], &i32_const(1));
    // No export at all.

    let host = Host::default();
    let module = rwasm::load_module(&m.build(), &host).unwrap();
    let err = rwasm::eval_module(&module, &host, VmConfig::default(), &[]).unwrap_err();
    assert!(matches!(err, rwasm::ExecutionError::MissingEntrypoint));
    rwasm::module_dispose(module, &host);
}

#[test]
fn call_indirect_through_out_of_range_element_index_traps_instead_of_panicking() {
    // The element section stores raw function indices with no validation
    // against the function index space; a table slot populated with an
    // out-of-range index must trap, not panic the process.
    let mut m = ModuleBuilder::new();
    let ty_add = m.add_type(&[I32, I32], &[I32]);
    let ty_start = m.add_type(&[], &[I32]);
    let body: Vec<u8> = [i32_const(3), i32_const(4), i32_const(0), call_indirect(ty_add)].concat();
    let start = m.add_function(ty_start, &[], &body);
    m.export_func("_start", start);
    m.set_table(1, None);
    // No function at index 99 — the module declares only `_start` (index 0).
    m.add_element(0, &[99]);

    let host = Host::default();
    let module = rwasm::load_module(&m.build(), &host).unwrap();
    let err = rwasm::eval_module(&module, &host, VmConfig::default(), &[]).unwrap_err();
    assert!(matches!(err, rwasm::ExecutionError::FunctionIndexOutOfBounds { index: 99, .. }));
    rwasm::module_dispose(module, &host);
}

#[test]
fn division_by_zero_traps() {
    let mut m = ModuleBuilder::new();
    let ty = m.add_type(&[], &[I32]);
    let body: Vec<u8> = [i32_const(1), i32_const(0), vec![0x6D /* i32.div_s */]].concat();
    let f = m.add_function(ty, &[], &body);
    m.export_func("_start", f);

    let host = Host::default();
    let module = rwasm::load_module(&m.build(), &host).unwrap();
    let err = rwasm::eval_module(&module, &host, VmConfig::default(), &[]).unwrap_err();
    assert!(matches!(err, rwasm::ExecutionError::DivideByZero));
    rwasm::module_dispose(module, &host);
}
