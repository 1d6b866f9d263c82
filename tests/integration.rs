//! End-to-end scenarios A-F from the component design's testable
//! properties section, each against a fresh module/interpreter/store.

use std::rc::Rc;

use rstest::rstest;
use watlite::{Error, Interpreter, MemoryStore, Value, ValueType};

fn build(src: &str) -> (Rc<MemoryStore>, Interpreter) {
    let module = Rc::new(watlite::parse(src).unwrap());
    let store = Rc::new(MemoryStore::new());
    let interp = Interpreter::new(module, store.clone()).unwrap();
    (store, interp)
}

#[test]
fn scenario_a_import_and_addition() {
    let (_store, interp) = build(
        "(module \
           (import \"env\" \"add\" (func $add (param i32 i32) (result i32))) \
           (func $main (result i32) (call $add (i32.const 10) (i32.const 32))))",
    );
    interp
        .register_host_function(
            "env",
            "add",
            |args: &[Value]| Ok(Value::I32(args[0].as_i32() + args[1].as_i32())),
            vec![ValueType::I32, ValueType::I32],
            vec![ValueType::I32],
        )
        .unwrap();
    assert_eq!(interp.run("main", &[]).unwrap(), Value::I32(42));
}

#[test]
fn scenario_b_array_via_memory_store() {
    let (store, interp) = build(
        "(module \
           (import \"env\" \"alloc\" (func $alloc (param i32) (result i32))) \
           (import \"env\" \"write_f64\" (func $write_f64 (param i32 i32 f64))) \
           (import \"env\" \"read_f64\" (func $read_f64 (param i32 i32) (result f64))) \
           (func $main (result f64) \
             (local $p i32) \
             (local.set $p (call $alloc (i32.const 16))) \
             (call $write_f64 (local.get $p) (i32.const 0) (f64.const 1.1)) \
             (call $write_f64 (local.get $p) (i32.const 8) (f64.const 2.2)) \
             (f64.add \
               (call $read_f64 (local.get $p) (i32.const 0)) \
               (call $read_f64 (local.get $p) (i32.const 8)))))",
    );

    let alloc_store = store.clone();
    interp
        .register_host_function(
            "env",
            "alloc",
            move |args: &[Value]| Ok(Value::I32(alloc_store.alloc(args[0].as_i32()).unwrap())),
            vec![ValueType::I32],
            vec![ValueType::I32],
        )
        .unwrap();

    let write_store = store.clone();
    interp
        .register_host_function(
            "env",
            "write_f64",
            move |args: &[Value]| {
                write_store
                    .write_f64(args[0].as_i32(), args[1].as_i32(), args[2].as_f64())
                    .unwrap();
                Ok(Value::Void)
            },
            vec![ValueType::I32, ValueType::I32, ValueType::F64],
            vec![],
        )
        .unwrap();

    let read_store = store.clone();
    interp
        .register_host_function(
            "env",
            "read_f64",
            move |args: &[Value]| {
                Ok(Value::F64(
                    read_store.read_f64(args[0].as_i32(), args[1].as_i32()).unwrap(),
                ))
            },
            vec![ValueType::I32, ValueType::I32],
            vec![ValueType::F64],
        )
        .unwrap();

    let result = interp.run("main", &[]).unwrap().as_f64();
    assert!((result - 3.3).abs() < 1e-9);
}

#[test]
fn scenario_c_span_aliasing_cross_module() {
    let store = MemoryStore::new();
    let h = store.alloc(12).unwrap();
    let span = store.make_span(h, 4, 8).unwrap();
    store.write_i32(span, 0, 11).unwrap();
    assert_eq!(store.read_i32(h, 4).unwrap(), 11);
    assert_eq!(store.read_i32(span, 0).unwrap(), 11);
}

#[test]
fn scenario_d_branch_to_loop_counts_to_five() {
    let (_store, interp) = build(
        "(module (func $f (result i32) (local $i i32) \
           (local.set $i (i32.const 0)) \
           (loop $L \
             (local.set $i (i32.add (local.get $i) (i32.const 1))) \
             (br_if $L (i32.lt_s (local.get $i) (i32.const 5)))) \
           (local.get $i)))",
    );
    assert_eq!(interp.run("f", &[]).unwrap(), Value::I32(5));
}

#[test]
fn scenario_e_indirect_call_success_and_faults() {
    let (_store, interp) = build(
        "(module \
           (type $bin (func (param i32 i32) (result i32))) \
           (table $t 2 funcref) \
           (elem (i32.const 0) $add $sub) \
           (func $add (param i32 i32) (result i32) (i32.add (local.get 0) (local.get 1))) \
           (func $sub (param i32 i32) (result i32) (i32.sub (local.get 0) (local.get 1))) \
           (func $f (param $i i32) (result i32) \
             (call_indirect (type $bin) (i32.const 7) (i32.const 3) (local.get $i))))",
    );

    assert_eq!(interp.run("f", &[Value::I32(1)]).unwrap(), Value::I32(4));

    assert!(matches!(
        interp.run("f", &[Value::I32(2)]),
        Err(Error::UndefinedElement(2))
    ));
}

#[test]
fn scenario_e_indirect_call_arity_mismatch() {
    let (_store, interp) = build(
        "(module \
           (type $bin (func (param i32 i32) (result i32))) \
           (type $un (func (param i32) (result i32))) \
           (table $t 1 funcref) \
           (elem (i32.const 0) $neg) \
           (func $neg (param i32) (result i32) (i32.sub (i32.const 0) (local.get 0))) \
           (func $f (result i32) \
             (call_indirect (type $bin) (i32.const 7) (i32.const 3) (i32.const 0))))",
    );
    assert!(matches!(
        interp.run("f", &[]),
        Err(Error::IndirectCallSignatureMismatch { .. })
    ));
}

#[test]
fn scenario_f_string_constant_read_only() {
    let (store, interp) = build(
        "(module (string $greeting \"hi\") (func $f (result i32) (string.const $greeting)))",
    );
    let handle = interp.run("f", &[]).unwrap().as_i32();
    assert_eq!(store.read_i32(handle, 0).unwrap(), 2);
    assert!(matches!(
        store.write_u8(handle, 4, 0),
        Err(Error::WriteToReadOnly(_))
    ));
}

#[rstest]
#[case("i32.add", 10, 32, 42)]
#[case("i32.sub", 10, 3, 7)]
#[case("i32.mul", 6, 7, 42)]
#[case("i32.lt_s", 3, 10, 1)]
#[case("i32.ge_s", 3, 10, 0)]
fn table_driven_arithmetic_and_compare(
    #[case] op: &str,
    #[case] a: i32,
    #[case] b: i32,
    #[case] expected: i32,
) {
    let src = format!(
        "(module (func $f (result i32) ({} (i32.const {}) (i32.const {}))))",
        op, a, b
    );
    let (_store, interp) = build(&src);
    assert_eq!(interp.run("f", &[]).unwrap(), Value::I32(expected));
}

#[test]
fn reentrant_host_call_preserves_outer_stack_sizes() {
    let module = Rc::new(
        watlite::parse(
            "(module \
               (import \"env\" \"bounce\" (func $bounce (result i32))) \
               (func $inner (result i32) (i32.const 9)) \
               (func $outer (result i32) (i32.add (call $bounce) (i32.const 1))))",
        )
        .unwrap(),
    );
    let store = Rc::new(MemoryStore::new());
    let interp = Rc::new(Interpreter::new(module, store).unwrap());
    let inner = interp.clone();
    interp
        .register_host_function(
            "env",
            "bounce",
            move |_| inner.run("inner", &[]),
            vec![],
            vec![ValueType::I32],
        )
        .unwrap();
    assert_eq!(interp.run("outer", &[]).unwrap(), Value::I32(10));
}

#[test]
fn cross_module_bridge_via_host_function() {
    let module_b = Rc::new(
        watlite::parse("(module (func $double (param i32) (result i32) (i32.mul (local.get 0) (i32.const 2))))")
            .unwrap(),
    );
    let store = Rc::new(MemoryStore::new());
    let interp_b = Rc::new(Interpreter::new(module_b, store.clone()).unwrap());

    let module_a = Rc::new(
        watlite::parse(
            "(module (import \"b\" \"double\" (func $double (param i32) (result i32))) \
             (func $main (result i32) (call $double (i32.const 21))))",
        )
        .unwrap(),
    );
    let interp_a = Interpreter::new(module_a, store).unwrap();
    let bridge = interp_b.clone();
    interp_a
        .register_host_function(
            "b",
            "double",
            move |args: &[Value]| bridge.run("double", args),
            vec![ValueType::I32],
            vec![ValueType::I32],
        )
        .unwrap();

    assert_eq!(interp_a.run("main", &[]).unwrap(), Value::I32(42));
}
