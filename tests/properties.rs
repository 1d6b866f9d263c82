//! Quantified invariants from the component design's testable
//! properties section: parser round-trip of arithmetic (property 1)
//! and memory-store read/write bijectivity (property 3), checked over
//! randomly generated inputs rather than hand enumeration.

use quickcheck_macros::quickcheck;
use watlite::{parse, MemoryStore, Value};

fn eval_binop(op: &str, a: i32, b: i32) -> i32 {
    let src = format!(
        "(module (func $f (result i32) ({} (i32.const {}) (i32.const {}))))",
        op, a, b
    );
    let module = std::rc::Rc::new(parse(&src).unwrap());
    let store = std::rc::Rc::new(MemoryStore::new());
    let interp = watlite::Interpreter::new(module, store).unwrap();
    match interp.run("f", &[]).unwrap() {
        Value::I32(v) => v,
        other => panic!("expected i32, got {:?}", other),
    }
}

#[quickcheck]
fn parser_roundtrip_add_wraps(a: i32, b: i32) -> bool {
    eval_binop("i32.add", a, b) == a.wrapping_add(b)
}

#[quickcheck]
fn parser_roundtrip_sub_wraps(a: i32, b: i32) -> bool {
    eval_binop("i32.sub", a, b) == a.wrapping_sub(b)
}

#[quickcheck]
fn parser_roundtrip_mul_wraps(a: i32, b: i32) -> bool {
    eval_binop("i32.mul", a, b) == a.wrapping_mul(b)
}

#[quickcheck]
fn memory_store_i32_bijective(size: u8, offset_frac: u8, value: i32) -> bool {
    let size = size as i32 + 4;
    let store = MemoryStore::new();
    let h = store.alloc(size).unwrap();
    let offset = (offset_frac as i32) % (size - 3).max(1);
    store.write_i32(h, offset, value).unwrap();
    store.read_i32(h, offset).unwrap() == value
}

#[quickcheck]
fn memory_store_f64_bijective(extra: u8, value: f64) -> bool {
    let size = extra as i32 + 8;
    let store = MemoryStore::new();
    let h = store.alloc(size).unwrap();
    let offset = size - 8;
    store.write_f64(h, offset, value).unwrap();
    let read_back = store.read_f64(h, offset).unwrap();
    read_back.to_bits() == value.to_bits() || (read_back.is_nan() && value.is_nan())
}

#[quickcheck]
fn span_reads_match_parent_at_offset(base: u8, span_offset: u8, value: i32) -> bool {
    let base_size = base as i32 + 8;
    let store = MemoryStore::new();
    let h = store.alloc(base_size).unwrap();
    let span_off = (span_offset as i32) % (base_size - 3).max(1);
    let span_size = base_size - span_off;
    let span = store.make_span(h, span_off, span_size).unwrap();
    store.write_i32(span, 0, value).unwrap();
    store.read_i32(h, span_off).unwrap() == value
}
