//! In-memory representation of a parsed module: the flat, arena-style
//! AST the parser produces and the interpreter walks.
//!
//! Symbolic references (locals, labels, callees, types, string aliases)
//! are preserved as names rather than resolved to indices here — the
//! parser doesn't know about function tables or local scopes, only the
//! interpreter does at instantiation/execution time.

use std::fmt;

/// One of the four numeric type tags the core dialect supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
        };
        f.write_str(s)
    }
}

/// A runtime value: exactly one of i32/i64/f32/f64, or the void
/// "no-value" sentinel. Bit-copy semantics, no implicit coercion —
/// reading a tag other than the one stored reinterprets the raw bits
/// rather than numerically converting, matching the stack discipline
/// of a validated body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Void,
}

impl Value {
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::I32(_) => Some(ValueType::I32),
            Value::I64(_) => Some(ValueType::I64),
            Value::F32(_) => Some(ValueType::F32),
            Value::F64(_) => Some(ValueType::F64),
            Value::Void => None,
        }
    }

    pub fn default_for(ty: ValueType) -> Value {
        match ty {
            ValueType::I32 => Value::I32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
        }
    }

    /// Raw i32 payload: reinterprets rather than converts when the
    /// stored tag isn't i32, per the no-coercion design note.
    pub fn as_i32(&self) -> i32 {
        match *self {
            Value::I32(v) => v,
            Value::I64(v) => v as i32,
            Value::F32(v) => v.to_bits() as i32,
            Value::F64(v) => v.to_bits() as i32,
            Value::Void => 0,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match *self {
            Value::I32(v) => v as i64,
            Value::I64(v) => v,
            Value::F32(v) => v.to_bits() as i64,
            Value::F64(v) => v.to_bits() as i64,
            Value::Void => 0,
        }
    }

    pub fn as_f32(&self) -> f32 {
        match *self {
            Value::F32(v) => v,
            Value::F64(v) => v as f32,
            Value::I32(v) => f32::from_bits(v as u32),
            Value::I64(v) => f32::from_bits(v as u32),
            Value::Void => 0.0,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::F64(v) => v,
            Value::F32(v) => v as f64,
            Value::I32(v) => f64::from_bits(v as u32 as u64),
            Value::I64(v) => f64::from_bits(v as u64),
            Value::Void => 0.0,
        }
    }
}

/// One arithmetic/comparison/constant/control opcode. Mnemonics follow
/// spec's dotted naming (`i32.add`, `local.get`, `br_if`, ...); the
/// Rust identifiers spell out the dotted form as `PascalCase` without
/// the dot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    I32Const,
    I64Const,
    F32Const,
    F64Const,

    I32Add,
    I32Sub,
    I32Mul,
    I32Eq,
    I32Ne,
    I32LtS,
    I32GtS,
    I32LeS,
    I32GeS,

    F64Add,
    F64Sub,
    F64Mul,
    F64Div,

    LocalGet,
    LocalSet,
    LocalTee,
    GlobalGet,
    GlobalSet,

    StringConst,

    Call,
    CallIndirect,

    Block,
    Loop,
    End,
    Br,
    BrIf,
    Return,
    If,
    Else,
    Unreachable,

    /// Unrecognized mnemonic, degraded per the parser's fallback rule.
    Nop,
}

/// At most one immediate operand per instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Immediate {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// A symbolic reference: local, label, callee, type, or string
    /// alias. Retains the name; resolved against the relevant table at
    /// execution time, never at parse time.
    Name(String),
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub immediate: Immediate,
}

impl Instruction {
    pub fn new(opcode: Opcode, immediate: Immediate) -> Self {
        Instruction { opcode, immediate }
    }

    pub fn bare(opcode: Opcode) -> Self {
        Instruction {
            opcode,
            immediate: Immediate::None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Function {
    pub name: String,
    pub param_types: Vec<ValueType>,
    pub param_names: Vec<Option<String>>,
    pub result_types: Vec<ValueType>,
    pub local_types: Vec<ValueType>,
    pub local_names: Vec<Option<String>>,
    pub body: Vec<Instruction>,
}

impl Function {
    /// Parameter/local count, used to size a fresh frame's locals.
    pub fn locals_len(&self) -> usize {
        self.param_types.len() + self.local_types.len()
    }
}

#[derive(Debug, Clone)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub alias: Option<String>,
    pub param_types: Vec<ValueType>,
    pub result_types: Vec<ValueType>,
}

#[derive(Debug, Clone)]
pub struct Type {
    pub name: Option<String>,
    pub param_types: Vec<ValueType>,
    pub result_types: Vec<ValueType>,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: Option<String>,
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone)]
pub struct ElementSegment {
    pub offset: i32,
    pub function_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StringDefinition {
    pub alias: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub imports: Vec<Import>,
    pub types: Vec<Type>,
    pub table: Option<Table>,
    pub elements: Vec<ElementSegment>,
    pub strings: Vec<StringDefinition>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    pub fn function_by_name(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}
