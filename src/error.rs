//! The single error type shared by the lexer, parser, instantiation,
//! interpreter, and memory store.
//!
//! Every recognized lex, parse, instantiation, execution, and memory-store
//! fault has a variant here. Everything is fatal to the `run` call it
//! occurred in; nothing is retried.

use crate::ast::ValueType;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    // --- Lex/Parse ---
    #[error("unexpected token: {found:?}, expected {expected}")]
    UnexpectedToken { found: String, expected: String },

    #[error("expected `module` at top level")]
    ExpectedModule,

    #[error("expected `func` form")]
    ExpectedFunc,

    #[error("expected a string value")]
    ExpectedStringValue,

    #[error("flat (non-folded) instructions are not supported, found: {0}")]
    FlatInstructionNotSupported(String),

    #[error("invalid immediate for opcode `{opcode}`: {text}")]
    InvalidImmediate { opcode: String, text: String },

    #[error("unsupported mnemonic (memory load/store): {0}")]
    UnsupportedMnemonic(String),

    #[error("table is not funcref")]
    NonFuncrefTable,

    // --- Instantiation ---
    #[error(
        "import signature mismatch for {module}.{field}: declared ({declared_params:?}) -> \
         {declared_results:?}, registered ({registered_params:?}) -> {registered_results:?}"
    )]
    ImportSignatureMismatch {
        module: String,
        field: String,
        declared_params: Vec<ValueType>,
        declared_results: Vec<ValueType>,
        registered_params: Vec<ValueType>,
        registered_results: Vec<ValueType>,
    },

    #[error("unknown import kind for {module}.{field}")]
    UnknownImportKind { module: String, field: String },

    // --- Execution: lookup ---
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("unknown local: {0}")]
    UnknownLocal(String),

    #[error("unknown label: {0}")]
    UnknownLabel(String),

    #[error("unknown type: {0}")]
    UnknownType(String),

    #[error("unknown string constant: {0}")]
    UnknownString(String),

    // --- Execution: stack/types ---
    #[error("value stack underflow")]
    StackUnderflow,

    #[error("argument count mismatch: expected {expected}, got {got}")]
    ArgumentMismatch { expected: usize, got: usize },

    // --- Execution: indirect call ---
    #[error("undefined element at table index {0}")]
    UndefinedElement(u32),

    #[error("uninitialized element at table index {0}")]
    UninitializedElement(u32),

    #[error("indirect call signature mismatch against type `{type_name}`")]
    IndirectCallSignatureMismatch { type_name: String },

    // --- Memory store ---
    #[error("invalid handle: {0}")]
    InvalidHandle(i32),

    #[error("out of bounds access: handle {handle}, offset {offset}, size {size}")]
    OutOfBounds {
        handle: i32,
        offset: i32,
        size: usize,
    },

    #[error("invalid allocation size: {0}")]
    InvalidSize(i32),

    #[error("write to read-only block: handle {0}")]
    WriteToReadOnly(i32),

    // --- Resource bounds (supplemental, see SPEC_FULL.md §3.3) ---
    #[error("value stack overflow (limit {0})")]
    StackOverflow(usize),

    #[error("call stack overflow (limit {0})")]
    CallStackOverflow(usize),

    // --- Opcodes the core recognizes but does not execute (Open Questions) ---
    #[error("opcode not supported by this core: {0}")]
    Unsupported(&'static str),

    // --- Invariant violations: should be unreachable, surfaced as a
    // fault rather than a panic so a broken invariant never takes down
    // an embedding host. ---
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
