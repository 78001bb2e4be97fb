use std::io::Write;

use crate::ast::Program;

pub mod builtins;
pub mod code;
pub mod compiler;
pub mod frame;
pub mod heap;
pub mod machine;
pub mod value;

pub use code::{Code, CompiledProgram, Opcode, Operand};
pub use compiler::Compiler;
pub use heap::{GcStats, Heap, HeapObject, HeapRef};
pub use machine::{Machine, TraceFrame};
pub use value::{Builtin, Value};

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("undefined global: {name}")]
    UndefinedGlobal { name: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("modulo by zero")]
    ModuloByZero,
    #[error("type mismatch in {op}: expected {expected}, found {found}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("cannot index a value of kind {found}")]
    NotIndexable { found: &'static str },
    #[error("invalid index: {found}")]
    InvalidIndex { found: String },
    #[error("index {index} out of bounds for array of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("operand stack underflow in {op}")]
    StackUnderflow { op: &'static str },
    #[error("malformed {op} instruction at address {address}")]
    MalformedInstruction { address: usize, op: &'static str },
    #[error("instruction address {address} is out of range")]
    InvalidAddress { address: usize },
    #[error("dangling heap reference #{handle}")]
    DanglingReference { handle: usize },
    #[error("call depth limit of {limit} exceeded")]
    CallDepthExceeded { limit: usize },
    #[error("builtin {name} failed: {message}")]
    Builtin { name: &'static str, message: String },
    #[error("output error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("'break' outside of a loop")]
    BreakOutsideLoop,
    #[error("'continue' outside of a loop")]
    ContinueOutsideLoop,
    #[error("duplicate function: {name}")]
    DuplicateFunction { name: String },
    #[error("function '{name}' must be declared at the top level")]
    NestedFunction { name: String },
    #[error("'{statement}' statement is missing its {clause}")]
    MissingClause { statement: &'static str, clause: &'static str },
    #[error("malformed literal: {message}")]
    MalformedLiteral { message: String },
    #[error("duplicate key in map literal: {key}")]
    DuplicateKey { key: String },
}

impl CompileError {
    /// Stable diagnostic code.
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::BreakOutsideLoop => "QL-C001",
            CompileError::ContinueOutsideLoop => "QL-C002",
            CompileError::DuplicateFunction { .. } => "QL-C003",
            CompileError::NestedFunction { .. } => "QL-C004",
            CompileError::MissingClause { .. } => "QL-C005",
            CompileError::MalformedLiteral { .. } => "QL-C006",
            CompileError::DuplicateKey { .. } => "QL-C007",
        }
    }
}

impl VmError {
    /// Stable diagnostic code.
    pub fn code(&self) -> &'static str {
        match self {
            VmError::UndefinedGlobal { .. } => "QL-R001",
            VmError::DivisionByZero => "QL-R002",
            VmError::ModuloByZero => "QL-R003",
            VmError::TypeMismatch { .. } => "QL-R004",
            VmError::NotIndexable { .. } => "QL-R005",
            VmError::InvalidIndex { .. } => "QL-R006",
            VmError::IndexOutOfBounds { .. } => "QL-R007",
            VmError::StackUnderflow { .. } => "QL-R008",
            VmError::MalformedInstruction { .. } => "QL-R009",
            VmError::InvalidAddress { .. } => "QL-R010",
            VmError::DanglingReference { .. } => "QL-R011",
            VmError::CallDepthExceeded { .. } => "QL-R012",
            VmError::Builtin { .. } => "QL-R013",
            VmError::Io(_) => "QL-R014",
        }
    }
}

// ── Configuration ────────────────────────────────────────────────────

pub const DEFAULT_GC_THRESHOLD: usize = 1024;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 10_000;

/// When the machine runs a collection cycle. Cycles only ever run
/// between instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPolicy {
    /// Collect once this many objects were allocated since the last cycle
    Threshold(usize),
    /// Collect before every instruction
    EveryInstruction,
    /// Only through [`Machine::collect_garbage`]
    Manual,
}

impl Default for GcPolicy {
    fn default() -> Self {
        GcPolicy::Threshold(DEFAULT_GC_THRESHOLD)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    pub gc: GcPolicy,

    /// Maximum number of live frames, bootstrap frame included
    pub max_call_depth: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            gc: GcPolicy::default(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl MachineConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

// ── Entry points ─────────────────────────────────────────────────────

pub fn compile(program: &Program) -> Result<CompiledProgram, CompileError> {
    Compiler::new().compile_program(program)
}

/// Run a compiled program on a fresh machine, writing output to `out`.
pub fn run<W: Write>(program: &CompiledProgram, config: MachineConfig, out: W) -> VmResult<Value> {
    Machine::new(program, config, out).run()
}
