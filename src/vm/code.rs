use std::collections::HashMap;
use std::fmt;

use super::{VmError, VmResult};

// ── Opcodes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Exit,
    GetGlobal,
    SetGlobal,
    Call,
    Alloca,
    Print,
    PrintLine,
    Return,

    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Absolute,
    ReverseSign,

    LogicalOr,
    LogicalAnd,

    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    LessOrEqual,
    GreaterOrEqual,

    GetLocal,
    SetLocal,
    Jump,
    ConditionJump,

    PushNull,
    PushBoolean,
    PushNumber,
    PushString,
    PushArray,
    PushMap,

    GetElement,
    SetElement,
    PopOperand,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Exit => "Exit",
            Opcode::GetGlobal => "GetGlobal",
            Opcode::SetGlobal => "SetGlobal",
            Opcode::Call => "Call",
            Opcode::Alloca => "Alloca",
            Opcode::Print => "Print",
            Opcode::PrintLine => "PrintLine",
            Opcode::Return => "Return",
            Opcode::Add => "Add",
            Opcode::Subtract => "Subtract",
            Opcode::Multiply => "Multiply",
            Opcode::Divide => "Divide",
            Opcode::Modulo => "Modulo",
            Opcode::Absolute => "Absolute",
            Opcode::ReverseSign => "ReverseSign",
            Opcode::LogicalOr => "LogicalOr",
            Opcode::LogicalAnd => "LogicalAnd",
            Opcode::Equal => "Equal",
            Opcode::NotEqual => "NotEqual",
            Opcode::LessThan => "LessThan",
            Opcode::GreaterThan => "GreaterThan",
            Opcode::LessOrEqual => "LessOrEqual",
            Opcode::GreaterOrEqual => "GreaterOrEqual",
            Opcode::GetLocal => "GetLocal",
            Opcode::SetLocal => "SetLocal",
            Opcode::Jump => "Jump",
            Opcode::ConditionJump => "ConditionJump",
            Opcode::PushNull => "PushNull",
            Opcode::PushBoolean => "PushBoolean",
            Opcode::PushNumber => "PushNumber",
            Opcode::PushString => "PushString",
            Opcode::PushArray => "PushArray",
            Opcode::PushMap => "PushMap",
            Opcode::GetElement => "GetElement",
            Opcode::SetElement => "SetElement",
            Opcode::PopOperand => "PopOperand",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Immediate carried by an instruction. Which kind is valid depends on the opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    /// Argument count, slot, address or frame size
    Index(usize),
    Boolean(bool),
    Number(f64),
    /// Global name or string literal
    Text(String),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Index(i) => write!(f, "{}", i),
            Operand::Boolean(b) => write!(f, "{}", b),
            Operand::Number(n) => write!(f, "{}", n),
            Operand::Text(s) => write!(f, "{:?}", s),
        }
    }
}

// ── Code unit ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Code {
    pub op: Opcode,
    pub operand: Operand,
}

impl Code {
    pub fn new(op: Opcode, operand: Operand) -> Self {
        Code { op, operand }
    }

    pub fn bare(op: Opcode) -> Self {
        Code { op, operand: Operand::None }
    }

    /// The `Index` immediate, or `MalformedInstruction` if this unit carries anything else.
    pub fn index(&self, address: usize) -> VmResult<usize> {
        match self.operand {
            Operand::Index(i) => Ok(i),
            _ => Err(self.malformed(address)),
        }
    }

    pub fn text(&self, address: usize) -> VmResult<&str> {
        match &self.operand {
            Operand::Text(s) => Ok(s),
            _ => Err(self.malformed(address)),
        }
    }

    pub(crate) fn malformed(&self, address: usize) -> VmError {
        VmError::MalformedInstruction { address, op: self.op.name() }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operand == Operand::None {
            write!(f, "{}", self.op)
        } else {
            write!(f, "{:<15} {}", self.op, self.operand)
        }
    }
}

// ── Compiled program ─────────────────────────────────────────────────

/// Output of the code generator: a flat instruction stream plus the
/// entry address of every function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledProgram {
    pub code: Vec<Code>,
    pub functions: HashMap<String, usize>,
}

impl CompiledProgram {
    pub fn function_address(&self, name: &str) -> Option<usize> {
        self.functions.get(name).copied()
    }

    /// Name of the function whose body contains `address`. The bootstrap
    /// sequence belongs to no function.
    pub fn function_at(&self, address: usize) -> Option<&str> {
        self.functions
            .iter()
            .filter(|(_, entry)| **entry <= address)
            .max_by_key(|(_, entry)| **entry)
            .map(|(name, _)| name.as_str())
    }

    /// Disassembly listing, one instruction per line, followed by the function table.
    pub fn listing(&self) -> String {
        let width = self.code.len().saturating_sub(1).to_string().len().max(4);
        let mut out = String::new();
        for (address, code) in self.code.iter().enumerate() {
            out.push_str(&format!("{:0width$} {}\n", address, code, width = width));
        }
        let mut functions: Vec<(&String, &usize)> = self.functions.iter().collect();
        functions.sort_by_key(|(_, address)| **address);
        out.push_str("\nfunctions:\n");
        for (name, address) in functions {
            out.push_str(&format!("  {:0width$} {}\n", address, name, width = width));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_pads_opcode() {
        let code = Code::new(Opcode::GetGlobal, Operand::Text("main".into()));
        assert_eq!(code.to_string(), "GetGlobal       \"main\"");
        assert_eq!(Code::bare(Opcode::Exit).to_string(), "Exit");
    }

    #[test]
    fn index_operand_mismatch_is_malformed() {
        let code = Code::new(Opcode::Jump, Operand::Text("oops".into()));
        match code.index(7) {
            Err(VmError::MalformedInstruction { address, op }) => {
                assert_eq!(address, 7);
                assert_eq!(op, "Jump");
            }
            other => panic!("expected malformed instruction, got {:?}", other),
        }
    }

    #[test]
    fn listing_includes_function_table() {
        let program = CompiledProgram {
            code: vec![
                Code::new(Opcode::GetGlobal, Operand::Text("main".into())),
                Code::new(Opcode::Call, Operand::Index(0)),
                Code::bare(Opcode::Exit),
                Code::new(Opcode::Alloca, Operand::Index(0)),
                Code::bare(Opcode::Return),
            ],
            functions: HashMap::from([("main".to_string(), 3)]),
        };
        let listing = program.listing();
        assert!(listing.starts_with("0000 GetGlobal       \"main\"\n0001 Call            0\n0002 Exit\n"));
        assert!(listing.ends_with("functions:\n  0003 main\n"));
    }

    #[test]
    fn function_at_finds_enclosing_body() {
        let program = CompiledProgram {
            code: Vec::new(),
            functions: HashMap::from([("helper".to_string(), 3), ("main".to_string(), 9)]),
        };
        assert_eq!(program.function_at(1), None);
        assert_eq!(program.function_at(3), Some("helper"));
        assert_eq!(program.function_at(8), Some("helper"));
        assert_eq!(program.function_at(12), Some("main"));
    }
}
