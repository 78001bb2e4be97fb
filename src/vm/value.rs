use std::fmt;

use super::heap::HeapRef;

/// Runtime value. Arrays and collections live in the heap and are shared
/// through their handle; everything else is copied.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Array(HeapRef),
    Collection(HeapRef),
    /// Entry address of a compiled function
    Function(usize),
    Builtin(Builtin),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Collection(_) => "collection",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Heap handle held by this value, if any.
    pub fn heap_ref(&self) -> Option<HeapRef> {
        match self {
            Value::Array(r) | Value::Collection(r) => Some(*r),
            _ => None,
        }
    }
}

/// Native functions reachable by name through `GetGlobal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Length,
    Push,
    Pop,
    Erase,
    Sqrt,
}

impl Builtin {
    pub const ALL: [Builtin; 5] = [Builtin::Length, Builtin::Push, Builtin::Pop, Builtin::Erase, Builtin::Sqrt];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Length => "length",
            Builtin::Push => "push",
            Builtin::Pop => "pop",
            Builtin::Erase => "erase",
            Builtin::Sqrt => "sqrt",
        }
    }

    pub fn lookup(name: &str) -> Option<Builtin> {
        Builtin::ALL.into_iter().find(|b| b.name() == name)
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Numbers print without a trailing `.0` when they are integral.
pub(crate) fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
