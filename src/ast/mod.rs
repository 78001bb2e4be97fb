use serde::{Deserialize, Serialize};

pub mod source_map;
pub use source_map::SourceMap;

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl From<std::ops::Range<usize>> for Span {
    fn from(range: std::ops::Range<usize>) -> Self {
        Span { start: range.start, end: range.end }
    }
}

// ---- Syntax tree ----
//
// This is the boundary between the front end and the code generator.
// Anything that produces these nodes (the bundled parser, or an external
// tool handing over JSON) can be compiled.

/// A complete program is a list of top-level functions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<Function>,
    #[serde(skip)]
    pub source: Option<String>,
}

/// `function name(a, b) { ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    #[serde(skip)]
    pub span: Span,
}

/// `var name = value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub value: Expr,
}

/// One `if`/`elif` arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub condition: Expr,
    pub body: Vec<Stmt>,
}

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// Function declaration; only legal at the top level
    Function(Function),

    /// `return expr;` or bare `return;`
    Return(Option<Expr>),

    /// `var name = expr;`
    Var(VarDecl),

    /// `for init, condition, increment { body }`
    ///
    /// The clauses are optional in the tree so that hand-built or
    /// deserialized programs can be rejected with a proper error.
    For {
        init: Option<VarDecl>,
        condition: Option<Expr>,
        increment: Option<Expr>,
        body: Vec<Stmt>,
    },

    /// `if c {..} elif c {..} else {..}`
    If {
        branches: Vec<Branch>,
        else_body: Option<Vec<Stmt>>,
    },

    Break,
    Continue,

    /// `print a, b;` or `printLine a, b;`
    Print { newline: bool, args: Vec<Expr> },

    /// Expression evaluated for its effect
    Expr(Expr),
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Literal),

    /// Variable read
    Identifier(String),

    /// Variable write: `name = value`
    Assign { name: String, value: Box<Expr> },

    Or { left: Box<Expr>, right: Box<Expr> },
    And { left: Box<Expr>, right: Box<Expr> },

    Relational {
        op: RelOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Arithmetic {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Unary { op: UnaryOp, operand: Box<Expr> },

    /// `callee(args...)`
    Call { callee: Box<Expr>, args: Vec<Expr> },

    /// `collection[index]`
    Index { collection: Box<Expr>, index: Box<Expr> },

    /// `collection[index] = value`
    IndexAssign {
        collection: Box<Expr>,
        index: Box<Expr>,
        value: Box<Expr>,
    },

    /// `[a, b, c]`
    Array(Vec<Expr>),

    /// `{ "key": value, ... }`
    Map(Vec<(String, Expr)>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelOp {
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    LessOrEqual,
    GreaterOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// unary `+`
    Absolute,
    /// unary `-`
    Negate,
}
