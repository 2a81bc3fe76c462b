//! AST node types for `.art` programs.
//!
//! Every node carries the source position of its first token for
//! diagnostics.

use crate::token::Position;

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: Position,
}

/// Transport named in a CONNECT statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Serial,
}

/// The action part of a RELAY statement.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayAction {
    Set { channel: Expr, state: Expr },
    Get { channel: Expr, target: Option<String> },
    Toggle { channel: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    // Variables
    Set {
        name: String,
        /// Present for `SET name[idx] = value`.
        index: Option<Expr>,
        value: Expr,
    },
    Const {
        name: String,
        value: Expr,
    },
    Global {
        name: String,
        value: Option<Expr>,
    },
    Delete {
        name: String,
    },
    Append {
        name: String,
        value: Expr,
    },
    Extend {
        name: String,
        value: Expr,
    },
    Reserve {
        name: String,
        size: Expr,
    },
    // Control flow
    If {
        /// (condition, body) pairs: IF plus any ELSEIFs, in order.
        branches: Vec<(Expr, Vec<Stmt>)>,
        else_body: Option<Vec<Stmt>>,
    },
    Loop {
        count: Expr,
        var: Option<String>,
        body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Foreach {
        name: String,
        collection: Expr,
        index_var: Option<String>,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    // Errors
    Try {
        body: Vec<Stmt>,
        catch: Option<(String, Vec<Stmt>)>,
        finally: Option<Vec<Stmt>>,
    },
    // Parallel
    Parallel {
        timeout: Option<Expr>,
        body: Vec<Stmt>,
    },
    // Device I/O
    Connect {
        device: String,
        transport: Transport,
        address: Expr,
        args: Vec<Expr>,
    },
    /// `device` is None for `DISCONNECT ALL`.
    Disconnect {
        device: Option<String>,
    },
    Send {
        device: Option<String>,
        command: Expr,
    },
    Query {
        device: Option<String>,
        command: Expr,
        target: String,
        timeout: Option<Expr>,
    },
    Relay {
        device: String,
        action: RelayAction,
    },
    // Functions
    Function {
        name: String,
        params: Vec<String>,
        body: Vec<Stmt>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Return {
        value: Option<Expr>,
    },
    // Libraries
    Import {
        path: Expr,
    },
    Library {
        name: Expr,
        body: Vec<Stmt>,
    },
    // Results
    Test {
        name: Expr,
        body: Vec<Stmt>,
    },
    Suite {
        name: Expr,
        setup: Option<Vec<Stmt>>,
        teardown: Option<Vec<Stmt>>,
        /// Each entry is a `StmtKind::Test`.
        tests: Vec<Stmt>,
    },
    Pass {
        message: Expr,
    },
    Fail {
        message: Expr,
    },
    Skip {
        message: Expr,
    },
    Assert {
        cond: Expr,
        message: Option<Expr>,
    },
    // Utility
    Log {
        level: String,
        message: Expr,
    },
    Delay {
        ms: Expr,
    },
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Ident(String),
    Array(Vec<Expr>),
    Dict(Vec<(String, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Field {
        target: Box<Expr>,
        name: String,
    },
    /// All-caps identifier applied to arguments, e.g. `LENGTH(xs)`.
    Builtin {
        name: String,
        args: Vec<Expr>,
    },
    /// `CALL name(args)` in expression position.
    Call {
        name: String,
        args: Vec<Expr>,
    },
}
