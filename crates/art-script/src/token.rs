//! Token types for `.art` source.
//!
//! Keywords are case-insensitive; `set`, `Set`, and `SET` all lex to the
//! same keyword token.  Builtin function names (`FLOAT`, `LENGTH`, `NOW`)
//! are NOT keywords; they lex as identifiers and are recognized by the
//! parser as all-caps identifiers applied to arguments.

use std::fmt;

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Source position: 1-based line and column plus byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: u32,
    pub column: u32,
    pub offset: usize,
}

impl Position {
    pub fn start() -> Self {
        Position {
            line: 1,
            column: 1,
            offset: 0,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

// ---------------------------------------------------------------------------
// Keywords
// ---------------------------------------------------------------------------

/// Case-insensitive keywords of the `.art` language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    // Test / suite structure
    Test,
    EndTest,
    Suite,
    EndSuite,
    Setup,
    EndSetup,
    Teardown,
    EndTeardown,
    Pass,
    Fail,
    Skip,
    Assert,
    // Variables
    Set,
    Const,
    Global,
    Delete,
    Append,
    Extend,
    Reserve,
    // Control flow
    If,
    ElseIf,
    Else,
    EndIf,
    Loop,
    EndLoop,
    While,
    EndWhile,
    Foreach,
    EndForeach,
    Break,
    Continue,
    Times,
    As,
    In,
    // Errors
    Try,
    Catch,
    Finally,
    EndTry,
    // Parallel
    Parallel,
    EndParallel,
    Timeout,
    // Device I/O
    Connect,
    Disconnect,
    Send,
    Query,
    Relay,
    Tcp,
    Serial,
    All,
    On,
    Off,
    Toggle,
    Get,
    // Functions
    Function,
    EndFunction,
    Call,
    Return,
    // Libraries
    Import,
    Library,
    EndLibrary,
    // Utilities
    Log,
    Delay,
    // Literals
    True,
    False,
    Null,
}

impl Keyword {
    /// Case-insensitive keyword lookup.
    pub fn lookup(ident: &str) -> Option<Keyword> {
        let kw = match ident.to_ascii_uppercase().as_str() {
            "TEST" => Keyword::Test,
            "ENDTEST" => Keyword::EndTest,
            "SUITE" => Keyword::Suite,
            "ENDSUITE" => Keyword::EndSuite,
            "SETUP" => Keyword::Setup,
            "ENDSETUP" => Keyword::EndSetup,
            "TEARDOWN" => Keyword::Teardown,
            "ENDTEARDOWN" => Keyword::EndTeardown,
            "PASS" => Keyword::Pass,
            "FAIL" => Keyword::Fail,
            "SKIP" => Keyword::Skip,
            "ASSERT" => Keyword::Assert,
            "SET" => Keyword::Set,
            "CONST" => Keyword::Const,
            "GLOBAL" => Keyword::Global,
            "DELETE" => Keyword::Delete,
            "APPEND" => Keyword::Append,
            "EXTEND" => Keyword::Extend,
            "RESERVE" => Keyword::Reserve,
            "IF" => Keyword::If,
            "ELSEIF" => Keyword::ElseIf,
            "ELSE" => Keyword::Else,
            "ENDIF" => Keyword::EndIf,
            "LOOP" => Keyword::Loop,
            "ENDLOOP" => Keyword::EndLoop,
            "WHILE" => Keyword::While,
            "ENDWHILE" => Keyword::EndWhile,
            "FOREACH" => Keyword::Foreach,
            "ENDFOREACH" => Keyword::EndForeach,
            "BREAK" => Keyword::Break,
            "CONTINUE" => Keyword::Continue,
            "TIMES" => Keyword::Times,
            "AS" => Keyword::As,
            "IN" => Keyword::In,
            "TRY" => Keyword::Try,
            "CATCH" => Keyword::Catch,
            "FINALLY" => Keyword::Finally,
            "ENDTRY" => Keyword::EndTry,
            "PARALLEL" => Keyword::Parallel,
            "ENDPARALLEL" => Keyword::EndParallel,
            "TIMEOUT" => Keyword::Timeout,
            "CONNECT" => Keyword::Connect,
            "DISCONNECT" => Keyword::Disconnect,
            "SEND" => Keyword::Send,
            "QUERY" => Keyword::Query,
            "RELAY" => Keyword::Relay,
            "TCP" => Keyword::Tcp,
            "SERIAL" => Keyword::Serial,
            "ALL" => Keyword::All,
            "ON" => Keyword::On,
            "OFF" => Keyword::Off,
            "TOGGLE" => Keyword::Toggle,
            "GET" => Keyword::Get,
            "FUNCTION" => Keyword::Function,
            "ENDFUNCTION" => Keyword::EndFunction,
            "CALL" => Keyword::Call,
            "RETURN" => Keyword::Return,
            "IMPORT" => Keyword::Import,
            "LIBRARY" => Keyword::Library,
            "ENDLIBRARY" => Keyword::EndLibrary,
            "LOG" => Keyword::Log,
            "DELAY" => Keyword::Delay,
            "TRUE" => Keyword::True,
            "FALSE" => Keyword::False,
            "NULL" => Keyword::Null,
            _ => return None,
        };
        Some(kw)
    }

    /// True for keywords that can begin a statement (the parser's
    /// synchronization set).
    pub fn starts_statement(self) -> bool {
        matches!(
            self,
            Keyword::Test
                | Keyword::Suite
                | Keyword::Pass
                | Keyword::Fail
                | Keyword::Skip
                | Keyword::Assert
                | Keyword::Set
                | Keyword::Const
                | Keyword::Global
                | Keyword::Delete
                | Keyword::Append
                | Keyword::Extend
                | Keyword::Reserve
                | Keyword::If
                | Keyword::Loop
                | Keyword::While
                | Keyword::Foreach
                | Keyword::Break
                | Keyword::Continue
                | Keyword::Try
                | Keyword::Parallel
                | Keyword::Connect
                | Keyword::Disconnect
                | Keyword::Send
                | Keyword::Query
                | Keyword::Relay
                | Keyword::Function
                | Keyword::Call
                | Keyword::Return
                | Keyword::Import
                | Keyword::Library
                | Keyword::Log
                | Keyword::Delay
        )
    }
}

// ---------------------------------------------------------------------------
// TokenKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Special
    Eof,
    Newline,
    Illegal(char),
    // Literals
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Keyword(Keyword),
    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Gt,
    Lt,
    Ge,
    Le,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
    Assign,
    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Colon,
    Comma,
    Dot,
}

impl TokenKind {
    /// Human-readable description for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Eof => "end of input".to_owned(),
            TokenKind::Newline => "end of line".to_owned(),
            TokenKind::Illegal(c) => format!("illegal character '{}'", c),
            TokenKind::Int(v) => format!("integer {}", v),
            TokenKind::Float(v) => format!("float {}", v),
            TokenKind::Str(s) => format!("string \"{}\"", s),
            TokenKind::Ident(name) => format!("identifier '{}'", name),
            TokenKind::Keyword(kw) => format!("keyword {:?}", kw).to_uppercase(),
            TokenKind::Plus => "'+'".to_owned(),
            TokenKind::Minus => "'-'".to_owned(),
            TokenKind::Star => "'*'".to_owned(),
            TokenKind::Slash => "'/'".to_owned(),
            TokenKind::Percent => "'%'".to_owned(),
            TokenKind::Gt => "'>'".to_owned(),
            TokenKind::Lt => "'<'".to_owned(),
            TokenKind::Ge => "'>='".to_owned(),
            TokenKind::Le => "'<='".to_owned(),
            TokenKind::EqEq => "'=='".to_owned(),
            TokenKind::NotEq => "'!='".to_owned(),
            TokenKind::AndAnd => "'&&'".to_owned(),
            TokenKind::OrOr => "'||'".to_owned(),
            TokenKind::Bang => "'!'".to_owned(),
            TokenKind::Assign => "'='".to_owned(),
            TokenKind::LParen => "'('".to_owned(),
            TokenKind::RParen => "')'".to_owned(),
            TokenKind::LBracket => "'['".to_owned(),
            TokenKind::RBracket => "']'".to_owned(),
            TokenKind::LBrace => "'{'".to_owned(),
            TokenKind::RBrace => "'}'".to_owned(),
            TokenKind::Colon => "':'".to_owned(),
            TokenKind::Comma => "','".to_owned(),
            TokenKind::Dot => "'.'".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: Position,
    /// Byte offset one past the end of the token; used by the parser's
    /// bracket-adjacency rule in `SET name[idx]`.
    pub end: usize,
}

impl Token {
    pub fn new(kind: TokenKind, pos: Position, end: usize) -> Self {
        Token { kind, pos, end }
    }
}
