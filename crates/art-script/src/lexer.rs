//! Single-pass lexer for `.art` source with multi-error recovery.
//!
//! Whitespace is insignificant except that any run of newlines (including
//! blank and comment-only lines) collapses into a single NEWLINE token.
//! Unrecognized characters become ILLEGAL tokens; unterminated strings and
//! malformed numbers record an error and resume at the next line.

use crate::error::Diagnostic;
use crate::token::{Keyword, Position, Token, TokenKind};

pub struct Lexer<'a> {
    chars: Vec<(usize, char)>,
    lines: Vec<&'a str>,
    src_len: usize,
    idx: usize,
    line: u32,
    column: u32,
    tokens: Vec<Token>,
    errors: Vec<Diagnostic>,
}

/// Tokenize a full source text.  Always returns a token stream terminated by
/// EOF; lexical errors are collected rather than aborting.
pub fn tokenize(src: &str) -> (Vec<Token>, Vec<Diagnostic>) {
    Lexer::new(src).run()
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            chars: src.char_indices().collect(),
            lines: src.lines().collect(),
            src_len: src.len(),
            idx: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn run(mut self) -> (Vec<Token>, Vec<Diagnostic>) {
        loop {
            self.skip_spaces_and_comments();
            let pos = self.pos();
            match self.peek() {
                None => {
                    self.tokens
                        .push(Token::new(TokenKind::Eof, pos, self.src_len));
                    break;
                }
                Some('\n') => {
                    self.bump();
                    // Collapse runs of newlines; suppress a leading NEWLINE.
                    let last_is_newline = matches!(
                        self.tokens.last().map(|t| &t.kind),
                        Some(TokenKind::Newline) | None
                    );
                    if !last_is_newline {
                        self.tokens
                            .push(Token::new(TokenKind::Newline, pos, pos.offset + 1));
                    }
                }
                Some(c) if c.is_ascii_digit() => self.lex_number(pos),
                Some('"') => self.lex_string(pos),
                Some(c) if c.is_ascii_alphabetic() || c == '_' => self.lex_ident(pos),
                Some(c) => self.lex_operator(c, pos),
            }
        }
        (self.tokens, self.errors)
    }

    // -----------------------------------------------------------------------
    // Scanning primitives
    // -----------------------------------------------------------------------

    fn peek(&self) -> Option<char> {
        self.chars.get(self.idx).map(|&(_, c)| c)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.idx + ahead).map(|&(_, c)| c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.idx)
            .map(|&(o, _)| o)
            .unwrap_or(self.src_len)
    }

    fn pos(&self) -> Position {
        Position {
            line: self.line,
            column: self.column,
            offset: self.offset(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.idx += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_spaces_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    /// Skip to (but not past) the next newline, for error recovery.
    fn skip_to_eol(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn context_line(&self, line: u32) -> String {
        self.lines
            .get(line.saturating_sub(1) as usize)
            .map(|l| (*l).to_owned())
            .unwrap_or_default()
    }

    fn error_at(&mut self, pos: Position, message: impl Into<String>) {
        let context = self.context_line(pos.line);
        self.errors.push(Diagnostic::error(pos, message, context));
    }

    fn push(&mut self, kind: TokenKind, pos: Position) {
        let end = self.offset();
        self.tokens.push(Token::new(kind, pos, end));
    }

    // -----------------------------------------------------------------------
    // Token scanners
    // -----------------------------------------------------------------------

    fn lex_number(&mut self, pos: Position) {
        let start = self.offset();
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }

        let mut is_float = false;
        // Fractional part: only when the dot is followed by a digit, so
        // `arr.1`-style field access never swallows the dot.
        if self.peek() == Some('.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }
        // Exponent.
        if matches!(self.peek(), Some('e') | Some('E')) {
            let mut ahead = 1;
            if matches!(self.peek_at(1), Some('+') | Some('-')) {
                ahead = 2;
            }
            match self.peek_at(ahead) {
                Some(c) if c.is_ascii_digit() => {
                    is_float = true;
                    for _ in 0..ahead {
                        self.bump();
                    }
                    while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                        self.bump();
                    }
                }
                _ => {
                    self.error_at(pos, "malformed number: exponent without digits");
                    self.skip_to_eol();
                    return;
                }
            }
        }

        let text: String = self.slice(start, self.offset());
        if is_float {
            match text.parse::<f64>() {
                Ok(v) => self.push(TokenKind::Float(v), pos),
                Err(_) => {
                    self.error_at(pos, format!("malformed float literal '{}'", text));
                    self.skip_to_eol();
                }
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) => self.push(TokenKind::Int(v), pos),
                Err(_) => {
                    self.error_at(pos, format!("integer literal '{}' out of range", text));
                    self.skip_to_eol();
                }
            }
        }
    }

    fn slice(&self, start: usize, end: usize) -> String {
        // Reconstruct from the char list to avoid holding a borrow of src.
        self.chars
            .iter()
            .skip_while(|&&(o, _)| o < start)
            .take_while(|&&(o, _)| o < end)
            .map(|&(_, c)| c)
            .collect()
    }

    fn lex_string(&mut self, pos: Position) {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    self.error_at(pos, "unterminated string literal");
                    // Resume at the next line; the newline itself is handled
                    // by the main loop.
                    return;
                }
                Some('"') => {
                    self.bump();
                    self.push(TokenKind::Str(value), pos);
                    return;
                }
                Some('\\') => {
                    self.bump();
                    match self.peek() {
                        Some('"') => {
                            value.push('"');
                            self.bump();
                        }
                        Some('\\') => {
                            value.push('\\');
                            self.bump();
                        }
                        Some('n') => {
                            value.push('\n');
                            self.bump();
                        }
                        Some('t') => {
                            value.push('\t');
                            self.bump();
                        }
                        Some(other) => {
                            let esc_pos = self.pos();
                            self.error_at(esc_pos, format!("unknown escape '\\{}'", other));
                            value.push(other);
                            self.bump();
                        }
                        None => {
                            self.error_at(pos, "unterminated string literal");
                            return;
                        }
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.bump();
                }
            }
        }
    }

    fn lex_ident(&mut self, pos: Position) {
        let start = self.offset();
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.bump();
        }
        let text = self.slice(start, self.offset());
        match Keyword::lookup(&text) {
            Some(kw) => self.push(TokenKind::Keyword(kw), pos),
            None => self.push(TokenKind::Ident(text), pos),
        }
    }

    fn lex_operator(&mut self, c: char, pos: Position) {
        self.bump();
        let kind = match c {
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ':' => TokenKind::Colon,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '=' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            '&' => {
                if self.peek() == Some('&') {
                    self.bump();
                    TokenKind::AndAnd
                } else {
                    self.error_at(pos, "unexpected '&' (did you mean '&&'?)");
                    TokenKind::Illegal('&')
                }
            }
            '|' => {
                if self.peek() == Some('|') {
                    self.bump();
                    TokenKind::OrOr
                } else {
                    self.error_at(pos, "unexpected '|' (did you mean '||'?)");
                    TokenKind::Illegal('|')
                }
            }
            other => {
                self.error_at(pos, format!("unrecognized character '{}'", other));
                TokenKind::Illegal(other)
            }
        };
        self.push(kind, pos);
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
