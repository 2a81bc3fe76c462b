//! Recursive-descent parser for `.art` programs.
//!
//! The parser never aborts: on an unexpected token inside a statement it
//! reports one diagnostic, synchronizes to the next NEWLINE or a token known
//! to start a statement, and continues.  Expressions are parsed by
//! precedence climbing, lowest to highest:
//! `||` < `&&` < `== !=` < `< > <= >=` < `+ -` < `* / %` < unary < postfix.

use crate::ast::{
    BinaryOp, Expr, ExprKind, Program, RelayAction, Stmt, StmtKind, Transport, UnaryOp,
};
use crate::error::Diagnostic;
use crate::lexer;
use crate::token::{Keyword, Position, Token, TokenKind};

/// Parse a full source text: lex, parse, and return the program plus all
/// diagnostics (lexical and syntactic, in source order).
pub fn parse(src: &str) -> (Program, Vec<Diagnostic>) {
    let (tokens, lex_errors) = lexer::tokenize(src);
    let lines: Vec<String> = src.lines().map(|l| l.to_owned()).collect();
    let mut parser = Parser {
        tokens,
        lines,
        idx: 0,
        errors: lex_errors,
    };
    let program = parser.parse_program();
    let mut errors = parser.errors;
    // Lexical and syntactic diagnostics interleave; report in source order.
    errors.sort_by_key(|d| (d.line, d.column));
    (program, errors)
}

/// Internal result: `Err(())` means a diagnostic was already recorded and
/// the caller should synchronize.
type PResult<T> = Result<T, ()>;

struct Parser {
    tokens: Vec<Token>,
    lines: Vec<String>,
    idx: usize,
    errors: Vec<Diagnostic>,
}

impl Parser {
    // -----------------------------------------------------------------------
    // Token access
    // -----------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.idx.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.idx < self.tokens.len() - 1 {
            self.idx += 1;
        }
        tok
    }

    fn check_keyword(&self, kw: Keyword) -> bool {
        matches!(self.peek_kind(), TokenKind::Keyword(k) if *k == kw)
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.check_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline) {
            self.advance();
        }
    }

    // -----------------------------------------------------------------------
    // Diagnostics and synchronization
    // -----------------------------------------------------------------------

    fn context_line(&self, line: u32) -> String {
        self.lines
            .get(line.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_default()
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let pos = self.peek().pos;
        let context = self.context_line(pos.line);
        self.errors.push(Diagnostic::error(pos, message, context));
    }

    fn expected(&mut self, what: &str) {
        let found = self.peek_kind().describe();
        self.error_here(format!("expected {}, found {}", what, found));
    }

    /// Consume tokens until the next statement boundary: just past a
    /// NEWLINE, or stopped at EOF / a statement-starting keyword / a block
    /// terminator.
    fn synchronize(&mut self) {
        loop {
            match self.peek_kind() {
                TokenKind::Eof => return,
                TokenKind::Newline => {
                    self.advance();
                    return;
                }
                TokenKind::Keyword(kw)
                    if kw.starts_statement() || is_block_boundary(*kw) =>
                {
                    return;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn expect_ident(&mut self, what: &str) -> PResult<String> {
        match self.peek_kind() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => {
                self.expected(what);
                Err(())
            }
        }
    }

    /// A device id: a bare identifier or a quoted string (for ids with
    /// hyphens).
    fn expect_device_id(&mut self) -> PResult<String> {
        match self.peek_kind() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            TokenKind::Str(s) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            _ => {
                self.expected("device id (identifier or string)");
                Err(())
            }
        }
    }

    fn expect_kind(&mut self, kind: &TokenKind, what: &str) -> PResult<()> {
        if self.peek_kind() == kind {
            self.advance();
            Ok(())
        } else {
            self.expected(what);
            Err(())
        }
    }

    fn expect_keyword(&mut self, kw: Keyword, what: &str) -> PResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            self.expected(what);
            Err(())
        }
    }

    /// Require the current statement to end here (NEWLINE, EOF, or an
    /// upcoming block terminator).
    fn expect_statement_end(&mut self) -> PResult<()> {
        match self.peek_kind() {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            TokenKind::Keyword(kw) if is_block_boundary(*kw) => Ok(()),
            _ => {
                self.expected("end of line");
                Err(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Program / blocks
    // -----------------------------------------------------------------------

    fn parse_program(&mut self) -> Program {
        let mut statements = Vec::new();
        loop {
            self.skip_newlines();
            if self.at_eof() {
                break;
            }
            match self.parse_statement() {
                Ok(stmt) => {
                    statements.push(stmt);
                    if self.expect_statement_end().is_err() {
                        self.synchronize();
                    }
                }
                Err(()) => self.synchronize(),
            }
        }
        Program { statements }
    }

    /// Parse statements until one of `terminators` (not consumed) or EOF.
    fn parse_block(&mut self, terminators: &[Keyword]) -> Vec<Stmt> {
        let mut statements = Vec::new();
        loop {
            self.skip_newlines();
            if self.at_eof() {
                break;
            }
            if let TokenKind::Keyword(kw) = self.peek_kind() {
                if terminators.contains(kw) {
                    break;
                }
            }
            match self.parse_statement() {
                Ok(stmt) => {
                    statements.push(stmt);
                    if self.expect_statement_end().is_err() {
                        self.synchronize();
                    }
                }
                Err(()) => self.synchronize(),
            }
        }
        statements
    }

    /// Expect and consume a specific block terminator, tolerating EOF with
    /// a diagnostic.
    fn close_block(&mut self, kw: Keyword, name: &str) {
        self.skip_newlines();
        if !self.eat_keyword(kw) {
            self.expected(name);
        }
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn parse_statement(&mut self) -> PResult<Stmt> {
        let pos = self.peek().pos;
        let kw = match self.peek_kind() {
            TokenKind::Keyword(kw) => *kw,
            _ => {
                self.expected("a statement");
                return Err(());
            }
        };
        let kind = match kw {
            Keyword::Set => self.parse_set()?,
            Keyword::Const => self.parse_const()?,
            Keyword::Global => self.parse_global()?,
            Keyword::Delete => {
                self.advance();
                StmtKind::Delete {
                    name: self.expect_ident("variable name after DELETE")?,
                }
            }
            Keyword::Append => {
                self.advance();
                let name = self.expect_ident("array name after APPEND")?;
                let value = self.parse_expr()?;
                StmtKind::Append { name, value }
            }
            Keyword::Extend => {
                self.advance();
                let name = self.expect_ident("array name after EXTEND")?;
                let value = self.parse_expr()?;
                StmtKind::Extend { name, value }
            }
            Keyword::Reserve => {
                self.advance();
                let name = self.expect_ident("array name after RESERVE")?;
                let size = self.parse_expr()?;
                StmtKind::Reserve { name, size }
            }
            Keyword::If => self.parse_if()?,
            Keyword::Loop => self.parse_loop()?,
            Keyword::While => self.parse_while()?,
            Keyword::Foreach => self.parse_foreach()?,
            Keyword::Break => {
                self.advance();
                StmtKind::Break
            }
            Keyword::Continue => {
                self.advance();
                StmtKind::Continue
            }
            Keyword::Try => self.parse_try()?,
            Keyword::Parallel => self.parse_parallel()?,
            Keyword::Connect => self.parse_connect()?,
            Keyword::Disconnect => self.parse_disconnect()?,
            Keyword::Send => self.parse_send()?,
            Keyword::Query => self.parse_query()?,
            Keyword::Relay => self.parse_relay()?,
            Keyword::Function => self.parse_function()?,
            Keyword::Call => {
                self.advance();
                let (name, args) = self.parse_call_tail()?;
                StmtKind::Call { name, args }
            }
            Keyword::Return => {
                self.advance();
                let value = if self.starts_expression() {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                StmtKind::Return { value }
            }
            Keyword::Import => {
                self.advance();
                StmtKind::Import {
                    path: self.parse_expr()?,
                }
            }
            Keyword::Library => {
                self.advance();
                let name = self.parse_expr()?;
                let body = self.parse_block(&[Keyword::EndLibrary]);
                self.close_block(Keyword::EndLibrary, "ENDLIBRARY");
                StmtKind::Library { name, body }
            }
            Keyword::Test => self.parse_test()?,
            Keyword::Suite => self.parse_suite()?,
            Keyword::Pass => {
                self.advance();
                StmtKind::Pass {
                    message: self.parse_expr()?,
                }
            }
            Keyword::Fail => {
                self.advance();
                StmtKind::Fail {
                    message: self.parse_expr()?,
                }
            }
            Keyword::Skip => {
                self.advance();
                StmtKind::Skip {
                    message: self.parse_expr()?,
                }
            }
            Keyword::Assert => {
                self.advance();
                let cond = self.parse_expr()?;
                let message = if self.starts_expression() {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                StmtKind::Assert { cond, message }
            }
            Keyword::Log => self.parse_log()?,
            Keyword::Delay => {
                self.advance();
                StmtKind::Delay {
                    ms: self.parse_expr()?,
                }
            }
            other => {
                self.error_here(format!("{:?} cannot start a statement", other));
                // Consume the stray keyword so synchronization makes progress.
                self.advance();
                return Err(());
            }
        };
        Ok(Stmt { kind, pos })
    }

    fn parse_set(&mut self) -> PResult<StmtKind> {
        self.advance(); // SET
        let name_tok = self.peek().clone();
        let name = self.expect_ident("variable name after SET")?;

        // `SET name[idx] = value` only when the bracket abuts the name with
        // no intervening whitespace; otherwise the bracket begins an array
        // literal that is the new value.
        let index = if matches!(self.peek_kind(), TokenKind::LBracket)
            && self.peek().pos.offset == name_tok.end
        {
            self.advance();
            let idx = self.parse_expr()?;
            self.expect_kind(&TokenKind::RBracket, "']' after index")?;
            Some(idx)
        } else {
            None
        };

        // The '=' is optional.
        if matches!(self.peek_kind(), TokenKind::Assign) {
            self.advance();
        }
        let value = self.parse_expr()?;
        Ok(StmtKind::Set { name, index, value })
    }

    fn parse_const(&mut self) -> PResult<StmtKind> {
        self.advance(); // CONST
        let name = self.expect_ident("constant name after CONST")?;
        if matches!(self.peek_kind(), TokenKind::Assign) {
            self.advance();
        }
        let value = self.parse_expr()?;
        Ok(StmtKind::Const { name, value })
    }

    fn parse_global(&mut self) -> PResult<StmtKind> {
        self.advance(); // GLOBAL
        let name = self.expect_ident("variable name after GLOBAL")?;
        if matches!(self.peek_kind(), TokenKind::Assign) {
            self.advance();
            return Ok(StmtKind::Global {
                name,
                value: Some(self.parse_expr()?),
            });
        }
        if self.starts_expression() {
            return Ok(StmtKind::Global {
                name,
                value: Some(self.parse_expr()?),
            });
        }
        Ok(StmtKind::Global { name, value: None })
    }

    fn parse_if(&mut self) -> PResult<StmtKind> {
        self.advance(); // IF
        let mut branches = Vec::new();
        let cond = self.parse_expr()?;
        let body = self.parse_block(&[Keyword::ElseIf, Keyword::Else, Keyword::EndIf]);
        branches.push((cond, body));

        let mut else_body = None;
        loop {
            self.skip_newlines();
            if self.eat_keyword(Keyword::ElseIf) {
                let cond = self.parse_expr()?;
                let body = self.parse_block(&[Keyword::ElseIf, Keyword::Else, Keyword::EndIf]);
                branches.push((cond, body));
            } else if self.eat_keyword(Keyword::Else) {
                else_body = Some(self.parse_block(&[Keyword::EndIf]));
            } else {
                break;
            }
        }
        self.close_block(Keyword::EndIf, "ENDIF");
        Ok(StmtKind::If {
            branches,
            else_body,
        })
    }

    fn parse_loop(&mut self) -> PResult<StmtKind> {
        self.advance(); // LOOP
        let count = self.parse_expr()?;
        self.expect_keyword(Keyword::Times, "TIMES after loop count")?;
        let var = if self.eat_keyword(Keyword::As) {
            Some(self.expect_ident("iteration variable after AS")?)
        } else {
            None
        };
        let body = self.parse_block(&[Keyword::EndLoop]);
        self.close_block(Keyword::EndLoop, "ENDLOOP");
        Ok(StmtKind::Loop { count, var, body })
    }

    fn parse_while(&mut self) -> PResult<StmtKind> {
        self.advance(); // WHILE
        let cond = self.parse_expr()?;
        let body = self.parse_block(&[Keyword::EndWhile]);
        self.close_block(Keyword::EndWhile, "ENDWHILE");
        Ok(StmtKind::While { cond, body })
    }

    fn parse_foreach(&mut self) -> PResult<StmtKind> {
        self.advance(); // FOREACH
        let name = self.expect_ident("item variable after FOREACH")?;
        self.expect_keyword(Keyword::In, "IN after FOREACH variable")?;
        let collection = self.parse_expr()?;
        let index_var = if self.eat_keyword(Keyword::As) {
            Some(self.expect_ident("index variable after AS")?)
        } else {
            None
        };
        let body = self.parse_block(&[Keyword::EndForeach]);
        self.close_block(Keyword::EndForeach, "ENDFOREACH");
        Ok(StmtKind::Foreach {
            name,
            collection,
            index_var,
            body,
        })
    }

    fn parse_try(&mut self) -> PResult<StmtKind> {
        self.advance(); // TRY
        let body = self.parse_block(&[Keyword::Catch, Keyword::Finally, Keyword::EndTry]);

        let mut catch = None;
        let mut finally = None;
        self.skip_newlines();
        if self.eat_keyword(Keyword::Catch) {
            let var = self.expect_ident("error variable after CATCH")?;
            let catch_body = self.parse_block(&[Keyword::Finally, Keyword::EndTry]);
            catch = Some((var, catch_body));
        }
        self.skip_newlines();
        if self.eat_keyword(Keyword::Finally) {
            finally = Some(self.parse_block(&[Keyword::EndTry]));
        }
        self.close_block(Keyword::EndTry, "ENDTRY");
        Ok(StmtKind::Try {
            body,
            catch,
            finally,
        })
    }

    fn parse_parallel(&mut self) -> PResult<StmtKind> {
        self.advance(); // PARALLEL
        let timeout = if self.eat_keyword(Keyword::Timeout) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let body = self.parse_block(&[Keyword::EndParallel]);
        self.close_block(Keyword::EndParallel, "ENDPARALLEL");
        Ok(StmtKind::Parallel { timeout, body })
    }

    fn parse_connect(&mut self) -> PResult<StmtKind> {
        self.advance(); // CONNECT
        let device = self.expect_device_id()?;
        let transport = if self.eat_keyword(Keyword::Tcp) {
            Transport::Tcp
        } else if self.eat_keyword(Keyword::Serial) {
            Transport::Serial
        } else {
            self.expected("TCP or SERIAL");
            return Err(());
        };
        let address = self.parse_expr()?;
        let mut args = Vec::new();
        while self.starts_expression() {
            args.push(self.parse_expr()?);
        }
        Ok(StmtKind::Connect {
            device,
            transport,
            address,
            args,
        })
    }

    fn parse_disconnect(&mut self) -> PResult<StmtKind> {
        self.advance(); // DISCONNECT
        if self.eat_keyword(Keyword::All) {
            Ok(StmtKind::Disconnect { device: None })
        } else {
            Ok(StmtKind::Disconnect {
                device: Some(self.expect_device_id()?),
            })
        }
    }

    fn parse_send(&mut self) -> PResult<StmtKind> {
        self.advance(); // SEND
        // `SEND [id] expr`: the first token is a device id only when another
        // expression follows it.
        let device = self.take_leading_device_id();
        let command = self.parse_expr()?;
        Ok(StmtKind::Send { device, command })
    }

    fn parse_query(&mut self) -> PResult<StmtKind> {
        self.advance(); // QUERY
        // Forms: `QUERY cmd target` and `QUERY id cmd target`.  Parse up to
        // three leading expressions and decide from what follows.
        let first = self.parse_expr()?;
        if !self.starts_expression() {
            self.expected("a response variable after the QUERY command");
            return Err(());
        }
        let second = self.parse_expr()?;
        let (device, command, target) = if self.starts_expression() {
            let third = self.parse_expr()?;
            let device = expr_as_device_id(&first).ok_or_else(|| {
                self.error_here("QUERY device id must be an identifier or string");
            })?;
            let target = expr_as_ident(&third).ok_or_else(|| {
                self.error_here("QUERY response target must be a variable name");
            })?;
            (Some(device), second, target)
        } else {
            let target = expr_as_ident(&second).ok_or_else(|| {
                self.error_here("QUERY response target must be a variable name");
            })?;
            (None, first, target)
        };

        let timeout = if self.eat_keyword(Keyword::Timeout) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(StmtKind::Query {
            device,
            command,
            target,
            timeout,
        })
    }

    fn parse_relay(&mut self) -> PResult<StmtKind> {
        self.advance(); // RELAY
        let device = self.expect_device_id()?;
        let action = if self.eat_keyword(Keyword::Set) {
            let channel = self.parse_expr()?;
            let state = self.parse_relay_state()?;
            RelayAction::Set { channel, state }
        } else if self.eat_keyword(Keyword::Get) {
            let channel = self.parse_expr()?;
            let target = match self.peek_kind() {
                TokenKind::Ident(name) => {
                    let name = name.clone();
                    self.advance();
                    Some(name)
                }
                _ => None,
            };
            RelayAction::Get { channel, target }
        } else if self.eat_keyword(Keyword::Toggle) {
            RelayAction::Toggle {
                channel: self.parse_expr()?,
            }
        } else {
            self.expected("SET, GET, or TOGGLE after relay device");
            return Err(());
        };
        Ok(StmtKind::Relay { device, action })
    }

    /// Relay states accept the ON/OFF keywords as boolean literals.
    fn parse_relay_state(&mut self) -> PResult<Expr> {
        let pos = self.peek().pos;
        if self.eat_keyword(Keyword::On) {
            return Ok(Expr {
                kind: ExprKind::Bool(true),
                pos,
            });
        }
        if self.eat_keyword(Keyword::Off) {
            return Ok(Expr {
                kind: ExprKind::Bool(false),
                pos,
            });
        }
        self.parse_expr()
    }

    fn parse_function(&mut self) -> PResult<StmtKind> {
        self.advance(); // FUNCTION
        let name = self.expect_ident("function name")?;
        self.expect_kind(&TokenKind::LParen, "'(' after function name")?;
        let mut params = Vec::new();
        if !matches!(self.peek_kind(), TokenKind::RParen) {
            loop {
                params.push(self.expect_ident("parameter name")?);
                if !matches!(self.peek_kind(), TokenKind::Comma) {
                    break;
                }
                self.advance();
            }
        }
        self.expect_kind(&TokenKind::RParen, "')' after parameters")?;
        let body = self.parse_block(&[Keyword::EndFunction]);
        self.close_block(Keyword::EndFunction, "ENDFUNCTION");
        Ok(StmtKind::Function { name, params, body })
    }

    /// `name(args)` after the CALL keyword.
    fn parse_call_tail(&mut self) -> PResult<(String, Vec<Expr>)> {
        let name = self.expect_ident("function name after CALL")?;
        self.expect_kind(&TokenKind::LParen, "'(' after function name")?;
        let args = self.parse_expr_list(TokenKind::RParen)?;
        self.expect_kind(&TokenKind::RParen, "')' after arguments")?;
        Ok((name, args))
    }

    fn parse_test(&mut self) -> PResult<StmtKind> {
        self.advance(); // TEST
        let name = self.parse_expr()?;
        let body = self.parse_block(&[Keyword::EndTest]);
        self.close_block(Keyword::EndTest, "ENDTEST");
        Ok(StmtKind::Test { name, body })
    }

    fn parse_suite(&mut self) -> PResult<StmtKind> {
        self.advance(); // SUITE
        let name = self.parse_expr()?;
        let mut setup = None;
        let mut teardown = None;
        let mut tests = Vec::new();
        loop {
            self.skip_newlines();
            if self.at_eof() {
                self.expected("ENDSUITE");
                break;
            }
            if self.eat_keyword(Keyword::EndSuite) {
                break;
            }
            if self.eat_keyword(Keyword::Setup) {
                let body = self.parse_block(&[Keyword::EndSetup]);
                self.close_block(Keyword::EndSetup, "ENDSETUP");
                setup = Some(body);
            } else if self.eat_keyword(Keyword::Teardown) {
                let body = self.parse_block(&[Keyword::EndTeardown]);
                self.close_block(Keyword::EndTeardown, "ENDTEARDOWN");
                teardown = Some(body);
            } else if self.check_keyword(Keyword::Test) {
                let pos = self.peek().pos;
                let kind = self.parse_test()?;
                tests.push(Stmt { kind, pos });
            } else {
                self.expected("SETUP, TEARDOWN, TEST, or ENDSUITE inside a suite");
                // Consume the offending token so synchronization makes progress.
                self.advance();
                self.synchronize();
            }
        }
        Ok(StmtKind::Suite {
            name,
            setup,
            teardown,
            tests,
        })
    }

    fn parse_log(&mut self) -> PResult<StmtKind> {
        self.advance(); // LOG
        let level = match self.peek_kind() {
            TokenKind::Ident(name) => {
                let level = name.to_ascii_lowercase();
                self.advance();
                level
            }
            TokenKind::Str(s) => {
                let level = s.to_ascii_lowercase();
                self.advance();
                level
            }
            _ => {
                self.expected("a log level (e.g. INFO) after LOG");
                return Err(());
            }
        };
        let message = self.parse_expr()?;
        Ok(StmtKind::Log { level, message })
    }

    /// If the current token is a plausible device id AND an expression
    /// follows it, consume it as the device.
    fn take_leading_device_id(&mut self) -> Option<String> {
        let id = match self.peek_kind() {
            TokenKind::Ident(name) => name.clone(),
            TokenKind::Str(s) => s.clone(),
            _ => return None,
        };
        // Lookahead: does the token after the candidate id start an expression?
        let next = &self.tokens[(self.idx + 1).min(self.tokens.len() - 1)];
        if kind_starts_expression(&next.kind) {
            self.advance();
            Some(id)
        } else {
            None
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn starts_expression(&self) -> bool {
        kind_starts_expression(self.peek_kind())
    }

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut left = self.parse_and()?;
        while matches!(self.peek_kind(), TokenKind::OrOr) {
            let pos = left.pos;
            self.advance();
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right, pos);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut left = self.parse_equality()?;
        while matches!(self.peek_kind(), TokenKind::AndAnd) {
            let pos = left.pos;
            self.advance();
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right, pos);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                _ => break,
            };
            let pos = left.pos;
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right, pos);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Ge => BinaryOp::Ge,
                _ => break,
            };
            let pos = left.pos;
            self.advance();
            let right = self.parse_term()?;
            left = binary(op, left, right, pos);
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> PResult<Expr> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            let pos = left.pos;
            self.advance();
            let right = self.parse_factor()?;
            left = binary(op, left, right, pos);
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> PResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            let pos = left.pos;
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right, pos);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let pos = self.peek().pos;
        let op = match self.peek_kind() {
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Neg),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                pos,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::LBracket => {
                    let pos = expr.pos;
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect_kind(&TokenKind::RBracket, "']' after index")?;
                    expr = Expr {
                        kind: ExprKind::Index {
                            target: Box::new(expr),
                            index: Box::new(index),
                        },
                        pos,
                    };
                }
                TokenKind::Dot => {
                    let pos = expr.pos;
                    self.advance();
                    let name = self.expect_ident("field name after '.'")?;
                    expr = Expr {
                        kind: ExprKind::Field {
                            target: Box::new(expr),
                            name,
                        },
                        pos,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let pos = self.peek().pos;
        let kind = match self.peek_kind().clone() {
            TokenKind::Int(v) => {
                self.advance();
                ExprKind::Int(v)
            }
            TokenKind::Float(v) => {
                self.advance();
                ExprKind::Float(v)
            }
            TokenKind::Str(s) => {
                self.advance();
                ExprKind::Str(s)
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                ExprKind::Bool(true)
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                ExprKind::Bool(false)
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                ExprKind::Null
            }
            TokenKind::Keyword(Keyword::Call) => {
                self.advance();
                let (name, args) = self.parse_call_tail()?;
                ExprKind::Call { name, args }
            }
            TokenKind::Ident(name) => {
                self.advance();
                if matches!(self.peek_kind(), TokenKind::LParen) {
                    // Builtin call: an all-caps identifier applied to args.
                    self.advance();
                    let args = self.parse_expr_list(TokenKind::RParen)?;
                    self.expect_kind(&TokenKind::RParen, "')' after arguments")?;
                    ExprKind::Builtin { name, args }
                } else {
                    ExprKind::Ident(name)
                }
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect_kind(&TokenKind::RParen, "')' to close group")?;
                inner.kind
            }
            TokenKind::LBracket => {
                self.advance();
                let items = self.parse_expr_list(TokenKind::RBracket)?;
                self.expect_kind(&TokenKind::RBracket, "']' to close array")?;
                ExprKind::Array(items)
            }
            TokenKind::LBrace => {
                self.advance();
                let entries = self.parse_dict_entries()?;
                self.expect_kind(&TokenKind::RBrace, "'}' to close dictionary")?;
                ExprKind::Dict(entries)
            }
            _ => {
                self.expected("an expression");
                return Err(());
            }
        };
        Ok(Expr { kind, pos })
    }

    /// Comma-separated expressions up to (not consuming) `closer`.
    fn parse_expr_list(&mut self, closer: TokenKind) -> PResult<Vec<Expr>> {
        let mut items = Vec::new();
        self.skip_newlines();
        if *self.peek_kind() == closer {
            return Ok(items);
        }
        loop {
            items.push(self.parse_expr()?);
            self.skip_newlines();
            if matches!(self.peek_kind(), TokenKind::Comma) {
                self.advance();
                self.skip_newlines();
            } else {
                break;
            }
        }
        Ok(items)
    }

    fn parse_dict_entries(&mut self) -> PResult<Vec<(String, Expr)>> {
        let mut entries = Vec::new();
        self.skip_newlines();
        if matches!(self.peek_kind(), TokenKind::RBrace) {
            return Ok(entries);
        }
        loop {
            let key = match self.peek_kind() {
                TokenKind::Ident(name) => {
                    let key = name.clone();
                    self.advance();
                    key
                }
                TokenKind::Str(s) => {
                    let key = s.clone();
                    self.advance();
                    key
                }
                _ => {
                    self.expected("a dictionary key");
                    return Err(());
                }
            };
            self.expect_kind(&TokenKind::Colon, "':' after dictionary key")?;
            let value = self.parse_expr()?;
            entries.push((key, value));
            self.skip_newlines();
            if matches!(self.peek_kind(), TokenKind::Comma) {
                self.advance();
                self.skip_newlines();
            } else {
                break;
            }
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn binary(op: BinaryOp, left: Expr, right: Expr, pos: Position) -> Expr {
    Expr {
        kind: ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        pos,
    }
}

fn kind_starts_expression(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::Str(_)
            | TokenKind::Ident(_)
            | TokenKind::LParen
            | TokenKind::LBracket
            | TokenKind::LBrace
            | TokenKind::Minus
            | TokenKind::Bang
            | TokenKind::Keyword(Keyword::True)
            | TokenKind::Keyword(Keyword::False)
            | TokenKind::Keyword(Keyword::Null)
            | TokenKind::Keyword(Keyword::Call)
    )
}

fn expr_as_device_id(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(name.clone()),
        ExprKind::Str(s) => Some(s.clone()),
        _ => None,
    }
}

fn expr_as_ident(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(name.clone()),
        _ => None,
    }
}

/// Keywords that close or continue a block; the statement-end check treats
/// them like a boundary so block parsers can see them unconsumed.
fn is_block_boundary(kw: Keyword) -> bool {
    matches!(
        kw,
        Keyword::ElseIf
            | Keyword::Else
            | Keyword::EndIf
            | Keyword::EndLoop
            | Keyword::EndWhile
            | Keyword::EndForeach
            | Keyword::Catch
            | Keyword::Finally
            | Keyword::EndTry
            | Keyword::EndParallel
            | Keyword::EndFunction
            | Keyword::EndLibrary
            | Keyword::EndTest
            | Keyword::EndSuite
            | Keyword::Setup
            | Keyword::EndSetup
            | Keyword::Teardown
            | Keyword::EndTeardown
    )
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        let (program, errors) = parse(src);
        assert!(errors.is_empty(), "unexpected parse errors: {:#?}", errors);
        program
    }

    #[test]
    fn set_with_arithmetic_precedence() {
        let program = parse_ok("SET x 2 + 3 * 4");
        match &program.statements[0].kind {
            StmtKind::Set { name, index, value } => {
                assert_eq!(name, "x");
                assert!(index.is_none());
                // Must parse as 2 + (3 * 4).
                match &value.kind {
                    ExprKind::Binary { op, right, .. } => {
                        assert_eq!(*op, BinaryOp::Add);
                        assert!(matches!(
                            right.kind,
                            ExprKind::Binary {
                                op: BinaryOp::Mul,
                                ..
                            }
                        ));
                    }
                    other => panic!("expected binary add, got {:?}", other),
                }
            }
            other => panic!("expected Set, got {:?}", other),
        }
    }

    #[test]
    fn set_index_requires_adjacent_bracket() {
        let program = parse_ok("SET arr[0] = 5");
        assert!(matches!(
            &program.statements[0].kind,
            StmtKind::Set { index: Some(_), .. }
        ));

        // With whitespace, the bracket starts an array literal value.
        let program = parse_ok("SET arr [1, 2]");
        match &program.statements[0].kind {
            StmtKind::Set { index, value, .. } => {
                assert!(index.is_none());
                assert!(matches!(value.kind, ExprKind::Array(_)));
            }
            other => panic!("expected Set, got {:?}", other),
        }
    }

    #[test]
    fn optional_assign_in_set() {
        let a = parse_ok("SET x = 1");
        let b = parse_ok("SET x 1");
        assert_eq!(a.statements[0].kind, b.statements[0].kind);
    }

    #[test]
    fn if_elseif_else_chain() {
        let src = "IF a > 1\n SET r 1\nELSEIF a > 0\n SET r 2\nELSE\n SET r 3\nENDIF";
        let program = parse_ok(src);
        match &program.statements[0].kind {
            StmtKind::If {
                branches,
                else_body,
            } => {
                assert_eq!(branches.len(), 2);
                assert!(else_body.is_some());
            }
            other => panic!("expected If, got {:?}", other),
        }
    }

    #[test]
    fn loop_with_iteration_variable() {
        let program = parse_ok("LOOP 3 TIMES AS i\n SET a i\nENDLOOP");
        match &program.statements[0].kind {
            StmtKind::Loop { var, body, .. } => {
                assert_eq!(var.as_deref(), Some("i"));
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected Loop, got {:?}", other),
        }
    }

    #[test]
    fn foreach_with_index() {
        let program = parse_ok("FOREACH item IN xs AS idx\n LOG INFO item\nENDFOREACH");
        match &program.statements[0].kind {
            StmtKind::Foreach {
                name, index_var, ..
            } => {
                assert_eq!(name, "item");
                assert_eq!(index_var.as_deref(), Some("idx"));
            }
            other => panic!("expected Foreach, got {:?}", other),
        }
    }

    #[test]
    fn try_catch_finally() {
        let src = "TRY\n SET x 1 / 0\nCATCH e\n SET c e\nFINALLY\n SET f TRUE\nENDTRY";
        let program = parse_ok(src);
        match &program.statements[0].kind {
            StmtKind::Try {
                body,
                catch,
                finally,
            } => {
                assert_eq!(body.len(), 1);
                assert_eq!(catch.as_ref().unwrap().0, "e");
                assert!(finally.is_some());
            }
            other => panic!("expected Try, got {:?}", other),
        }
    }

    #[test]
    fn function_definition_and_expression_call() {
        let src = "FUNCTION add(a, b)\n RETURN a + b\nENDFUNCTION\nSET r CALL add(1, 2)";
        let program = parse_ok(src);
        assert!(matches!(
            &program.statements[0].kind,
            StmtKind::Function { params, .. } if params.len() == 2
        ));
        match &program.statements[1].kind {
            StmtKind::Set { value, .. } => {
                assert!(matches!(&value.kind, ExprKind::Call { name, args } if name == "add" && args.len() == 2));
            }
            other => panic!("expected Set, got {:?}", other),
        }
    }

    #[test]
    fn query_with_and_without_device() {
        let program = parse_ok("QUERY \"*IDN?\" resp");
        match &program.statements[0].kind {
            StmtKind::Query {
                device, target, ..
            } => {
                assert!(device.is_none());
                assert_eq!(target, "resp");
            }
            other => panic!("expected Query, got {:?}", other),
        }

        let program = parse_ok("QUERY \"DMM-01\" \"MEAS:VOLT:DC?\" volts TIMEOUT 2000");
        match &program.statements[0].kind {
            StmtKind::Query {
                device,
                target,
                timeout,
                ..
            } => {
                assert_eq!(device.as_deref(), Some("DMM-01"));
                assert_eq!(target, "volts");
                assert!(timeout.is_some());
            }
            other => panic!("expected Query, got {:?}", other),
        }
    }

    #[test]
    fn send_with_optional_device() {
        let program = parse_ok("SEND pump \"PUMP ON\"");
        assert!(matches!(
            &program.statements[0].kind,
            StmtKind::Send { device: Some(d), .. } if d == "pump"
        ));

        let program = parse_ok("SEND \"*RST\"");
        assert!(matches!(
            &program.statements[0].kind,
            StmtKind::Send { device: None, .. }
        ));
    }

    #[test]
    fn relay_forms() {
        let program = parse_ok("RELAY \"RELAY-01\" SET 3 ON\nRELAY board GET 2 state\nRELAY board TOGGLE 1");
        assert!(matches!(
            &program.statements[0].kind,
            StmtKind::Relay {
                action: RelayAction::Set { .. },
                ..
            }
        ));
        match &program.statements[1].kind {
            StmtKind::Relay {
                action: RelayAction::Get { target, .. },
                ..
            } => assert_eq!(target.as_deref(), Some("state")),
            other => panic!("expected Relay Get, got {:?}", other),
        }
        assert!(matches!(
            &program.statements[2].kind,
            StmtKind::Relay {
                action: RelayAction::Toggle { .. },
                ..
            }
        ));
    }

    #[test]
    fn suite_with_setup_teardown_and_tests() {
        let src = "SUITE \"smoke\"\nSETUP\n SET a 1\nENDSETUP\nTEARDOWN\n SET a 0\nENDTEARDOWN\nTEST \"one\"\n PASS \"ok\"\nENDTEST\nTEST \"two\"\n FAIL \"no\"\nENDTEST\nENDSUITE";
        let program = parse_ok(src);
        match &program.statements[0].kind {
            StmtKind::Suite {
                setup,
                teardown,
                tests,
                ..
            } => {
                assert!(setup.is_some());
                assert!(teardown.is_some());
                assert_eq!(tests.len(), 2);
            }
            other => panic!("expected Suite, got {:?}", other),
        }
    }

    #[test]
    fn dict_and_array_literals() {
        let program = parse_ok("SET cfg {host: \"10.0.0.5\", port: 6379, tags: [1, 2]}");
        match &program.statements[0].kind {
            StmtKind::Set { value, .. } => match &value.kind {
                ExprKind::Dict(entries) => {
                    assert_eq!(entries.len(), 3);
                    assert_eq!(entries[0].0, "host");
                }
                other => panic!("expected Dict, got {:?}", other),
            },
            other => panic!("expected Set, got {:?}", other),
        }
    }

    #[test]
    fn parallel_with_timeout() {
        let program = parse_ok("PARALLEL TIMEOUT 5000\n SEND a \"X\"\n SEND b \"Y\"\nENDPARALLEL");
        match &program.statements[0].kind {
            StmtKind::Parallel { timeout, body } => {
                assert!(timeout.is_some());
                assert_eq!(body.len(), 2);
            }
            other => panic!("expected Parallel, got {:?}", other),
        }
    }

    #[test]
    fn error_recovery_continues_to_next_statement() {
        let (program, errors) = parse("SET 42 1\nSET ok 7");
        assert_eq!(errors.len(), 1, "one error for the bad SET: {:?}", errors);
        assert!(errors[0].message.contains("variable name"));
        // The good statement still parses.
        assert_eq!(program.statements.len(), 1);
        assert!(matches!(
            &program.statements[0].kind,
            StmtKind::Set { name, .. } if name == "ok"
        ));
    }

    #[test]
    fn error_lists_are_deterministic() {
        let src = "SET 1\nWHILE\nENDWHILE\nSET b = = 2\n";
        let (_, e1) = parse(src);
        let (_, e2) = parse(src);
        assert!(!e1.is_empty());
        assert_eq!(e1, e2);
    }

    #[test]
    fn diagnostics_carry_source_context() {
        let (_, errors) = parse("SET ok 1\nSET 42 1");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 2);
        assert_eq!(errors[0].context, "SET 42 1");
    }

    #[test]
    fn unclosed_block_reports_missing_terminator() {
        let (_, errors) = parse("IF a > 1\n SET x 1\n");
        assert!(!errors.is_empty());
        assert!(errors.iter().any(|e| e.message.contains("ENDIF")));
    }

    #[test]
    fn connect_with_extra_args() {
        let program = parse_ok("CONNECT \"DMM-01\" TCP \"10.0.0.9\" 5025 500");
        match &program.statements[0].kind {
            StmtKind::Connect {
                device,
                transport,
                args,
                ..
            } => {
                assert_eq!(device, "DMM-01");
                assert_eq!(*transport, Transport::Tcp);
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected Connect, got {:?}", other),
        }
    }

    #[test]
    fn global_with_and_without_value() {
        let program = parse_ok("GLOBAL counter\nGLOBAL limit = 10\nGLOBAL base 2");
        assert!(matches!(
            &program.statements[0].kind,
            StmtKind::Global { value: None, .. }
        ));
        assert!(matches!(
            &program.statements[1].kind,
            StmtKind::Global { value: Some(_), .. }
        ));
        assert!(matches!(
            &program.statements[2].kind,
            StmtKind::Global { value: Some(_), .. }
        ));
    }

    #[test]
    fn field_access_and_indexing_chain() {
        let program = parse_ok("SET v data[0].name");
        match &program.statements[0].kind {
            StmtKind::Set { value, .. } => {
                assert!(matches!(&value.kind, ExprKind::Field { target, .. }
                    if matches!(target.kind, ExprKind::Index { .. })));
            }
            other => panic!("expected Set, got {:?}", other),
        }
    }
}
