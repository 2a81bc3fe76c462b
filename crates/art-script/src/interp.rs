//! AST-walking interpreter.
//!
//! Non-local transfers travel as `Flow` sentinels: BREAK/CONTINUE affect
//! the innermost loop, RETURN unwinds to the enclosing call, and
//! PASS/FAIL/SKIP (and failing ASSERT) terminate the enclosing TEST, which
//! is the only boundary that absorbs them.  Runtime errors propagate as
//! `Err` and are catchable by TRY/CATCH; uncaught errors inside a TEST
//! close that test with status `error` and the run proceeds.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error as log_error, info, warn};

use crate::ast::{BinaryOp, Expr, ExprKind, Program, RelayAction, Stmt, StmtKind, Transport};
use crate::collector::ResultCollector;
use crate::env::Environment;
use crate::error::RuntimeError;
use crate::router::DeviceRouter;
use crate::token::Position;
use crate::value::{self, Value};

/// Default QUERY/SEND timeout in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
/// Accepted `TIMEOUT` bounds.
const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 300_000;
/// Recursion guard for CALL.
const MAX_CALL_DEPTH: usize = 200;

// ---------------------------------------------------------------------------
// Control-flow sentinels
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
    /// Emitted by PASS/FAIL/SKIP and failing ASSERT; absorbed at the
    /// enclosing TEST boundary.
    TestTerminated,
}

type ExecResult = Result<Flow, RuntimeError>;
type EvalResult = Result<Value, RuntimeError>;

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

pub struct Interpreter<'p, C: ResultCollector> {
    env: Environment,
    router: Arc<dyn DeviceRouter>,
    collector: C,
    cancel: CancellationToken,
    functions: HashMap<&'p str, (&'p [String], &'p [Stmt])>,
    /// Device implied by the most recent CONNECT, used when SEND/QUERY omit
    /// the id.  This is not connection state; setup itself is external.
    default_device: Option<String>,
    call_depth: usize,
    /// Top-level statement cursor, exposed for session progress tracking.
    progress: Arc<AtomicUsize>,
}

impl<'p, C: ResultCollector> Interpreter<'p, C> {
    pub fn new(router: Arc<dyn DeviceRouter>, collector: C) -> Self {
        Interpreter {
            env: Environment::new(),
            router,
            collector,
            cancel: CancellationToken::new(),
            functions: HashMap::new(),
            default_device: None,
            call_depth: 0,
            progress: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Use an external cancellation token (session termination, e-stop).
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle for observing the top-level statement cursor.
    pub fn progress_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.progress)
    }

    /// Share an external counter as the statement cursor (e.g. a session
    /// record's script cursor).
    pub fn with_progress(mut self, progress: Arc<AtomicUsize>) -> Self {
        self.progress = progress;
        self
    }

    /// Recover the collector (e.g. to build the run report).
    pub fn into_collector(self) -> C {
        self.collector
    }

    /// Read a variable after execution; used by embedding code and tests.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.env.get(name)
    }

    /// Execute a whole program.  The first uncaught error outside a TEST
    /// stops the run, is reported to the collector, and is returned.
    pub async fn run(&mut self, program: &'p Program) -> Result<(), RuntimeError> {
        for (i, stmt) in program.statements.iter().enumerate() {
            self.progress.store(i, Ordering::Relaxed);
            match self.exec_stmt(stmt).await {
                Ok(Flow::Normal) => {}
                Ok(Flow::Return(_)) => break,
                Ok(Flow::Break) | Ok(Flow::Continue) => {
                    let err = RuntimeError::at(stmt.pos, "BREAK/CONTINUE outside a loop");
                    self.collector.error(&err.message);
                    return Err(err);
                }
                Ok(Flow::TestTerminated) => {
                    // PASS/FAIL/SKIP outside a TEST: the collector has
                    // already synthesized a record; keep going.
                }
                Err(e) => {
                    self.collector.error(&e.message);
                    return Err(e);
                }
            }
        }
        self.progress
            .store(program.statements.len(), Ordering::Relaxed);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn exec_block<'a>(&'a mut self, stmts: &'p [Stmt]) -> BoxFuture<'a, ExecResult>
    where
        'p: 'a,
    {
        async move {
            for stmt in stmts {
                match self.exec_stmt(stmt).await? {
                    Flow::Normal => {}
                    other => return Ok(other),
                }
            }
            Ok(Flow::Normal)
        }
        .boxed()
    }

    fn exec_stmt<'a>(&'a mut self, stmt: &'p Stmt) -> BoxFuture<'a, ExecResult>
    where
        'p: 'a,
    {
        async move {
            if self.cancel.is_cancelled() {
                return Err(RuntimeError::at(stmt.pos, "script cancelled"));
            }
            let pos = stmt.pos;
            match &stmt.kind {
                StmtKind::Set { name, index, value } => {
                    let v = self.eval_expr(value).await?;
                    match index {
                        None => self.env_set(name, v, pos)?,
                        Some(index) => {
                            let idx = self.eval_expr(index).await?;
                            self.set_indexed(name, idx, v, pos)?;
                        }
                    }
                    Ok(Flow::Normal)
                }
                StmtKind::Const { name, value } => {
                    let v = self.eval_expr(value).await?;
                    self.env
                        .set_const(name, v)
                        .map_err(|e| RuntimeError::at(pos, e.to_string()))?;
                    Ok(Flow::Normal)
                }
                StmtKind::Global { name, value } => {
                    match value {
                        Some(expr) => {
                            let v = self.eval_expr(expr).await?;
                            self.env
                                .set_global(name, v)
                                .map_err(|e| RuntimeError::at(pos, e.to_string()))?;
                        }
                        None => {
                            if !self.env.exists(name) {
                                self.env
                                    .set_global(name, Value::Null)
                                    .map_err(|e| RuntimeError::at(pos, e.to_string()))?;
                            }
                        }
                    }
                    Ok(Flow::Normal)
                }
                StmtKind::Delete { name } => {
                    self.env
                        .delete(name)
                        .map_err(|e| RuntimeError::at(pos, e.to_string()))?;
                    Ok(Flow::Normal)
                }
                StmtKind::Append { name, value } => {
                    let v = self.eval_expr(value).await?;
                    let mut arr = self.get_array(name, "APPEND", pos)?;
                    arr.push(v);
                    self.env_set(name, Value::Array(arr), pos)?;
                    Ok(Flow::Normal)
                }
                StmtKind::Extend { name, value } => {
                    let v = self.eval_expr(value).await?;
                    let tail = match v {
                        Value::Array(items) => items,
                        other => {
                            return Err(RuntimeError::at(
                                pos,
                                format!(
                                    "EXTEND requires an array value, got {}",
                                    other.type_name()
                                ),
                            ));
                        }
                    };
                    let mut arr = self.get_array(name, "EXTEND", pos)?;
                    arr.extend(tail);
                    self.env_set(name, Value::Array(arr), pos)?;
                    Ok(Flow::Normal)
                }
                StmtKind::Reserve { name, size } => {
                    let size = self.eval_expr(size).await?;
                    let n = match size {
                        Value::Int(n) if n >= 0 => n as usize,
                        other => {
                            return Err(RuntimeError::at(
                                pos,
                                format!(
                                    "RESERVE size must be a non-negative integer, got {}",
                                    other
                                ),
                            ));
                        }
                    };
                    self.env_set(name, Value::Array(vec![Value::Null; n]), pos)?;
                    Ok(Flow::Normal)
                }
                StmtKind::If {
                    branches,
                    else_body,
                } => {
                    for (cond, body) in branches {
                        let c = self.eval_expr(cond).await?;
                        if c.is_truthy() {
                            return self.exec_scoped(body).await;
                        }
                    }
                    if let Some(body) = else_body {
                        return self.exec_scoped(body).await;
                    }
                    Ok(Flow::Normal)
                }
                StmtKind::Loop { count, var, body } => {
                    let count = self.eval_expr(count).await?;
                    let n = match count {
                        Value::Int(n) => n.max(0),
                        other => {
                            return Err(RuntimeError::at(
                                pos,
                                format!("LOOP count must be an integer, got {}", other.type_name()),
                            ));
                        }
                    };
                    self.env.push_scope();
                    let mut result = Ok(Flow::Normal);
                    'iterations: for i in 0..n {
                        if self.cancel.is_cancelled() {
                            result = Err(RuntimeError::at(pos, "script cancelled"));
                            break;
                        }
                        if let Some(var) = var {
                            if let Err(e) = self.env.set_local(var, Value::Int(i)) {
                                result = Err(RuntimeError::at(pos, e.to_string()));
                                break;
                            }
                        }
                        match self.exec_block(body).await {
                            Ok(Flow::Normal) | Ok(Flow::Continue) => {}
                            Ok(Flow::Break) => break 'iterations,
                            other => {
                                result = other;
                                break;
                            }
                        }
                    }
                    self.env.pop_scope();
                    result
                }
                StmtKind::While { cond, body } => {
                    self.env.push_scope();
                    let mut result = Ok(Flow::Normal);
                    loop {
                        if self.cancel.is_cancelled() {
                            result = Err(RuntimeError::at(pos, "script cancelled"));
                            break;
                        }
                        let c = match self.eval_expr(cond).await {
                            Ok(c) => c,
                            Err(e) => {
                                result = Err(e);
                                break;
                            }
                        };
                        if !c.is_truthy() {
                            break;
                        }
                        match self.exec_block(body).await {
                            Ok(Flow::Normal) | Ok(Flow::Continue) => {}
                            Ok(Flow::Break) => break,
                            other => {
                                result = other;
                                break;
                            }
                        }
                    }
                    self.env.pop_scope();
                    result
                }
                StmtKind::Foreach {
                    name,
                    collection,
                    index_var,
                    body,
                } => {
                    let collection = self.eval_expr(collection).await?;
                    let items = match collection {
                        Value::Array(items) => items,
                        other => {
                            return Err(RuntimeError::at(
                                pos,
                                format!("FOREACH requires an array, got {}", other.type_name()),
                            ));
                        }
                    };
                    self.env.push_scope();
                    let mut result = Ok(Flow::Normal);
                    'items: for (i, item) in items.into_iter().enumerate() {
                        if self.cancel.is_cancelled() {
                            result = Err(RuntimeError::at(pos, "script cancelled"));
                            break;
                        }
                        if let Err(e) = self.env.set_local(name, item) {
                            result = Err(RuntimeError::at(pos, e.to_string()));
                            break;
                        }
                        if let Some(index_var) = index_var {
                            if let Err(e) = self.env.set_local(index_var, Value::Int(i as i64)) {
                                result = Err(RuntimeError::at(pos, e.to_string()));
                                break;
                            }
                        }
                        match self.exec_block(body).await {
                            Ok(Flow::Normal) | Ok(Flow::Continue) => {}
                            Ok(Flow::Break) => break 'items,
                            other => {
                                result = other;
                                break;
                            }
                        }
                    }
                    self.env.pop_scope();
                    result
                }
                StmtKind::Break => Ok(Flow::Break),
                StmtKind::Continue => Ok(Flow::Continue),
                StmtKind::Try {
                    body,
                    catch,
                    finally,
                } => {
                    let mut result = self.exec_scoped(body).await;
                    if let Err(e) = &result {
                        if let Some((var, catch_body)) = catch {
                            let message = e.message.clone();
                            self.env.push_scope();
                            let bound = self.env.set_local(var, Value::Str(message));
                            result = match bound {
                                Ok(()) => self.exec_block(catch_body).await,
                                Err(e) => Err(RuntimeError::at(pos, e.to_string())),
                            };
                            self.env.pop_scope();
                        }
                    }
                    if let Some(finally_body) = finally {
                        match self.exec_scoped(finally_body).await {
                            Ok(Flow::Normal) => {}
                            // A non-normal outcome in FINALLY takes over.
                            other => return other,
                        }
                    }
                    result
                }
                StmtKind::Parallel { timeout, body } => {
                    let budget = match timeout {
                        Some(expr) => {
                            let v = self.eval_expr(expr).await?;
                            Some(self.timeout_from_value(v, pos)?)
                        }
                        None => None,
                    };
                    let deadline = budget.map(|ms| Instant::now() + Duration::from_millis(ms));
                    self.env.push_scope();
                    let mut result = Ok(Flow::Normal);
                    for child in body {
                        let outcome = match deadline {
                            Some(deadline) => {
                                match tokio::time::timeout_at(deadline, self.exec_stmt(child))
                                    .await
                                {
                                    Ok(outcome) => outcome,
                                    Err(_) => Err(RuntimeError::at(
                                        child.pos,
                                        "PARALLEL block exceeded its timeout",
                                    )),
                                }
                            }
                            None => self.exec_stmt(child).await,
                        };
                        match outcome {
                            Ok(Flow::Normal) => {}
                            other => {
                                result = other;
                                break;
                            }
                        }
                    }
                    self.env.pop_scope();
                    result
                }
                StmtKind::Connect {
                    device,
                    transport,
                    address,
                    args,
                } => {
                    let address = self.eval_expr(address).await?;
                    let mut extras = Vec::with_capacity(args.len());
                    for arg in args {
                        extras.push(self.eval_expr(arg).await?.to_string());
                    }
                    let transport = match transport {
                        Transport::Tcp => "tcp",
                        Transport::Serial => "serial",
                    };
                    info!(
                        device = %device,
                        transport = %transport,
                        address = %address,
                        args = ?extras,
                        "CONNECT forwarded to device setup"
                    );
                    self.default_device = Some(device.clone());
                    Ok(Flow::Normal)
                }
                StmtKind::Disconnect { device } => {
                    match device {
                        Some(device) => {
                            info!(device = %device, "DISCONNECT forwarded to device setup");
                            if self.default_device.as_deref() == Some(device) {
                                self.default_device = None;
                            }
                        }
                        None => {
                            info!("DISCONNECT ALL forwarded to device setup");
                            self.default_device = None;
                        }
                    }
                    Ok(Flow::Normal)
                }
                StmtKind::Send { device, command } => {
                    let device = self.resolve_device(device, pos)?;
                    let command = self.eval_expr(command).await?.to_string();
                    // Response content is ignored; errors surface.
                    self.route(&device, &command, BTreeMap::new(), DEFAULT_TIMEOUT_MS, pos)
                        .await?;
                    Ok(Flow::Normal)
                }
                StmtKind::Query {
                    device,
                    command,
                    target,
                    timeout,
                } => {
                    let device = self.resolve_device(device, pos)?;
                    let command = self.eval_expr(command).await?.to_string();
                    let timeout_ms = match timeout {
                        Some(expr) => {
                            let v = self.eval_expr(expr).await?;
                            self.timeout_from_value(v, pos)?
                        }
                        None => DEFAULT_TIMEOUT_MS,
                    };
                    let outcome = self
                        .route(&device, &command, BTreeMap::new(), timeout_ms, pos)
                        .await?;
                    let response = outcome.response.unwrap_or_default();
                    self.env_set(target, Value::Str(response), pos)?;
                    Ok(Flow::Normal)
                }
                StmtKind::Relay { device, action } => {
                    let device = self.resolve_device_name(device);
                    let mut params = BTreeMap::new();
                    let (command, target) = match action {
                        RelayAction::Set { channel, state } => {
                            let channel = self.eval_expr(channel).await?;
                            let state = self.eval_expr(state).await?;
                            params.insert("channel".to_owned(), channel.to_string());
                            params.insert(
                                "state".to_owned(),
                                if state.is_truthy() { "on" } else { "off" }.to_owned(),
                            );
                            ("relay_set", None)
                        }
                        RelayAction::Get { channel, target } => {
                            let channel = self.eval_expr(channel).await?;
                            params.insert("channel".to_owned(), channel.to_string());
                            ("relay_get", target.clone())
                        }
                        RelayAction::Toggle { channel } => {
                            let channel = self.eval_expr(channel).await?;
                            params.insert("channel".to_owned(), channel.to_string());
                            ("relay_toggle", None)
                        }
                    };
                    let outcome = self
                        .route(&device, command, params, DEFAULT_TIMEOUT_MS, pos)
                        .await?;
                    if let Some(target) = target {
                        let response = outcome.response.unwrap_or_default();
                        self.env_set(&target, Value::Str(response), pos)?;
                    }
                    Ok(Flow::Normal)
                }
                StmtKind::Function { name, params, body } => {
                    self.functions
                        .insert(name.as_str(), (params.as_slice(), body.as_slice()));
                    Ok(Flow::Normal)
                }
                StmtKind::Call { name, args } => {
                    self.call_function(name, args, pos).await?;
                    Ok(Flow::Normal)
                }
                StmtKind::Return { value } => {
                    let v = match value {
                        Some(expr) => self.eval_expr(expr).await?,
                        None => Value::Null,
                    };
                    Ok(Flow::Return(v))
                }
                StmtKind::Import { path } => {
                    let path = self.eval_expr(path).await?;
                    info!(path = %path, "IMPORT ignored (library loading is external)");
                    Ok(Flow::Normal)
                }
                StmtKind::Library { name, .. } => {
                    let name = self.eval_expr(name).await?;
                    info!(library = %name, "LIBRARY block ignored (library loading is external)");
                    Ok(Flow::Normal)
                }
                StmtKind::Test { name, body } => {
                    let name = self.eval_expr(name).await?.to_string();
                    self.collector.test_start(&name);
                    debug!(test = %name, "test started");
                    match self.exec_scoped(body).await {
                        Ok(Flow::Normal) => {
                            self.collector.test_pass(None);
                            Ok(Flow::Normal)
                        }
                        Ok(Flow::TestTerminated) => Ok(Flow::Normal),
                        Ok(other) => {
                            // RETURN/BREAK leaving a test: the body ran
                            // without failing, record pass and propagate.
                            self.collector.test_pass(None);
                            Ok(other)
                        }
                        Err(e) => {
                            warn!(test = %name, error = %e.message, "test errored");
                            self.collector.test_error(&e.message);
                            Ok(Flow::Normal)
                        }
                    }
                }
                StmtKind::Suite {
                    name,
                    setup,
                    teardown,
                    tests,
                } => {
                    let name = self.eval_expr(name).await?.to_string();
                    self.collector.suite_enter(&name);
                    let mut pending: Option<Flow> = None;
                    for test in tests {
                        let mut setup_ok = true;
                        if let Some(setup_body) = setup {
                            match self.exec_scoped(setup_body).await {
                                Ok(Flow::Normal) => {}
                                Ok(_) => {}
                                Err(e) => {
                                    setup_ok = false;
                                    self.collector
                                        .error(&format!("suite '{}' setup failed: {}", name, e));
                                }
                            }
                        }
                        if setup_ok {
                            match self.exec_stmt(test).await {
                                Ok(Flow::Normal) => {}
                                Ok(other) => pending = Some(other),
                                Err(e) => {
                                    self.run_teardown(teardown, &name).await;
                                    self.collector.suite_leave(&name);
                                    return Err(e);
                                }
                            }
                        }
                        self.run_teardown(teardown, &name).await;
                        if pending.is_some() {
                            break;
                        }
                    }
                    self.collector.suite_leave(&name);
                    Ok(pending.unwrap_or(Flow::Normal))
                }
                StmtKind::Pass { message } => {
                    let message = self.eval_expr(message).await?.to_string();
                    self.collector.test_pass(Some(&message));
                    Ok(Flow::TestTerminated)
                }
                StmtKind::Fail { message } => {
                    let message = self.eval_expr(message).await?.to_string();
                    self.collector.test_fail(Some(&message));
                    Ok(Flow::TestTerminated)
                }
                StmtKind::Skip { message } => {
                    let message = self.eval_expr(message).await?.to_string();
                    self.collector.test_skip(Some(&message));
                    Ok(Flow::TestTerminated)
                }
                StmtKind::Assert { cond, message } => {
                    let c = self.eval_expr(cond).await?;
                    let message = match message {
                        Some(expr) => self.eval_expr(expr).await?.to_string(),
                        None => format!("assertion at line {}", pos.line),
                    };
                    if c.is_truthy() {
                        self.collector.assertion(true, &message);
                        Ok(Flow::Normal)
                    } else {
                        self.collector.assertion(false, &message);
                        self.collector.test_fail(Some(&message));
                        Ok(Flow::TestTerminated)
                    }
                }
                StmtKind::Log { level, message } => {
                    let message = self.eval_expr(message).await?.to_string();
                    match level.as_str() {
                        "debug" => debug!(script = true, "{}", message),
                        "warn" | "warning" => warn!(script = true, "{}", message),
                        "error" => log_error!(script = true, "{}", message),
                        _ => info!(script = true, "{}", message),
                    }
                    Ok(Flow::Normal)
                }
                StmtKind::Delay { ms } => {
                    let ms = match self.eval_expr(ms).await? {
                        Value::Int(n) if n >= 0 => n as u64,
                        Value::Float(f) if f >= 0.0 => f as u64,
                        other => {
                            return Err(RuntimeError::at(
                                pos,
                                format!("DELAY requires a non-negative number, got {}", other),
                            ));
                        }
                    };
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            Err(RuntimeError::at(pos, "script cancelled"))
                        }
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(Flow::Normal),
                    }
                }
            }
        }
        .boxed()
    }

    /// Execute a block inside a fresh lexical scope, popping it on all paths.
    async fn exec_scoped(&mut self, stmts: &'p [Stmt]) -> ExecResult {
        self.env.push_scope();
        let result = self.exec_block(stmts).await;
        self.env.pop_scope();
        result
    }

    async fn run_teardown(&mut self, teardown: &'p Option<Vec<Stmt>>, suite: &str) {
        if let Some(body) = teardown {
            match self.exec_scoped(body).await {
                Ok(_) => {}
                Err(e) => self
                    .collector
                    .error(&format!("suite '{}' teardown failed: {}", suite, e)),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    fn call_function<'a>(
        &'a mut self,
        name: &'p str,
        args: &'p [Expr],
        pos: Position,
    ) -> BoxFuture<'a, EvalResult>
    where
        'p: 'a,
    {
        async move {
            let (params, body) = match self.functions.get(name) {
                Some(&entry) => entry,
                None => {
                    return Err(RuntimeError::at(
                        pos,
                        format!("undefined function '{}'", name),
                    ));
                }
            };
            if params.len() != args.len() {
                return Err(RuntimeError::at(
                    pos,
                    format!(
                        "function '{}' expects {} argument(s), got {}",
                        name,
                        params.len(),
                        args.len()
                    ),
                ));
            }
            if self.call_depth >= MAX_CALL_DEPTH {
                return Err(RuntimeError::at(
                    pos,
                    format!("maximum call depth exceeded in '{}'", name),
                ));
            }

            // Arguments evaluate in the caller's scope.
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(self.eval_expr(arg).await?);
            }

            self.call_depth += 1;
            self.env.push_function_scope();
            let mut bind_err = None;
            for (param, value) in params.iter().zip(values) {
                if let Err(e) = self.env.set_local(param, value) {
                    bind_err = Some(RuntimeError::at(pos, e.to_string()));
                    break;
                }
            }
            let result = match bind_err {
                Some(e) => Err(e),
                None => self.exec_block(body).await,
            };
            self.env.pop_function_scope();
            self.call_depth -= 1;

            match result? {
                Flow::Return(value) => Ok(value),
                Flow::Normal => Ok(Value::Null),
                Flow::Break | Flow::Continue => Err(RuntimeError::at(
                    pos,
                    format!("BREAK/CONTINUE escaped function '{}'", name),
                )),
                Flow::TestTerminated => Err(RuntimeError::at(
                    pos,
                    format!("PASS/FAIL/SKIP inside function '{}' has no enclosing TEST", name),
                )),
            }
        }
        .boxed()
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn eval_expr<'a>(&'a mut self, expr: &'p Expr) -> BoxFuture<'a, EvalResult>
    where
        'p: 'a,
    {
        async move {
            let pos = expr.pos;
            match &expr.kind {
                ExprKind::Int(v) => Ok(Value::Int(*v)),
                ExprKind::Float(v) => Ok(Value::Float(*v)),
                ExprKind::Str(s) => Ok(Value::Str(s.clone())),
                ExprKind::Bool(b) => Ok(Value::Bool(*b)),
                ExprKind::Null => Ok(Value::Null),
                ExprKind::Ident(name) => self
                    .env
                    .get(name)
                    .cloned()
                    .ok_or_else(|| {
                        RuntimeError::at(pos, format!("undefined variable '{}'", name))
                    }),
                ExprKind::Array(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval_expr(item).await?);
                    }
                    Ok(Value::Array(values))
                }
                ExprKind::Dict(entries) => {
                    let mut map = BTreeMap::new();
                    for (key, value) in entries {
                        let v = self.eval_expr(value).await?;
                        map.insert(key.clone(), v);
                    }
                    Ok(Value::Dict(map))
                }
                ExprKind::Unary { op, operand } => {
                    let v = self.eval_expr(operand).await?;
                    value::unary_op(*op, &v).map_err(|e| RuntimeError::at(pos, e.message))
                }
                ExprKind::Binary { op, left, right } => {
                    // Short-circuit logical operators on truthiness.
                    match op {
                        BinaryOp::And => {
                            let l = self.eval_expr(left).await?;
                            if !l.is_truthy() {
                                return Ok(Value::Bool(false));
                            }
                            let r = self.eval_expr(right).await?;
                            Ok(Value::Bool(r.is_truthy()))
                        }
                        BinaryOp::Or => {
                            let l = self.eval_expr(left).await?;
                            if l.is_truthy() {
                                return Ok(Value::Bool(true));
                            }
                            let r = self.eval_expr(right).await?;
                            Ok(Value::Bool(r.is_truthy()))
                        }
                        _ => {
                            let l = self.eval_expr(left).await?;
                            let r = self.eval_expr(right).await?;
                            value::binary_op(*op, &l, &r)
                                .map_err(|e| RuntimeError::at(pos, e.message))
                        }
                    }
                }
                ExprKind::Index { target, index } => {
                    let target = self.eval_expr(target).await?;
                    let index = self.eval_expr(index).await?;
                    index_value(&target, &index, pos)
                }
                ExprKind::Field { target, name } => {
                    let target = self.eval_expr(target).await?;
                    match target {
                        Value::Dict(map) => map.get(name).cloned().ok_or_else(|| {
                            RuntimeError::at(pos, format!("undefined key '{}'", name))
                        }),
                        other => Err(RuntimeError::at(
                            pos,
                            format!("field access requires a dict, got {}", other.type_name()),
                        )),
                    }
                }
                ExprKind::Builtin { name, args } => self.eval_builtin(name, args, pos).await,
                ExprKind::Call { name, args } => self.call_function(name, args, pos).await,
            }
        }
        .boxed()
    }

    async fn eval_builtin(&mut self, name: &'p str, args: &'p [Expr], pos: Position) -> EvalResult {
        // EXISTS suppresses the not-found error, so its argument is not
        // evaluated normally.
        if name == "EXISTS" {
            if args.len() != 1 {
                return Err(RuntimeError::at(pos, "EXISTS expects one argument"));
            }
            return match &args[0].kind {
                ExprKind::Ident(var) => Ok(Value::Bool(self.env.exists(var))),
                ExprKind::Str(var) => Ok(Value::Bool(self.env.exists(var))),
                _ => Err(RuntimeError::at(pos, "EXISTS expects a variable name")),
            };
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval_expr(arg).await?);
        }
        let one = |values: &[Value]| -> Result<Value, RuntimeError> {
            if values.len() != 1 {
                return Err(RuntimeError::at(
                    pos,
                    format!("{} expects one argument, got {}", name, values.len()),
                ));
            }
            Ok(values[0].clone())
        };

        match name {
            "FLOAT" => value::to_float(&one(&values)?).map_err(|e| RuntimeError::at(pos, e.message)),
            "INT" => value::to_int(&one(&values)?).map_err(|e| RuntimeError::at(pos, e.message)),
            "STRING" => Ok(value::to_string_value(&one(&values)?)),
            "BOOL" => Ok(value::to_bool(&one(&values)?)),
            "LENGTH" => value::length(&one(&values)?).map_err(|e| RuntimeError::at(pos, e.message)),
            "TYPE" => Ok(Value::Str(one(&values)?.type_name().to_owned())),
            "NOW" => {
                if !values.is_empty() {
                    return Err(RuntimeError::at(pos, "NOW expects no arguments"));
                }
                Ok(Value::Str(Utc::now().to_rfc3339()))
            }
            other => Err(RuntimeError::at(pos, format!("unknown builtin '{}'", other))),
        }
    }

    // -----------------------------------------------------------------------
    // Device I/O helpers
    // -----------------------------------------------------------------------

    /// A bare-identifier device id that names a bound string variable (e.g.
    /// `CONST PUMP "PUMP-01"` then `QUERY PUMP ...`) resolves to its value;
    /// anything else is taken literally.
    fn resolve_device_name(&self, name: &str) -> String {
        match self.env.get(name) {
            Some(Value::Str(s)) => s.clone(),
            _ => name.to_owned(),
        }
    }

    fn resolve_device(
        &self,
        explicit: &Option<String>,
        pos: Position,
    ) -> Result<String, RuntimeError> {
        let name = match explicit {
            Some(device) => device.clone(),
            None => self.default_device.clone().ok_or_else(|| {
                RuntimeError::at(pos, "no device specified and no prior CONNECT names one")
            })?,
        };
        Ok(self.resolve_device_name(&name))
    }

    fn timeout_from_value(&self, v: Value, pos: Position) -> Result<u64, RuntimeError> {
        let ms = match v {
            Value::Int(n) if n > 0 => n as u64,
            Value::Float(f) if f > 0.0 => f as u64,
            other => {
                return Err(RuntimeError::at(
                    pos,
                    format!("TIMEOUT must be a positive number of milliseconds, got {}", other),
                ));
            }
        };
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&ms) {
            return Err(RuntimeError::at(
                pos,
                format!(
                    "TIMEOUT {} ms outside [{}, {}]",
                    ms, MIN_TIMEOUT_MS, MAX_TIMEOUT_MS
                ),
            ));
        }
        Ok(ms)
    }

    async fn route(
        &mut self,
        device: &str,
        command: &str,
        params: BTreeMap<String, String>,
        timeout_ms: u64,
        pos: Position,
    ) -> Result<crate::router::CommandOutcome, RuntimeError> {
        let router = Arc::clone(&self.router);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(RuntimeError::at(pos, "script cancelled"));
            }
            result = router.send(device, command, &params, timeout_ms) => result,
        };
        match result {
            Ok(outcome) => {
                self.collector.command(
                    device,
                    command,
                    true,
                    outcome.response.as_deref(),
                    outcome.duration_ms,
                );
                Ok(outcome)
            }
            Err(e) => {
                self.collector.command(device, command, false, None, 0);
                Err(RuntimeError::at(pos, e.to_string()))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Environment helpers
    // -----------------------------------------------------------------------

    fn env_set(&mut self, name: &str, value: Value, pos: Position) -> Result<(), RuntimeError> {
        self.env
            .set(name, value)
            .map_err(|e| RuntimeError::at(pos, e.to_string()))
    }

    fn get_array(
        &self,
        name: &str,
        op: &str,
        pos: Position,
    ) -> Result<Vec<Value>, RuntimeError> {
        match self.env.get(name) {
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(other) => Err(RuntimeError::at(
                pos,
                format!("{} requires an array target, '{}' is {}", op, name, other.type_name()),
            )),
            None => Err(RuntimeError::at(pos, format!("undefined variable '{}'", name))),
        }
    }

    fn set_indexed(
        &mut self,
        name: &str,
        index: Value,
        value: Value,
        pos: Position,
    ) -> Result<(), RuntimeError> {
        let current = self
            .env
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::at(pos, format!("undefined variable '{}'", name)))?;
        let updated = match (current, index) {
            (Value::Array(mut items), Value::Int(i)) => {
                if i < 0 || i as usize >= items.len() {
                    return Err(RuntimeError::at(
                        pos,
                        format!("array index {} out of range (length {})", i, items.len()),
                    ));
                }
                items[i as usize] = value;
                Value::Array(items)
            }
            (Value::Dict(mut map), Value::Str(key)) => {
                map.insert(key, value);
                Value::Dict(map)
            }
            (target, index) => {
                return Err(RuntimeError::at(
                    pos,
                    format!(
                        "cannot index {} with {}",
                        target.type_name(),
                        index.type_name()
                    ),
                ));
            }
        };
        self.env_set(name, updated, pos)
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn index_value(target: &Value, index: &Value, pos: Position) -> EvalResult {
    match (target, index) {
        (Value::Array(items), Value::Int(i)) => {
            if *i < 0 || *i as usize >= items.len() {
                return Err(RuntimeError::at(
                    pos,
                    format!("array index {} out of range (length {})", i, items.len()),
                ));
            }
            Ok(items[*i as usize].clone())
        }
        (Value::Dict(map), Value::Str(key)) => map.get(key).cloned().ok_or_else(|| {
            RuntimeError::at(pos, format!("undefined key '{}'", key))
        }),
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            if *i < 0 || *i as usize >= chars.len() {
                return Err(RuntimeError::at(
                    pos,
                    format!("string index {} out of range (length {})", i, chars.len()),
                ));
            }
            Ok(Value::Str(chars[*i as usize].to_string()))
        }
        (target, index) => Err(RuntimeError::at(
            pos,
            format!(
                "cannot index {} with {}",
                target.type_name(),
                index.type_name()
            ),
        )),
    }
}
