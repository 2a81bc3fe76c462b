//! Test-result collection.
//!
//! The interpreter drives an opaque `ResultCollector` through lifecycle
//! callbacks; `ReportCollector` is the standard implementation, building a
//! `RunReport` with per-suite and overall summaries.

use std::time::{Duration, Instant};

use serde::Serialize;

// ---------------------------------------------------------------------------
// Collector trait
// ---------------------------------------------------------------------------

/// Lifecycle callbacks invoked by the interpreter.
///
/// If a pass/fail/skip arrives without a preceding `test_start`, the
/// implementation must create a synthetic test record.
pub trait ResultCollector: Send {
    fn suite_enter(&mut self, name: &str);
    fn suite_leave(&mut self, name: &str);
    fn test_start(&mut self, name: &str);
    fn test_pass(&mut self, message: Option<&str>);
    fn test_fail(&mut self, message: Option<&str>);
    fn test_skip(&mut self, message: Option<&str>);
    fn test_error(&mut self, message: &str);
    fn assertion(&mut self, passed: bool, message: &str);
    fn command(
        &mut self,
        device: &str,
        command: &str,
        success: bool,
        response: Option<&str>,
        duration_ms: u64,
    );
    /// A run-level error outside any test.
    fn error(&mut self, message: &str);
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl TestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TestOutcome::Passed => "passed",
            TestOutcome::Failed => "failed",
            TestOutcome::Skipped => "skipped",
            TestOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssertionRecord {
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub device: String,
    pub command: String,
    pub success: bool,
    pub response: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestRecord {
    pub name: String,
    /// Enclosing suite, if any.
    pub suite: Option<String>,
    pub outcome: TestOutcome,
    pub message: Option<String>,
    pub assertions: Vec<AssertionRecord>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl Tally {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped + self.errors
    }

    fn record(&mut self, outcome: TestOutcome) {
        match outcome {
            TestOutcome::Passed => self.passed += 1,
            TestOutcome::Failed => self.failed += 1,
            TestOutcome::Skipped => self.skipped += 1,
            TestOutcome::Error => self.errors += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteSummary {
    pub name: String,
    pub tally: Tally,
}

/// The finished run report.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub tests: Vec<TestRecord>,
    pub suites: Vec<SuiteSummary>,
    pub commands: Vec<CommandRecord>,
    /// Run-level errors reported outside any test.
    pub run_errors: Vec<String>,
    pub overall: Tally,
    pub duration: Duration,
}

impl RunReport {
    /// True when no test failed or errored and no run-level error occurred.
    pub fn success(&self) -> bool {
        self.overall.failed == 0 && self.overall.errors == 0 && self.run_errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ReportCollector
// ---------------------------------------------------------------------------

struct OpenTest {
    name: String,
    suite: Option<String>,
    assertions: Vec<AssertionRecord>,
    started: Instant,
}

/// Standard collector: accumulates records and produces a `RunReport`.
pub struct ReportCollector {
    started: Instant,
    tests: Vec<TestRecord>,
    commands: Vec<CommandRecord>,
    run_errors: Vec<String>,
    suite_stack: Vec<String>,
    suite_summaries: Vec<SuiteSummary>,
    current: Option<OpenTest>,
}

impl Default for ReportCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportCollector {
    pub fn new() -> Self {
        ReportCollector {
            started: Instant::now(),
            tests: Vec::new(),
            commands: Vec::new(),
            run_errors: Vec::new(),
            suite_stack: Vec::new(),
            suite_summaries: Vec::new(),
            current: None,
        }
    }

    /// Consume the collector and build the report.
    pub fn finish(mut self) -> RunReport {
        // A test left open (e.g. the run was cancelled) closes as an error.
        if self.current.is_some() {
            self.close(TestOutcome::Error, Some("test did not complete"));
        }
        let mut overall = Tally::default();
        for test in &self.tests {
            overall.record(test.outcome);
        }
        RunReport {
            tests: self.tests,
            suites: self.suite_summaries,
            commands: self.commands,
            run_errors: self.run_errors,
            overall,
            duration: self.started.elapsed(),
        }
    }

    /// Close the current test (synthesizing one if none is open).
    fn close(&mut self, outcome: TestOutcome, message: Option<&str>) {
        let open = self.current.take().unwrap_or_else(|| OpenTest {
            name: "(unnamed)".to_owned(),
            suite: self.suite_stack.last().cloned(),
            assertions: Vec::new(),
            started: Instant::now(),
        });
        if let Some(suite_name) = &open.suite {
            if let Some(summary) = self
                .suite_summaries
                .iter_mut()
                .find(|s| &s.name == suite_name)
            {
                summary.tally.record(outcome);
            }
        }
        self.tests.push(TestRecord {
            name: open.name,
            suite: open.suite,
            outcome,
            message: message.map(|m| m.to_owned()),
            assertions: open.assertions,
            duration: open.started.elapsed(),
        });
    }
}

impl ResultCollector for ReportCollector {
    fn suite_enter(&mut self, name: &str) {
        self.suite_stack.push(name.to_owned());
        self.suite_summaries.push(SuiteSummary {
            name: name.to_owned(),
            tally: Tally::default(),
        });
    }

    fn suite_leave(&mut self, _name: &str) {
        self.suite_stack.pop();
    }

    fn test_start(&mut self, name: &str) {
        // An unterminated previous test closes as an error.
        if self.current.is_some() {
            self.close(TestOutcome::Error, Some("previous test did not complete"));
        }
        self.current = Some(OpenTest {
            name: name.to_owned(),
            suite: self.suite_stack.last().cloned(),
            assertions: Vec::new(),
            started: Instant::now(),
        });
    }

    fn test_pass(&mut self, message: Option<&str>) {
        self.close(TestOutcome::Passed, message);
    }

    fn test_fail(&mut self, message: Option<&str>) {
        self.close(TestOutcome::Failed, message);
    }

    fn test_skip(&mut self, message: Option<&str>) {
        self.close(TestOutcome::Skipped, message);
    }

    fn test_error(&mut self, message: &str) {
        self.close(TestOutcome::Error, Some(message));
    }

    fn assertion(&mut self, passed: bool, message: &str) {
        if let Some(open) = &mut self.current {
            open.assertions.push(AssertionRecord {
                passed,
                message: message.to_owned(),
            });
        }
    }

    fn command(
        &mut self,
        device: &str,
        command: &str,
        success: bool,
        response: Option<&str>,
        duration_ms: u64,
    ) {
        self.commands.push(CommandRecord {
            device: device.to_owned(),
            command: command.to_owned(),
            success,
            response: response.map(|r| r.to_owned()),
            duration_ms,
        });
    }

    fn error(&mut self, message: &str) {
        self.run_errors.push(message.to_owned());
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
