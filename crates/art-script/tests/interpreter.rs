//! Interpreter behavior tests: variables, control flow, functions, error
//! handling, device I/O through a scripted mock router, and test-result
//! collection.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use art_script::collector::TestOutcome;
use art_script::{
    parse_strict, CommandOutcome, DeviceRouter, Interpreter, ReportCollector, RouteError, Value,
};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Mock router
// ---------------------------------------------------------------------------

/// Scripted router: replies from a canned table and records every command.
#[derive(Default)]
struct MockRouter {
    replies: BTreeMap<String, String>,
    log: Mutex<Vec<(String, String)>>,
    fail_with: Option<RouteError>,
}

impl MockRouter {
    fn with_reply(mut self, command: &str, response: &str) -> Self {
        self.replies.insert(command.to_owned(), response.to_owned());
        self
    }

    fn failing(code: &str, message: &str) -> Self {
        MockRouter {
            fail_with: Some(RouteError::new(code, message)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DeviceRouter for MockRouter {
    async fn send(
        &self,
        device_id: &str,
        command: &str,
        _params: &BTreeMap<String, String>,
        _timeout_ms: u64,
    ) -> Result<CommandOutcome, RouteError> {
        self.log
            .lock()
            .unwrap()
            .push((device_id.to_owned(), command.to_owned()));
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        Ok(CommandOutcome {
            response: self.replies.get(command).cloned().or_else(|| Some("OK".to_owned())),
            duration_ms: 1,
        })
    }
}

async fn run_script(src: &str) -> Interpreter<'_, ReportCollector> {
    run_script_with(src, MockRouter::default()).await
}

async fn run_script_with(src: &str, router: MockRouter) -> Interpreter<'_, ReportCollector> {
    let program = Box::leak(Box::new(
        parse_strict(src).expect("script should parse cleanly"),
    ));
    let mut interp = Interpreter::new(std::sync::Arc::new(router), ReportCollector::new());
    interp.run(program).await.expect("script should run cleanly");
    interp
}

// ---------------------------------------------------------------------------
// Variables and expressions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn arithmetic_precedence() {
    let interp = run_script("SET x 2 + 3 * 4").await;
    assert_eq!(interp.get("x"), Some(&Value::Int(14)));
}

#[tokio::test]
async fn grouped_expression_overrides_precedence() {
    let interp = run_script("SET x (2 + 3) * 4").await;
    assert_eq!(interp.get("x"), Some(&Value::Int(20)));
}

#[tokio::test]
async fn string_concat_and_comparison() {
    let interp = run_script("SET s \"n=\" + 4\nSET lt \"a\" < \"b\"").await;
    assert_eq!(interp.get("s"), Some(&Value::Str("n=4".to_owned())));
    assert_eq!(interp.get("lt"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn array_index_assignment_and_length() {
    let src = "SET arr [1, 2, 3]\nSET arr[1] = 9\nAPPEND arr 4\nSET n LENGTH(arr)\nSET second arr[1]";
    let interp = run_script(src).await;
    assert_eq!(interp.get("n"), Some(&Value::Int(4)));
    assert_eq!(interp.get("second"), Some(&Value::Int(9)));
}

#[tokio::test]
async fn extend_and_reserve() {
    let src = "RESERVE slots 3\nSET slots[0] = 7\nSET a [1]\nEXTEND a [2, 3]\nSET n LENGTH(a)";
    let interp = run_script(src).await;
    assert_eq!(interp.get("n"), Some(&Value::Int(3)));
    match interp.get("slots") {
        Some(Value::Array(items)) => {
            assert_eq!(items.len(), 3);
            assert_eq!(items[0], Value::Int(7));
            assert_eq!(items[1], Value::Null);
        }
        other => panic!("expected array, got {:?}", other),
    }
}

#[tokio::test]
async fn dict_literal_field_and_index() {
    let src = "SET cfg {host: \"lab\", port: 6379}\nSET h cfg.host\nSET p cfg[\"port\"]";
    let interp = run_script(src).await;
    assert_eq!(interp.get("h"), Some(&Value::Str("lab".to_owned())));
    assert_eq!(interp.get("p"), Some(&Value::Int(6379)));
}

#[tokio::test]
async fn coercion_builtins() {
    let src = "SET a INT(\"42\")\nSET b STRING(a)\nSET c FLOAT(\"2.5\")\nSET d BOOL(0)\nSET t TYPE(c)";
    let interp = run_script(src).await;
    assert_eq!(interp.get("a"), Some(&Value::Int(42)));
    assert_eq!(interp.get("b"), Some(&Value::Str("42".to_owned())));
    assert_eq!(interp.get("c"), Some(&Value::Float(2.5)));
    assert_eq!(interp.get("d"), Some(&Value::Bool(false)));
    assert_eq!(interp.get("t"), Some(&Value::Str("float".to_owned())));
}

#[tokio::test]
async fn exists_suppresses_not_found() {
    let src = "SET defined 1\nSET a EXISTS(defined)\nSET b EXISTS(missing)";
    let interp = run_script(src).await;
    assert_eq!(interp.get("a"), Some(&Value::Bool(true)));
    assert_eq!(interp.get("b"), Some(&Value::Bool(false)));
}

// ---------------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn if_elseif_else_takes_one_branch() {
    let src = "SET a 5\nIF a > 10\n SET r \"big\"\nELSEIF a > 3\n SET r \"mid\"\nELSE\n SET r \"small\"\nENDIF";
    let interp = run_script(src).await;
    assert_eq!(interp.get("r"), Some(&Value::Str("mid".to_owned())));
}

#[tokio::test]
async fn loop_with_break_and_continue() {
    let src = "SET total 0\nLOOP 10 TIMES AS i\n IF i == 3\n  CONTINUE\n ENDIF\n IF i == 6\n  BREAK\n ENDIF\n SET total total + i\nENDLOOP";
    let interp = run_script(src).await;
    // 0+1+2+4+5 = 12 (3 skipped, stop at 6)
    assert_eq!(interp.get("total"), Some(&Value::Int(12)));
}

#[tokio::test]
async fn while_counter_updates_defining_scope() {
    let src = "SET n 0\nWHILE n < 5\n SET n n + 1\nENDWHILE";
    let interp = run_script(src).await;
    assert_eq!(interp.get("n"), Some(&Value::Int(5)));
}

#[tokio::test]
async fn foreach_iterates_in_order_with_index() {
    let src = "SET parts [\"a\", \"b\", \"c\"]\nSET out \"\"\nFOREACH p IN parts AS i\n SET out out + p + i\nENDFOREACH";
    let interp = run_script(src).await;
    assert_eq!(interp.get("out"), Some(&Value::Str("a0b1c2".to_owned())));
}

// ---------------------------------------------------------------------------
// Functions and scoping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recursive_factorial() {
    let src = "FUNCTION fact(n)\n IF n <= 1\n  RETURN 1\n ENDIF\n SET sub CALL fact(n - 1)\n RETURN n * sub\nENDFUNCTION\nSET r CALL fact(5)";
    let interp = run_script(src).await;
    assert_eq!(interp.get("r"), Some(&Value::Int(120)));
}

#[tokio::test]
async fn function_locals_do_not_escape_but_globals_do() {
    let src = "SET visible \"outer\"\nGLOBAL shared = 1\nFUNCTION mutate(x)\n SET hidden x\n SET shared shared + x\n RETURN hidden\nENDFUNCTION\nSET r CALL mutate(41)";
    let interp = run_script(src).await;
    assert_eq!(interp.get("r"), Some(&Value::Int(41)));
    assert_eq!(interp.get("shared"), Some(&Value::Int(42)));
    assert!(interp.get("hidden").is_none(), "function locals must not leak");
}

#[tokio::test]
async fn function_cannot_see_caller_locals() {
    // `probe` reports whether it can see a caller-local name.
    let src = "FUNCTION probe()\n RETURN EXISTS(caller_only)\nENDFUNCTION\nSET caller_only 1\nSET seen CALL probe()";
    let interp = run_script(src).await;
    // caller_only is a top-level (global-scope) binding here, so the
    // function DOES see it; a nested function scope is needed to hide it.
    assert_eq!(interp.get("seen"), Some(&Value::Bool(true)));

    let src = "FUNCTION probe()\n RETURN EXISTS(inner_local)\nENDFUNCTION\nFUNCTION outer()\n SET inner_local 1\n RETURN CALL probe()\nENDFUNCTION\nSET seen CALL outer()";
    let interp = run_script(src).await;
    assert_eq!(interp.get("seen"), Some(&Value::Bool(false)));
}

#[tokio::test]
async fn constants_cannot_be_reassigned() {
    let src = "CONST LIMIT 10\nSET err \"\"\nTRY\n SET LIMIT 11\nCATCH e\n SET err e\nENDTRY";
    let interp = run_script(src).await;
    match interp.get("err") {
        Some(Value::Str(msg)) => assert!(msg.contains("constant"), "got: {}", msg),
        other => panic!("expected error string, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn try_catches_divide_by_zero_and_finally_runs() {
    let src = "SET caught \"\"\nTRY\n SET x 1 / 0\nCATCH e\n SET caught e\nFINALLY\n SET fin TRUE\nENDTRY";
    let interp = run_script(src).await;
    match interp.get("caught") {
        Some(Value::Str(msg)) => assert!(msg.contains("zero"), "got: {}", msg),
        other => panic!("expected error string, got {:?}", other),
    }
    assert_eq!(interp.get("fin"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn uncaught_error_stops_run_and_reports() {
    let program = parse_strict("SET x missing + 1").unwrap();
    let mut interp = Interpreter::new(
        std::sync::Arc::new(MockRouter::default()),
        ReportCollector::new(),
    );
    let err = interp.run(&program).await.unwrap_err();
    assert!(err.message.contains("undefined variable"));
    let report = interp.into_collector().finish();
    assert_eq!(report.run_errors.len(), 1);
}

#[tokio::test]
async fn catch_binds_error_and_scripted_retry_succeeds() {
    let src = "SET tries 0\nSET done FALSE\nWHILE !done\n SET tries tries + 1\n TRY\n  IF tries < 3\n   SET x 1 / 0\n  ENDIF\n  SET done TRUE\n CATCH e\n  SET last e\n ENDTRY\nENDWHILE";
    let interp = run_script(src).await;
    assert_eq!(interp.get("tries"), Some(&Value::Int(3)));
}

// ---------------------------------------------------------------------------
// Device I/O
// ---------------------------------------------------------------------------

#[tokio::test]
async fn query_stores_response_in_variable() {
    let router = MockRouter::default().with_reply("pump_status", "0");
    let src = "QUERY \"PUMP-01\" \"pump_status\" status TIMEOUT 2000";
    let interp = run_script_with(src, router).await;
    assert_eq!(interp.get("status"), Some(&Value::Str("0".to_owned())));
}

#[tokio::test]
async fn send_uses_connect_default_device() {
    let router = MockRouter::default();
    let src = "CONNECT \"DMM-01\" TCP \"10.0.0.9\" 5025\nSEND \"*RST\"";
    let interp = run_script_with(src, router).await;
    let report = interp.into_collector().finish();
    assert_eq!(report.commands.len(), 1);
    assert_eq!(report.commands[0].device, "DMM-01");
    assert_eq!(report.commands[0].command, "*RST");
}

#[tokio::test]
async fn device_error_is_catchable() {
    let router = MockRouter::failing("E_DEVICE_TIMEOUT", "no reply within 100 ms");
    let src = "SET caught \"\"\nTRY\n QUERY \"PUMP-01\" \"pump_status\" s TIMEOUT 100\nCATCH e\n SET caught e\nENDTRY";
    let interp = run_script_with(src, router).await;
    match interp.get("caught") {
        Some(Value::Str(msg)) => assert!(msg.contains("E_DEVICE_TIMEOUT"), "got: {}", msg),
        other => panic!("expected error string, got {:?}", other),
    }
}

#[tokio::test]
async fn relay_packages_single_request() {
    let router = MockRouter::default().with_reply("relay_get", "1");
    let src = "RELAY \"RELAY-01\" SET 3 ON\nRELAY \"RELAY-01\" GET 3 state";
    let interp = run_script_with(src, router).await;
    assert_eq!(interp.get("state"), Some(&Value::Str("1".to_owned())));
}

#[tokio::test]
async fn out_of_bounds_timeout_is_an_error() {
    let program = parse_strict("QUERY \"D\" \"cmd\" r TIMEOUT 99").unwrap();
    let mut interp = Interpreter::new(
        std::sync::Arc::new(MockRouter::default()),
        ReportCollector::new(),
    );
    let err = interp.run(&program).await.unwrap_err();
    assert!(err.message.contains("TIMEOUT"));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_aborts_delay() {
    let program = parse_strict("DELAY 60000\nSET never 1").unwrap();
    let cancel = CancellationToken::new();
    let mut interp = Interpreter::new(
        std::sync::Arc::new(MockRouter::default()),
        ReportCollector::new(),
    )
    .with_cancel(cancel.clone());

    let canceller = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        }
    });
    let err = interp.run(&program).await.unwrap_err();
    assert!(err.message.contains("cancelled"));
    assert!(interp.get("never").is_none());
    canceller.await.unwrap();
}

// ---------------------------------------------------------------------------
// Tests, suites, and the collector
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_outcomes_are_collected() {
    let src = "TEST \"passes\"\n ASSERT 1 + 1 == 2\nENDTEST\nTEST \"fails\"\n ASSERT 1 == 2 \"math broke\"\nENDTEST\nTEST \"skips\"\n SKIP \"not today\"\nENDTEST\nTEST \"errors\"\n SET x 1 / 0\nENDTEST";
    let interp = run_script(src).await;
    let report = interp.into_collector().finish();

    assert_eq!(report.overall.passed, 1);
    assert_eq!(report.overall.failed, 1);
    assert_eq!(report.overall.skipped, 1);
    assert_eq!(report.overall.errors, 1);

    assert_eq!(report.tests[0].outcome, TestOutcome::Passed);
    assert_eq!(report.tests[1].outcome, TestOutcome::Failed);
    assert_eq!(report.tests[1].message.as_deref(), Some("math broke"));
    assert_eq!(report.tests[3].outcome, TestOutcome::Error);
}

#[tokio::test]
async fn error_in_one_test_does_not_stop_the_next() {
    let src = "TEST \"boom\"\n SET x 1 / 0\nENDTEST\nTEST \"after\"\n PASS \"still running\"\nENDTEST";
    let interp = run_script(src).await;
    let report = interp.into_collector().finish();
    assert_eq!(report.tests.len(), 2);
    assert_eq!(report.tests[1].outcome, TestOutcome::Passed);
}

#[tokio::test]
async fn suite_runs_setup_and_teardown_around_each_test() {
    let src = "GLOBAL setups = 0\nGLOBAL teardowns = 0\nSUITE \"lifecycle\"\nSETUP\n SET setups setups + 1\nENDSETUP\nTEARDOWN\n SET teardowns teardowns + 1\nENDTEARDOWN\nTEST \"one\"\n PASS \"ok\"\nENDTEST\nTEST \"two\"\n FAIL \"no\"\nENDTEST\nENDSUITE";
    let interp = run_script(src).await;
    assert_eq!(interp.get("setups"), Some(&Value::Int(2)));
    assert_eq!(
        interp.get("teardowns"),
        Some(&Value::Int(2)),
        "teardown runs even when the test fails"
    );
    let report = interp.into_collector().finish();
    assert_eq!(report.suites.len(), 1);
    assert_eq!(report.suites[0].tally.passed, 1);
    assert_eq!(report.suites[0].tally.failed, 1);
}

#[tokio::test]
async fn parallel_block_enforces_timeout() {
    let program = parse_strict("PARALLEL TIMEOUT 100\n DELAY 50\n DELAY 5000\nENDPARALLEL").unwrap();
    let mut interp = Interpreter::new(
        std::sync::Arc::new(MockRouter::default()),
        ReportCollector::new(),
    );
    let start = std::time::Instant::now();
    let err = interp.run(&program).await.unwrap_err();
    assert!(err.message.contains("timeout"), "got: {}", err.message);
    assert!(start.elapsed() < std::time::Duration::from_secs(2));
}

#[tokio::test]
async fn parallel_without_timeout_runs_children() {
    let src = "SET a 0\nPARALLEL\n SET a a + 1\n SET a a + 1\nENDPARALLEL";
    let interp = run_script(src).await;
    assert_eq!(interp.get("a"), Some(&Value::Int(2)));
}

#[tokio::test]
async fn import_and_library_are_logged_noops() {
    let src = "IMPORT \"lib/common.art\"\nLIBRARY \"helpers\"\n SET ignored 1\nENDLIBRARY\nSET after 1";
    let interp = run_script(src).await;
    assert_eq!(interp.get("after"), Some(&Value::Int(1)));
    assert!(interp.get("ignored").is_none(), "library bodies do not execute");
}
