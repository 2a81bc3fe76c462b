//! Lexing and parsing are deterministic: the same source produces the same
//! token stream, the same AST, and the same ordered error list every time.

use art_script::{lexer, parser};

const VALID_SCRIPT: &str = r#"# Regen qualification procedure
CONST PUMP "PUMP-01"
SET readings []

FUNCTION kelvin(raw)
  RETURN FLOAT(raw)
ENDFUNCTION

SUITE "regen qualification"
SETUP
  QUERY PUMP "pump_status" status TIMEOUT 2000
ENDSETUP
TEARDOWN
  LOG INFO "test done at " + NOW()
ENDTEARDOWN

TEST "pump responds"
  ASSERT status == "1" "pump must be on"
ENDTEST

TEST "second stage is cold"
  QUERY PUMP "get_second_stage_temp" raw TIMEOUT 2000
  SET temp CALL kelvin(raw)
  APPEND readings temp
  ASSERT temp < 20.0
ENDTEST
ENDSUITE

LOOP 3 TIMES AS i
  DELAY 10
  LOG DEBUG "poll " + i
ENDLOOP
"#;

const INVALID_SCRIPT: &str = r#"SET 42 broken
WHILE
ENDWHILE
SET s "unterminated
QUERY
SET ok 1
"#;

#[test]
fn valid_program_parses_with_zero_errors() {
    let (program, errors) = parser::parse(VALID_SCRIPT);
    assert!(errors.is_empty(), "unexpected errors: {:#?}", errors);
    assert!(!program.statements.is_empty());
}

#[test]
fn token_streams_are_identical_across_runs() {
    let (t1, e1) = lexer::tokenize(VALID_SCRIPT);
    let (t2, e2) = lexer::tokenize(VALID_SCRIPT);
    assert_eq!(t1, t2);
    assert_eq!(e1, e2);
}

#[test]
fn asts_are_identical_across_runs() {
    let (p1, _) = parser::parse(VALID_SCRIPT);
    let (p2, _) = parser::parse(VALID_SCRIPT);
    assert_eq!(p1, p2);
}

#[test]
fn error_lists_are_identical_and_ordered_across_runs() {
    let (_, e1) = parser::parse(INVALID_SCRIPT);
    let (_, e2) = parser::parse(INVALID_SCRIPT);
    assert!(!e1.is_empty(), "invalid script must produce diagnostics");
    assert_eq!(e1, e2);

    // Errors arrive in source order.
    let lines: Vec<u32> = e1.iter().map(|d| d.line).collect();
    let mut sorted = lines.clone();
    sorted.sort_unstable();
    assert_eq!(lines, sorted);

    // Recovery still parses the trailing good statement.
    let (program, _) = parser::parse(INVALID_SCRIPT);
    assert!(program
        .statements
        .iter()
        .any(|s| matches!(&s.kind, art_script::ast::StmtKind::Set { name, .. } if name == "ok")));
}

#[test]
fn reparsing_an_invalid_program_yields_the_same_error_list() {
    // Ten runs, one fingerprint.
    let baseline: Vec<String> = parser::parse(INVALID_SCRIPT)
        .1
        .into_iter()
        .map(|d| format!("{}:{} {}", d.line, d.column, d.message))
        .collect();
    for _ in 0..10 {
        let again: Vec<String> = parser::parse(INVALID_SCRIPT)
            .1
            .into_iter()
            .map(|d| format!("{}:{} {}", d.line, d.column, d.message))
            .collect();
        assert_eq!(baseline, again);
    }
}
