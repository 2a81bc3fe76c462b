// art-script: The `.art` test-procedure language.
//
// Lexer -> parser -> AST interpreter, with a scoped dynamic-value
// environment, multi-error diagnostics, and collaborator traits for device
// routing and test-result collection.  Device I/O and result storage stay
// outside this crate; the interpreter only drives the `DeviceRouter` and
// `ResultCollector` interfaces.

pub mod ast;
pub mod collector;
pub mod env;
pub mod error;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod router;
pub mod token;
pub mod value;

pub use collector::{ReportCollector, ResultCollector, RunReport, TestOutcome};
pub use env::{EnvError, Environment};
pub use error::{Diagnostic, RuntimeError, Severity};
pub use interp::Interpreter;
pub use parser::parse;
pub use router::{CommandOutcome, DeviceRouter, RouteError};
pub use value::Value;

/// Parse source, requiring zero diagnostics.
pub fn parse_strict(src: &str) -> Result<ast::Program, Vec<Diagnostic>> {
    let (program, diagnostics) = parser::parse(src);
    if diagnostics.is_empty() {
        Ok(program)
    } else {
        Err(diagnostics)
    }
}
