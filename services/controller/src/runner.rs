//! Script runner: parse -> session -> interpret -> report.

use std::path::Path;

use art_script::{Diagnostic, Interpreter, ReportCollector, RunReport};
use thiserror::Error;
use tracing::{info, warn};

use crate::stations::{StationTracker, TrackerError};
use crate::Controller;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("cannot read script '{path}': {message}")]
    Read { path: String, message: String },
    #[error("E_SCRIPT_PARSE_FAILED: {0} error(s)")]
    ParseFailed(usize),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Outcome of a script run: the report plus any parse diagnostics (empty on
/// a clean parse).
pub struct RunOutcome {
    pub report: Option<RunReport>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Lex and parse only; returns the diagnostics.
pub async fn check_script(path: &Path) -> Result<Vec<Diagnostic>, RunError> {
    let source = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    let (_, diagnostics) = art_script::parse(&source);
    Ok(diagnostics)
}

/// Run a script against a station: verify it parses cleanly, open a
/// session, execute, and close the session with the run's outcome.
pub async fn run_script(
    controller: &Controller,
    path: &Path,
    station: &str,
    operator: &str,
    reference_id: Option<String>,
) -> Result<RunOutcome, RunError> {
    let source = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    let (program, diagnostics) = art_script::parse(&source);
    if !diagnostics.is_empty() {
        warn!(
            script = %path.display(),
            errors = diagnostics.len(),
            "script failed to parse"
        );
        return Ok(RunOutcome {
            report: None,
            diagnostics,
        });
    }

    let script_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let session = controller.tracker().start_test(
        station,
        &path.display().to_string(),
        &script_name,
        operator,
        reference_id,
    )?;

    let mut interp = Interpreter::new(controller.router(), ReportCollector::new())
        .with_cancel(session.cancel.clone())
        .with_progress(session.cursor.clone());

    let result = interp.run(&program).await;

    let tracker: &StationTracker = controller.tracker();
    match &result {
        Ok(()) => {
            // The session may have been terminated externally mid-run.
            if tracker.complete_test(station).is_ok() {
                info!(station = %station, script = %script_name, "script completed");
            }
        }
        Err(e) => {
            let _ = tracker.terminate_test(station, &e.message);
        }
    }

    let report = interp.into_collector().finish();
    Ok(RunOutcome {
        report: Some(report),
        diagnostics: Vec::new(),
    })
}
