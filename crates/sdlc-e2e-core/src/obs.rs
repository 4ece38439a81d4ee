//! Structured events for the run lifecycle.
//!
//! Every orchestrator step runs inside a [`StepSpan`] and emits a started
//! and a finished/failed event, so a log line can always be traced back to
//! the run and step that produced it.

use std::time::Duration;

use tracing::{info, warn};

/// Guard entering a span tagged with the run id and step name.
pub struct StepSpan {
    span: tracing::Span,
}

impl StepSpan {
    pub fn new(run_id: &str, step: &str) -> Self {
        Self {
            span: tracing::info_span!("sdlc.step", run_id = %run_id, step = %step),
        }
    }

    /// The span, for instrumenting a future that crosses await points.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

pub fn emit_run_started(run_id: &str, steps: usize) {
    info!(event = "run.started", run_id = %run_id, steps = steps);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_step_started(step: &str) {
    info!(event = "step.started", step = %step);
}

pub fn emit_step_finished(step: &str, elapsed: Duration, detail: &str) {
    info!(
        event = "step.finished",
        step = %step,
        elapsed_ms = elapsed.as_millis() as u64,
        detail = %detail,
    );
}

/// Step failure, at warning level.
pub fn emit_step_failed(step: &str, elapsed: Duration, error: &dyn std::fmt::Display) {
    warn!(
        event = "step.failed",
        step = %step,
        elapsed_ms = elapsed.as_millis() as u64,
        error = %error,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_span_create() {
        let span = StepSpan::new("run-1", "scm.issue");
        let _entered = span.span().enter();
        emit_step_started("scm.issue");
        emit_step_finished("scm.issue", Duration::from_millis(12), "created");
    }
}
