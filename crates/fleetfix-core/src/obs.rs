//! Structured observability hooks for fleet runs.
//!
//! Every event carries an `event` field (`fleet.started`, `repo.finished`, ...) so JSON log
//! lines can be filtered without parsing messages.

use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{FleetCounts, PipelineOutcome, RepoHandle};

/// Span tagging every log line of one run with its `run_id`.
pub fn fleet_span(run_id: &Uuid) -> tracing::Span {
    tracing::info_span!("fleetfix.run", run_id = %run_id)
}

pub fn emit_fleet_started(run_id: &Uuid, repos: usize, workers: usize, fix: &str) {
    info!(
        event = "fleet.started",
        run_id = %run_id,
        repos = repos,
        workers = workers,
        fix = %fix,
    );
}

pub fn emit_repo_started(repo: &RepoHandle, index: usize, total: usize) {
    info!(
        event = "repo.started",
        repo = %repo.name,
        path = %repo.path.display(),
        position = index + 1,
        total = total,
    );
}

/// Failed repositories are logged at warn level.
pub fn emit_repo_finished(repo: &RepoHandle, outcome: &PipelineOutcome, duration_ms: u64) {
    match outcome {
        PipelineOutcome::Failed { stage, error } => warn!(
            event = "repo.finished",
            repo = %repo.name,
            outcome = outcome.kind(),
            stage = %stage,
            error = %error,
            duration_ms = duration_ms,
        ),
        _ => info!(
            event = "repo.finished",
            repo = %repo.name,
            outcome = outcome.kind(),
            files_changed = outcome.files_changed().len(),
            duration_ms = duration_ms,
        ),
    }
}

pub fn emit_fleet_finished(
    run_id: &Uuid,
    counts: &FleetCounts,
    not_started: usize,
    duration_ms: u64,
) {
    info!(
        event = "fleet.finished",
        run_id = %run_id,
        committed = counts.committed,
        unchanged = counts.unchanged,
        would_commit = counts.would_commit,
        failed = counts.failed,
        not_started = not_started,
        duration_ms = duration_ms,
    );
}

/// In-flight repositories still run to completion after this.
pub fn emit_stop_requested() {
    warn!(
        event = "fleet.stop_requested",
        "stop requested, finishing in-flight repositories"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_span_can_be_entered() {
        let span = fleet_span(&Uuid::new_v4());
        let _guard = span.enter();
        emit_stop_requested();
    }
}
