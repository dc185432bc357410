use std::path::Path;

use crate::domain::{FleetError, FleetResult, PipelineOutcome, Result};

/// Write the run report as pretty JSON.
pub fn write_report_json(path: &Path, result: &FleetResult) -> Result<()> {
    let content = serde_json::to_string_pretty(result)?;
    std::fs::write(path, content).map_err(|source| FleetError::Report {
        path: path.to_path_buf(),
        source,
    })
}

/// Render the human-readable run summary: one line per repository, then the totals.
pub fn render_summary(result: &FleetResult) -> String {
    let mut out = String::new();

    for report in &result.pairs {
        let name = &report.repo.name;
        let line = match &report.outcome {
            PipelineOutcome::Unchanged { .. } => format!("unchanged     {name}"),
            PipelineOutcome::Committed {
                branch_name,
                files_changed,
                ..
            } => format!(
                "committed     {name} on {branch_name} ({})",
                files_changed.join(", ")
            ),
            PipelineOutcome::WouldCommit {
                branch_name,
                files_changed,
                ..
            } => format!(
                "would commit  {name} on {branch_name} ({})",
                files_changed.join(", ")
            ),
            PipelineOutcome::Failed { stage, error } => {
                format!("FAILED        {name} at {stage}: {error}")
            }
        };
        out.push_str(&line);
        out.push('\n');
    }

    for repo in &result.not_started {
        out.push_str(&format!("not started   {}\n", repo.name));
    }

    let counts = &result.counts;
    out.push_str(&format!(
        "\n{} committed, {} unchanged, {} would commit, {} failed",
        counts.committed, counts.unchanged, counts.would_commit, counts.failed
    ));
    if result.interrupted {
        out.push_str(&format!(
            ", {} not started (interrupted)",
            result.not_started.len()
        ));
    }
    out.push('\n');
    out
}
