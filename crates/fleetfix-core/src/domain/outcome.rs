//! Per-repository outcomes and the fleet-wide aggregate.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::repo::RepoHandle;

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStage {
    Checkout,
    Action,
    DiffCheck,
    Commit,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Checkout => "checkout",
            FailureStage::Action => "action",
            FailureStage::DiffCheck => "diff-check",
            FailureStage::Commit => "commit",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics captured from one invocation of the fix action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    /// Exit code, `None` when the process was killed by a signal or the action ran in-process.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub duration_ms: u64,
    /// Trailing part of the action's stderr (or its error text for in-process actions).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr_tail: String,
}

/// What happened to one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// The action ran and left the tracked state byte-identical.
    Unchanged { action: ActionReport },
    /// The action changed the working copy and the change was committed on `branch_name`.
    Committed {
        branch_name: String,
        commit_message: String,
        files_changed: Vec<String>,
        commit_id: String,
        action: ActionReport,
    },
    /// Dry run: a change was detected, then discarded without committing.
    WouldCommit {
        branch_name: String,
        files_changed: Vec<String>,
        action: ActionReport,
    },
    Failed { stage: FailureStage, error: String },
}

impl PipelineOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineOutcome::Unchanged { .. } => "unchanged",
            PipelineOutcome::Committed { .. } => "committed",
            PipelineOutcome::WouldCommit { .. } => "would_commit",
            PipelineOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PipelineOutcome::Failed { .. })
    }

    /// Files touched by the action, empty unless a change was detected.
    pub fn files_changed(&self) -> &[String] {
        match self {
            PipelineOutcome::Committed { files_changed, .. }
            | PipelineOutcome::WouldCommit { files_changed, .. } => files_changed,
            _ => &[],
        }
    }
}

/// One entry of the fleet result, in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoReport {
    pub repo: RepoHandle,
    pub outcome: PipelineOutcome,
}

/// Outcome counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetCounts {
    pub committed: usize,
    pub unchanged: usize,
    pub would_commit: usize,
    pub failed: usize,
}

impl FleetCounts {
    pub fn record(&mut self, outcome: &PipelineOutcome) {
        match outcome {
            PipelineOutcome::Unchanged { .. } => self.unchanged += 1,
            PipelineOutcome::Committed { .. } => self.committed += 1,
            PipelineOutcome::WouldCommit { .. } => self.would_commit += 1,
            PipelineOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.committed + self.unchanged + self.would_commit + self.failed
    }
}

/// Aggregate over every repository of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: FleetCounts,
    /// Completed repositories, in submission order.
    pub pairs: Vec<RepoReport>,
    /// Repositories never started because the run was stopped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_started: Vec<RepoHandle>,
    pub interrupted: bool,
}

impl FleetResult {
    /// Assemble the result from outcome slots indexed by submission order.
    ///
    /// Slots left empty belong to repositories that were never started; the run counts as
    /// interrupted only when there is at least one.
    pub fn from_slots(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        slots: Vec<(RepoHandle, Option<PipelineOutcome>)>,
    ) -> Self {
        let mut counts = FleetCounts::default();
        let mut pairs = Vec::with_capacity(slots.len());
        let mut not_started = Vec::new();

        for (repo, outcome) in slots {
            match outcome {
                Some(outcome) => {
                    counts.record(&outcome);
                    pairs.push(RepoReport { repo, outcome });
                }
                None => not_started.push(repo),
            }
        }

        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            counts,
            pairs,
            interrupted: !not_started.is_empty(),
            not_started,
        }
    }

    /// Failed repositories with their stage and error text.
    pub fn failures(&self) -> impl Iterator<Item = (&RepoHandle, FailureStage, &str)> {
        self.pairs.iter().filter_map(|r| match &r.outcome {
            PipelineOutcome::Failed { stage, error } => Some((&r.repo, *stage, error.as_str())),
            _ => None,
        })
    }

    /// `true` when no repository failed and every repository was processed.
    pub fn is_success(&self) -> bool {
        self.counts.failed == 0 && !self.interrupted
    }

    pub fn outcome_for(&self, name: &str) -> Option<&PipelineOutcome> {
        self.pairs
            .iter()
            .find(|r| r.repo.name == name)
            .map(|r| &r.outcome)
    }
}
