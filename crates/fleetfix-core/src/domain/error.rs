//! Error taxonomy for fleetfix.
//!
//! Repository-local errors (`VcsError`, `ActionError`, wrapped in `PipelineError`) never abort a
//! run; they are folded into a `Failed` outcome. `FleetError` is fatal and surfaces before any
//! repository is touched.

use std::path::PathBuf;

use crate::domain::outcome::FailureStage;

/// Errors from the version-control primitives.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("working copy has uncommitted changes: {}", .entries.join(", "))]
    Dirty { entries: Vec<String> },

    #[error("working copy not found: {}", .path.display())]
    MissingWorkingCopy { path: PathBuf },

    /// The path exists but is not the top level of its own git working copy.
    #[error("not the top level of a git working copy: {}", .path.display())]
    NotARepository { path: PathBuf },

    #[error("changes were detected but nothing could be staged")]
    NothingStaged,

    #[error("unexpected git output: {0}")]
    Output(String),
}

/// Errors that prevent the fix action from running at all.
///
/// A non-zero exit status is not an `ActionError`; it is recorded in the outcome's
/// [`ActionReport`](crate::domain::ActionReport).
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("fix command is empty")]
    EmptyCommand,

    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("fix action timed out after {secs} seconds")]
    TimedOut { secs: u64 },

    #[error("fix action panicked: {0}")]
    Panicked(String),

    #[error("io error while running fix action: {0}")]
    Io(#[from] std::io::Error),
}

/// A failure inside one repository's pipeline, tagged by the stage that produced it.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("checkout failed: {0}")]
    Checkout(#[source] VcsError),

    #[error("action failed: {0}")]
    ActionExecution(#[source] ActionError),

    #[error("diff check failed: {0}")]
    DiffDetection(#[source] VcsError),

    #[error("commit failed: {0}")]
    Commit(#[source] VcsError),
}

impl PipelineError {
    pub fn stage(&self) -> FailureStage {
        match self {
            PipelineError::Checkout(_) => FailureStage::Checkout,
            PipelineError::ActionExecution(_) => FailureStage::Action,
            PipelineError::DiffDetection(_) => FailureStage::DiffCheck,
            PipelineError::Commit(_) => FailureStage::Commit,
        }
    }

    /// Error text without the stage prefix.
    pub fn detail(&self) -> String {
        match self {
            PipelineError::Checkout(e)
            | PipelineError::DiffDetection(e)
            | PipelineError::Commit(e) => e.to_string(),
            PipelineError::ActionExecution(e) => e.to_string(),
        }
    }
}

/// Fatal, fleet-level errors.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("cannot read config {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "config {} has too-permissive permissions ({mode:o}), expected it to be private to its owner",
        .path.display()
    )]
    InsecureConfig { path: PathBuf, mode: u32 },

    #[error("invalid {field} pattern: {source}")]
    InvalidPattern {
        field: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("cannot read repository manifest {}: {source}", .path.display())]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid repository manifest {}: {source}", .path.display())]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no repositories to operate on")]
    NoRepositories,

    #[error("working copy submitted more than once: {}", .path.display())]
    DuplicateRepository { path: PathBuf },

    #[error("cannot write report {}: {source}", .path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for fleet-level operations.
pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_maps_to_stage() {
        let err = PipelineError::Checkout(VcsError::Dirty {
            entries: vec!["README".to_string()],
        });
        assert_eq!(err.stage(), FailureStage::Checkout);
        assert!(err.to_string().contains("README"));

        let err = PipelineError::ActionExecution(ActionError::EmptyCommand);
        assert_eq!(err.stage(), FailureStage::Action);

        let err = PipelineError::DiffDetection(VcsError::MissingWorkingCopy {
            path: PathBuf::from("/gone"),
        });
        assert_eq!(err.stage(), FailureStage::DiffCheck);
        assert!(err.to_string().contains("/gone"));

        let err = PipelineError::Commit(VcsError::NothingStaged);
        assert_eq!(err.stage(), FailureStage::Commit);
        assert_eq!(err.detail(), "changes were detected but nothing could be staged");
    }

    #[test]
    fn insecure_config_shows_octal_mode() {
        let err = FleetError::InsecureConfig {
            path: PathBuf::from("fleetfix.json"),
            mode: 0o644,
        };
        assert!(err.to_string().contains("644"));
    }
}
