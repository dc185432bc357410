//! Domain models for fleetfix.
//!
//! Canonical definitions for the core entities:
//! - `RepoHandle`: one working copy and the repository it was cloned from
//! - `PipelineOutcome`: what happened to one repository during a run
//! - `FleetResult`: the aggregate over every repository of a run

pub mod error;
pub mod outcome;
pub mod repo;

pub use error::{ActionError, FleetError, PipelineError, Result, VcsError};
pub use outcome::{ActionReport, FailureStage, FleetCounts, FleetResult, PipelineOutcome, RepoReport};
pub use repo::RepoHandle;
