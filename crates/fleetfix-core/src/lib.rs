//! fleetfix core library
//!
//! Runs one fix action against many cloned repositories and commits whatever it changed on a
//! dedicated branch per repository.
//!
//! - [`resolver`] turns configuration into [`RepoHandle`]s
//! - [`action`] holds the opaque [`FixAction`] and the shared [`FixSpec`]
//! - [`pipeline`] drives one working copy through checkout, action, diff check and commit
//! - [`orchestrator`] fans the pipeline out over the fleet and aggregates a [`FleetResult`]

pub mod action;
pub mod config;
pub mod domain;
pub mod fakes;
pub mod git;
pub mod obs;
pub mod orchestrator;
pub mod pipeline;
pub mod quote;
pub mod reporting;
pub mod resolver;
pub mod telemetry;

pub use action::{CommandAction, FixAction, FixSpec, FnAction};
pub use config::{Config, RepoFilter, DEFAULT_CONFIG_FILE};
pub use domain::{
    ActionError, ActionReport, FailureStage, FleetCounts, FleetError, FleetResult,
    PipelineError, PipelineOutcome, RepoHandle, RepoReport, Result, VcsError,
};
pub use git::{GitCli, Vcs};
pub use orchestrator::FleetOrchestrator;
pub use pipeline::{PipelineSettings, PipelineState, RepoPipeline};
pub use quote::{quote_argv, split_command};
pub use reporting::{render_summary, write_report_json};
pub use resolver::{find_repos, RepoSource};
pub use telemetry::init_tracing;

/// fleetfix version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
