//! fleetfix - apply one command across a fleet of cloned repositories
//!
//! Every repository is switched to a fresh branch, the command runs inside it, and whatever the
//! command changed is committed on that branch. Repositories the command leaves untouched are
//! reported as unchanged.
//!
//! ```text
//! fleetfix -j 8 --branch-name bump-ci -- sed -i s/v3/v4/ .github/workflows/ci.yml
//! fleetfix --repos ../a --repos ../b 'pre-commit autoupdate'
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn, Level};

use fleetfix_core::{
    obs, quote_argv, render_summary, split_command, write_report_json, Config, FixSpec,
    FleetOrchestrator, GitCli, PipelineSettings, RepoPipeline, RepoSource, Vcs,
    DEFAULT_CONFIG_FILE,
};

#[derive(Parser, Debug)]
#[command(name = "fleetfix")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a command in many repositories and commit what it changes", long_about = None)]
struct Cli {
    /// Config file listing the clone directory and repo filters
    #[arg(short = 'C', long, env = "FLEETFIX_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Operate on these working copies instead of the configured ones (repeatable)
    #[arg(long = "repos", value_name = "PATH", value_delimiter = ',')]
    repos: Vec<PathBuf>,

    /// Only operate on the first N repositories
    #[arg(long)]
    limit: Option<usize>,

    /// Number of repositories processed at once
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,

    /// Branch created in every repository
    #[arg(long, default_value = "fleetfix-exec")]
    branch_name: String,

    /// Commit message (default: the quoted command)
    #[arg(long)]
    commit_msg: Option<String>,

    /// Override the commit author, e.g. "Bot <bot@example.com>"
    #[arg(long)]
    author: Option<String>,

    /// Report what would be committed, then restore each working copy
    #[arg(long)]
    dry_run: bool,

    /// Kill the command after this many seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    timeout_secs: u64,

    /// Write the full JSON result here
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Command to run; a single argument is split on whitespace
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    command: Vec<String>,
}

impl Cli {
    fn argv(&self) -> Vec<String> {
        match self.command.as_slice() {
            [single] => split_command(single),
            many => many.to_vec(),
        }
    }

    fn source(&self) -> Result<RepoSource> {
        if !self.repos.is_empty() {
            return Ok(RepoSource::Paths(self.repos.clone()));
        }
        let config = Config::load(&self.config)
            .with_context(|| format!("Failed to load config {}", self.config.display()))?;
        Ok(RepoSource::Config(config))
    }

    fn settings(&self, argv: &[String]) -> PipelineSettings {
        let message = self
            .commit_msg
            .clone()
            .unwrap_or_else(|| quote_argv(argv));
        let settings = PipelineSettings::new(&self.branch_name, message).dry_run(self.dry_run);
        match &self.author {
            Some(author) => settings.with_author(author),
            None => settings,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    fleetfix_core::init_tracing(cli.json, level);

    let argv = cli.argv();
    anyhow::ensure!(!argv.is_empty(), "command is empty");

    let repos = cli
        .source()?
        .resolve(cli.limit)
        .context("Failed to resolve repositories")?;
    info!(repos = repos.len(), command = %quote_argv(&argv), "resolved fleet");

    // First Ctrl-C drains in-flight repositories; a second one exits at once.
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        obs::emit_stop_requested();
        let _ = stop_tx.send(true);
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt, exiting without waiting for in-flight repositories");
            std::process::exit(130);
        }
    });

    let pipeline = RepoPipeline::new(Arc::new(GitCli::new()) as Arc<dyn Vcs>, cli.settings(&argv));
    let result = FleetOrchestrator::new(pipeline)
        .concurrency(cli.jobs)
        .with_shutdown(stop_rx)
        .run(repos, FixSpec::command(argv, cli.timeout_secs))
        .await
        .context("Fleet run failed")?;

    println!("{}", render_summary(&result));

    if let Some(path) = &cli.report {
        write_report_json(path, &result)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
