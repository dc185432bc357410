//! Per-repository pipeline.
//!
//! One run is a linear state machine:
//!
//! ```text
//! Idle -> CheckedOut -> ActionRun -> DiffChecked -> Done(outcome)
//! ```
//!
//! Each edge is one transition function. An error on any edge ends the run in
//! `Done(Failed { stage })`, where `stage` names the edge that failed. The run never returns
//! an error: every repository yields exactly one [`PipelineOutcome`].

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::action::FixSpec;
use crate::domain::{
    ActionReport, FailureStage, PipelineError, PipelineOutcome, RepoHandle,
};
use crate::git::Vcs;

/// Where a pipeline run currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    /// The fix branch exists and is checked out at `base`.
    CheckedOut { base: String },
    ActionRun { base: String, action: ActionReport },
    DiffChecked {
        base: String,
        action: ActionReport,
        files: Vec<String>,
    },
    Done(PipelineOutcome),
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::CheckedOut { .. } => "checked_out",
            PipelineState::ActionRun { .. } => "action_run",
            PipelineState::DiffChecked { .. } => "diff_checked",
            PipelineState::Done(_) => "done",
        }
    }

    /// The stage that runs when leaving this state, and therefore the stage blamed for a
    /// failure observed while in it.
    pub fn next_stage(&self) -> Option<FailureStage> {
        match self {
            PipelineState::Idle => Some(FailureStage::Checkout),
            PipelineState::CheckedOut { .. } => Some(FailureStage::Action),
            PipelineState::ActionRun { .. } => Some(FailureStage::DiffCheck),
            PipelineState::DiffChecked { .. } => Some(FailureStage::Commit),
            PipelineState::Done(_) => None,
        }
    }
}

/// Per-run pipeline settings, shared by every repository.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub branch_name: String,
    pub commit_message: String,
    /// `git commit --author` override, `Name <email>`.
    pub author: Option<String>,
    /// Detect changes, then discard them instead of committing.
    pub dry_run: bool,
}

impl PipelineSettings {
    pub fn new(branch_name: impl Into<String>, commit_message: impl Into<String>) -> Self {
        Self {
            branch_name: branch_name.into(),
            commit_message: commit_message.into(),
            author: None,
            dry_run: false,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Runs the fix against one working copy at a time.
#[derive(Clone)]
pub struct RepoPipeline {
    vcs: Arc<dyn Vcs>,
    settings: Arc<PipelineSettings>,
}

impl RepoPipeline {
    pub fn new(vcs: Arc<dyn Vcs>, settings: PipelineSettings) -> Self {
        Self {
            vcs,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn run(&self, repo: &RepoHandle, fix: &FixSpec) -> PipelineOutcome {
        self.run_with_progress(repo, fix, None).await
    }

    /// Run the pipeline, publishing every state entered on `progress`.
    #[instrument(skip_all, fields(repo = %repo.name, branch = %self.settings.branch_name))]
    pub async fn run_with_progress(
        &self,
        repo: &RepoHandle,
        fix: &FixSpec,
        progress: Option<&watch::Sender<PipelineState>>,
    ) -> PipelineOutcome {
        let mut state = PipelineState::Idle;
        loop {
            if let Some(tx) = progress {
                tx.send_replace(state.clone());
            }
            debug!(state = state.name(), "pipeline state");

            state = match state {
                PipelineState::Done(outcome) => return outcome,
                current => match self.step(current, repo, fix).await {
                    Ok(next) => next,
                    Err(e) => {
                        warn!(stage = %e.stage(), error = %e, "pipeline failed");
                        PipelineState::Done(PipelineOutcome::Failed {
                            stage: e.stage(),
                            error: e.detail(),
                        })
                    }
                },
            };
        }
    }

    async fn step(
        &self,
        state: PipelineState,
        repo: &RepoHandle,
        fix: &FixSpec,
    ) -> Result<PipelineState, PipelineError> {
        match state {
            PipelineState::Idle => self.checkout(repo).await,
            PipelineState::CheckedOut { base } => self.apply(repo, fix, base).await,
            PipelineState::ActionRun { base, action } => {
                self.diff_check(repo, base, action).await
            }
            PipelineState::DiffChecked {
                base,
                action,
                files,
            } => self.finish(repo, base, action, files).await,
            done @ PipelineState::Done(_) => Ok(done),
        }
    }

    async fn checkout(&self, repo: &RepoHandle) -> Result<PipelineState, PipelineError> {
        let base = self
            .vcs
            .checkout_branch(&repo.path, &self.settings.branch_name)
            .await
            .map_err(PipelineError::Checkout)?;
        Ok(PipelineState::CheckedOut { base })
    }

    async fn apply(
        &self,
        repo: &RepoHandle,
        fix: &FixSpec,
        base: String,
    ) -> Result<PipelineState, PipelineError> {
        let action = fix
            .apply(&repo.path)
            .await
            .map_err(PipelineError::ActionExecution)?;
        if !action.success {
            warn!(
                exit_code = ?action.exit_code,
                stderr = %action.stderr_tail,
                "fix action reported failure, checking for changes anyway"
            );
        }
        Ok(PipelineState::ActionRun { base, action })
    }

    async fn diff_check(
        &self,
        repo: &RepoHandle,
        base: String,
        action: ActionReport,
    ) -> Result<PipelineState, PipelineError> {
        let mut files = self
            .vcs
            .changed_files(&repo.path)
            .await
            .map_err(PipelineError::DiffDetection)?;
        files.sort();
        files.dedup();
        Ok(PipelineState::DiffChecked {
            base,
            action,
            files,
        })
    }

    async fn finish(
        &self,
        repo: &RepoHandle,
        base: String,
        action: ActionReport,
        files: Vec<String>,
    ) -> Result<PipelineState, PipelineError> {
        let settings = &self.settings;

        if files.is_empty() {
            debug!(base = %base, "no changes, branch left at base");
            return Ok(PipelineState::Done(PipelineOutcome::Unchanged { action }));
        }

        if settings.dry_run {
            self.vcs
                .discard_changes(&repo.path)
                .await
                .map_err(PipelineError::Commit)?;
            return Ok(PipelineState::Done(PipelineOutcome::WouldCommit {
                branch_name: settings.branch_name.clone(),
                files_changed: files,
                action,
            }));
        }

        let commit_id = self
            .vcs
            .commit(&repo.path, &settings.commit_message, settings.author.as_deref())
            .await
            .map_err(PipelineError::Commit)?;

        Ok(PipelineState::Done(PipelineOutcome::Committed {
            branch_name: settings.branch_name.clone(),
            commit_message: settings.commit_message.clone(),
            files_changed: files,
            commit_id,
            action,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryVcs;
    use std::path::{Path, PathBuf};

    fn setup() -> (Arc<MemoryVcs>, RepoHandle) {
        let vcs = Arc::new(MemoryVcs::new());
        let repo = RepoHandle::new("org/a", "/fleet/org/a");
        vcs.add_repo(&repo.path);
        (vcs, repo)
    }

    fn pipeline(vcs: &Arc<MemoryVcs>) -> RepoPipeline {
        RepoPipeline::new(
            Arc::clone(vcs) as Arc<dyn Vcs>,
            PipelineSettings::new("fix-1", "bump deps"),
        )
    }

    fn touching(vcs: &Arc<MemoryVcs>, file: &'static str) -> FixSpec {
        let vcs = Arc::clone(vcs);
        FixSpec::from_fn("touch", move |path: &Path| vcs.touch(path, file))
    }

    fn failed_stage(outcome: &PipelineOutcome) -> FailureStage {
        match outcome {
            PipelineOutcome::Failed { stage, .. } => *stage,
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn change_is_committed_on_branch() {
        let (vcs, repo) = setup();
        let outcome = pipeline(&vcs).run(&repo, &touching(&vcs, "README")).await;

        match outcome {
            PipelineOutcome::Committed {
                branch_name,
                files_changed,
                commit_id,
                ..
            } => {
                assert_eq!(branch_name, "fix-1");
                assert_eq!(files_changed, vec!["README"]);
                assert_eq!(commit_id, "mem-1");
            }
            other => panic!("expected commit, got {other:?}"),
        }
        let commits = vcs.commits(&repo.path);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].message, "bump deps");
    }

    #[tokio::test]
    async fn no_change_is_unchanged() {
        let (vcs, repo) = setup();
        let noop = FixSpec::from_fn("noop", |_| Ok(()));
        let outcome = pipeline(&vcs).run(&repo, &noop).await;

        assert!(matches!(outcome, PipelineOutcome::Unchanged { .. }));
        assert!(vcs.commits(&repo.path).is_empty());
        assert_eq!(vcs.current_branch(&repo.path).as_deref(), Some("fix-1"));
    }

    #[tokio::test]
    async fn dirty_checkout_fails_at_checkout() {
        let (vcs, repo) = setup();
        vcs.touch(&repo.path, "leftover").unwrap();
        let outcome = pipeline(&vcs).run(&repo, &touching(&vcs, "README")).await;
        assert_eq!(failed_stage(&outcome), FailureStage::Checkout);
    }

    #[tokio::test]
    async fn unrunnable_action_fails_at_action() {
        let (vcs, repo) = setup();
        let fix = FixSpec::command(vec!["fleetfix-no-such-binary".to_string()], 0);
        let outcome = pipeline(&vcs).run(&repo, &fix).await;
        assert_eq!(failed_stage(&outcome), FailureStage::Action);
    }

    #[tokio::test]
    async fn deleted_working_copy_fails_at_diff_check() {
        let (vcs, repo) = setup();
        let remover = Arc::clone(&vcs);
        let fix = FixSpec::from_fn("rm -rf .", move |path: &Path| {
            remover.remove_repo(path);
            Ok(())
        });
        let outcome = pipeline(&vcs).run(&repo, &fix).await;
        assert_eq!(failed_stage(&outcome), FailureStage::DiffCheck);
    }

    #[tokio::test]
    async fn commit_failure_fails_at_commit() {
        let (vcs, repo) = setup();
        vcs.fail_at(&repo.path, FailureStage::Commit);
        let outcome = pipeline(&vcs).run(&repo, &touching(&vcs, "README")).await;
        assert_eq!(failed_stage(&outcome), FailureStage::Commit);
    }

    #[tokio::test]
    async fn failing_action_with_changes_is_still_committed() {
        let (vcs, repo) = setup();
        let toucher = Arc::clone(&vcs);
        let fix = FixSpec::from_fn("partial", move |path: &Path| {
            toucher.touch(path, "setup.cfg")?;
            Err("exit status 1".to_string())
        });
        let outcome = pipeline(&vcs).run(&repo, &fix).await;

        match outcome {
            PipelineOutcome::Committed { action, .. } => {
                assert!(!action.success);
                assert_eq!(action.stderr_tail, "exit status 1");
            }
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dry_run_discards_instead_of_committing() {
        let (vcs, repo) = setup();
        let pipeline = RepoPipeline::new(
            Arc::clone(&vcs) as Arc<dyn Vcs>,
            PipelineSettings::new("fix-1", "msg").dry_run(true),
        );
        let outcome = pipeline.run(&repo, &touching(&vcs, "README")).await;

        assert_eq!(outcome.files_changed(), ["README".to_string()]);
        assert_eq!(outcome.kind(), "would_commit");
        assert!(vcs.commits(&repo.path).is_empty());
        assert!(vcs.pending(&repo.path).is_empty());
    }

    #[tokio::test]
    async fn progress_reports_every_state() {
        let (vcs, repo) = setup();
        let (tx, rx) = watch::channel(PipelineState::Idle);
        let outcome = pipeline(&vcs)
            .run_with_progress(&repo, &touching(&vcs, "README"), Some(&tx))
            .await;

        assert_eq!(*rx.borrow(), PipelineState::Done(outcome));
        assert_eq!(rx.borrow().next_stage(), None);
    }

    #[test]
    fn next_stage_follows_the_state_order() {
        let action = ActionReport::default();
        let base = "abc".to_string();
        assert_eq!(PipelineState::Idle.next_stage(), Some(FailureStage::Checkout));
        assert_eq!(
            PipelineState::CheckedOut { base: base.clone() }.next_stage(),
            Some(FailureStage::Action)
        );
        assert_eq!(
            PipelineState::ActionRun {
                base: base.clone(),
                action: action.clone()
            }
            .next_stage(),
            Some(FailureStage::DiffCheck)
        );
        assert_eq!(
            PipelineState::DiffChecked {
                base,
                action,
                files: vec![]
            }
            .next_stage(),
            Some(FailureStage::Commit)
        );
    }

    #[tokio::test]
    async fn author_is_passed_to_commit() {
        let (vcs, repo) = setup();
        let pipeline = RepoPipeline::new(
            Arc::clone(&vcs) as Arc<dyn Vcs>,
            PipelineSettings::new("fix-1", "msg").with_author("Bot <bot@example.com>"),
        );
        pipeline.run(&repo, &touching(&vcs, "README")).await;
        assert_eq!(
            vcs.commits(&PathBuf::from("/fleet/org/a"))[0].author.as_deref(),
            Some("Bot <bot@example.com>")
        );
    }
}
