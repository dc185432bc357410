//! In-memory fakes for the VCS trait (testing only)
//!
//! [`MemoryVcs`] keeps a pending change set and a commit log per working copy, and can be told
//! to fail at a given stage, so every pipeline transition can be exercised without `git`.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::domain::{FailureStage, VcsError};
use crate::git::Vcs;

/// A commit recorded by [`MemoryVcs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCommit {
    pub id: String,
    pub branch: String,
    pub message: String,
    pub author: Option<String>,
    pub files: Vec<String>,
}

#[derive(Debug, Default)]
struct RepoState {
    branch: Option<String>,
    pending: BTreeSet<String>,
    commits: Vec<MemoryCommit>,
    fail_at: Option<FailureStage>,
}

impl RepoState {
    fn head(&self) -> String {
        format!("mem-{}", self.commits.len())
    }

    fn injected(&self, stage: FailureStage) -> Result<(), VcsError> {
        if self.fail_at == Some(stage) {
            return Err(VcsError::CommandFailed {
                command: format!("memory {stage}"),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

/// In-memory [`Vcs`] keyed by working-copy path.
#[derive(Debug, Default)]
pub struct MemoryVcs {
    repos: Mutex<HashMap<PathBuf, RepoState>>,
}

impl MemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    fn repos(&self) -> MutexGuard<'_, HashMap<PathBuf, RepoState>> {
        self.repos.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a clean working copy.
    pub fn add_repo(&self, path: impl Into<PathBuf>) {
        self.repos().insert(path.into(), RepoState::default());
    }

    /// Forget a working copy, as if its directory had been deleted.
    pub fn remove_repo(&self, path: &Path) {
        self.repos().remove(path);
    }

    /// Mark `file` as modified in the working copy at `path`.
    pub fn touch(&self, path: &Path, file: &str) -> Result<(), String> {
        let mut repos = self.repos();
        let state = repos
            .get_mut(path)
            .ok_or_else(|| format!("unknown working copy {}", path.display()))?;
        state.pending.insert(file.to_string());
        Ok(())
    }

    /// Make the next VCS call for `stage` on `path` fail.
    pub fn fail_at(&self, path: &Path, stage: FailureStage) {
        if let Some(state) = self.repos().get_mut(path) {
            state.fail_at = Some(stage);
        }
    }

    pub fn commits(&self, path: &Path) -> Vec<MemoryCommit> {
        self.repos()
            .get(path)
            .map(|s| s.commits.clone())
            .unwrap_or_default()
    }

    pub fn current_branch(&self, path: &Path) -> Option<String> {
        self.repos().get(path).and_then(|s| s.branch.clone())
    }

    pub fn pending(&self, path: &Path) -> Vec<String> {
        self.repos()
            .get(path)
            .map(|s| s.pending.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn missing(path: &Path) -> VcsError {
    VcsError::MissingWorkingCopy {
        path: path.to_path_buf(),
    }
}

#[async_trait]
impl Vcs for MemoryVcs {
    async fn checkout_branch(&self, repo: &Path, branch: &str) -> Result<String, VcsError> {
        let mut repos = self.repos();
        let state = repos.get_mut(repo).ok_or_else(|| missing(repo))?;
        state.injected(FailureStage::Checkout)?;
        if !state.pending.is_empty() {
            return Err(VcsError::Dirty {
                entries: state.pending.iter().cloned().collect(),
            });
        }
        state.branch = Some(branch.to_string());
        Ok(state.head())
    }

    async fn changed_files(&self, repo: &Path) -> Result<Vec<String>, VcsError> {
        let repos = self.repos();
        let state = repos.get(repo).ok_or_else(|| missing(repo))?;
        state.injected(FailureStage::DiffCheck)?;
        Ok(state.pending.iter().cloned().collect())
    }

    async fn commit(
        &self,
        repo: &Path,
        message: &str,
        author: Option<&str>,
    ) -> Result<String, VcsError> {
        let mut repos = self.repos();
        let state = repos.get_mut(repo).ok_or_else(|| missing(repo))?;
        state.injected(FailureStage::Commit)?;
        if state.pending.is_empty() {
            return Err(VcsError::NothingStaged);
        }
        let files = std::mem::take(&mut state.pending).into_iter().collect();
        let commit = MemoryCommit {
            id: format!("mem-{}", state.commits.len() + 1),
            branch: state.branch.clone().unwrap_or_default(),
            message: message.to_string(),
            author: author.map(str::to_string),
            files,
        };
        state.commits.push(commit);
        Ok(state.head())
    }

    async fn discard_changes(&self, repo: &Path) -> Result<(), VcsError> {
        let mut repos = self.repos();
        let state = repos.get_mut(repo).ok_or_else(|| missing(repo))?;
        state.pending.clear();
        Ok(())
    }
}
