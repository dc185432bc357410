//! Version-control primitives used by the pipeline.
//!
//! [`Vcs`] is the seam; [`GitCli`] implements it by shelling out to `git`.
//!
//! Change policy: a path counts as changed when `git status` reports it, i.e. tracked paths
//! that were modified, deleted or renamed, and new paths that are not ignored. Ignored paths
//! never count.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::domain::VcsError;

/// Version-control operations on one working copy.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Create or reset `branch` at the current tip and switch to it.
    ///
    /// Fails with [`VcsError::Dirty`] when the working copy has pending changes. Returns the
    /// commit id of the branch point.
    async fn checkout_branch(&self, repo: &Path, branch: &str) -> Result<String, VcsError>;

    /// Paths that differ from the branch point, sorted. Empty means unchanged.
    async fn changed_files(&self, repo: &Path) -> Result<Vec<String>, VcsError>;

    /// Stage every change and commit it, returning the new commit id.
    async fn commit(
        &self,
        repo: &Path,
        message: &str,
        author: Option<&str>,
    ) -> Result<String, VcsError>;

    /// Throw away every uncommitted change except ignored files.
    async fn discard_changes(&self, repo: &Path) -> Result<(), VcsError>;
}

/// [`Vcs`] backed by the `git` executable.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    async fn output(&self, repo: &Path, args: &[&str]) -> Result<Output, VcsError> {
        if !repo.is_dir() {
            return Err(VcsError::MissingWorkingCopy {
                path: repo.to_path_buf(),
            });
        }
        debug!(repo = %repo.display(), args = ?args, "git");
        Command::new("git")
            .args(args)
            .current_dir(repo)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| VcsError::Spawn {
                command: command_line(args),
                source,
            })
    }

    async fn run(&self, repo: &Path, args: &[&str]) -> Result<String, VcsError> {
        let output = self.output(repo, args).await?;
        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command: command_line(args),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Capture the HEAD commit SHA.
    pub async fn head_sha(&self, repo: &Path) -> Result<String, VcsError> {
        let sha = self.run(repo, &["rev-parse", "HEAD"]).await?.trim().to_string();
        if sha.is_empty() {
            return Err(VcsError::Output(
                "git rev-parse HEAD returned empty output".to_string(),
            ));
        }
        Ok(sha)
    }

    /// Fail unless `repo` is the top level of its own working copy.
    ///
    /// A plain directory nested in another checkout would otherwise have git act on the
    /// enclosing repository.
    async fn ensure_toplevel(&self, repo: &Path) -> Result<(), VcsError> {
        let not_a_repo = || VcsError::NotARepository {
            path: repo.to_path_buf(),
        };
        let output = self.output(repo, &["rev-parse", "--show-toplevel"]).await?;
        if !output.status.success() {
            return Err(not_a_repo());
        }
        let toplevel = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        match (
            tokio::fs::canonicalize(&toplevel).await,
            tokio::fs::canonicalize(repo).await,
        ) {
            (Ok(toplevel), Ok(repo)) if toplevel == repo => Ok(()),
            _ => Err(not_a_repo()),
        }
    }

    async fn status(&self, repo: &Path) -> Result<Vec<String>, VcsError> {
        let out = self
            .run(
                repo,
                &["status", "--porcelain=v1", "-z", "--untracked-files=all"],
            )
            .await?;
        parse_porcelain_z(&out)
    }
}

#[async_trait]
impl Vcs for GitCli {
    async fn checkout_branch(&self, repo: &Path, branch: &str) -> Result<String, VcsError> {
        self.ensure_toplevel(repo).await?;
        let pending = self.status(repo).await?;
        if !pending.is_empty() {
            return Err(VcsError::Dirty { entries: pending });
        }
        let base = self.head_sha(repo).await?;
        self.run(repo, &["checkout", "-q", "-B", branch]).await?;
        Ok(base)
    }

    async fn changed_files(&self, repo: &Path) -> Result<Vec<String>, VcsError> {
        self.status(repo).await
    }

    async fn commit(
        &self,
        repo: &Path,
        message: &str,
        author: Option<&str>,
    ) -> Result<String, VcsError> {
        self.run(repo, &["add", "-A"]).await?;

        let staged = self.output(repo, &["diff", "--cached", "--quiet"]).await?;
        match staged.status.code() {
            Some(1) => {}
            Some(0) => return Err(VcsError::NothingStaged),
            _ => {
                return Err(VcsError::CommandFailed {
                    command: "git diff --cached --quiet".to_string(),
                    stderr: String::from_utf8_lossy(&staged.stderr).trim().to_string(),
                })
            }
        }

        let mut args = vec!["commit", "-q", "-m", message];
        if let Some(author) = author {
            args.push("--author");
            args.push(author);
        }
        self.run(repo, &args).await?;
        self.head_sha(repo).await
    }

    async fn discard_changes(&self, repo: &Path) -> Result<(), VcsError> {
        self.run(repo, &["reset", "-q", "--hard", "HEAD"]).await?;
        self.run(repo, &["clean", "-fdq"]).await?;
        Ok(())
    }
}

fn command_line(args: &[&str]) -> String {
    format!("git {}", args.join(" "))
}

/// Parse `git status --porcelain=v1 -z` into a sorted, de-duplicated path list.
///
/// Renames and copies contribute both the new and the original path.
fn parse_porcelain_z(out: &str) -> Result<Vec<String>, VcsError> {
    let mut files = BTreeSet::new();
    let mut fields = out.split('\0').filter(|f| !f.is_empty());

    while let Some(entry) = fields.next() {
        let bytes = entry.as_bytes();
        if bytes.len() < 4 || bytes[2] != b' ' {
            return Err(VcsError::Output(format!("malformed status entry: {entry:?}")));
        }
        let (x, path) = (bytes[0], &entry[3..]);
        files.insert(path.to_string());
        if x == b'R' || x == b'C' {
            if let Some(orig) = fields.next() {
                files.insert(orig.to_string());
            }
        }
    }

    Ok(files.into_iter().collect())
}
