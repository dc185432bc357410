//! Fix actions: the opaque operation applied to each working copy.
//!
//! The pipeline only sees the [`FixAction`] trait. [`CommandAction`] runs an external process;
//! [`FnAction`] wraps an in-process closure, which lets tests substitute a function for a real
//! command.

use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::domain::{ActionError, ActionReport};
use crate::quote::quote_argv;

const STDERR_TAIL_BYTES: usize = 4096;

/// Anything that can be applied to a working copy.
#[async_trait]
pub trait FixAction: Send + Sync {
    /// Human-readable description, used as the default commit message.
    fn describe(&self) -> String;

    /// Apply the action with `cwd` as the working directory.
    ///
    /// Only a total inability to run is an error; an unsuccessful run is reported through
    /// [`ActionReport::success`].
    async fn apply(&self, cwd: &Path) -> Result<ActionReport, ActionError>;
}

/// External command run inside the working copy.
#[derive(Debug, Clone)]
pub struct CommandAction {
    argv: Vec<String>,
    /// Zero disables the timeout.
    timeout_secs: u64,
}

impl CommandAction {
    pub fn new(argv: Vec<String>, timeout_secs: u64) -> Self {
        Self { argv, timeout_secs }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

#[async_trait]
impl FixAction for CommandAction {
    fn describe(&self) -> String {
        quote_argv(&self.argv)
    }

    async fn apply(&self, cwd: &Path) -> Result<ActionReport, ActionError> {
        let (program, args) = self.argv.split_first().ok_or(ActionError::EmptyCommand)?;
        let start = Instant::now();

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: a terminal Ctrl-C reaches fleetfix only, and a timeout can take
        // down everything the command spawned.
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| ActionError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();

        let output = if self.timeout_secs > 0 {
            match tokio::time::timeout(
                Duration::from_secs(self.timeout_secs),
                child.wait_with_output(),
            )
            .await
            {
                Ok(output) => output?,
                Err(_) => {
                    kill_process_group(pid);
                    return Err(ActionError::TimedOut {
                        secs: self.timeout_secs,
                    });
                }
            }
        } else {
            child.wait_with_output().await?
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(stdout = %tail(&stdout, STDERR_TAIL_BYTES), "fix action output");
        }

        Ok(ActionReport {
            exit_code: output.status.code(),
            success: output.status.success(),
            duration_ms: start.elapsed().as_millis() as u64,
            stderr_tail: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_BYTES),
        })
    }
}

/// SIGKILL the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) only signals processes; a negative pid addresses the group we created.
    let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if ret != 0 {
        debug!(
            pgid,
            error = %std::io::Error::last_os_error(),
            "process group already gone"
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

type FixFn = dyn Fn(&Path) -> Result<(), String> + Send + Sync;

/// In-process action backed by a closure.
///
/// The closure runs on the blocking pool. `Err(text)` is reported like a non-zero exit; a panic
/// becomes [`ActionError::Panicked`].
#[derive(Clone)]
pub struct FnAction {
    description: String,
    f: Arc<FixFn>,
}

impl FnAction {
    pub fn new<F>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Path) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for FnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAction")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FixAction for FnAction {
    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn apply(&self, cwd: &Path) -> Result<ActionReport, ActionError> {
        let f = Arc::clone(&self.f);
        let cwd: PathBuf = cwd.to_path_buf();
        let start = Instant::now();

        let result = tokio::task::spawn_blocking(move || f(&cwd))
            .await
            .map_err(|e| match e.try_into_panic() {
                Ok(payload) => ActionError::Panicked(panic_message(payload.as_ref())),
                Err(e) => ActionError::Panicked(e.to_string()),
            })?;

        let duration_ms = start.elapsed().as_millis() as u64;
        Ok(match result {
            Ok(()) => ActionReport {
                exit_code: None,
                success: true,
                duration_ms,
                stderr_tail: String::new(),
            },
            Err(text) => ActionReport {
                exit_code: None,
                success: false,
                duration_ms,
                stderr_tail: tail(&text, STDERR_TAIL_BYTES),
            },
        })
    }
}

/// The fix to apply across the fleet. Cheap to clone; shared read-only by every worker.
#[derive(Clone)]
pub struct FixSpec {
    action: Arc<dyn FixAction>,
    description: String,
}

impl FixSpec {
    pub fn new(action: impl FixAction + 'static) -> Self {
        let description = action.describe();
        Self {
            action: Arc::new(action),
            description,
        }
    }

    /// A fix that runs `argv` in every working copy.
    pub fn command(argv: Vec<String>, timeout_secs: u64) -> Self {
        Self::new(CommandAction::new(argv, timeout_secs))
    }

    pub fn from_fn<F>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Path) -> Result<(), String> + Send + Sync + 'static,
    {
        Self::new(FnAction::new(description, f))
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub async fn apply(&self, cwd: &Path) -> Result<ActionReport, ActionError> {
        self.action.apply(cwd).await
    }
}

impl fmt::Debug for FixSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixSpec")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn tail(text: &str, max_bytes: usize) -> String {
    let text = text.trim_end();
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn command_description_is_quoted() {
        let spec = FixSpec::command(argv(&["sh", "-c", "echo hi > README"]), 0);
        assert_eq!(spec.description(), "sh -c 'echo hi > README'");
    }

    #[tokio::test]
    async fn command_runs_in_working_copy() {
        let dir = tempfile::tempdir().unwrap();
        let action = CommandAction::new(argv(&["sh", "-c", "echo fixed > marker"]), 60);

        let report = action.apply(dir.path()).await.expect("apply failed");
        assert!(report.success);
        assert_eq!(report.exit_code, Some(0));
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let action = CommandAction::new(argv(&["sh", "-c", "echo broken >&2; exit 3"]), 60);

        let report = action.apply(dir.path()).await.expect("apply failed");
        assert!(!report.success);
        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.stderr_tail, "broken");
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let action = CommandAction::new(argv(&["fleetfix-definitely-not-a-binary"]), 60);

        let err = action.apply(dir.path()).await.unwrap_err();
        assert!(matches!(err, ActionError::Spawn { .. }));
    }

    #[tokio::test]
    async fn empty_command_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandAction::new(vec![], 0)
            .apply(dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::EmptyCommand));
    }

    #[tokio::test]
    async fn timeout_kills_the_action() {
        let dir = tempfile::tempdir().unwrap();
        let action = CommandAction::new(argv(&["sleep", "5"]), 1);

        let err = action.apply(dir.path()).await.unwrap_err();
        assert!(matches!(err, ActionError::TimedOut { secs: 1 }));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn command_runs_in_its_own_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let action = CommandAction::new(
            argv(&["sh", "-c", "echo $$ $(cut -d' ' -f5 /proc/$$/stat) > ids"]),
            60,
        );

        action.apply(dir.path()).await.expect("apply failed");

        let ids = std::fs::read_to_string(dir.path().join("ids")).unwrap();
        let ids: Vec<i32> = ids.split_whitespace().map(|id| id.parse().unwrap()).collect();
        let (pid, pgid) = (ids[0], ids[1]);
        assert_eq!(pgid, pid, "command should lead its own process group");
        assert_ne!(pgid, unsafe { libc::getpgrp() });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_background_children_too() {
        let dir = tempfile::tempdir().unwrap();
        let action = CommandAction::new(
            argv(&["sh", "-c", "(sleep 2; echo late > late.txt) & wait"]),
            1,
        );

        let err = action.apply(dir.path()).await.unwrap_err();
        assert!(matches!(err, ActionError::TimedOut { secs: 1 }));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("late.txt").exists());
    }

    #[tokio::test]
    async fn fn_action_error_text_becomes_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let action = FnAction::new("refuse", |_| Err("nothing to do".to_string()));

        let report = action.apply(dir.path()).await.expect("apply failed");
        assert!(!report.success);
        assert_eq!(report.stderr_tail, "nothing to do");
    }

    #[tokio::test]
    async fn fn_action_panic_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let action = FnAction::new("explode", |_| panic!("kaboom"));

        let err = action.apply(dir.path()).await.unwrap_err();
        match err {
            ActionError::Panicked(msg) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let text = "ééééé";
        let t = tail(text, 3);
        assert!(text.ends_with(&t));
        assert!(t.len() <= 3);
    }
}
