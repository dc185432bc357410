//! Fleet orchestrator: fans the per-repository pipeline out over a repo set.
//!
//! A fixed pool of `concurrency` workers pulls repositories in submission order from a shared
//! cursor. Each worker runs one repository start to finish before taking the next, and reports
//! over a channel to a single aggregator, which places outcomes by submission index. Workers
//! share no mutable state besides the cursor.
//!
//! A stop request (the shutdown flag turning `true`) lets in-flight repositories finish and
//! keeps workers from starting new ones.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn, Instrument};
use uuid::Uuid;

use crate::action::{panic_message, FixSpec};
use crate::domain::{FailureStage, FleetError, FleetResult, PipelineOutcome, RepoHandle, Result};
use crate::obs;
use crate::pipeline::{PipelineState, RepoPipeline};

enum RepoEvent {
    Started {
        index: usize,
    },
    Finished {
        index: usize,
        outcome: PipelineOutcome,
        duration_ms: u64,
    },
}

/// Runs a [`RepoPipeline`] over many repositories with bounded concurrency.
pub struct FleetOrchestrator {
    pipeline: RepoPipeline,
    concurrency: usize,
    shutdown: Option<watch::Receiver<bool>>,
}

impl FleetOrchestrator {
    pub fn new(pipeline: RepoPipeline) -> Self {
        Self {
            pipeline,
            concurrency: 1,
            shutdown: None,
        }
    }

    /// Maximum number of repositories processed at once. Values below 1 mean 1.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Stop taking new repositories once `shutdown` reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Apply `fix` to every repository and collect one outcome per repository.
    ///
    /// Per-repository failures (including panics) become `Failed` outcomes. Only fleet-level
    /// problems, such as an empty or duplicated repo set, are returned as errors, and those are
    /// detected before any repository is touched.
    pub async fn run(&self, repos: Vec<RepoHandle>, fix: FixSpec) -> Result<FleetResult> {
        if repos.is_empty() {
            return Err(FleetError::NoRepositories);
        }
        {
            let mut seen = HashSet::new();
            if let Some(dup) = repos.iter().find(|r| !seen.insert(&r.path)) {
                return Err(FleetError::DuplicateRepository {
                    path: dup.path.clone(),
                });
            }
        }

        let run_id = Uuid::new_v4();
        self.run_inner(run_id, repos, fix)
            .instrument(obs::fleet_span(&run_id))
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        repos: Vec<RepoHandle>,
        fix: FixSpec,
    ) -> Result<FleetResult> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let total = repos.len();
        let workers = self.concurrency.min(total);
        obs::emit_fleet_started(&run_id, total, workers, fix.description());

        let repos = Arc::new(repos);
        let cursor = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let ctx = Worker {
                    id: worker,
                    repos: Arc::clone(&repos),
                    cursor: Arc::clone(&cursor),
                    pipeline: self.pipeline.clone(),
                    fix: fix.clone(),
                    shutdown: self.shutdown.clone(),
                    tx: tx.clone(),
                };
                tokio::spawn(ctx.run().in_current_span())
            })
            .collect();
        drop(tx);

        let mut slots: Vec<Option<PipelineOutcome>> = vec![None; total];
        while let Some(event) = rx.recv().await {
            match event {
                RepoEvent::Started { index } => {
                    obs::emit_repo_started(&repos[index], index, total);
                }
                RepoEvent::Finished {
                    index,
                    outcome,
                    duration_ms,
                } => {
                    obs::emit_repo_finished(&repos[index], &outcome, duration_ms);
                    match &slots[index] {
                        Some(_) => warn!(repo = %repos[index], "duplicate outcome ignored"),
                        None => slots[index] = Some(outcome),
                    }
                }
            }
        }

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!(error = %e, "fleet worker terminated abnormally");
            }
        }

        let slots = repos.iter().cloned().zip(slots).collect();
        let result = FleetResult::from_slots(run_id, started_at, slots);

        obs::emit_fleet_finished(
            &run_id,
            &result.counts,
            result.not_started.len(),
            clock.elapsed().as_millis() as u64,
        );
        Ok(result)
    }
}

struct Worker {
    id: usize,
    repos: Arc<Vec<RepoHandle>>,
    cursor: Arc<AtomicUsize>,
    pipeline: RepoPipeline,
    fix: FixSpec,
    shutdown: Option<watch::Receiver<bool>>,
    tx: mpsc::UnboundedSender<RepoEvent>,
}

impl Worker {
    async fn run(self) {
        loop {
            if stop_requested(self.shutdown.as_ref()) {
                debug!(worker = self.id, "stop requested, worker exiting");
                break;
            }
            let index = self.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(repo) = self.repos.get(index).cloned() else {
                break;
            };

            let _ = self.tx.send(RepoEvent::Started { index });
            let start = Instant::now();
            let outcome = run_isolated(&self.pipeline, repo, self.fix.clone()).await;
            let event = RepoEvent::Finished {
                index,
                outcome,
                duration_ms: start.elapsed().as_millis() as u64,
            };
            if self.tx.send(event).is_err() {
                break;
            }
        }
    }
}

/// Run one pipeline in its own task so a panic cannot take the worker down with it.
///
/// A panic is blamed on the stage the pipeline was about to run when it died.
async fn run_isolated(pipeline: &RepoPipeline, repo: RepoHandle, fix: FixSpec) -> PipelineOutcome {
    let (progress_tx, progress_rx) = watch::channel(PipelineState::Idle);
    let pipeline = pipeline.clone();
    let task = tokio::spawn(
        async move {
            pipeline
                .run_with_progress(&repo, &fix, Some(&progress_tx))
                .await
        }
        .in_current_span(),
    );

    match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            let stage = progress_rx
                .borrow()
                .next_stage()
                .unwrap_or(FailureStage::Commit);
            let error = if e.is_panic() {
                format!("pipeline panicked: {}", panic_message(e.into_panic().as_ref()))
            } else {
                format!("pipeline task cancelled: {e}")
            };
            PipelineOutcome::Failed { stage, error }
        }
    }
}

fn stop_requested(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.map(|rx| *rx.borrow()).unwrap_or(false)
}
