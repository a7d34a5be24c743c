//! Serial trunk integrator.
//!
//! The single consumer thread here is the only code permitted to check out
//! or mutate the integration branch. Workers submit merge requests over a
//! bounded channel; results come back in FIFO order.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::Config;
use crate::engine::ladder::AgentContext;
use crate::engine::reconciler;
use crate::events::{EventLog, EventRecord};
use crate::git;
use crate::knowledge::KnowledgeGraph;
use crate::learnings::Learnings;
use crate::tracker::{Bead, Tracker};
use crate::verify;
use crate::worktree::WorktreeManager;

/// What a worker produced for its bead.
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    Completed {
        close_reason: String,
        cost_usd: f64,
        duration_ms: u64,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub bead: Bead,
    pub outcome: WorkOutcome,
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub bead_id: String,
    pub success: bool,
    pub error: Option<String>,
}

pub struct MergeQueueContext {
    pub repo_root: PathBuf,
    pub integration_branch: String,
    pub config: Config,
    pub agent: AgentContext,
    pub tracker: Arc<Tracker>,
    pub knowledge: Arc<KnowledgeGraph>,
    pub events: EventLog,
    pub learnings: Arc<Learnings>,
    pub worktrees: Arc<WorktreeManager>,
}

pub struct MergeQueue {
    tx: Option<SyncSender<MergeRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl MergeQueue {
    /// Start the consumer thread. Results are delivered to `results_tx` in
    /// the order requests were consumed.
    pub fn start(
        ctx: MergeQueueContext,
        results_tx: Sender<MergeResult>,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let handle = std::thread::spawn(move || consume(&ctx, &rx, &results_tx));
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Clone the submission side for a worker.
    pub fn sender(&self) -> SyncSender<MergeRequest> {
        self.tx
            .as_ref()
            .cloned()
            .expect("merge queue already finished")
    }

    /// Drop the submission side and wait for the consumer to drain.
    pub fn finish(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MergeQueue {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn consume(
    ctx: &MergeQueueContext,
    rx: &Receiver<MergeRequest>,
    results_tx: &Sender<MergeResult>,
) {
    while let Ok(request) = rx.recv() {
        // A request carrying an execution failure never touches trunk; it
        // just becomes a failure result.
        let result = match &request.outcome {
            WorkOutcome::Failed { error } => Err(error.clone()),
            WorkOutcome::Completed { .. } => {
                let result = integrate(ctx, &request);
                if let Err(ref e) = result {
                    ctx.events.append(
                        EventRecord::new("merge_failed")
                            .bead(&request.bead.id)
                            .error(e),
                    );
                }
                result
            }
        };
        let merge_result = match result {
            Ok(()) => MergeResult {
                bead_id: request.bead.id.clone(),
                success: true,
                error: None,
            },
            Err(e) => MergeResult {
                bead_id: request.bead.id.clone(),
                success: false,
                error: Some(e),
            },
        };
        if results_tx.send(merge_result).is_err() {
            // Scheduler gone; keep draining so workers blocked on the
            // bounded channel can finish.
            tracing::warn!("merge result receiver dropped");
        }
    }
}

/// One integration: switch, merge, verify, reconcile if needed, then the
/// post-success bookkeeping. Errors come back as strings so they become
/// failure results, not panics.
fn integrate(ctx: &MergeQueueContext, request: &MergeRequest) -> Result<(), String> {
    let bead = &request.bead;

    let (close_reason, cost_usd, duration_ms) = match &request.outcome {
        WorkOutcome::Failed { error } => return Err(error.clone()),
        WorkOutcome::Completed {
            close_reason,
            cost_usd,
            duration_ms,
        } => (close_reason.clone(), *cost_usd, *duration_ms),
    };

    ctx.events
        .append(EventRecord::new("merge_started").bead(&bead.id));

    git::switch(&ctx.repo_root, &ctx.integration_branch)
        .map_err(|e| format!("switching to integration branch: {e:#}"))?;

    let branch = ctx.worktrees.branch_for(&bead.id);
    let message = format!("merge {}: {}", bead.id, bead.title);
    match git::merge_no_ff(&ctx.repo_root, &branch, &message)
        .map_err(|e| format!("merging {branch}: {e:#}"))?
    {
        git::MergeOutcome::Merged => {}
        git::MergeOutcome::Conflict { detail } => {
            // Trunk is clean after the abort; conflicts are not retried.
            return Err(format!("merge conflict: {detail}"));
        }
    }

    let steps = verify::assemble_pipeline(&ctx.config, bead);
    let outcome = verify::run_pipeline(&steps, &ctx.repo_root)
        .map_err(|e| format!("post-merge verification: {e:#}"))?;
    if !outcome.passed {
        let repaired = reconciler::reconcile(
            &ctx.agent,
            &steps,
            &ctx.knowledge,
            &ctx.events,
            bead,
            &outcome,
            &ctx.repo_root,
        )
        .map_err(|e| format!("reconciler: {e:#}"))?;
        if !repaired {
            return Err(format!(
                "post-merge verification failed at `{}` and reconcile did not converge",
                outcome.failed_step
            ));
        }
        let recheck = verify::run_pipeline(&steps, &ctx.repo_root)
            .map_err(|e| format!("post-reconcile verification: {e:#}"))?;
        if !recheck.passed {
            return Err(format!(
                "verification failed at `{}` after reconcile",
                recheck.failed_step
            ));
        }
    }

    // Post-success bookkeeping. All of it is best-effort.
    ctx.tracker.close(&bead.id, &close_reason);
    ctx.learnings.append(
        &bead.id,
        close_reason.lines().next().unwrap_or("completed"),
    );
    ctx.knowledge.reindex(&bead.files);
    if let Err(e) = ctx.worktrees.remove(&bead.id) {
        tracing::warn!(bead = %bead.id, "worktree removal failed: {e:#}");
    }

    ctx.events
        .append(EventRecord::new("merge_completed").bead(&bead.id));
    ctx.events.append(
        EventRecord::new("task_completed")
            .bead(&bead.id)
            .duration_ms(duration_ms)
            .cost_usd(cost_usd),
    );
    Ok(())
}
