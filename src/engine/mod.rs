//! The run controller: state initialisation, group iteration, the
//! sequential and parallel execution paths, and checkpoint flushing.

pub mod groups;
pub mod ladder;
pub mod merge_queue;
pub mod prompt;
pub mod reconciler;
pub mod report;
pub mod resume;
pub mod scheduler;
pub mod stuck;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;

use crate::config::{Config, StatePaths};
use crate::coordinator::{Coordinator, DEFAULT_LOCK_STALE_AFTER};
use crate::error::ExitError;
use crate::events::{EventLog, EventRecord};
use crate::git;
use crate::knowledge::KnowledgeGraph;
use crate::learnings::Learnings;
use crate::state::pool::PoolSnapshot;
use crate::state::{CheckpointStore, CircuitBreaker, ExecutionPool, ExecutionState};
use crate::tracker::{Bead, BeadStatus, Tracker};
use crate::verify;
use crate::worktree::WorktreeManager;

use groups::ExecutionGroup;
use ladder::{AgentContext, WorkerContext};
use merge_queue::{MergeQueue, MergeQueueContext, MergeRequest, MergeResult, WorkOutcome};
use report::BeadReport;
use resume::ResumeInfo;
use stuck::{BreakerChoice, Prompter, StuckResolution};

/// Default tool allow-list handed to the agent subprocess.
const DEFAULT_ALLOWED_TOOLS: &[&str] = &["Bash", "Edit", "Write", "Read", "Glob", "Grep"];

pub struct RunOptions {
    pub project_root: PathBuf,
    pub resume: Option<ResumeInfo>,
    /// Agent program on PATH. Tests substitute a stub.
    pub agent_program: String,
    /// Tracker program on PATH. Tests substitute a stub.
    pub tracker_program: String,
}

impl RunOptions {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            resume: None,
            agent_program: "claude".to_string(),
            tracker_program: "br".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub snapshot: PoolSnapshot,
}

/// Whether to keep iterating groups after a breaker decision.
enum LoopControl {
    Continue,
    SkipRemaining,
}

struct Controller<'a> {
    config: &'a Config,
    repo_root: PathBuf,
    run_id: String,
    run_dir: PathBuf,
    integration_branch: String,
    events: EventLog,
    tracker: Arc<Tracker>,
    knowledge: Arc<KnowledgeGraph>,
    learnings: Arc<Learnings>,
    worktrees: Arc<WorktreeManager>,
    breaker: CircuitBreaker,
    pool: ExecutionPool,
    checkpoint: CheckpointStore,
    state: ExecutionState,
    agent: AgentContext,
    cancel: Arc<AtomicBool>,
    terminal: BTreeMap<String, BeadStatus>,
    outcomes: Vec<BeadReport>,
    beads_by_id: BTreeMap<String, Bead>,
}

/// Execute (or resume) a run. Only a run-wide abort comes back as an error;
/// per-bead failures are absorbed into the summary.
pub fn run(
    config: &Config,
    options: &RunOptions,
    prompter: &mut dyn Prompter,
) -> anyhow::Result<RunSummary> {
    let started_at = Utc::now();
    let project_root = options.project_root.clone();
    let paths = StatePaths::new(&project_root);
    paths.ensure()?;
    resume::prune_old_runs(&paths, config.cleanup.max_age_days);

    if !git::is_repo(&project_root) {
        return Err(ExitError::Config(format!(
            "{} is not a git repository",
            project_root.display()
        ))
        .into());
    }
    git::ensure_initial_commit(&project_root)?;

    let run_id = options
        .resume
        .as_ref()
        .map_or_else(|| started_at.format("%Y%m%d-%H%M%S").to_string(), |r| r.run_id.clone());
    let run_dir = paths.run_dir(&run_id);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let integration_branch = format!("{}run-{run_id}", config.branch_prefix());
    if !git::branch_exists(&project_root, &integration_branch) {
        git::create_branch(&project_root, &integration_branch)?;
    }
    git::switch(&project_root, &integration_branch)?;

    let system_prompt = prompt::seed_system_prompt(&project_root, &paths);
    let events = EventLog::new(&paths.event_log());
    let tracker = Arc::new(
        Tracker::new(&project_root, &paths.bead_meta_dir())
            .with_program(&options.tracker_program),
    );
    let knowledge = Arc::new(KnowledgeGraph::new(
        &project_root,
        config.knowledge_graph.enabled,
    ));
    let learnings = Arc::new(Learnings::new(&paths.learnings_file()));
    let worktrees = Arc::new(WorktreeManager::new(
        &project_root,
        &paths.worktrees_dir(),
        config.branch_prefix(),
        &integration_branch,
    ));

    // Bead list from the tracker. A dead tracker means there is nothing we
    // can drive; report and stop rather than abort.
    let all_beads = match tracker.all() {
        Ok(beads) => beads,
        Err(e) => {
            tracing::warn!("tracker unavailable: {e:#}");
            eprintln!("Tracker unavailable; nothing to run.");
            Vec::new()
        }
    };
    let done: BTreeSet<String> = all_beads
        .iter()
        .filter(|b| b.status == BeadStatus::Done)
        .map(|b| b.id.clone())
        .collect();
    let open: Vec<Bead> = all_beads
        .iter()
        .filter(|b| b.status == BeadStatus::Open)
        .cloned()
        .collect();
    let (runnable, blocked) = partition_blocked(&open, &done);

    events.append(EventRecord::new("run_started"));
    if runnable.is_empty() && blocked.is_empty() {
        eprintln!("No beads ready.");
        events.append(EventRecord::new("run_complete"));
        return Ok(RunSummary {
            run_id,
            snapshot: PoolSnapshot::default(),
        });
    }

    let computed_groups = groups::compute_groups(
        &runnable,
        config.execution.parallel_mode,
        config.parallel_threshold(),
    );
    let any_parallel = computed_groups.iter().any(|g| g.parallel);

    // The coordinator only exists when some group actually runs in parallel.
    let coordinator = if any_parallel {
        match Coordinator::start(DEFAULT_LOCK_STALE_AFTER) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!("coordinator failed to start: {e:#}");
                None
            }
        }
    } else {
        None
    };
    let mcp_config = coordinator
        .as_ref()
        .and_then(|c| write_mcp_config(&run_dir, &c.base_url()));

    let breaker = CircuitBreaker::new(config.breaker_threshold());
    let mut state = ExecutionState {
        run_id: run_id.clone(),
        ..ExecutionState::default()
    };
    if let Some(restored) = options.resume.as_ref().and_then(|r| r.state.clone()) {
        breaker.set(restored.consecutive_failures);
        state.completed = restored.completed;
        state.failed = restored.failed;
        state.retry_counts = restored.retry_counts;
        state.consecutive_failures = restored.consecutive_failures;
        state.last_error = restored.last_error;
    }

    let pool = ExecutionPool::new(runnable.len() + blocked.len());
    let cancel = Arc::new(AtomicBool::new(false));
    install_cancel_handler(Arc::clone(&cancel));

    let mut terminal: BTreeMap<String, BeadStatus> = BTreeMap::new();
    for id in &done {
        terminal.insert(id.clone(), BeadStatus::Done);
    }

    let mut controller = Controller {
        config,
        repo_root: project_root,
        run_id: run_id.clone(),
        run_dir: run_dir.clone(),
        integration_branch,
        events,
        tracker,
        knowledge,
        learnings,
        worktrees,
        breaker,
        pool,
        checkpoint: CheckpointStore::new(&run_dir),
        state,
        agent: AgentContext {
            program: options.agent_program.clone(),
            system_prompt,
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|s| (*s).to_string()).collect(),
            mcp_config,
            timeout: Duration::from_secs(config.timeout_per_bead()),
        },
        cancel,
        terminal,
        outcomes: Vec::new(),
        beads_by_id: runnable
            .iter()
            .chain(blocked.iter())
            .map(|b| (b.id.clone(), b.clone()))
            .collect(),
    };

    for bead in &blocked {
        controller.skip_bead(&bead.id, "blocked by an unresolvable dependency");
    }

    let result = controller.run_groups(&computed_groups, prompter);
    drop(coordinator);

    let snapshot = controller.finish(started_at, result.is_ok())?;
    result?;

    if controller.cancel.load(Ordering::SeqCst) {
        return Err(ExitError::RunAborted("interrupted by operator".to_string()).into());
    }
    Ok(RunSummary { run_id, snapshot })
}

impl Controller<'_> {
    fn run_groups(
        &mut self,
        computed_groups: &[ExecutionGroup],
        prompter: &mut dyn Prompter,
    ) -> anyhow::Result<()> {
        for group in computed_groups {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }

            // Cross-group cascade: a bead whose dependency ended stuck or
            // skipped can never run.
            let mut group_beads = Vec::new();
            for id in &group.bead_ids {
                if self.terminal.contains_key(id) {
                    continue;
                }
                let bead = self.beads_by_id[id].clone();
                let blocked = bead.deps.iter().any(|d| {
                    matches!(
                        self.terminal.get(d),
                        Some(BeadStatus::Stuck | BeadStatus::Skipped)
                    )
                });
                if blocked {
                    self.skip_bead(id, "dependency did not complete");
                } else {
                    group_beads.push(bead);
                }
            }
            if group_beads.is_empty() {
                continue;
            }

            for bead in &group_beads {
                self.tracker.set_status(&bead.id, BeadStatus::InProgress);
                self.events
                    .append(EventRecord::new("task_started").bead(&bead.id));
            }

            let control = if group.parallel {
                self.run_parallel_group(&group_beads, prompter)?
            } else {
                self.run_sequential_group(&group_beads, prompter)?
            };

            if matches!(control, LoopControl::SkipRemaining) {
                let remaining: Vec<String> = self
                    .beads_by_id
                    .keys()
                    .filter(|id| !self.terminal.contains_key(*id))
                    .cloned()
                    .collect();
                for id in remaining {
                    self.skip_bead(&id, "skipped at circuit-breaker prompt");
                }
                break;
            }
        }
        Ok(())
    }

    /// Sequential walk: no worktrees, no merge queue. The ladder runs in
    /// the repository itself, on the integration branch.
    fn run_sequential_group(
        &mut self,
        beads: &[Bead],
        prompter: &mut dyn Prompter,
    ) -> anyhow::Result<LoopControl> {
        for bead in beads {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            self.state.current_bead = bead.id.clone();
            self.save_checkpoint();

            let repo_root = self.repo_root.clone();
            let wctx = self.worker_context(bead);
            self.events
                .append(EventRecord::new("worker_started").bead(&bead.id));
            let outcome = ladder::run(&wctx, bead, &repo_root)?;
            self.events
                .append(EventRecord::new("worker_completed").bead(&bead.id));
            self.state.retry_counts.insert(bead.id.clone(), outcome.attempts);

            if outcome.passed {
                self.complete_bead_on_trunk(bead, &outcome.result_text, outcome.cost_usd, outcome.duration_ms);
            } else {
                match stuck::handle(&wctx, prompter, bead, &outcome, &repo_root)? {
                    StuckResolution::Resolved { close_reason } => {
                        self.complete_bead_on_trunk(bead, &close_reason, outcome.cost_usd, outcome.duration_ms);
                    }
                    StuckResolution::Skipped => {
                        self.stuck_bead(&bead.id, outcome.errors.last().map_or("", String::as_str));
                    }
                    StuckResolution::Aborted => {
                        self.state.last_error = format!("operator aborted at {}", bead.id);
                        self.save_checkpoint();
                        return Err(ExitError::RunAborted(format!(
                            "aborted at bead {}",
                            bead.id
                        ))
                        .into());
                    }
                }
            }
            self.save_checkpoint();

            if self.breaker.should_pause() {
                match self.breaker_gate(prompter)? {
                    LoopControl::Continue => {}
                    LoopControl::SkipRemaining => return Ok(LoopControl::SkipRemaining),
                }
            }
        }
        Ok(LoopControl::Continue)
    }

    /// Parallel path: per-bead worktrees, the scheduler, and the serial
    /// merge queue.
    fn run_parallel_group(
        &mut self,
        beads: &[Bead],
        prompter: &mut dyn Prompter,
    ) -> anyhow::Result<LoopControl> {
        let (results_tx, results_rx) = mpsc::channel();
        let queue = MergeQueue::start(
            MergeQueueContext {
                repo_root: self.repo_root.clone(),
                integration_branch: self.integration_branch.clone(),
                config: self.config.clone(),
                agent: self.agent.clone(),
                tracker: Arc::clone(&self.tracker),
                knowledge: Arc::clone(&self.knowledge),
                events: self.events.clone(),
                learnings: Arc::clone(&self.learnings),
                worktrees: Arc::clone(&self.worktrees),
            },
            results_tx,
            self.config.max_parallel(),
        );
        let submit = queue.sender();

        let worker = self.make_worker();
        let max_parallel = self.config.max_parallel();
        let cancel = Arc::clone(&self.cancel);

        // Split borrows for the per-result callback: counters and state
        // update, then a checkpoint flush, after every terminal bead event.
        let pool = &self.pool;
        let breaker = &self.breaker;
        let tracker = Arc::clone(&self.tracker);
        let state = &mut self.state;
        let checkpoint = &self.checkpoint;
        let mut on_result = |result: &MergeResult| {
            if result.success {
                pool.record_completed();
                breaker.record_success();
                state.completed.push(result.bead_id.clone());
            } else {
                pool.record_stuck();
                breaker.record_failure();
                tracker.set_status(&result.bead_id, BeadStatus::Stuck);
                state.failed.push(result.bead_id.clone());
                state.last_error = result.error.clone().unwrap_or_default();
            }
            state.consecutive_failures = breaker.count();
            if let Err(e) = checkpoint.save(state) {
                tracing::warn!("checkpoint save failed: {e:#}");
            }
        };

        let outcome = scheduler::run_group(
            beads,
            max_parallel,
            &cancel,
            &submit,
            &results_rx,
            &worker,
            &mut on_result,
        );
        drop(submit);
        queue.finish();

        for id in &outcome.completed {
            self.terminal.insert(id.clone(), BeadStatus::Done);
            self.push_report(id, "done");
        }
        for id in &outcome.failed {
            self.terminal.insert(id.clone(), BeadStatus::Stuck);
            self.push_report(id, "stuck");
        }
        for id in outcome.skipped.clone() {
            self.skip_bead(&id, "dependency failed in this group");
        }

        if self.breaker.should_pause() {
            return self.breaker_gate(prompter);
        }
        Ok(LoopControl::Continue)
    }

    /// Build the worker closure run on scheduler threads. It owns clones of
    /// everything it touches; the merge queue handles all trunk access.
    fn make_worker(&self) -> scheduler::WorkerFn {
        let agent = self.agent.clone();
        let config = self.config.clone();
        let knowledge = Arc::clone(&self.knowledge);
        let learnings = Arc::clone(&self.learnings);
        let worktrees = Arc::clone(&self.worktrees);
        let events = self.events.clone();

        Arc::new(move |bead: Bead| {
            events.append(EventRecord::new("worker_started").bead(&bead.id));
            let workdir = match worktrees.create(&bead.id) {
                Ok(path) => path,
                Err(e) => {
                    return MergeRequest {
                        bead,
                        outcome: WorkOutcome::Failed {
                            error: format!("worktree creation failed: {e:#}"),
                        },
                    };
                }
            };

            let wctx = WorkerContext {
                agent: agent.clone(),
                verify_steps: verify::assemble_pipeline(&config, &bead),
                graph: knowledge.impact(&bead.files),
                learnings: learnings.read_for_prompt(),
                events: events.clone(),
            };

            let outcome = match ladder::run(&wctx, &bead, &workdir) {
                Ok(outcome) => outcome,
                Err(e) => {
                    return MergeRequest {
                        bead,
                        outcome: WorkOutcome::Failed {
                            error: format!("ladder error: {e:#}"),
                        },
                    };
                }
            };
            events.append(EventRecord::new("worker_completed").bead(&bead.id));

            if outcome.passed {
                // Catch-all commit so uncommitted agent edits are never
                // lost at the merge boundary.
                if let Err(e) = git::commit_all(&workdir, &format!("{}: {}", bead.id, bead.title)) {
                    tracing::warn!(bead = %bead.id, "catch-all commit failed: {e:#}");
                }
                MergeRequest {
                    bead,
                    outcome: WorkOutcome::Completed {
                        close_reason: outcome.result_text,
                        cost_usd: outcome.cost_usd,
                        duration_ms: outcome.duration_ms,
                    },
                }
            } else {
                let error = outcome
                    .errors
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "retry ladder exhausted".to_string());
                MergeRequest {
                    bead,
                    outcome: WorkOutcome::Failed { error },
                }
            }
        })
    }

    fn worker_context(&self, bead: &Bead) -> WorkerContext {
        WorkerContext {
            agent: self.agent.clone(),
            verify_steps: verify::assemble_pipeline(self.config, bead),
            graph: self.knowledge.impact(&bead.files),
            learnings: self.learnings.read_for_prompt(),
            events: self.events.clone(),
        }
    }

    /// Success bookkeeping for the sequential path, where commits land
    /// directly on the integration branch.
    fn complete_bead_on_trunk(
        &mut self,
        bead: &Bead,
        close_reason: &str,
        cost_usd: f64,
        duration_ms: u64,
    ) {
        match git::commit_all(&self.repo_root, &format!("{}: {}", bead.id, bead.title)) {
            Ok(true) => tracing::debug!(bead = %bead.id, "catch-all commit created"),
            Ok(false) => {}
            Err(e) => tracing::warn!(bead = %bead.id, "catch-all commit failed: {e:#}"),
        }
        self.tracker.close(&bead.id, close_reason);
        self.learnings
            .append(&bead.id, close_reason.lines().next().unwrap_or("completed"));
        self.knowledge.reindex(&bead.files);
        self.pool.record_completed();
        self.breaker.record_success();
        self.state.completed.push(bead.id.clone());
        self.state.current_bead.clear();
        self.terminal.insert(bead.id.clone(), BeadStatus::Done);
        self.events.append(
            EventRecord::new("task_completed")
                .bead(&bead.id)
                .duration_ms(duration_ms)
                .cost_usd(cost_usd),
        );
        self.push_report(&bead.id, "done");
    }

    fn stuck_bead(&mut self, id: &str, last_error: &str) {
        self.tracker.set_status(id, BeadStatus::Stuck);
        self.pool.record_stuck();
        self.breaker.record_failure();
        self.state.failed.push(id.to_string());
        self.state.last_error = last_error.to_string();
        self.state.current_bead.clear();
        self.terminal.insert(id.to_string(), BeadStatus::Stuck);
        self.push_report(id, "stuck");
    }

    fn skip_bead(&mut self, id: &str, reason: &str) {
        tracing::info!(bead = id, reason, "skipping bead");
        self.tracker.set_status(id, BeadStatus::Skipped);
        self.pool.record_skipped();
        self.terminal.insert(id.to_string(), BeadStatus::Skipped);
        self.push_report(id, &format!("skipped: {reason}"));
        self.save_checkpoint();
    }

    fn push_report(&mut self, id: &str, outcome: &str) {
        let title = self
            .beads_by_id
            .get(id)
            .map_or_else(String::new, |b| b.title.clone());
        self.outcomes.push(BeadReport {
            id: id.to_string(),
            title,
            outcome: outcome.to_string(),
        });
    }

    fn save_checkpoint(&mut self) {
        self.state.consecutive_failures = self.breaker.count();
        if let Err(e) = self.checkpoint.save(&mut self.state) {
            tracing::warn!("checkpoint save failed: {e:#}");
        }
    }

    /// The circuit breaker fired: checkpoint, then ask the operator.
    fn breaker_gate(&mut self, prompter: &mut dyn Prompter) -> anyhow::Result<LoopControl> {
        self.save_checkpoint();
        match prompter.breaker_choice(self.breaker.count()) {
            BreakerChoice::Retry => {
                self.breaker.reset();
                self.save_checkpoint();
                Ok(LoopControl::Continue)
            }
            BreakerChoice::SkipRemaining => {
                self.breaker.reset();
                self.save_checkpoint();
                Ok(LoopControl::SkipRemaining)
            }
            BreakerChoice::Abort => {
                self.state.last_error = "circuit breaker abort".to_string();
                self.save_checkpoint();
                Err(ExitError::RunAborted("circuit breaker".to_string()).into())
            }
        }
    }

    /// Final bookkeeping: report, terminal events, checkpoint clear on a
    /// clean finish.
    fn finish(
        &mut self,
        started_at: chrono::DateTime<Utc>,
        clean: bool,
    ) -> anyhow::Result<PoolSnapshot> {
        let snapshot = self.pool.snapshot();
        if let Err(e) = report::write_report(
            &self.run_dir,
            &self.run_id,
            started_at,
            &snapshot,
            &self.outcomes,
        ) {
            tracing::warn!("report write failed: {e:#}");
        }
        self.events.append(EventRecord::new("run_complete"));
        self.worktrees.cleanup_all();

        let interrupted = self.cancel.load(Ordering::SeqCst);
        if clean && !interrupted && snapshot.stuck == 0 && snapshot.skipped == 0 {
            self.checkpoint.clear()?;
        } else {
            self.save_checkpoint();
        }

        eprintln!(
            "Run {}: {} completed, {} stuck, {} skipped of {}",
            self.run_id, snapshot.completed, snapshot.stuck, snapshot.skipped, snapshot.total
        );
        Ok(snapshot)
    }
}

/// Split open beads into runnable and blocked: a bead is blocked when some
/// dependency is neither done nor runnable this run, transitively.
fn partition_blocked(open: &[Bead], done: &BTreeSet<String>) -> (Vec<Bead>, Vec<Bead>) {
    let mut runnable: BTreeMap<String, Bead> =
        open.iter().map(|b| (b.id.clone(), b.clone())).collect();
    loop {
        let blocked_ids: Vec<String> = runnable
            .values()
            .filter(|b| {
                b.deps
                    .iter()
                    .any(|d| !done.contains(d) && !runnable.contains_key(d))
            })
            .map(|b| b.id.clone())
            .collect();
        if blocked_ids.is_empty() {
            break;
        }
        for id in blocked_ids {
            runnable.remove(&id);
        }
    }

    let runnable_vec: Vec<Bead> = runnable.values().cloned().collect();
    let blocked: Vec<Bead> = open
        .iter()
        .filter(|b| !runnable.contains_key(&b.id))
        .cloned()
        .collect();
    (runnable_vec, blocked)
}

fn write_mcp_config(run_dir: &Path, base_url: &str) -> Option<PathBuf> {
    let path = run_dir.join("mcp.json");
    let body = serde_json::json!({
        "mcpServers": {
            "coordination": { "type": "http", "url": base_url }
        }
    });
    match serde_json::to_string_pretty(&body) {
        Ok(json) => match std::fs::write(&path, json) {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!("failed to write mcp config: {e}");
                None
            }
        },
        Err(e) => {
            tracing::warn!("failed to encode mcp config: {e}");
            None
        }
    }
}

// The ctrlc handler is process-global and can only be installed once; it
// flips whichever cancel flag the current run registered.
static CANCEL_FLAG: OnceLock<Mutex<Option<Arc<AtomicBool>>>> = OnceLock::new();
static HANDLER_INSTALLED: OnceLock<()> = OnceLock::new();

fn install_cancel_handler(flag: Arc<AtomicBool>) {
    let slot = CANCEL_FLAG.get_or_init(|| Mutex::new(None));
    *slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(flag);
    HANDLER_INSTALLED.get_or_init(|| {
        let result = ctrlc::set_handler(|| {
            eprintln!("\nInterrupt received; draining in-flight work...");
            if let Some(slot) = CANCEL_FLAG.get() {
                let guard = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(ref flag) = *guard {
                    flag.store(true, Ordering::SeqCst);
                }
            }
        });
        if let Err(e) = result {
            tracing::warn!("failed to install interrupt handler: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stuck::test_support::ScriptedPrompter;
    use crate::git::test_support::init_repo;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Tracker stub: serves beads.json from the repo root and logs every
    /// mutation to tracker-ops.log.
    fn tracker_stub(dir: &Path) -> PathBuf {
        write_script(
            dir,
            "stub-br",
            r#"case "$1" in
  list|ready) cat beads.json;;
  *) echo "$@" >> tracker-ops.log;;
esac"#,
        )
    }

    fn beads_json(repo: &Path, json: &str) {
        std::fs::write(repo.join("beads.json"), json).unwrap();
        git::commit_all(repo, "seed beads").unwrap();
    }

    #[test]
    fn happy_path_single_bead_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);
        beads_json(
            &repo,
            r#"[{"id":"bd-1","title":"write a.txt","status":"open","files":["a.txt"]}]"#,
        );

        // The agent writes the file and commits it, then reports success.
        let agent = write_script(
            dir.path(),
            "stub-agent",
            r#"echo created > a.txt
git add -A >/dev/null 2>&1; git commit -qm "bd-1: write a.txt" >/dev/null 2>&1
echo '{"type":"result","result":"wrote a.txt as requested","is_error":false,"cost_usd":0.02,"duration_ms":40}'"#,
        );
        let tracker = tracker_stub(dir.path());

        let config = Config {
            verify_pipeline: vec!["test -f a.txt".to_string()],
            ..Config::default()
        };

        let mut options = RunOptions::new(&repo);
        options.agent_program = agent.display().to_string();
        options.tracker_program = tracker.display().to_string();

        let mut prompter = ScriptedPrompter::new();
        let summary = run(&config, &options, &mut prompter).unwrap();

        assert_eq!(summary.snapshot.completed, 1);
        assert_eq!(summary.snapshot.stuck, 0);
        assert_eq!(summary.snapshot.skipped, 0);

        // Work landed on the integration branch
        let branch = git::current_branch(&repo).unwrap();
        assert!(branch.starts_with("berth/run-"));
        assert!(repo.join("a.txt").exists());

        // Tracker was told to close the bead
        let ops = std::fs::read_to_string(repo.join("tracker-ops.log")).unwrap();
        assert!(ops.contains("close bd-1"));

        // Checkpoint cleared on a clean finish; report written
        let paths = StatePaths::new(&repo);
        let run_dir = paths.run_dir(&summary.run_id);
        assert!(!run_dir.join("checkpoint.json").exists());
        let report = std::fs::read_to_string(run_dir.join("report.md")).unwrap();
        assert!(report.contains("| completed | 1 |"));

        // Event log has the lifecycle events
        let log = std::fs::read_to_string(paths.event_log()).unwrap();
        for event in ["run_started", "task_started", "verify_passed", "task_completed", "run_complete"] {
            assert!(log.contains(event), "missing {event}");
        }
    }

    #[test]
    fn parallel_group_with_cascade_failure() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);
        beads_json(
            &repo,
            r#"[
  {"id":"bd-a","title":"doomed","status":"open"},
  {"id":"bd-b","title":"fine","status":"open"},
  {"id":"bd-c","title":"downstream","status":"open","deps":["bd-a"]}
]"#,
        );

        // bd-a always self-reports an error; everything else writes a file
        // in its worktree and commits.
        let agent = write_script(
            dir.path(),
            "stub-agent",
            r#"case "$2" in
  *bd-a*) echo '{"type":"result","result":"cannot do this","is_error":true}';;
  *) echo ok > b.txt
     git add -A >/dev/null 2>&1; git commit -qm "work" >/dev/null 2>&1
     echo '{"type":"result","result":"did the work","is_error":false}';;
esac"#,
        );
        let tracker = tracker_stub(dir.path());

        let config = Config {
            execution: crate::config::ExecutionConfig {
                parallel_mode: crate::config::ParallelMode::Always,
                ..crate::config::ExecutionConfig::default()
            },
            ..Config::default()
        };

        let mut options = RunOptions::new(&repo);
        options.agent_program = agent.display().to_string();
        options.tracker_program = tracker.display().to_string();

        let mut prompter = ScriptedPrompter::new();
        let summary = run(&config, &options, &mut prompter).unwrap();

        assert_eq!(summary.snapshot.completed, 1, "bd-b done");
        assert_eq!(summary.snapshot.stuck, 1, "bd-a stuck");
        assert_eq!(summary.snapshot.skipped, 1, "bd-c cascade-skipped");

        // bd-b's work merged onto the integration branch
        assert!(repo.join("b.txt").exists());

        let ops = std::fs::read_to_string(repo.join("tracker-ops.log")).unwrap();
        assert!(ops.contains("update bd-a --status stuck"));
        assert!(ops.contains("update bd-c --status skipped"));
        assert!(ops.contains("close bd-b"));

        // Checkpoint survives a run with stuck beads
        let paths = StatePaths::new(&repo);
        assert!(paths.run_dir(&summary.run_id).join("checkpoint.json").exists());
    }

    #[test]
    fn breaker_skip_marks_remaining_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);
        beads_json(
            &repo,
            r#"[
  {"id":"bd-1","title":"one","status":"open"},
  {"id":"bd-2","title":"two","status":"open"},
  {"id":"bd-3","title":"three","status":"open"}
]"#,
        );

        // Every agent call self-reports an error, so every bead fails its
        // ladder; the scripted operator skips each stuck bead until the
        // breaker fires.
        let agent = write_script(
            dir.path(),
            "stub-agent",
            r#"echo '{"type":"result","result":"nope","is_error":true}'"#,
        );
        let tracker = tracker_stub(dir.path());

        let config = Config {
            execution: crate::config::ExecutionConfig {
                circuit_breaker_threshold: 2,
                ..crate::config::ExecutionConfig::default()
            },
            ..Config::default()
        };

        let mut options = RunOptions::new(&repo);
        options.agent_program = agent.display().to_string();
        options.tracker_program = tracker.display().to_string();

        let mut prompter = ScriptedPrompter::new();
        prompter.stuck.push(stuck::StuckChoice::Skip);
        prompter.stuck.push(stuck::StuckChoice::Skip);
        prompter.breaker.push(BreakerChoice::SkipRemaining);

        let summary = run(&config, &options, &mut prompter).unwrap();
        assert_eq!(summary.snapshot.stuck, 2);
        assert_eq!(summary.snapshot.skipped, 1, "bd-3 skipped at the breaker");
        assert_eq!(summary.snapshot.completed, 0);
        assert!(prompter.breaker.is_empty(), "breaker prompt consumed");
    }

    #[test]
    fn no_beads_returns_empty_summary() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);
        beads_json(&repo, "[]");
        let tracker = tracker_stub(dir.path());

        let mut options = RunOptions::new(&repo);
        options.tracker_program = tracker.display().to_string();
        options.agent_program = "nonexistent-agent-xyz".to_string();

        let mut prompter = ScriptedPrompter::new();
        let summary = run(&Config::default(), &options, &mut prompter).unwrap();
        assert_eq!(summary.snapshot.total, 0);
    }

    #[test]
    fn operator_abort_surfaces_as_run_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);
        beads_json(
            &repo,
            r#"[{"id":"bd-1","title":"one","status":"open"}]"#,
        );
        let agent = write_script(
            dir.path(),
            "stub-agent",
            r#"echo '{"type":"result","result":"nope","is_error":true}'"#,
        );
        let tracker = tracker_stub(dir.path());

        let mut options = RunOptions::new(&repo);
        options.agent_program = agent.display().to_string();
        options.tracker_program = tracker.display().to_string();

        let mut prompter = ScriptedPrompter::new();
        prompter.stuck.push(stuck::StuckChoice::Abort);

        let err = run(&Config::default(), &options, &mut prompter).unwrap_err();
        let exit = err.downcast_ref::<ExitError>().unwrap();
        assert!(matches!(exit, ExitError::RunAborted(_)));

        // A final checkpoint was written before aborting
        let paths = StatePaths::new(&repo);
        let info = resume::latest_run(&paths).unwrap().unwrap();
        assert!(info.state.is_some());
    }

    #[test]
    fn partition_blocked_is_transitive() {
        let done = BTreeSet::new();
        let beads = vec![
            Bead {
                id: "bd-1".to_string(),
                title: String::new(),
                description: String::new(),
                status: BeadStatus::Open,
                deps: vec!["bd-gone".to_string()],
                files: Vec::new(),
                verify_extra: Vec::new(),
            },
            Bead {
                id: "bd-2".to_string(),
                title: String::new(),
                description: String::new(),
                status: BeadStatus::Open,
                deps: vec!["bd-1".to_string()],
                files: Vec::new(),
                verify_extra: Vec::new(),
            },
            Bead {
                id: "bd-3".to_string(),
                title: String::new(),
                description: String::new(),
                status: BeadStatus::Open,
                deps: Vec::new(),
                files: Vec::new(),
                verify_extra: Vec::new(),
            },
        ];
        let (runnable, blocked) = partition_blocked(&beads, &done);
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].id, "bd-3");
        assert_eq!(blocked.len(), 2);
    }
}
