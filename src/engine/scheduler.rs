//! Dependency scheduler: launches ready beads on worker threads up to the
//! concurrency cap, consumes merge results, and cascade-skips the
//! descendants of failures.
//!
//! Launch order is deterministic: ready beads start in lexicographic id
//! order for a given topology and cap.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;

use crate::engine::merge_queue::{MergeRequest, MergeResult};
use crate::tracker::Bead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Terminal statuses for every bead the scheduler was given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

/// The work a worker thread performs for one bead, producing its merge
/// request.
pub type WorkerFn = Arc<dyn Fn(Bead) -> MergeRequest + Send + Sync>;

struct Graph {
    statuses: BTreeMap<String, NodeStatus>,
    deps: BTreeMap<String, Vec<String>>,
    dependents: BTreeMap<String, Vec<String>>,
}

impl Graph {
    fn build(beads: &[Bead]) -> Self {
        let ids: Vec<String> = beads.iter().map(|b| b.id.clone()).collect();
        let mut statuses = BTreeMap::new();
        let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for bead in beads {
            statuses.insert(bead.id.clone(), NodeStatus::Pending);
            let internal: Vec<String> = bead
                .deps
                .iter()
                .filter(|d| ids.contains(d))
                .cloned()
                .collect();
            deps.insert(bead.id.clone(), internal);
        }
        // Reverse map built once after forward construction.
        for (id, dep_list) in &deps {
            for dep in dep_list {
                dependents.entry(dep.clone()).or_default().push(id.clone());
            }
        }
        Self {
            statuses,
            deps,
            dependents,
        }
    }

    fn is_ready(&self, id: &str) -> bool {
        self.statuses.get(id) == Some(&NodeStatus::Pending)
            && self.deps[id]
                .iter()
                .all(|d| self.statuses.get(d) == Some(&NodeStatus::Completed))
    }

    /// Transitively mark pending descendants of a failure as skipped. The
    /// status filter keeps traversal from revisiting nodes.
    fn cascade_skip(&mut self, failed_id: &str) -> Vec<String> {
        let mut skipped = Vec::new();
        let mut stack = vec![failed_id.to_string()];
        while let Some(id) = stack.pop() {
            let children = self.dependents.get(&id).cloned().unwrap_or_default();
            for child in children {
                if self.statuses.get(&child) == Some(&NodeStatus::Pending) {
                    self.statuses.insert(child.clone(), NodeStatus::Skipped);
                    skipped.push(child.clone());
                    stack.push(child);
                }
            }
        }
        skipped
    }
}

/// Run one group of beads to completion. Blocks on the merge queue's result
/// channel; `on_result` fires for every result in arrival order.
pub fn run_group(
    beads: &[Bead],
    max_parallel: usize,
    cancel: &Arc<AtomicBool>,
    submit: &SyncSender<MergeRequest>,
    results: &Receiver<MergeResult>,
    worker: &WorkerFn,
    on_result: &mut dyn FnMut(&MergeResult),
) -> ScheduleOutcome {
    let mut graph = Graph::build(beads);
    let beads_by_id: BTreeMap<String, Bead> =
        beads.iter().map(|b| (b.id.clone(), b.clone())).collect();
    let cap = max_parallel.max(1);
    let mut running = 0usize;

    loop {
        // Launch in lexicographic id order, up to the cap.
        if !cancel.load(Ordering::SeqCst) {
            let ready: Vec<String> = graph
                .statuses
                .keys()
                .filter(|id| graph.is_ready(id))
                .cloned()
                .collect();
            for id in ready {
                if running >= cap {
                    break;
                }
                graph.statuses.insert(id.clone(), NodeStatus::Running);
                running += 1;
                let bead = beads_by_id[&id].clone();
                let worker = Arc::clone(worker);
                let submit = submit.clone();
                tracing::debug!(bead = %id, "launching worker");
                std::thread::spawn(move || {
                    let request = worker(bead);
                    if submit.send(request).is_err() {
                        tracing::warn!("merge queue closed before submission");
                    }
                });
            }
        }

        if running == 0 {
            // Nothing in flight and nothing launchable: remaining pending
            // nodes are unreachable (cancelled or descendants of failures).
            break;
        }

        let Ok(result) = results.recv() else {
            tracing::warn!("merge result channel closed");
            break;
        };
        running = running.saturating_sub(1);
        let status = if result.success {
            NodeStatus::Completed
        } else {
            NodeStatus::Failed
        };
        graph.statuses.insert(result.bead_id.clone(), status);
        if !result.success {
            let skipped = graph.cascade_skip(&result.bead_id);
            if !skipped.is_empty() {
                tracing::info!(
                    failed = %result.bead_id,
                    skipped = skipped.len(),
                    "cascade-skipped descendants"
                );
            }
        }
        on_result(&result);
    }

    let mut outcome = ScheduleOutcome::default();
    for (id, status) in &graph.statuses {
        match status {
            NodeStatus::Completed => outcome.completed.push(id.clone()),
            NodeStatus::Failed => outcome.failed.push(id.clone()),
            // Leftover pending/running nodes were never resolved; they
            // surface as skipped so the run never loses a bead.
            NodeStatus::Skipped | NodeStatus::Pending | NodeStatus::Running => {
                outcome.skipped.push(id.clone());
            }
        }
    }
    outcome
}
