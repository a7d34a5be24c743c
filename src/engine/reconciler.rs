//! Post-merge reconciler: a targeted repair agent for verification
//! regressions caused by semantic merge conflicts.

use std::path::Path;

use crate::engine::ladder::AgentContext;
use crate::engine::prompt;
use crate::events::{EventLog, EventRecord};
use crate::knowledge::KnowledgeGraph;
use crate::tracker::Bead;
use crate::verify::{self, VerifyOutcome};

const MAX_ATTEMPTS: u32 = 2;

/// Attempt to repair a post-merge verification failure on trunk. Returns
/// true iff some attempt produced a passing verification.
pub fn reconcile(
    agent: &AgentContext,
    verify_steps: &[String],
    knowledge: &KnowledgeGraph,
    events: &EventLog,
    bead: &Bead,
    failed: &VerifyOutcome,
    trunk: &Path,
) -> anyhow::Result<bool> {
    events.append(
        EventRecord::new("reconcile_started")
            .bead(&bead.id)
            .step(&failed.failed_step),
    );

    let impact = knowledge.impact(&bead.files);
    let task = prompt::reconcile_prompt(bead, &failed.failed_step, &failed.failure_output, &impact);

    for attempt in 1..=MAX_ATTEMPTS {
        match agent.invocation(&task, trunk).spawn() {
            Ok(reply) if !reply.is_error => {}
            Ok(reply) => {
                tracing::warn!(bead = %bead.id, attempt, "reconciler agent error: {}", reply.result);
                continue;
            }
            Err(e) => {
                tracing::warn!(bead = %bead.id, attempt, "reconciler spawn failed: {e}");
                continue;
            }
        }

        let outcome = verify::run_pipeline(verify_steps, trunk)?;
        if outcome.passed {
            events.append(
                EventRecord::new("reconcile_completed")
                    .bead(&bead.id)
                    .attempt(attempt),
            );
            return Ok(true);
        }
        tracing::warn!(
            bead = %bead.id,
            attempt,
            step = %outcome.failed_step,
            "reconcile attempt did not converge"
        );
    }

    events.append(EventRecord::new("reconcile_failed").bead(&bead.id));
    Ok(false)
}
