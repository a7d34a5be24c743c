//! The "3+1" retry ladder: three blind attempts, a diagnosis, and one
//! diagnosed retry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentInvocation, AgentReply};
use crate::engine::prompt;
use crate::events::{EventLog, EventRecord};
use crate::knowledge::ImpactData;
use crate::tracker::Bead;
use crate::verify;

/// Run-wide agent invocation settings.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub program: String,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    pub mcp_config: Option<PathBuf>,
    pub timeout: Duration,
}

impl AgentContext {
    pub fn invocation(&self, task_prompt: &str, workdir: &Path) -> AgentInvocation {
        let mut invocation = AgentInvocation::new(task_prompt, self.timeout)
            .program(&self.program)
            .system_prompt(&self.system_prompt)
            .allowed_tools(&self.allowed_tools)
            .workdir(workdir);
        if let Some(ref mcp) = self.mcp_config {
            invocation = invocation.mcp_config(mcp);
        }
        invocation
    }
}

/// Per-bead execution context for the ladder.
pub struct WorkerContext {
    pub agent: AgentContext,
    pub verify_steps: Vec<String>,
    pub graph: ImpactData,
    pub learnings: String,
    pub events: EventLog,
}

/// Structured diagnosis emitted after three blind failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnosis {
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub fix: String,
    #[serde(default)]
    pub misconceptions: String,
    #[serde(default)]
    pub additional_context: String,
}

/// What the ladder produced for one bead.
#[derive(Debug, Clone)]
pub struct LadderOutcome {
    pub passed: bool,
    /// Raw agent text from the deciding attempt, for close-reason extraction.
    pub result_text: String,
    pub attempts: u32,
    pub errors: Vec<String>,
    pub diagnosis: Option<Diagnosis>,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

impl LadderOutcome {
    fn failed(attempts: u32, errors: Vec<String>, diagnosis: Option<Diagnosis>) -> Self {
        Self {
            passed: false,
            result_text: String::new(),
            attempts,
            errors,
            diagnosis,
            cost_usd: 0.0,
            duration_ms: 0,
        }
    }
}

/// Drive the 3+1 ladder for one bead in the given working directory.
///
/// The fourth attempt's outcome is returned verbatim; further escalation is
/// the caller's concern.
pub fn run(ctx: &WorkerContext, bead: &Bead, workdir: &Path) -> anyhow::Result<LadderOutcome> {
    let mut errors: Vec<String> = Vec::new();
    let mut cost_usd = 0.0;
    let mut duration_ms = 0;

    for attempt in 1..=3u32 {
        if attempt >= 2 {
            ctx.events.append(
                EventRecord::new("task_retry")
                    .bead(&bead.id)
                    .attempt(attempt)
                    .error(last_line(errors.last())),
            );
        }

        let retry = errors.last().map(|e| prompt::RetryContext {
            attempt,
            previous_error: e.clone(),
        });
        let task = prompt::task_prompt(bead, &ctx.graph, &ctx.learnings, retry.as_ref());

        match spawn(ctx, &task, workdir, &mut cost_usd, &mut duration_ms) {
            Err(message) => {
                // Spawn failure or self-reported error: no point verifying.
                tracing::warn!(bead = %bead.id, attempt, "agent attempt failed: {message}");
                errors.push(message);
            }
            Ok(reply) => {
                let outcome = verify::run_pipeline(&ctx.verify_steps, workdir)?;
                if outcome.passed {
                    ctx.events
                        .append(EventRecord::new("verify_passed").bead(&bead.id).attempt(attempt));
                    return Ok(LadderOutcome {
                        passed: true,
                        result_text: reply.result,
                        attempts: attempt,
                        errors,
                        diagnosis: None,
                        cost_usd,
                        duration_ms,
                    });
                }
                ctx.events.append(
                    EventRecord::new("verify_failed")
                        .bead(&bead.id)
                        .attempt(attempt)
                        .step(&outcome.failed_step),
                );
                errors.push(outcome.annotated_output);
            }
        }
    }

    // Diagnose: a separate invocation over the three failure blobs.
    let diag_prompt = prompt::diagnosis_prompt(bead, &errors);
    let diagnosis = match spawn(ctx, &diag_prompt, workdir, &mut cost_usd, &mut duration_ms) {
        Ok(reply) => parse_diagnosis(&reply.result),
        Err(message) => {
            tracing::warn!(bead = %bead.id, "diagnosis failed: {message}");
            return Ok(LadderOutcome::failed(3, errors, None));
        }
    };

    // The diagnosed retry; its outcome is returned verbatim.
    ctx.events
        .append(EventRecord::new("task_retry").bead(&bead.id).attempt(4));
    let diagnosed = prompt::diagnosed_task_prompt(bead, &ctx.graph, &ctx.learnings, &diagnosis);
    match spawn(ctx, &diagnosed, workdir, &mut cost_usd, &mut duration_ms) {
        Err(message) => {
            errors.push(message);
            Ok(LadderOutcome::failed(4, errors, Some(diagnosis)))
        }
        Ok(reply) => {
            let outcome = verify::run_pipeline(&ctx.verify_steps, workdir)?;
            if outcome.passed {
                ctx.events
                    .append(EventRecord::new("verify_passed").bead(&bead.id).attempt(4));
                Ok(LadderOutcome {
                    passed: true,
                    result_text: reply.result,
                    attempts: 4,
                    errors,
                    diagnosis: Some(diagnosis),
                    cost_usd,
                    duration_ms,
                })
            } else {
                ctx.events.append(
                    EventRecord::new("verify_failed")
                        .bead(&bead.id)
                        .attempt(4)
                        .step(&outcome.failed_step),
                );
                errors.push(outcome.annotated_output);
                Ok(LadderOutcome::failed(4, errors, Some(diagnosis)))
            }
        }
    }
}

/// Spawn the agent once; map spawn failures and self-reported errors to a
/// message, accumulating cost and duration from successful replies.
fn spawn(
    ctx: &WorkerContext,
    task_prompt: &str,
    workdir: &Path,
    cost_usd: &mut f64,
    duration_ms: &mut u64,
) -> Result<AgentReply, String> {
    let result = ctx.agent.invocation(task_prompt, workdir).spawn();
    match result {
        Ok(reply) => {
            *cost_usd += reply.cost_usd;
            *duration_ms += reply.duration_ms;
            if reply.is_error {
                Err(format!("agent reported error: {}", reply.result))
            } else {
                Ok(reply)
            }
        }
        Err(e) => Err(e.to_string()),
    }
}

/// Parse a diagnosis out of the agent's reply text. Tolerates fenced or
/// surrounded JSON; free text degrades to a root-cause-only diagnosis.
pub fn parse_diagnosis(text: &str) -> Diagnosis {
    if let Ok(d) = serde_json::from_str(text.trim()) {
        return d;
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(d) = serde_json::from_str(&text[start..=end]) {
                return d;
            }
        }
    }
    Diagnosis {
        root_cause: text.trim().to_string(),
        ..Diagnosis::default()
    }
}

fn last_line(error: Option<&String>) -> &str {
    error
        .map(|e| e.lines().last().unwrap_or(""))
        .unwrap_or("agent attempt failed")
}
