//! Interactive escalation after the 3+1 ladder fails: hint, rescue, skip,
//! or abort.

use std::path::Path;

use dialoguer::{Input, Select};

use crate::engine::ladder::{LadderOutcome, WorkerContext};
use crate::engine::prompt;
use crate::tracker::Bead;
use crate::verify;

/// Operator choice at the stuck prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckChoice {
    Hint,
    Rescue,
    Skip,
    Abort,
}

/// Operator choice at the circuit-breaker prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerChoice {
    Retry,
    SkipRemaining,
    Abort,
}

/// Source of operator decisions. The console implementation prompts on the
/// terminal; tests script it.
pub trait Prompter {
    fn stuck_choice(&mut self, bead: &Bead, summary: &str) -> StuckChoice;
    fn hint(&mut self) -> String;
    fn breaker_choice(&mut self, failures: u32) -> BreakerChoice;
}

/// Terminal prompter. Invalid input reprompts.
pub struct ConsolePrompter;

impl Prompter for ConsolePrompter {
    fn stuck_choice(&mut self, bead: &Bead, summary: &str) -> StuckChoice {
        eprintln!("\nBead {} is stuck: {}", bead.id, bead.title);
        eprintln!("{summary}");
        loop {
            let selection = Select::new()
                .with_prompt("How should this bead proceed?")
                .items(&[
                    "hint - one more attempt with a hint from you",
                    "rescue - open an interactive agent session",
                    "skip - mark stuck and continue",
                    "abort - terminate the run",
                ])
                .default(0)
                .interact();
            match selection {
                Ok(0) => return StuckChoice::Hint,
                Ok(1) => return StuckChoice::Rescue,
                Ok(2) => return StuckChoice::Skip,
                Ok(3) => return StuckChoice::Abort,
                _ => eprintln!("Please pick one of the listed options."),
            }
        }
    }

    fn hint(&mut self) -> String {
        loop {
            match Input::<String>::new().with_prompt("Hint").interact_text() {
                Ok(hint) if !hint.trim().is_empty() => return hint,
                _ => eprintln!("Please enter a one-line hint."),
            }
        }
    }

    fn breaker_choice(&mut self, failures: u32) -> BreakerChoice {
        eprintln!("\nCircuit breaker: {failures} consecutive failures.");
        loop {
            let selection = Select::new()
                .with_prompt("Continue the run?")
                .items(&[
                    "retry - reset the breaker and continue",
                    "skip - mark remaining beads skipped and finish",
                    "abort - terminate the run",
                ])
                .default(0)
                .interact();
            match selection {
                Ok(0) => return BreakerChoice::Retry,
                Ok(1) => return BreakerChoice::SkipRemaining,
                Ok(2) => return BreakerChoice::Abort,
                _ => eprintln!("Please pick one of the listed options."),
            }
        }
    }
}

/// Terminal per-bead resolution from the stuck handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StuckResolution {
    Resolved { close_reason: String },
    Skipped,
    Aborted,
}

fn summarize(outcome: &LadderOutcome) -> String {
    let mut summary = format!("{} attempts failed.", outcome.attempts);
    if let Some(ref diagnosis) = outcome.diagnosis {
        summary.push_str(&format!(
            "\nDiagnosis: {}\nSuggested fix: {}",
            diagnosis.root_cause, diagnosis.fix
        ));
    }
    if let Some(last) = outcome.errors.last() {
        let tail: Vec<&str> = last.lines().rev().take(10).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        summary.push_str(&format!("\nLast failure:\n{}", tail.join("\n")));
    }
    summary
}

/// Drive the stuck prompt loop until the bead resolves, is skipped, or the
/// operator aborts the run.
pub fn handle(
    ctx: &WorkerContext,
    prompter: &mut dyn Prompter,
    bead: &Bead,
    outcome: &LadderOutcome,
    workdir: &Path,
) -> anyhow::Result<StuckResolution> {
    let summary = summarize(outcome);

    loop {
        match prompter.stuck_choice(bead, &summary) {
            StuckChoice::Hint => {
                let hint = prompter.hint();
                let task = prompt::hint_task_prompt(bead, &ctx.graph, &ctx.learnings, &hint);
                match ctx.agent.invocation(&task, workdir).spawn() {
                    Ok(reply) if !reply.is_error => {
                        let verified = verify::run_pipeline(&ctx.verify_steps, workdir)?;
                        if verified.passed {
                            return Ok(StuckResolution::Resolved {
                                close_reason: reply.result,
                            });
                        }
                        eprintln!("Hinted attempt still fails verification.");
                    }
                    Ok(reply) => eprintln!("Agent reported an error: {}", reply.result),
                    Err(e) => eprintln!("Agent invocation failed: {e}"),
                }
            }
            StuckChoice::Rescue => {
                let opening = prompt::rescue_prompt(bead, &ctx.graph, &outcome.errors);
                if let Err(e) = ctx.agent.invocation(&opening, workdir).spawn_interactive() {
                    eprintln!("Rescue session failed to start: {e}");
                    continue;
                }
                let verified = verify::run_pipeline(&ctx.verify_steps, workdir)?;
                if verified.passed {
                    return Ok(StuckResolution::Resolved {
                        close_reason: "resolved in interactive rescue session".to_string(),
                    });
                }
                eprintln!("Verification still fails after the rescue session.");
            }
            StuckChoice::Skip => return Ok(StuckResolution::Skipped),
            StuckChoice::Abort => return Ok(StuckResolution::Aborted),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedPrompter;
    use super::*;
    use crate::engine::ladder::AgentContext;
    use crate::events::EventLog;
    use crate::knowledge::ImpactData;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;

    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("stub-agent");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn ctx(dir: &Path, program: &Path, verify_steps: &[&str]) -> WorkerContext {
        WorkerContext {
            agent: AgentContext {
                program: program.display().to_string(),
                system_prompt: String::new(),
                allowed_tools: Vec::new(),
                mcp_config: None,
                timeout: Duration::from_secs(10),
            },
            verify_steps: verify_steps.iter().map(|s| (*s).to_string()).collect(),
            graph: ImpactData::default(),
            learnings: String::new(),
            events: EventLog::new(&dir.join("log.jsonl")),
        }
    }

    fn bead() -> Bead {
        Bead {
            id: "bd-1".to_string(),
            title: "a task".to_string(),
            description: String::new(),
            status: crate::tracker::BeadStatus::Open,
            deps: Vec::new(),
            files: Vec::new(),
            verify_extra: Vec::new(),
        }
    }

    fn failed_outcome() -> LadderOutcome {
        LadderOutcome {
            passed: false,
            result_text: String::new(),
            attempts: 4,
            errors: vec!["verify: assertion failed".to_string()],
            diagnosis: None,
            cost_usd: 0.0,
            duration_ms: 0,
        }
    }

    #[test]
    fn skip_resolves_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path(), "exit 1");
        let ctx = ctx(dir.path(), &stub, &["true"]);
        let mut prompter = ScriptedPrompter::new();
        prompter.stuck.push(StuckChoice::Skip);

        let resolution = handle(&ctx, &mut prompter, &bead(), &failed_outcome(), dir.path()).unwrap();
        assert_eq!(resolution, StuckResolution::Skipped);
    }

    #[test]
    fn abort_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path(), "exit 1");
        let ctx = ctx(dir.path(), &stub, &["true"]);
        let mut prompter = ScriptedPrompter::new();
        prompter.stuck.push(StuckChoice::Abort);

        let resolution = handle(&ctx, &mut prompter, &bead(), &failed_outcome(), dir.path()).unwrap();
        assert_eq!(resolution, StuckResolution::Aborted);
    }

    #[test]
    fn hint_success_resolves_with_agent_text() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"echo '{"type":"result","result":"applied the hint","is_error":false}'"#,
        );
        let ctx = ctx(dir.path(), &stub, &["true"]);
        let mut prompter = ScriptedPrompter::new();
        prompter.stuck.push(StuckChoice::Hint);
        prompter.hints.push("the fixture path is relative".to_string());

        let resolution = handle(&ctx, &mut prompter, &bead(), &failed_outcome(), dir.path()).unwrap();
        assert_eq!(
            resolution,
            StuckResolution::Resolved {
                close_reason: "applied the hint".to_string()
            }
        );
    }

    #[test]
    fn failed_hint_loops_back_to_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"echo '{"type":"result","result":"tried","is_error":false}'"#,
        );
        // Verification never passes, so the first hint loops back.
        let ctx = ctx(dir.path(), &stub, &["false"]);
        let mut prompter = ScriptedPrompter::new();
        prompter.stuck.push(StuckChoice::Hint);
        prompter.hints.push("try harder".to_string());
        prompter.stuck.push(StuckChoice::Skip);

        let resolution = handle(&ctx, &mut prompter, &bead(), &failed_outcome(), dir.path()).unwrap();
        assert_eq!(resolution, StuckResolution::Skipped);
        assert!(prompter.stuck.is_empty(), "both prompts consumed");
    }

    #[test]
    fn summary_includes_diagnosis_and_tail() {
        let mut outcome = failed_outcome();
        outcome.diagnosis = Some(crate::engine::ladder::Diagnosis {
            root_cause: "stale cache".to_string(),
            fix: "clear target dir".to_string(),
            misconceptions: String::new(),
            additional_context: String::new(),
        });
        let summary = summarize(&outcome);
        assert!(summary.contains("4 attempts failed"));
        assert!(summary.contains("stale cache"));
        assert!(summary.contains("assertion failed"));
    }
}
