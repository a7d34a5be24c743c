//! Prompt builders for the worker, diagnosis, rescue, and reconcile agent
//! invocations, plus system-prompt seeding.

use std::path::Path;

use crate::config::StatePaths;
use crate::engine::ladder::Diagnosis;
use crate::knowledge::ImpactData;
use crate::tracker::Bead;

/// Embedded fallback when no instruction files exist.
const DEFAULT_SYSTEM_PROMPT: &str = r"You are an autonomous software engineer working on one task at a time.

Rules:
- Implement exactly the task you are given. Do not pick up unrelated work.
- Commit your changes with `git add -A && git commit` before finishing.
- Keep commits scoped to the task; write conventional commit messages.
- If coordination endpoints are available, acquire a lock before editing a
  file other workers may touch, and release it when done.
- Never amend or rebase existing history.";

/// Retry context injected from the second blind attempt on.
pub struct RetryContext {
    pub attempt: u32,
    pub previous_error: String,
}

fn bead_section(bead: &Bead) -> String {
    let files = if bead.files.is_empty() {
        "(not specified)".to_string()
    } else {
        bead.files.join(", ")
    };
    format!(
        "## Task {id}: {title}\n\n{description}\n\nAffected files: {files}\n",
        id = bead.id,
        title = bead.title,
        description = bead.description.trim(),
    )
}

fn graph_section(graph: &ImpactData) -> String {
    if graph.is_empty() {
        return String::new();
    }
    format!(
        "\n## Code-graph context\n\nDirect dependents: {}\nTransitive dependents: {}\nAffected tests: {}\n",
        join_or_none(&graph.direct_dependents),
        join_or_none(&graph.transitive_dependents),
        join_or_none(&graph.affected_tests),
    )
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

fn learnings_section(learnings: &str) -> String {
    if learnings.trim().is_empty() {
        return String::new();
    }
    format!("\n## Learnings from earlier tasks\n\n{}\n", learnings.trim())
}

/// The blind-attempt task prompt. Attempts >= 2 carry a retry note with the
/// previous failure.
pub fn task_prompt(
    bead: &Bead,
    graph: &ImpactData,
    learnings: &str,
    retry: Option<&RetryContext>,
) -> String {
    let retry_section = retry.map_or_else(String::new, |r| {
        format!(
            "\n## Retry context (attempt {attempt})\n\nA previous attempt at this task failed verification. Review the failure\nbefore changing anything, and fix the cause rather than retrying blindly.\n\n```\n{error}\n```\n",
            attempt = r.attempt,
            error = truncate(&r.previous_error, 6000),
        )
    });

    format!(
        "{bead}{graph}{learnings}{retry}\nImplement the task, make the verification pipeline pass, and commit your\nwork. When done, summarise what you changed in one short paragraph.",
        bead = bead_section(bead),
        graph = graph_section(graph),
        learnings = learnings_section(learnings),
        retry = retry_section,
    )
}

/// The diagnosis prompt: three failure blobs in, structured JSON out.
pub fn diagnosis_prompt(bead: &Bead, errors: &[String]) -> String {
    let mut attempts = String::new();
    for (i, error) in errors.iter().enumerate() {
        attempts.push_str(&format!(
            "\n### Attempt {n}\n\n```\n{body}\n```\n",
            n = i + 1,
            body = truncate(error, 4000),
        ));
    }

    format!(
        "{bead}\nThree attempts at this task failed verification. Do NOT attempt the task.\nAnalyse the failures below and respond with a JSON object only, with these\nkeys: \"root_cause\", \"fix\", \"misconceptions\", \"additional_context\".\n{attempts}",
        bead = bead_section(bead),
        attempts = attempts,
    )
}

/// The diagnosed retry: the blind prompt plus the diagnosis verbatim.
pub fn diagnosed_task_prompt(
    bead: &Bead,
    graph: &ImpactData,
    learnings: &str,
    diagnosis: &Diagnosis,
) -> String {
    format!(
        "{base}\n\n## Diagnosis of previous failures\n\nRoot cause: {root_cause}\nSuggested fix: {fix}\nMisconceptions to avoid: {misconceptions}\nAdditional context: {additional_context}\n\nApply the diagnosis. Fix the root cause, then make verification pass.",
        base = task_prompt(bead, graph, learnings, None),
        root_cause = diagnosis.root_cause,
        fix = diagnosis.fix,
        misconceptions = diagnosis.misconceptions,
        additional_context = diagnosis.additional_context,
    )
}

/// One more attempt driven by an operator hint.
pub fn hint_task_prompt(
    bead: &Bead,
    graph: &ImpactData,
    learnings: &str,
    hint: &str,
) -> String {
    let diagnosis = Diagnosis {
        root_cause: format!("Operator hint: {hint}"),
        fix: hint.to_string(),
        misconceptions: String::new(),
        additional_context: "This hint comes from a human operator watching the run.".to_string(),
    };
    diagnosed_task_prompt(bead, graph, learnings, &diagnosis)
}

/// Opening context for an interactive rescue session.
pub fn rescue_prompt(bead: &Bead, graph: &ImpactData, errors: &[String]) -> String {
    let mut history = String::new();
    for (i, error) in errors.iter().enumerate() {
        history.push_str(&format!(
            "\n### Failure {n}\n\n```\n{body}\n```\n",
            n = i + 1,
            body = truncate(error, 2000),
        ));
    }
    format!(
        "{bead}{graph}\nAutomated attempts at this task have failed repeatedly. You are in an\ninteractive rescue session with a human operator. Work through the failures\ntogether and leave the working tree in a verifiable, committed state.\n{history}",
        bead = bead_section(bead),
        graph = graph_section(graph),
        history = history,
    )
}

/// Post-merge targeted repair prompt for the reconciler.
pub fn reconcile_prompt(
    bead: &Bead,
    failed_step: &str,
    failure_output: &str,
    impact: &ImpactData,
) -> String {
    format!(
        "## Post-merge regression after {id}: {title}\n\nThe merge of this task onto the integration branch passed its own\nverification in isolation but broke the merged tree. Fix the regression on\nthe current branch with the smallest change that makes verification pass,\nand commit the fix.\n\nFailing step: `{failed_step}`\n\n```\n{output}\n```\n{impact}",
        id = bead.id,
        title = bead.title,
        failed_step = failed_step,
        output = truncate(failure_output, 6000),
        impact = graph_section(impact),
    )
}

/// Seed the executor system prompt: project-level instructions, then
/// executor-level instructions, falling back to the embedded default. The
/// concatenation is written to `.berth/CLAUDE.md` for inspection.
pub fn seed_system_prompt(project_root: &Path, paths: &StatePaths) -> String {
    let mut parts = Vec::new();
    for source in [
        project_root.join("CLAUDE.md"),
        paths.state_dir().join("executor.md"),
    ] {
        if let Ok(contents) = std::fs::read_to_string(&source) {
            if !contents.trim().is_empty() {
                parts.push(contents.trim().to_string());
            }
        }
    }
    let combined = if parts.is_empty() {
        DEFAULT_SYSTEM_PROMPT.to_string()
    } else {
        parts.join("\n\n")
    };

    if let Err(e) = std::fs::write(paths.system_prompt_file(), &combined) {
        tracing::warn!("failed to write generated system prompt: {e}");
    }
    combined
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::BeadStatus;

    fn sample_bead() -> Bead {
        Bead {
            id: "bd-7".to_string(),
            title: "add config loader".to_string(),
            description: "Load config.yaml and apply defaults.".to_string(),
            status: BeadStatus::Open,
            deps: Vec::new(),
            files: vec!["src/config.rs".to_string()],
            verify_extra: Vec::new(),
        }
    }

    #[test]
    fn task_prompt_contains_bead_body_and_files() {
        let prompt = task_prompt(&sample_bead(), &ImpactData::default(), "", None);
        assert!(prompt.contains("bd-7"));
        assert!(prompt.contains("add config loader"));
        assert!(prompt.contains("src/config.rs"));
        assert!(!prompt.contains("Retry context"));
    }

    #[test]
    fn retry_note_appears_from_second_attempt() {
        let retry = RetryContext {
            attempt: 2,
            previous_error: "assertion failed: left == right".to_string(),
        };
        let prompt = task_prompt(&sample_bead(), &ImpactData::default(), "", Some(&retry));
        assert!(prompt.contains("Retry context (attempt 2)"));
        assert!(prompt.contains("assertion failed"));
    }

    #[test]
    fn learnings_and_graph_sections_included_when_present() {
        let graph = ImpactData {
            direct_dependents: vec!["src/main.rs".to_string()],
            transitive_dependents: Vec::new(),
            affected_tests: vec!["tests/cli.rs".to_string()],
        };
        let prompt = task_prompt(&sample_bead(), &graph, "- [bd-1] use anyhow context", None);
        assert!(prompt.contains("Code-graph context"));
        assert!(prompt.contains("src/main.rs"));
        assert!(prompt.contains("Learnings from earlier tasks"));
        assert!(prompt.contains("use anyhow context"));
    }

    #[test]
    fn diagnosis_prompt_lists_all_attempts_and_requests_json() {
        let errors = vec!["first".to_string(), "second".to_string(), "third".to_string()];
        let prompt = diagnosis_prompt(&sample_bead(), &errors);
        assert!(prompt.contains("### Attempt 1"));
        assert!(prompt.contains("### Attempt 3"));
        assert!(prompt.contains("root_cause"));
        assert!(prompt.contains("JSON object"));
    }

    #[test]
    fn diagnosed_prompt_embeds_diagnosis() {
        let diagnosis = Diagnosis {
            root_cause: "missing feature flag".to_string(),
            fix: "enable serde derive".to_string(),
            misconceptions: "the test is not flaky".to_string(),
            additional_context: String::new(),
        };
        let prompt =
            diagnosed_task_prompt(&sample_bead(), &ImpactData::default(), "", &diagnosis);
        assert!(prompt.contains("missing feature flag"));
        assert!(prompt.contains("enable serde derive"));
    }

    #[test]
    fn seed_falls_back_to_embedded_default() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        paths.ensure().unwrap();
        let prompt = seed_system_prompt(dir.path(), &paths);
        assert!(prompt.contains("autonomous software engineer"));
        assert!(paths.system_prompt_file().exists());
    }

    #[test]
    fn seed_concatenates_project_and_executor_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        paths.ensure().unwrap();
        std::fs::write(dir.path().join("CLAUDE.md"), "project rules").unwrap();
        std::fs::write(paths.state_dir().join("executor.md"), "executor rules").unwrap();

        let prompt = seed_system_prompt(dir.path(), &paths);
        assert!(prompt.contains("project rules"));
        assert!(prompt.contains("executor rules"));
        let written = std::fs::read_to_string(paths.system_prompt_file()).unwrap();
        assert_eq!(written, prompt);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "héllo wörld";
        let cut = truncate(text, 2);
        assert!(cut.len() <= 2);
        assert!(text.starts_with(cut));
    }
}
