//! Verification pipeline runner.
//!
//! Runs an ordered list of shell commands in a working directory and stops at
//! the first non-zero exit. Commands go through a POSIX shell so operators
//! may use pipes and `&&`.

use std::path::Path;

use crate::config::Config;
use crate::subprocess::Cmd;
use crate::tracker::Bead;

/// Outcome of a verification pipeline run.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub passed: bool,
    /// The command of the first failed step; empty on success.
    pub failed_step: String,
    /// Combined stdout+stderr of the failed step; empty on success.
    pub failure_output: String,
    /// Annotated output of every executed step.
    pub annotated_output: String,
}

impl VerifyOutcome {
    fn pass(annotated: String) -> Self {
        Self {
            passed: true,
            failed_step: String::new(),
            failure_output: String::new(),
            annotated_output: annotated,
        }
    }
}

/// Assemble the effective pipeline for a bead: configured default pipeline,
/// then the bead's extra steps, then the optional security command last.
pub fn assemble_pipeline(config: &Config, bead: &Bead) -> Vec<String> {
    let mut steps = config.verify_pipeline.clone();
    steps.extend(bead.verify_extra.iter().cloned());
    if let Some(ref security) = config.verify.security {
        steps.push(security.clone());
    }
    steps
}

/// Run the pipeline, stopping at the first failing step.
///
/// An empty pipeline passes with a diagnostic note rather than silently.
pub fn run_pipeline(steps: &[String], workdir: &Path) -> anyhow::Result<VerifyOutcome> {
    if steps.is_empty() {
        return Ok(VerifyOutcome::pass(
            "(no verification steps configured)".to_string(),
        ));
    }

    let mut annotated = String::new();
    for step in steps {
        tracing::debug!(step, "running verification step");
        let output = Cmd::shell(step).current_dir(workdir).run()?;
        annotated.push_str(&format!("$ {step}\n{}\n", output.combined()));

        if !output.success() {
            let failure_output = output.combined();
            annotated.push_str(&format!("(step failed with exit {})\n", output.exit_code));
            return Ok(VerifyOutcome {
                passed: false,
                failed_step: step.clone(),
                failure_output,
                annotated_output: annotated,
            });
        }
    }

    Ok(VerifyOutcome::pass(annotated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::BeadStatus;

    fn bead_with_extras(extras: &[&str]) -> Bead {
        Bead {
            id: "bd-1".to_string(),
            title: "test".to_string(),
            description: String::new(),
            status: BeadStatus::Open,
            deps: Vec::new(),
            files: Vec::new(),
            verify_extra: extras.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn empty_pipeline_passes_with_note() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_pipeline(&[], dir.path()).unwrap();
        assert!(outcome.passed);
        assert!(outcome.failed_step.is_empty());
        assert!(outcome.annotated_output.contains("no verification steps"));
    }

    #[test]
    fn all_steps_pass() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec!["true".to_string(), "echo ok".to_string()];
        let outcome = run_pipeline(&steps, dir.path()).unwrap();
        assert!(outcome.passed);
        assert!(outcome.annotated_output.contains("$ true"));
        assert!(outcome.annotated_output.contains("$ echo ok"));
        assert!(outcome.annotated_output.contains("ok"));
    }

    #[test]
    fn stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![
            "echo first".to_string(),
            "echo boom >&2; exit 1".to_string(),
            "echo never".to_string(),
        ];
        let outcome = run_pipeline(&steps, dir.path()).unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.failed_step, "echo boom >&2; exit 1");
        assert!(outcome.failure_output.contains("boom"));
        assert!(!outcome.annotated_output.contains("never"));
    }

    #[test]
    fn shell_pipelines_allowed_in_steps() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec!["echo a b c | wc -w | grep -q 3".to_string()];
        let outcome = run_pipeline(&steps, dir.path()).unwrap();
        assert!(outcome.passed);
    }

    #[test]
    fn assemble_orders_default_extras_security() {
        let config = Config {
            verify_pipeline: vec!["cargo test".to_string()],
            verify: crate::config::VerifyConfig {
                security: Some("cargo audit".to_string()),
            },
            ..Config::default()
        };
        let bead = bead_with_extras(&["just e2e"]);

        let steps = assemble_pipeline(&config, &bead);
        assert_eq!(steps, vec!["cargo test", "just e2e", "cargo audit"]);
    }

    #[test]
    fn assemble_without_security() {
        let config = Config::default();
        let bead = bead_with_extras(&[]);
        assert!(assemble_pipeline(&config, &bead).is_empty());
    }
}
